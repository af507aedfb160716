//! Transport frame codec.
//!
//! A subset of websocket framing, sufficient to carry encoded packets:
//! a two-byte mandatory header with fin/extension/opcode and
//! mask/length-class bits, an optional extended length (16 or 64 bit,
//! big-endian), an optional 4-byte mask and the payload. Masked payloads
//! are XORed with `mask[i % 4]` on both ends.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload. The peer encodes one packet
/// per frame and splits large writes, so anything bigger than this means
/// the stream is desynchronized.
pub const MAX_PAYLOAD_LENGTH: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
}

impl OpCode {
    fn from_u8(v: u8) -> Option<OpCode> {
        match v {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    /// Clean end of stream: the peer closed the socket between frames.
    #[error("end of stream")]
    Eof,
    #[error("truncated frame header")]
    TruncatedHeader,
    #[error("truncated frame payload: expected {0} bytes")]
    TruncatedPayload(u64),
    #[error("unexpected opcode 0x{0:x}")]
    BadOpcode(u8),
    #[error("frame payload of {0} bytes exceeds limit")]
    BadLength(u64),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw unmasked payload bytes.
    pub data: Vec<u8>,
    pub op: OpCode,
    pub mask: [u8; 4],
    /// Extension bits from the header, reserved junk today. Kept so the
    /// wire silhouette survives a future meaningful use.
    pub ext: u8,
    /// Final frame in a message.
    pub fin: bool,
    pub use_mask: bool,
}

impl Frame {
    pub fn binary(data: Vec<u8>, mask: [u8; 4]) -> Self {
        Frame {
            data,
            op: OpCode::Binary,
            mask,
            ext: 0,
            fin: true,
            use_mask: true,
        }
    }
}

/// Read a single frame.
///
/// Fails with [`FrameError::Eof`] when the stream ends cleanly before
/// the first header byte, with a truncation error when it ends inside a
/// frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, FrameError> {
    let mut hdr = [0u8; 2];
    let n = r.read(&mut hdr[..1]).await?;
    if n == 0 {
        return Err(FrameError::Eof);
    }
    r.read_exact(&mut hdr[1..]).await.map_err(truncated_header)?;

    let fin = hdr[0] >> 7 == 1;
    let ext = (hdr[0] >> 4) & 0x7;
    let op = OpCode::from_u8(hdr[0] & 0xF).ok_or(FrameError::BadOpcode(hdr[0] & 0xF))?;
    let use_mask = hdr[1] >> 7 == 1;
    let size_bits = hdr[1] & 0x7F;

    let mut size = u64::from(size_bits);
    let mut mask = [0u8; 4];

    let mut extra = [0u8; 12];
    let extra_size = header_extra_size(use_mask, size_bits);
    if extra_size > 0 {
        r.read_exact(&mut extra[..extra_size])
            .await
            .map_err(truncated_header)?;

        let mut pos = 0;
        if size_bits == 126 {
            size = u64::from(u16::from_be_bytes([extra[0], extra[1]]));
            pos = 2;
        } else if size_bits == 127 {
            size = u64::from_be_bytes(extra[..8].try_into().unwrap());
            pos = 8;
        }
        if use_mask {
            mask.copy_from_slice(&extra[pos..pos + 4]);
        }
    }

    if size > MAX_PAYLOAD_LENGTH {
        return Err(FrameError::BadLength(size));
    }

    let mut data = vec![0u8; size as usize];
    if size != 0 {
        r.read_exact(&mut data)
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::UnexpectedEof => FrameError::TruncatedPayload(size),
                _ => FrameError::Io(err),
            })?;
    }

    if use_mask {
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= mask[i & 0b11];
        }
    }

    Ok(Frame {
        data,
        op,
        mask,
        ext,
        fin,
        use_mask,
    })
}

fn truncated_header(err: io::Error) -> FrameError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::TruncatedHeader,
        _ => FrameError::Io(err),
    }
}

fn header_extra_size(use_mask: bool, size_bits: u8) -> usize {
    let mut size = 0;
    if use_mask {
        size += 4;
    }
    if size_bits == 126 {
        size += 2;
    } else if size_bits == 127 {
        size += 8;
    }
    size
}

/// Write a single frame. The caller's payload is left untouched; masking
/// happens on the way out.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, f: &Frame) -> Result<(), FrameError> {
    let mut hbuf = [0u8; 14];
    let (size_bits, extra_size) = size_bits(f.data.len() as u64);

    hbuf[0] = (u8::from(f.fin) << 7) | ((f.ext & 0x7) << 4) | (f.op as u8);
    hbuf[1] = (u8::from(f.use_mask) << 7) | size_bits;
    let mut n = 2;

    match extra_size {
        0 => {}
        2 => hbuf[2..4].copy_from_slice(&(f.data.len() as u16).to_be_bytes()),
        8 => hbuf[2..10].copy_from_slice(&(f.data.len() as u64).to_be_bytes()),
        _ => unreachable!(),
    }
    n += extra_size;

    if f.use_mask {
        hbuf[n..n + 4].copy_from_slice(&f.mask);
        n += 4;
    }

    w.write_all(&hbuf[..n]).await?;

    if f.data.is_empty() {
        return Ok(());
    }
    if !f.use_mask {
        w.write_all(&f.data).await?;
        return Ok(());
    }

    // Mask in chunks to keep the scratch buffer bounded for big payloads.
    const CHUNK: usize = 1 << 14;
    let mut buf = vec![0u8; f.data.len().min(CHUNK)];
    let mut pos = 0;
    while pos < f.data.len() {
        let chunk = &f.data[pos..(pos + CHUNK).min(f.data.len())];
        for (i, b) in chunk.iter().enumerate() {
            buf[i] = b ^ f.mask[i & 0b11];
        }
        w.write_all(&buf[..chunk.len()]).await?;
        pos += chunk.len();
    }
    Ok(())
}

fn size_bits(size: u64) -> (u8, usize) {
    if size <= 125 {
        (size as u8, 0)
    } else if size <= 0xFFFF {
        (126, 2)
    } else {
        (127, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: Frame) -> Frame {
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let got = read_frame(&mut buf.as_slice()).await.unwrap();
        assert_eq!(got, frame);
        got
    }

    #[tokio::test]
    async fn roundtrip_unmasked_empty() {
        roundtrip(Frame {
            data: Vec::new(),
            op: OpCode::Binary,
            mask: [0; 4],
            ext: 0,
            fin: true,
            use_mask: false,
        })
        .await;
    }

    #[tokio::test]
    async fn roundtrip_small() {
        roundtrip(Frame {
            data: b"hello".to_vec(),
            op: OpCode::Binary,
            mask: [0; 4],
            ext: 0,
            fin: true,
            use_mask: false,
        })
        .await;
        roundtrip(Frame::binary(b"hello".to_vec(), [0xAC, 0x13, 0xE9, 0x06])).await;
    }

    #[tokio::test]
    async fn roundtrip_medium() {
        // 11000 bytes forces the 16-bit length class
        let data = b"hello world".repeat(1000);
        roundtrip(Frame::binary(data, [0xAC, 0x13, 0xE9, 0x06])).await;
    }

    #[tokio::test]
    async fn roundtrip_large() {
        // 110000 bytes forces the 64-bit length class
        let data = b"hello world".repeat(10000);
        roundtrip(Frame::binary(data, [0xAC, 0x13, 0xE9, 0x06])).await;
    }

    #[tokio::test]
    async fn roundtrip_preserves_ext_bits_and_fin() {
        let mut frame = Frame::binary(b"x".to_vec(), [1, 2, 3, 4]);
        frame.ext = 0b101;
        frame.fin = false;
        roundtrip(frame).await;
    }

    #[test]
    fn length_class_selection() {
        assert_eq!(size_bits(0), (0, 0));
        assert_eq!(size_bits(125), (125, 0));
        assert_eq!(size_bits(126), (126, 2));
        assert_eq!(size_bits(65535), (126, 2));
        assert_eq!(size_bits(65536), (127, 8));
        assert_eq!(size_bits(1 << 23), (127, 8));
    }

    #[tokio::test]
    async fn masked_payload_differs_on_wire() {
        let frame = Frame::binary(b"secret".to_vec(), [0x5A, 0x5A, 0x5A, 0x5A]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let wire = &buf[buf.len() - 6..];
        assert_ne!(wire, b"secret");
    }

    #[tokio::test]
    async fn eof_between_frames() {
        let err = read_frame(&mut [].as_slice()).await.unwrap_err();
        assert!(matches!(err, FrameError::Eof));
    }

    #[tokio::test]
    async fn truncated_header() {
        let err = read_frame(&mut [0x82u8].as_slice()).await.unwrap_err();
        assert!(matches!(err, FrameError::TruncatedHeader));
    }

    #[tokio::test]
    async fn truncated_payload() {
        let frame = Frame::binary(b"hello".to_vec(), [1, 2, 3, 4]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        buf.truncate(buf.len() - 2);
        let err = read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, FrameError::TruncatedPayload(5)));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let mut buf = vec![0x82u8, 127];
        buf.extend_from_slice(&(MAX_PAYLOAD_LENGTH + 1).to_be_bytes());
        let err = read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, FrameError::BadLength(_)));
    }
}
