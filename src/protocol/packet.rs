//! Obfuscated packet codec.
//!
//! Wire encoding is designed to be hard to fingerprint with DPI methods:
//! it avoids any fixed header, inserts random junk in several places and
//! makes the whole byte sequence open and close like a json message.
//! Depending on the per-packet style the encoding looks like one of
//!
//! ```text
//! {"..."}
//! ["..."]
//! ```
//!
//! where `...` is the inner part with variable content:
//!
//! ```text
//! <start>
//! tjunk        - 8 bytes
//! tjunk        - varlen    (1 - 8 bytes)
//! junk         - 3 bytes   (reserved for future use)
//! type         - 1 byte    (low 4 bits is type, high 4 bits are junk)
//! cid          - 16 bytes
//! packet data  - varlen    (arbitrary)
//! csum         - 4 bytes   (control sum, little-endian)
//! tjunk        - varlen    (1 - 8 bytes)
//! tjunk        - 8 bytes
//! <end>
//! ```
//!
//! Text junk (tjunk) is restricted to a 64-character alphanumeric
//! alphabet so the head and tail of the packet stay printable. The two
//! variable junk lengths derive from the salted hash of the first 8
//! inner bytes: the low 3 bits give the head length, the next 3 bits the
//! tail length (each 1..=8). They are therefore recoverable from the
//! packet itself plus the pre-shared salt.
//!
//! The control sum covers one chosen byte of the leading fixed junk, the
//! connection id, at most 4 bytes of packet data and one chosen byte of
//! the trailing fixed junk. Which junk byte is chosen comes from the low
//! 3 bits of the first byte of each fixed junk run.

use rand::RngCore;
use thiserror::Error;

use super::hash::Hasher;
use super::{close, hello, CloseCode, ConnId, Hello, PacketType, Style};

/// Alphabet for text junk, indexed by the low 6 bits of a random byte.
const JUNK_ALPHABET: &[u8; 64] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz_:";

/// Shortest possible encoding: both variable junk runs at their minimum
/// length and no packet data.
pub const MIN_PACKET_LENGTH: usize = 2 + 8 + 1 + 3 + 1 + 16 + 4 + 1 + 8 + 2;

/// Largest possible encoding overhead on top of the packet data: both
/// variable junk runs at their maximum length.
pub const MAX_PACKET_OVERHEAD: usize = 2 + 8 + 8 + 3 + 1 + 16 + 4 + 8 + 8 + 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("bad size")]
    BadSize,
    #[error("bad style")]
    BadStyle,
    #[error("bad sum")]
    BadSum,
}

/// A single unit of transfer between proxy client and server.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub cid: ConnId,
    pub ptype: PacketType,
    pub data: Vec<u8>,

    // Chosen at random during encoding, recovered during decoding.
    style: Style,
}

impl Packet {
    pub fn new(cid: ConnId, ptype: PacketType, data: Vec<u8>) -> Self {
        Packet {
            cid,
            ptype,
            data,
            style: Style::Brace,
        }
    }

    pub fn ping(cid: ConnId) -> Self {
        Packet::new(cid, PacketType::Ping, Vec::new())
    }

    pub fn data(cid: ConnId, data: &[u8]) -> Self {
        Packet::new(cid, PacketType::Data, data.to_vec())
    }

    pub fn hello<R: RngCore>(
        rng: &mut R,
        cid: ConnId,
        hello: &Hello,
    ) -> Result<Self, hello::HelloError> {
        let data = hello::encode(hello, rng)?;
        Ok(Packet::new(cid, PacketType::Hello, data))
    }

    pub fn close<R: RngCore>(rng: &mut R, cid: ConnId, code: CloseCode) -> Self {
        Packet::new(cid, PacketType::Close, close::encode(code, rng))
    }

    /// Pure padding traffic. The connection id is random and the data, if
    /// not synthesized here, will be during encoding.
    pub fn junk<R: RngCore>(rng: &mut R) -> Self {
        Packet::new(ConnId::generate(rng), PacketType::Junk, Vec::new())
    }

    pub fn style(&self) -> Style {
        self.style
    }

    /// Encode the packet into its wire form.
    ///
    /// Junk packets are normalized here: a random type nibble in 4..=15
    /// is chosen and, when no data was supplied, 1..=64 random payload
    /// bytes are synthesized (and kept, so an encoded packet compares
    /// equal to its decoded counterpart).
    pub fn encode<R: RngCore>(&mut self, rng: &mut R, salt: u32) -> Vec<u8> {
        let mut head = [0u8; 24];
        let mut tail = [0u8; 16];
        fill_text_junk(rng, &mut head);
        fill_text_junk(rng, &mut tail);

        let v = rng.next_u64();
        self.style = if v & 1 == 0 {
            Style::Brace
        } else {
            Style::Bracket
        };

        let nibble = if self.ptype.is_junk() {
            // Randomize the encoded junk type over the whole 4..=15 range.
            // 11 = 7 + 3 + 1, so 3 + 2 + 1 random bits give an even-ish
            // spread without a modulo.
            let x1 = (v >> 8) as u8 & 0b1;
            let x2 = (v >> 16) as u8 & 0b11;
            let x3 = (v >> 24) as u8 & 0b111;
            if self.data.is_empty() {
                let n = 1 + ((v >> 32) & 0x3F) as usize;
                self.data = vec![0u8; n];
                rng.fill_bytes(&mut self.data);
            }
            4 + x1 + x2 + x3
        } else {
            self.ptype as u8
        };
        let type_byte = nibble | (head[20] & 0xF0);

        let mut hasher = Hasher::new(salt);
        hasher.put(&head[..8]);
        let h = hasher.acc();

        let len1 = 1 + (h & 0b111) as usize;
        let len2 = 1 + ((h >> 3) & 0b111) as usize;

        let i1 = (head[0] & 0b111) as usize;
        let i2 = len2 + (tail[len2] & 0b111) as usize;
        hasher.reset(salt);
        hasher.put_byte(head[i1]);
        hasher.put(self.cid.as_bytes());
        hasher.put(&self.data[..self.data.len().min(4)]);
        hasher.put_byte(tail[i2]);
        let csum = hasher.sum32();

        let mut buf = Vec::with_capacity(MAX_PACKET_OVERHEAD + self.data.len());
        buf.extend_from_slice(match self.style {
            Style::Brace => b"{\"",
            Style::Bracket => b"[\"",
        });
        buf.extend_from_slice(&head[..8 + len1 + 3]);
        buf.push(type_byte);
        buf.extend_from_slice(self.cid.as_bytes());
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&csum.to_le_bytes());
        buf.extend_from_slice(&tail[..8 + len2]);
        buf.extend_from_slice(match self.style {
            Style::Brace => b"\"}",
            Style::Bracket => b"\"]",
        });
        buf
    }

    /// Decode a packet from its wire form. The salt must match the one
    /// used for encoding, otherwise the checksum check fails.
    pub fn decode(raw: &[u8], salt: u32) -> Result<Packet, PacketError> {
        let mut d = Reader::new(raw);

        if d.remaining() < MIN_PACKET_LENGTH {
            return Err(PacketError::BadSize);
        }

        let s1 = match d.u8() {
            b'{' => Style::Brace,
            b'[' => Style::Bracket,
            _ => return Err(PacketError::BadStyle),
        };
        if d.u8() != b'"' {
            return Err(PacketError::BadStyle);
        }

        let prefix: [u8; 8] = d.bytes(8).try_into().unwrap();

        let mut hasher = Hasher::new(salt);
        hasher.put(&prefix);
        let h = hasher.acc();

        let len1 = 1 + (h & 0b111) as usize;
        let len2 = 1 + ((h >> 3) & 0b111) as usize;

        // Everything after the cid except the packet data has a length
        // known at this point.
        let trailer = 4 + len2 + 8 + 2;
        let Some(dlen) = d
            .remaining()
            .checked_sub(len1 + 3 + 1 + ConnId::LEN + trailer)
        else {
            return Err(PacketError::BadSize);
        };

        d.skip(len1 + 3);
        let ptype = PacketType::from_nibble(d.u8());
        let cid = ConnId::from_bytes(d.bytes(16).try_into().unwrap());
        let data = d.bytes(dlen).to_vec();
        let csum = u32::from_le_bytes(d.bytes(4).try_into().unwrap());
        d.skip(len2);
        let suffix: [u8; 8] = d.bytes(8).try_into().unwrap();

        let i1 = (prefix[0] & 0b111) as usize;
        let i2 = (suffix[0] & 0b111) as usize;
        hasher.reset(salt);
        hasher.put_byte(prefix[i1]);
        hasher.put(cid.as_bytes());
        hasher.put(&data[..data.len().min(4)]);
        hasher.put_byte(suffix[i2]);
        if hasher.sum32() != csum {
            return Err(PacketError::BadSum);
        }

        if d.u8() != b'"' {
            return Err(PacketError::BadStyle);
        }
        let s2 = match d.u8() {
            b'}' => Style::Brace,
            b']' => Style::Bracket,
            _ => return Err(PacketError::BadStyle),
        };
        if s1 != s2 {
            return Err(PacketError::BadStyle);
        }

        Ok(Packet {
            cid,
            ptype,
            data,
            style: s1,
        })
    }
}

/// Read the connection id out of an encoded packet without decoding it.
///
/// The cid sits right after the variable-length head junk, whose length
/// is recomputed from the first 8 inner bytes and the salt.
pub fn peek_conn_id(raw: &[u8], salt: u32) -> Result<ConnId, PacketError> {
    let (_, offset) = peek_inner(raw, salt)?;
    let cid = raw[offset + 1..offset + 1 + ConnId::LEN].try_into().unwrap();
    Ok(ConnId::from_bytes(cid))
}

/// Read the packet type out of an encoded packet without decoding it.
pub fn peek_packet_type(raw: &[u8], salt: u32) -> Result<PacketType, PacketError> {
    let (_, offset) = peek_inner(raw, salt)?;
    Ok(PacketType::from_nibble(raw[offset]))
}

/// Validates the opening style bytes and returns the head junk length
/// together with the offset of the type byte.
fn peek_inner(raw: &[u8], salt: u32) -> Result<(usize, usize), PacketError> {
    if raw.len() < MIN_PACKET_LENGTH {
        return Err(PacketError::BadSize);
    }
    match raw[0] {
        b'{' | b'[' => {}
        _ => return Err(PacketError::BadStyle),
    }
    if raw[1] != b'"' {
        return Err(PacketError::BadStyle);
    }

    let mut hasher = Hasher::new(salt);
    hasher.put(&raw[2..10]);
    let len1 = 1 + (hasher.acc() & 0b111) as usize;

    let offset = 2 + 8 + len1 + 3;
    if raw.len() < offset + 1 + ConnId::LEN {
        return Err(PacketError::BadSize);
    }
    Ok((len1, offset))
}

pub(crate) fn fill_text_junk<R: RngCore>(rng: &mut R, buf: &mut [u8]) {
    rng.fill_bytes(buf);
    for b in buf.iter_mut() {
        *b = JUNK_ALPHABET[(*b & 0x3F) as usize];
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> u8 {
        let b = self.buf[self.pos];
        self.pos += 1;
        b
    }

    // Caller is responsible for checking buffer length boundaries.
    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let p = self.pos;
        self.pos += n;
        &self.buf[p..self.pos]
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    const SALT: u32 = 0x4A7B_AAE0;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x0001_0203)
    }

    fn roundtrip_case(rng: &mut StdRng, ptype: PacketType, data: &[u8]) {
        let cid = ConnId::generate(rng);
        let mut packet = Packet::new(cid, ptype, data.to_vec());
        let raw = packet.encode(rng, SALT);

        assert!(raw.len() >= MIN_PACKET_LENGTH);
        assert_eq!(peek_conn_id(&raw, SALT).unwrap(), cid);
        assert_eq!(peek_packet_type(&raw, SALT).unwrap(), packet.ptype);

        let got = Packet::decode(&raw, SALT).unwrap();
        assert_eq!(got.cid, packet.cid);
        assert_eq!(got.data, packet.data);
        assert_eq!(got.ptype, packet.ptype);
        assert_eq!(got.style(), packet.style());
    }

    #[test]
    fn roundtrip() {
        let mut rng = rng();
        roundtrip_case(&mut rng, PacketType::Hello, b"");
        roundtrip_case(&mut rng, PacketType::Close, b"");
        roundtrip_case(&mut rng, PacketType::Ping, b"");
        roundtrip_case(&mut rng, PacketType::Junk, b"");
        roundtrip_case(&mut rng, PacketType::Data, b"");
        roundtrip_case(&mut rng, PacketType::Data, b"hello");
        roundtrip_case(&mut rng, PacketType::Data, "++ hello !".repeat(237).as_bytes());
    }

    #[test]
    fn junk_packet_synthesizes_data() {
        let mut rng = rng();
        let mut packet = Packet::junk(&mut rng);
        let raw = packet.encode(&mut rng, SALT);

        assert!(!packet.data.is_empty());
        assert!(packet.data.len() <= 64);

        let got = Packet::decode(&raw, SALT).unwrap();
        assert_eq!(got.ptype, PacketType::Junk);
        assert_eq!(got.data, packet.data);
    }

    #[test]
    fn junk_nibble_stays_in_range() {
        let mut rng = rng();
        for _ in 0..64 {
            let mut packet = Packet::junk(&mut rng);
            let raw = packet.encode(&mut rng, SALT);
            let mut h = Hasher::new(SALT);
            h.put(&raw[2..10]);
            let len1 = 1 + (h.acc() & 0b111) as usize;
            let nibble = raw[2 + 8 + len1 + 3] & 0x0F;
            assert!(nibble >= 4, "junk nibble {nibble} below 4");
        }
    }

    #[test]
    fn style_pairs() {
        let mut rng = rng();
        let mut seen_brace = false;
        let mut seen_bracket = false;
        for _ in 0..64 {
            let mut packet = Packet::data(ConnId::generate(&mut rng), b"abc");
            let raw = packet.encode(&mut rng, SALT);
            match (raw[0], raw[raw.len() - 1]) {
                (b'{', b'}') => seen_brace = true,
                (b'[', b']') => seen_bracket = true,
                (open, close) => panic!("mismatched style pair {open} {close}"),
            }
            assert_eq!(raw[1], b'"');
            assert_eq!(raw[raw.len() - 2], b'"');
        }
        assert!(seen_brace && seen_bracket);
    }

    #[test]
    fn mismatched_style_is_rejected() {
        let mut rng = rng();
        let mut packet = Packet::data(ConnId::generate(&mut rng), b"abc");
        let mut raw = packet.encode(&mut rng, SALT);
        let last = raw.len() - 1;
        raw[last] = match raw[last] {
            b'}' => b']',
            _ => b'}',
        };
        assert_eq!(Packet::decode(&raw, SALT), Err(PacketError::BadStyle));
    }

    #[test]
    fn short_input_is_rejected() {
        let mut rng = rng();
        let mut packet = Packet::data(ConnId::generate(&mut rng), b"");
        let raw = packet.encode(&mut rng, SALT);
        assert_eq!(
            Packet::decode(&raw[..MIN_PACKET_LENGTH - 1], SALT),
            Err(PacketError::BadSize)
        );
        assert_eq!(Packet::decode(b"", SALT), Err(PacketError::BadSize));
    }

    #[test]
    fn payload_tampering_is_detected() {
        let mut rng = rng();
        let cid = ConnId::generate(&mut rng);
        let mut packet = Packet::data(cid, b"hello");
        let raw = packet.encode(&mut rng, SALT);

        // Locate the payload region and flip a single byte in it.
        let mut h = Hasher::new(SALT);
        h.put(&raw[2..10]);
        let len1 = 1 + (h.acc() & 0b111) as usize;
        let start = 2 + 8 + len1 + 3 + 1 + ConnId::LEN;

        for i in 0..4 {
            let mut bad = raw.clone();
            bad[start + i] ^= 0x01;
            assert_eq!(
                Packet::decode(&bad, SALT),
                Err(PacketError::BadSum),
                "flip at payload byte {i} went unnoticed"
            );
        }
    }

    #[test]
    fn wrong_salt_is_rejected() {
        let mut rng = rng();
        let mut packet = Packet::data(ConnId::generate(&mut rng), b"hello");
        let raw = packet.encode(&mut rng, SALT);
        let err = Packet::decode(&raw, SALT ^ 1).unwrap_err();
        assert!(matches!(
            err,
            PacketError::BadSum | PacketError::BadSize | PacketError::BadStyle
        ));
    }

    #[test]
    fn min_length_is_tight() {
        // An empty data packet with both variable junk runs at length 1
        // must hit the documented minimum exactly, so scan a few seeds.
        let mut shortest = usize::MAX;
        for seed in 0..4096 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut packet = Packet::data(ConnId::generate(&mut rng), b"");
            let raw = packet.encode(&mut rng, SALT);
            shortest = shortest.min(raw.len());
        }
        assert_eq!(shortest, MIN_PACKET_LENGTH);
    }
}
