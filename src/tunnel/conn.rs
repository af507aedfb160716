//! Logical connection: a duplex byte stream carried by the tunnel.

use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::sync::oneshot;
use tracing::debug;

use super::PacketTx;
use crate::protocol::packet::MAX_PACKET_OVERHEAD;
use crate::protocol::{CloseCode, ConnId, Packet, PacketType};

/// Largest data payload carried by one packet. Keeps the encoded packet
/// within the 16-bit frame length class even with maximum junk overhead.
pub const MAX_DATA_PER_PACKET: usize = 0xFFFF - MAX_PACKET_OVERHEAD;

/// How long a close waits for the writer task to put the close packet on
/// the wire before giving up.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiving end of a logical connection.
pub struct ConnReadHalf {
    cid: ConnId,
    inbound: async_channel::Receiver<Packet>,
    /// Tail of a packet that did not fit the caller's buffer. Drained
    /// before the queue is touched again.
    leftover: BytesMut,
    /// Payload bytes delivered to the caller, protocol overhead excluded.
    received: u64,
}

impl ConnReadHalf {
    /// Read the next chunk of payload bytes.
    ///
    /// Returns 0 once the connection queue has been closed and drained:
    /// the peer sent a close, the tunnel went down, or the local writer
    /// half finished a close.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            return Ok(n);
        }

        let packet = match self.inbound.recv().await {
            Ok(packet) => packet,
            Err(_) => return Ok(0),
        };

        match packet.ptype {
            PacketType::Data => {}
            PacketType::Hello => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "hello packet inside established connection",
                ));
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected {other} packet inside established connection"),
                ));
            }
        }

        self.received += packet.data.len() as u64;

        let n = packet.data.len().min(buf.len());
        buf[..n].copy_from_slice(&packet.data[..n]);
        if n < packet.data.len() {
            self.leftover.extend_from_slice(&packet.data[n..]);
        }
        Ok(n)
    }

    pub fn cid(&self) -> ConnId {
        self.cid
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

/// Sending end of a logical connection.
pub struct ConnWriteHalf {
    cid: ConnId,
    tx: PacketTx,
    /// Payload bytes accepted from the caller, protocol overhead excluded.
    sent: u64,
    closed: bool,
}

impl ConnWriteHalf {
    /// Send payload bytes, split across data packets as needed.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            ));
        }

        for chunk in data.chunks(MAX_DATA_PER_PACKET) {
            self.tx
                .send(Packet::data(self.cid, chunk))
                .await
                .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err.to_string()))?;
        }
        self.sent += data.len() as u64;
        Ok(data.len())
    }

    /// Send a close packet and wait, bounded, for the writer task to put
    /// it on the wire. Flushing the close also removes the connection
    /// from the tunnel table, which ends the read half.
    pub async fn close(&mut self, code: CloseCode) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let close = self
            .tx
            .with_rng(|rng| Packet::close(rng, self.cid, code));
        let flushed = match self.tx.send_flushed(close).await {
            Ok(flushed) => flushed,
            // Tunnel already gone, nothing left to flush.
            Err(_) => return Ok(()),
        };
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flushed).await.is_err() {
            debug!("close flush timed out (cid={})", self.cid);
        }
        Ok(())
    }

    pub fn cid(&self) -> ConnId {
        self.cid
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

/// A single proxied connection. Owns no socket: reads come from the
/// tunnel-fed inbound queue, writes go to the tunnel outbound queue.
pub struct Conn {
    reader: ConnReadHalf,
    writer: ConnWriteHalf,
    ack: Option<oneshot::Receiver<()>>,
}

impl Conn {
    pub(crate) fn new(
        cid: ConnId,
        inbound: async_channel::Receiver<Packet>,
        ack: oneshot::Receiver<()>,
        tx: PacketTx,
    ) -> Self {
        Conn {
            reader: ConnReadHalf {
                cid,
                inbound,
                leftover: BytesMut::new(),
                received: 0,
            },
            writer: ConnWriteHalf {
                cid,
                tx,
                sent: 0,
                closed: false,
            },
            ack: Some(ack),
        }
    }

    pub fn cid(&self) -> ConnId {
        self.reader.cid
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writer.write(data).await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.writer.close(CloseCode::OK).await
    }

    /// Wait for the peer's hello acknowledgement of this connection.
    /// Returns false if the tunnel went down before one arrived, or if
    /// it was already consumed.
    pub async fn acknowledged(&mut self) -> bool {
        match self.ack.take() {
            Some(ack) => ack.await.is_ok(),
            None => false,
        }
    }

    pub fn sent(&self) -> u64 {
        self.writer.sent
    }

    pub fn received(&self) -> u64 {
        self.reader.received
    }

    /// Split into independently owned halves, so reading and writing can
    /// proceed from different tasks.
    pub fn split(self) -> (ConnReadHalf, ConnWriteHalf) {
        (self.reader, self.writer)
    }
}
