//! Obfuscated packet protocol carried inside transport frames.
//!
//! The tunnel between client and server multiplexes many logical
//! connections over one socket. Each unit of transfer is a packet
//! ([`Packet`]) identified by a 16-byte connection id and masqueraded as a
//! short json-looking message. Connection open and close carry their own
//! sub-encodings ([`hello`], [`close`]).

use std::fmt;

use rand::RngCore;

pub mod close;
pub mod hash;
pub mod hello;
pub mod packet;

pub use close::CloseCode;
pub use hash::Hasher;
pub use hello::{Hello, Network};
pub use packet::{Packet, PacketError};

/// Logical connection id.
///
/// Drawn from the tunnel random stream when a connection is opened and
/// used by both endpoints as the only cross-endpoint handle. Unique among
/// live connections of a tunnel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId([u8; 16]);

impl ConnId {
    pub const LEN: usize = 16;

    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut b = [0u8; Self::LEN];
        rng.fill_bytes(&mut b);
        ConnId(b)
    }

    pub fn from_bytes(b: [u8; 16]) -> Self {
        ConnId(b)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        f.write_str("-")?;
        for b in &self.0[4..8] {
            write!(f, "{b:02x}")?;
        }
        f.write_str("-")?;
        for b in &self.0[8..] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Wire packet kind, stored in the low 4 bits of the type byte.
///
/// Values 0..=3 are meaningful. Everything else decodes as [`PacketType::Junk`]:
/// such packets are discarded after checksum validation, which still runs
/// so that third-party meddling with the stream is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Keepalive and liveness probe, answered symmetrically.
    Ping,
    /// Open a logical connection. For the server this requests an outbound
    /// dial to the target carried in the data; for the client a received
    /// hello acknowledges that the dial succeeded.
    Hello,
    /// Terminate a logical connection, or report failure to open one.
    Close,
    /// Payload bytes of an established connection.
    Data,
    /// Padding traffic with no meaning beyond its valid checksum.
    Junk,
}

impl PacketType {
    pub fn from_nibble(v: u8) -> PacketType {
        match v & 0x0F {
            0 => PacketType::Ping,
            1 => PacketType::Hello,
            2 => PacketType::Close,
            3 => PacketType::Data,
            _ => PacketType::Junk,
        }
    }

    pub fn is_junk(&self) -> bool {
        matches!(self, PacketType::Junk)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketType::Ping => "ping",
            PacketType::Hello => "hello",
            PacketType::Close => "close",
            PacketType::Data => "data",
            PacketType::Junk => "junk",
        };
        f.write_str(s)
    }
}

/// Packet masquerade style: which bracket pair wraps the encoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    /// `{"..."}`
    Brace,
    /// `["..."]`
    Bracket,
}

/// Derive the per-tunnel checksum salt from the shared bearer token.
///
/// Both endpoints compute this independently when the tunnel is
/// established; the salt stays constant for the tunnel lifetime.
pub fn derive_salt(token: &str) -> u32 {
    let mut h = Hasher::new(0);
    h.put(token.as_bytes());
    h.sum32()
}
