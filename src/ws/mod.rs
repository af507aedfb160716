//! Transport layer: text-initiated framing.
//!
//! [`handshake`] builds and validates the plain-text upgrade exchange,
//! [`frame`] carries the binary frames that follow it.

pub mod frame;
pub mod handshake;

pub use frame::{read_frame, write_frame, Frame, FrameError, OpCode};
pub use handshake::{
    check_upgrade_response, format_upgrade_response, generate_key, hash_key, HandshakeError,
    UpgradeRequest, HANDSHAKE_MAGIC,
};
