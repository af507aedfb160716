//! Transparent tunneling proxy.
//!
//! A client intercepts outbound traffic on a host and carries it through
//! a single long-lived, DPI-resistant tunnel to a remote server that
//! re-originates the connections.
//!
//! The layers, bottom up:
//!
//! - [`protocol`]: the obfuscated packet codec and its hello/close
//!   sub-encodings, tied together by a salted checksum.
//! - [`ws`]: the transport framing and the text upgrade handshake that
//!   establishes it.
//! - [`tunnel`]: the multiplexer that carries many logical connections
//!   over one socket.
//! - [`client`] and [`server`]: the two endpoints, local interception
//!   with routing policy on one side and remote re-origination behind a
//!   masquerade static site on the other.
//! - [`dns`]: a stand-alone name-resolution helper.

pub mod client;
pub mod config;
pub mod dns;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod tunnel;
pub mod ws;
