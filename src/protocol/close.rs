//! Connection-close payload.
//!
//! Fixed 8-byte encoding: the little-endian close code occupies even
//! offsets, odd offsets hold junk.

use rand::RngCore;
use thiserror::Error;

const CLOSE_LENGTH: usize = 8;

/// Reason for closing a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u32);

impl CloseCode {
    /// Normal teardown.
    pub const OK: CloseCode = CloseCode(0);
    /// The server failed to dial the requested target.
    pub const DIAL_FAILED: CloseCode = CloseCode(1);
    /// Unspecified connection-level failure.
    pub const ERROR: CloseCode = CloseCode(2);
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            CloseCode::OK => f.write_str("ok"),
            CloseCode::DIAL_FAILED => f.write_str("dial failed"),
            CloseCode::ERROR => f.write_str("error"),
            CloseCode(other) => write!(f, "code {other}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CloseError {
    #[error("bad size")]
    BadSize,
}

pub fn encode<R: RngCore>(code: CloseCode, rng: &mut R) -> Vec<u8> {
    let mut junk = [0u8; 4];
    rng.fill_bytes(&mut junk);

    let cc = code.0.to_le_bytes();
    let mut buf = Vec::with_capacity(CLOSE_LENGTH);
    for i in 0..4 {
        buf.push(cc[i]);
        buf.push(junk[i]);
    }
    buf
}

pub fn decode(data: &[u8]) -> Result<CloseCode, CloseError> {
    if data.len() != CLOSE_LENGTH {
        return Err(CloseError::BadSize);
    }
    let cc = [data[0], data[2], data[4], data[6]];
    Ok(CloseCode(u32::from_le_bytes(cc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn roundtrip() {
        let mut rng = StdRng::seed_from_u64(0x0001_0203);
        for code in [0, 1, 2, 0x75BC_C91A] {
            let data = encode(CloseCode(code), &mut rng);
            assert_eq!(data.len(), CLOSE_LENGTH);
            assert_eq!(decode(&data).unwrap(), CloseCode(code), "code {code}");
        }
    }

    #[test]
    fn wrong_size_is_rejected() {
        assert_eq!(decode(&[0u8; 7]), Err(CloseError::BadSize));
        assert_eq!(decode(&[0u8; 9]), Err(CloseError::BadSize));
        assert_eq!(decode(&[]), Err(CloseError::BadSize));
    }
}
