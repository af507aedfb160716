//! Connection-open payload.
//!
//! Carried inside a hello packet. Tells the server which network and
//! target address the new logical connection should be dialed to. Like
//! the packet wrapper, the encoding mixes junk into unused bit and byte
//! positions so that its silhouette stays irregular.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use rand::RngCore;
use thiserror::Error;

/// Transport of the proxied connection, low 2 bits of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp = 0,
    Udp = 1,
}

const ADDR_V4: u8 = 0;
const ADDR_V6: u8 = 1;

const MIN_HELLO_LENGTH: usize = 1 + // network
    1 + // address kind
    2 + // port
    8; // address interleaved with junk

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HelloError {
    #[error("bad size")]
    BadSize,
    #[error("bad network")]
    BadNetwork,
    #[error("bad address type")]
    BadAddrType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub network: Network,
    pub addr: SocketAddr,
}

impl Hello {
    pub fn tcp(addr: SocketAddr) -> Self {
        Hello {
            network: Network::Tcp,
            addr,
        }
    }
}

/// Encode a hello payload.
///
/// Layout: network byte, address kind byte (junk in the high 6 bits of
/// both), port in big-endian, then the 4 address bytes interleaved with
/// junk at odd offsets. IPv6 targets are reserved and rejected until a
/// layout for them is defined.
pub fn encode<R: RngCore>(h: &Hello, rng: &mut R) -> Result<Vec<u8>, HelloError> {
    let addr = match h.addr {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => return Err(HelloError::BadAddrType),
    };

    let mut junk = [0u8; 8];
    rng.fill_bytes(&mut junk);

    let mut buf = Vec::with_capacity(MIN_HELLO_LENGTH);
    buf.push((junk[0] & 0b1111_1100) | h.network as u8);
    buf.push((junk[1] & 0b1111_1100) | ADDR_V4);
    buf.extend_from_slice(&addr.port().to_be_bytes());

    let a = addr.ip().octets();
    for i in 0..4 {
        buf.push(a[i]);
        buf.push(junk[2 + i]);
    }
    Ok(buf)
}

pub fn decode(data: &[u8]) -> Result<Hello, HelloError> {
    if data.len() < MIN_HELLO_LENGTH {
        return Err(HelloError::BadSize);
    }

    let network = match data[0] & 0b11 {
        0 => Network::Tcp,
        1 => Network::Udp,
        _ => return Err(HelloError::BadNetwork),
    };

    match data[1] & 0b11 {
        ADDR_V4 => {}
        // Reserved: no v6 layout exists in this protocol revision.
        ADDR_V6 => return Err(HelloError::BadAddrType),
        _ => return Err(HelloError::BadAddrType),
    }

    let port = u16::from_be_bytes([data[2], data[3]]);
    let ip = Ipv4Addr::new(data[4], data[6], data[8], data[10]);

    Ok(Hello {
        network,
        addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x0001_0203)
    }

    #[test]
    fn roundtrip() {
        let cases = [
            ("8.8.8.8:53", Network::Udp),
            ("127.0.0.1:8081", Network::Tcp),
            ("209.85.233.91:80", Network::Tcp),
            ("188.186.154.88:443", Network::Tcp),
        ];

        let mut rng = rng();
        for (addr, network) in cases {
            let hello = Hello {
                network,
                addr: addr.parse().unwrap(),
            };
            let data = encode(&hello, &mut rng).unwrap();
            assert!(data.len() >= MIN_HELLO_LENGTH, "{addr}");

            let got = decode(&data).unwrap();
            assert_eq!(got, hello, "{addr}");
        }
    }

    #[test]
    fn short_input_is_rejected() {
        assert_eq!(decode(&[0u8; 11]), Err(HelloError::BadSize));
        assert_eq!(decode(&[]), Err(HelloError::BadSize));
    }

    #[test]
    fn bad_network_is_rejected() {
        let mut rng = rng();
        let hello = Hello::tcp("10.0.0.1:80".parse().unwrap());
        let mut data = encode(&hello, &mut rng).unwrap();
        data[0] = (data[0] & 0b1111_1100) | 0b10;
        assert_eq!(decode(&data), Err(HelloError::BadNetwork));
    }

    #[test]
    fn bad_address_kind_is_rejected() {
        let mut rng = rng();
        let hello = Hello::tcp("10.0.0.1:80".parse().unwrap());
        let mut data = encode(&hello, &mut rng).unwrap();
        data[1] = (data[1] & 0b1111_1100) | 0b11;
        assert_eq!(decode(&data), Err(HelloError::BadAddrType));
    }

    #[test]
    fn v6_target_is_rejected_on_encode() {
        let mut rng = rng();
        let hello = Hello::tcp("[::1]:80".parse().unwrap());
        assert_eq!(encode(&hello, &mut rng), Err(HelloError::BadAddrType));
    }

    #[test]
    fn junk_does_not_leak_into_fields() {
        // Odd address offsets and high bits of the leading bytes are junk;
        // two encodings of the same hello still decode identically.
        let mut rng = rng();
        let hello = Hello::tcp("192.168.0.12:8443".parse().unwrap());
        let a = encode(&hello, &mut rng).unwrap();
        let b = encode(&hello, &mut rng).unwrap();
        assert_ne!(a, b);
        assert_eq!(decode(&a).unwrap(), decode(&b).unwrap());
    }
}
