//! Upgrade handshake: the plain-text exchange that turns a fresh TCP
//! connection into a framed tunnel transport.
//!
//! The request mimics a browser websocket upgrade. The response check is
//! deliberately strict: exactly the status line plus three headers in a
//! fixed order, terminated by a blank line. Anything else is treated as
//! a failed handshake.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;

pub const HANDSHAKE_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unexpected number of headers (={0})")]
    BadHeaderCount(usize),
    #[error("bad status: {0}")]
    BadStatus(String),
    #[error("bad connection header: {0}")]
    BadConnectionHeader(String),
    #[error("bad upgrade header: {0}")]
    BadUpgradeHeader(String),
    #[error("bad accept header: {0}")]
    BadAcceptHeader(String),
    #[error("handshake key hash mismatch: {0}")]
    HashMismatch(String),
    #[error("bad response end: {0}")]
    BadEnd(String),
}

/// 16 random bytes in base64, sent as `Sec-Websocket-Key`.
pub fn generate_key<R: RngCore>(rng: &mut R) -> String {
    let mut buf = [0u8; 16];
    rng.fill_bytes(&mut buf);
    BASE64.encode(buf)
}

/// Accept hash for a handshake key.
pub fn hash_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(HANDSHAKE_MAGIC.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Upgrade request parameters.
///
/// Fields mirror what a browser would send; optional ones are skipped
/// when empty.
#[derive(Debug, Default)]
pub struct UpgradeRequest<'a> {
    pub path: &'a str,
    pub key: &'a str,
    /// Includes optional port.
    pub host: &'a str,
    pub user_agent: &'a str,
    pub origin: &'a str,
    pub auth_token: &'a str,
    pub extensions: &'a [&'a str],
    pub accept_encodings: &'a [&'a str],
    pub extra_headers: &'a [(&'a str, &'a str)],
}

impl UpgradeRequest<'_> {
    /// Render the full request text, terminated by a blank line.
    pub fn format(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str("GET ");
        out.push_str(if self.path.is_empty() { "/" } else { self.path });
        out.push_str(" HTTP/1.1\n");

        let auth = if self.auth_token.is_empty() {
            String::new()
        } else {
            format!("Bearer {}", self.auth_token)
        };
        let headers: &[(&str, &str)] = &[
            ("Host", self.host),
            ("User-Agent", self.user_agent),
            ("Accept-Encoding", &self.accept_encodings.join(", ")),
            ("Sec-WebSocket-Version", "13"),
            ("Origin", self.origin),
            ("Sec-WebSocket-Extensions", &self.extensions.join(", ")),
            ("Sec-Websocket-Key", self.key),
            ("Connection", "keep-alive, Upgrade"),
            ("Sec-Fetch-Dest", "empty"),
            ("Sec-Fetch-Mode", "websocket"),
            ("Sec-Fetch-Site", "same-origin"),
            ("Pragma", "no-cache"),
            ("Cache-Control", "no-cache"),
            ("Upgrade", "websocket"),
            ("Authorization", &auth),
        ];
        for (name, value) in headers {
            push_header(&mut out, name, value);
        }
        for (name, value) in self.extra_headers {
            push_header(&mut out, name, value);
        }
        out.push('\n');
        out
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    if name.is_empty() || value.is_empty() {
        return;
    }
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push('\n');
}

/// Render the switching-protocols response the responder sends back.
pub fn format_upgrade_response(accept_hash: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\n\
         Connection: Upgrade\n\
         Upgrade: websocket\n\
         Sec-Websocket-Accept: {accept_hash}\n\n"
    )
}

/// Validate the upgrade response against the key we sent.
///
/// A correct response looks like:
///
/// ```text
/// HTTP/1.1 101 Switching Protocols
/// Connection: Upgrade
/// Upgrade: websocket
/// Sec-Websocket-Accept: <hash>
/// ```
///
/// and ends with a double newline. Splitting on newlines must therefore
/// produce exactly 6 parts, the last two empty.
pub fn check_upgrade_response(raw: &[u8], key: &str) -> Result<(), HandshakeError> {
    let split: Vec<&[u8]> = raw.split(|&b| b == b'\n').collect();
    if split.len() != 6 {
        return Err(HandshakeError::BadHeaderCount(split.len()));
    }

    if split[0] != b"HTTP/1.1 101 Switching Protocols" {
        return Err(HandshakeError::BadStatus(lossy(split[0])));
    }
    if split[1] != b"Connection: Upgrade" {
        return Err(HandshakeError::BadConnectionHeader(lossy(split[1])));
    }
    if split[2] != b"Upgrade: websocket" {
        return Err(HandshakeError::BadUpgradeHeader(lossy(split[2])));
    }

    let Some(colon) = split[3].iter().position(|&b| b == b':') else {
        return Err(HandshakeError::BadAcceptHeader(lossy(split[3])));
    };
    let got_hash = trim_ascii(&split[3][colon + 1..]);
    let want_hash = hash_key(key);
    if got_hash != want_hash.as_bytes() {
        return Err(HandshakeError::HashMismatch(lossy(got_hash)));
    }

    if !split[4].is_empty() {
        return Err(HandshakeError::BadEnd(lossy(split[4])));
    }
    Ok(())
}

fn trim_ascii(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|c| !c.is_ascii_whitespace());
    let end = b.iter().rposition(|c| !c.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &b[s..=e],
        _ => &[],
    }
}

fn lossy(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn accept_hash_matches_rfc_sample() {
        // Sample key and accept value from RFC 6455 section 1.3.
        assert_eq!(
            hash_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_distinct_base64() {
        let mut rng = StdRng::seed_from_u64(0x0001_0203);
        let a = generate_key(&mut rng);
        let b = generate_key(&mut rng);
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 16);
    }

    #[test]
    fn response_roundtrip() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let resp = format_upgrade_response(&hash_key(key));
        check_upgrade_response(resp.as_bytes(), key).unwrap();
    }

    #[test]
    fn wrong_hash_is_rejected() {
        let resp = format_upgrade_response(&hash_key("someotherkey0000000000=="));
        let err = check_upgrade_response(resp.as_bytes(), "dGhlIHNhbXBsZSBub25jZQ==").unwrap_err();
        assert!(matches!(err, HandshakeError::HashMismatch(_)));
    }

    #[test]
    fn extra_headers_are_rejected() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let resp = format!(
            "HTTP/1.1 101 Switching Protocols\n\
             Connection: Upgrade\n\
             Upgrade: websocket\n\
             Server: nginx\n\
             Sec-Websocket-Accept: {}\n\n",
            hash_key(key)
        );
        let err = check_upgrade_response(resp.as_bytes(), key).unwrap_err();
        assert!(matches!(err, HandshakeError::BadHeaderCount(7)));
    }

    #[test]
    fn wrong_status_is_rejected() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let resp = format!(
            "HTTP/1.1 200 OK\n\
             Connection: Upgrade\n\
             Upgrade: websocket\n\
             Sec-Websocket-Accept: {}\n\n",
            hash_key(key)
        );
        let err = check_upgrade_response(resp.as_bytes(), key).unwrap_err();
        assert!(matches!(err, HandshakeError::BadStatus(_)));
    }

    #[test]
    fn crlf_response_is_rejected() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let resp = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-Websocket-Accept: {}\r\n\r\n",
            hash_key(key)
        );
        assert!(check_upgrade_response(resp.as_bytes(), key).is_err());
    }

    #[test]
    fn request_format() {
        let req = UpgradeRequest {
            path: "/updates",
            key: "rdwCAuY2qmzrQbTkg2fZhA==",
            host: "example.com:8080",
            user_agent: "test-agent",
            origin: "http://example.com:8080",
            auth_token: "tok123",
            extensions: &["permessage-deflate"],
            accept_encodings: &["gzip", "deflate"],
            extra_headers: &[("Accept", "*/*")],
        };
        let text = req.format();

        assert!(text.starts_with("GET /updates HTTP/1.1\n"));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("Host: example.com:8080\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\n"));
        assert!(text.contains("Sec-Websocket-Key: rdwCAuY2qmzrQbTkg2fZhA==\n"));
        assert!(text.contains("Connection: keep-alive, Upgrade\n"));
        assert!(text.contains("Upgrade: websocket\n"));
        assert!(text.contains("Authorization: Bearer tok123\n"));
        assert!(text.contains("Sec-WebSocket-Extensions: permessage-deflate\n"));
        assert!(text.contains("Accept: */*\n"));
    }

    #[test]
    fn empty_token_skips_authorization() {
        let req = UpgradeRequest {
            path: "/",
            key: "k",
            host: "h",
            ..Default::default()
        };
        assert!(!req.format().contains("Authorization"));
    }
}
