//! Request-head handling for the remote endpoint.
//!
//! The server speaks just enough HTTP/1.1 to do two things: accept the
//! tunnel upgrade and serve the masquerade static site to anything
//! else. Upgrade requests arrive with bare LF line endings, so the head
//! is normalized before parsing.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Caps the buffered request head.
const MAX_HEAD_LENGTH: usize = 1 << 16;

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_upgrade_headers(&self) -> bool {
        if self.header("Upgrade") != Some("websocket") {
            return false;
        }
        self.header("Connection")
            .is_some_and(|v| v.contains("Upgrade"))
    }

    /// Bearer token from the authorization header, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("Authorization")?.strip_prefix("Bearer ")
    }
}

/// Read until the blank line that terminates the request head.
pub(crate) async fn read_head<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        let n = r.read(&mut byte).await.context("read request head")?;
        if n == 0 {
            bail!("connection closed before request head ended");
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") || buf.ends_with(b"\n\n") {
            return Ok(buf);
        }
        if buf.len() > MAX_HEAD_LENGTH {
            bail!("request head too large");
        }
    }
}

pub(crate) fn parse_request(head: &[u8]) -> anyhow::Result<RequestHead> {
    let normalized = normalize_line_endings(head);

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    let status = req.parse(&normalized).context("parse request head")?;
    if status.is_partial() {
        bail!("incomplete request head");
    }

    Ok(RequestHead {
        method: req.method.unwrap_or_default().to_owned(),
        path: req.path.unwrap_or_default().to_owned(),
        headers: req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_owned(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
    })
}

fn normalize_line_endings(head: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len() + 16);
    let mut prev = 0u8;
    for &b in head {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// Serve the masquerade site: the index page at the root, files below
/// `/static/`, a plain 404 for everything else. One response per
/// connection, closed afterwards.
pub(crate) async fn serve_static<W: AsyncWrite + Unpin>(
    w: &mut W,
    static_dir: &Path,
    head: &RequestHead,
) -> anyhow::Result<()> {
    if head.method != "GET" {
        return write_response(w, "405 Method Not Allowed", "text/plain", b"method not allowed")
            .await;
    }

    let file = if head.path == "/" {
        Some(static_dir.join("index.html"))
    } else {
        head.path
            .strip_prefix("/static/")
            .and_then(|rel| sanitize_path(static_dir, rel))
    };

    let Some(file) = file else {
        return write_response(w, "404 Not Found", "text/plain", b"not found").await;
    };

    match tokio::fs::read(&file).await {
        Ok(body) => write_response(w, "200 OK", content_type(&file), &body).await,
        Err(_) => write_response(w, "404 Not Found", "text/plain", b"not found").await,
    }
}

/// Resolve a request path below the static directory, refusing anything
/// that tries to climb out of it.
fn sanitize_path(static_dir: &Path, rel: &str) -> Option<PathBuf> {
    if rel.is_empty() {
        return None;
    }
    let rel = Path::new(rel);
    for part in rel.components() {
        match part {
            Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(static_dir.join(rel))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

pub(crate) async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> anyhow::Result<()> {
    let head = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    w.write_all(head.as_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LF_REQUEST: &[u8] = b"GET /updates HTTP/1.1\n\
        Host: localhost:8733\n\
        Upgrade: websocket\n\
        Connection: keep-alive, Upgrade\n\
        Sec-Websocket-Key: rdwCAuY2qmzrQbTkg2fZhA==\n\
        Authorization: Bearer tok123\n\n";

    #[tokio::test]
    async fn head_is_read_up_to_blank_line() {
        let mut input = Vec::from(LF_REQUEST);
        input.extend_from_slice(b"trailing frame bytes");
        let head = read_head(&mut input.as_slice()).await.unwrap();
        assert_eq!(head, LF_REQUEST);
    }

    #[test]
    fn parses_lf_request() {
        let head = parse_request(LF_REQUEST).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/updates");
        assert!(head.has_upgrade_headers());
        assert_eq!(head.bearer_token(), Some("tok123"));
        assert_eq!(
            head.header("sec-websocket-key"),
            Some("rdwCAuY2qmzrQbTkg2fZhA==")
        );
    }

    #[test]
    fn parses_crlf_request() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let head = parse_request(raw).unwrap();
        assert_eq!(head.path, "/");
        assert!(!head.has_upgrade_headers());
        assert!(head.bearer_token().is_none());
    }

    #[test]
    fn upgrade_requires_both_headers() {
        let raw = b"GET / HTTP/1.1\nUpgrade: websocket\nConnection: close\n\n";
        assert!(!parse_request(raw).unwrap().has_upgrade_headers());

        let raw = b"GET / HTTP/1.1\nConnection: Upgrade\n\n";
        assert!(!parse_request(raw).unwrap().has_upgrade_headers());
    }

    #[test]
    fn path_traversal_is_refused() {
        let dir = Path::new("/srv/static");
        assert!(sanitize_path(dir, "app.css").is_some());
        assert!(sanitize_path(dir, "img/logo.png").is_some());
        assert!(sanitize_path(dir, "../secret").is_none());
        assert!(sanitize_path(dir, "a/../../secret").is_none());
        assert!(sanitize_path(dir, "/etc/passwd").is_none());
        assert!(sanitize_path(dir, "").is_none());
    }

    #[tokio::test]
    async fn not_found_response() {
        let head = parse_request(b"GET /nope HTTP/1.1\n\n").unwrap();
        let mut out = Vec::new();
        serve_static(&mut out, Path::new("/srv/static"), &head)
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{text}");
        assert!(text.contains("Content-Length: 9\r\n"), "{text}");
    }
}
