//! Initiator side of the tunnel: dial the remote endpoint, run the
//! upgrade exchange, hand the socket to a [`Tunnel`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use async_trait::async_trait;
use rand::{rngs::StdRng, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use super::{ConnectHandler, Tunnel};
use crate::protocol::{derive_salt, ConnId};
use crate::ws::{self, UpgradeRequest};

const FAKE_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:145.0) Gecko/20100101 Firefox/145.0";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest upgrade response we are willing to buffer.
const MAX_RESPONSE_LENGTH: usize = 1 << 14;

/// Dial the proxy endpoint, perform the upgrade exchange and return a
/// running tunnel. The checksum salt derives from the auth token on both
/// sides, nothing about it goes over the wire.
pub async fn connect(proxy_url: &str, token: &str) -> anyhow::Result<Tunnel> {
    let url = Url::parse(proxy_url).context("parse proxy url")?;
    let host = url
        .host_str()
        .context("proxy url carries no host")?
        .to_owned();
    let port = url
        .port_or_known_default()
        .context("proxy url carries no port")?;
    let addr = format!("{host}:{port}");

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("dial proxy server {addr}"))?;

    let mut rng = seeded_rng(addr.as_bytes());
    let key = ws::generate_key(&mut rng);

    let request = UpgradeRequest {
        path: url.path(),
        key: &key,
        host: &addr,
        user_agent: FAKE_USER_AGENT,
        origin: &format!("{}://{addr}", url.scheme()),
        auth_token: token,
        extensions: &["permessage-deflate"],
        accept_encodings: &["gzip", "deflate", "br", "zstd"],
        extra_headers: &[("Accept", "*/*"), ("Accept-Language", "en-US,en;q=0.5")],
    };

    let mut stream = stream;
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        stream
            .write_all(request.format().as_bytes())
            .await
            .context("send upgrade request")?;

        let response = read_response(&mut stream)
            .await
            .context("read upgrade response")?;
        ws::check_upgrade_response(&response, &key).context("check upgrade response")?;
        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("upgrade exchange timed out")??;

    debug!("tunnel established to {addr}");

    let salt = derive_salt(token);
    Ok(Tunnel::spawn(stream, salt, rng, Arc::new(AckHandler)))
}

/// Reads until the blank line that ends the response head.
async fn read_response(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed before upgrade response ended");
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(2).any(|w| w == b"\n\n") || buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(buf);
        }
        if buf.len() > MAX_RESPONSE_LENGTH {
            bail!("upgrade response head too large");
        }
    }
}

/// Client-side hello dispatch: an incoming hello acknowledges that the
/// server opened the proxied connection, deliver it to the pending open
/// waiter.
pub(crate) struct AckHandler;

#[async_trait]
impl ConnectHandler for AckHandler {
    async fn on_hello(&self, tunnel: &Tunnel, cid: ConnId, _data: &[u8]) -> anyhow::Result<()> {
        if tunnel.conns.acknowledge(&cid) {
            debug!("connection acknowledged (cid={cid})");
        } else {
            debug!("hello ack for unknown connection (cid={cid})");
        }
        Ok(())
    }
}

/// Seed a generator from the wall clock mixed with a peer-specific string.
pub fn seeded_rng(extra: &[u8]) -> StdRng {
    let mut seed = [0u8; 32];
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    seed[..16].copy_from_slice(&nanos.to_le_bytes());
    for (slot, b) in seed[16..].iter_mut().zip(extra) {
        *slot = *b;
    }
    StdRng::from_seed(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_rngs_differ_by_peer() {
        use rand::RngCore;
        let mut a = seeded_rng(b"peer-a:443");
        let mut b = seeded_rng(b"peer-b:443");
        assert_ne!(a.next_u64(), b.next_u64());
    }
}
