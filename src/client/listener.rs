//! Local intercept listener.
//!
//! NAT-redirected connections land here. For each accepted socket the
//! original destination is recovered from the kernel, the router decides
//! what to do with it, and the connection is either dropped, dialed
//! directly, or carried through the tunnel.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::router::{Action, Router};
use super::sys;
use crate::protocol::{CloseCode, Hello};
use crate::tunnel::Tunnel;

const RELAY_BUFFER: usize = 1 << 16;

pub struct LocalServer {
    router: Arc<Router>,
    tunnel: Tunnel,
    next_id: AtomicU64,
}

impl LocalServer {
    pub fn new(router: Arc<Router>, tunnel: Tunnel) -> Self {
        LocalServer {
            router,
            tunnel,
            next_id: AtomicU64::new(0),
        }
    }

    /// Accept and dispatch intercepted connections until cancelled.
    pub async fn listen(&self, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("listen on local tcp port {port}"))?;
        info!("local server listening on port {port}");

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("accept connection: {err}");
                        continue;
                    }
                },
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let router = self.router.clone();
            let tunnel = self.tunnel.clone();
            tokio::spawn(handle_connection(router, tunnel, id, stream, peer));
        }
    }
}

async fn handle_connection(
    router: Arc<Router>,
    tunnel: Tunnel,
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let dst = match sys::original_destination(&stream) {
        Ok(dst) => dst,
        Err(err) => {
            warn!("get original destination of {peer}: {err:#}");
            return;
        }
    };
    let proc_name = sys::executable_for_port(peer.port())
        .await
        .unwrap_or_else(|| "?".to_owned());

    let action = router.lookup(IpAddr::V4(*dst.ip()));
    info!("accepted connection (id={id}) from {proc_name} ({peer}) to {dst}, action {action}");

    // Auto falls back to the default policy, which is direct.
    match action {
        Action::Block => {
            info!("blocked connection (id={id}) to {dst}");
        }
        Action::Direct | Action::Auto => relay_direct(id, stream, dst).await,
        Action::Proxy => relay_proxied(id, stream, tunnel, dst).await,
    }
}

async fn relay_direct(id: u64, mut client: TcpStream, dst: SocketAddrV4) {
    let mut remote = match TcpStream::connect(SocketAddr::V4(dst)).await {
        Ok(remote) => remote,
        Err(err) => {
            warn!("direct destination {dst} dial: {err}");
            return;
        }
    };
    debug!("new direct connection (id={id}) to {dst} established");

    if let Err(err) = tokio::io::copy_bidirectional(&mut client, &mut remote).await {
        debug!("direct relay (id={id}): {err}");
    }
    debug!("relay of connection (id={id}) ended");
}

async fn relay_proxied(id: u64, client: TcpStream, tunnel: Tunnel, dst: SocketAddrV4) {
    let conn = match tunnel.open(Hello::tcp(SocketAddr::V4(dst))).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!("open proxied connection (id={id}) to {dst}: {err:#}");
            return;
        }
    };
    let cid = conn.cid();
    let (mut tunnel_rd, mut tunnel_wr) = conn.split();
    let (mut client_rd, mut client_wr) = client.into_split();

    // Local application bytes flow into the tunnel until the app closes
    // its side, then the logical connection is closed with it.
    let to_tunnel = tokio::spawn(async move {
        let mut buf = vec![0u8; RELAY_BUFFER];
        loop {
            match client_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tunnel_wr.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = tunnel_wr.close(CloseCode::OK).await;
    });

    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        match tunnel_rd.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if client_wr.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!("proxied connection (id={id}, cid={cid}): {err}");
                break;
            }
        }
    }
    let _ = client_wr.shutdown().await;

    to_tunnel.abort();
    let _ = to_tunnel.await;
    debug!(
        "relay of proxied connection (id={id}, cid={cid}) ended, received {} bytes",
        tunnel_rd.received()
    );
}
