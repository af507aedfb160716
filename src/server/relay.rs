//! Server-side connection handling: dial the requested target and relay
//! bytes between it and the tunnel.

use anyhow::bail;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::protocol::{hello, CloseCode, ConnId, Hello, Packet};
use crate::tunnel::{Conn, ConnectHandler, Tunnel};

const RELAY_BUFFER: usize = 1 << 16;

/// Server-side hello dispatch: every hello packet asks for a new
/// outbound connection.
pub(crate) struct RelayHandler;

#[async_trait]
impl ConnectHandler for RelayHandler {
    async fn on_hello(&self, tunnel: &Tunnel, cid: ConnId, data: &[u8]) -> anyhow::Result<()> {
        if tunnel.contains(&cid) {
            bail!("hello packet from already existing connection");
        }
        let hello = hello::decode(data)?;
        let conn = tunnel.attach(cid);
        tokio::spawn(serve_conn(tunnel.clone(), conn, hello));
        Ok(())
    }
}

async fn serve_conn(tunnel: Tunnel, conn: Conn, hello: Hello) {
    let cid = conn.cid();

    let remote = match TcpStream::connect(hello.addr).await {
        Ok(remote) => remote,
        Err(err) => {
            warn!("dial {} (cid={cid}): {err}", hello.addr);
            let close = tunnel
                .packet_tx()
                .with_rng(|rng| Packet::close(rng, cid, CloseCode::DIAL_FAILED));
            if let Err(err) = tunnel.packet_tx().send(close).await {
                debug!("report failed dial (cid={cid}): {err}");
            }
            tunnel.detach(&cid);
            return;
        }
    };

    // Acknowledge the open: the client side completes its pending waiter
    // on this hello.
    let ack = tunnel
        .packet_tx()
        .with_rng(|rng| Packet::hello(rng, cid, &hello));
    match ack {
        Ok(ack) => {
            if tunnel.packet_tx().send(ack).await.is_err() {
                tunnel.detach(&cid);
                return;
            }
        }
        Err(err) => {
            warn!("encode hello ack (cid={cid}): {err}");
            tunnel.detach(&cid);
            return;
        }
    }
    info!("proxied connection (cid={cid}) to {} open", hello.addr);

    let (mut tunnel_rd, mut tunnel_wr) = conn.split();
    let (mut remote_rd, mut remote_wr) = remote.into_split();

    // Client bytes flow out to the target until the client closes the
    // logical connection or the tunnel goes down.
    let to_remote = tokio::spawn(async move {
        let mut buf = vec![0u8; RELAY_BUFFER];
        loop {
            match tunnel_rd.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if remote_wr.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!("tunnel side of proxied connection: {err}");
                    break;
                }
            }
        }
        let _ = remote_wr.shutdown().await;
    });

    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        tokio::select! {
            _ = tunnel.closed() => break,
            res = remote_rd.read(&mut buf) => match res {
                Ok(0) => {
                    let _ = tunnel_wr.close(CloseCode::OK).await;
                    break;
                }
                Ok(n) => {
                    if tunnel_wr.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("read from target (cid={cid}): {err}");
                    let _ = tunnel_wr.close(CloseCode::ERROR).await;
                    break;
                }
            },
        }
    }

    let _ = to_remote.await;
    info!("proxied connection (cid={cid}) ended");
}
