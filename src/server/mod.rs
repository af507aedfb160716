//! Remote endpoint: accepts upgrade requests, re-originates proxied
//! connections and serves the masquerade static site to everything
//! else.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use crate::config::{self, Settings};
use crate::protocol::derive_salt;
use crate::tunnel::{connect::seeded_rng, Tunnel};
use crate::ws;

pub mod http;
pub mod relay;

use http::RequestHead;
use relay::RelayHandler;

/// Bounds how long a client may take to deliver its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub static_dir: PathBuf,
    pub auth_token: String,

    /// Standard output is used when no log file is set.
    pub log_file: Option<String>,
    pub log_level: Level,

    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            static_dir: PathBuf::new(),
            auth_token: String::new(),
            log_file: None,
            log_level: Level::INFO,
            port: 0,
        }
    }
}

impl Settings for ServerConfig {
    fn apply(&mut self, name: &str, raw: &str) -> Result<(), String> {
        match name {
            "static_dir" => self.static_dir = PathBuf::from(config::parse_string(raw)?),
            "auth_token" => self.auth_token = config::parse_string(raw)?,
            "log_file" => self.log_file = Some(config::parse_string(raw)?),
            "log_level" => self.log_level = config::parse_level(raw)?,
            "port" => self.port = config::parse_u16(raw)?,
            _ => return Err("unknown field".into()),
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), String> {
        if self.static_dir.as_os_str().is_empty() {
            return Err("empty static directory".into());
        }
        if self.auth_token.is_empty() {
            return Err("empty auth token".into());
        }
        if self.port == 0 {
            return Err("empty or zero listen port".into());
        }
        Ok(())
    }
}

/// Run the server until interrupted.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("listen on port {}", config.port))?;
    info!("listening on port {}", config.port);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt, shutting down");
            }
            cancel.cancel();
        });
    }

    let config = Arc::new(config);
    let salt = derive_salt(&config.auth_token);

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

        let config = config.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, &peer.to_string(), config, salt, cancel).await {
                debug!("client {peer}: {err:#}");
            }
        });
    }
}

async fn handle_client(
    mut stream: TcpStream,
    peer: &str,
    config: Arc<ServerConfig>,
    salt: u32,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let raw = tokio::time::timeout(HEAD_TIMEOUT, http::read_head(&mut stream))
        .await
        .context("request head timed out")??;
    let head = http::parse_request(&raw)?;

    if !head.has_upgrade_headers() {
        return http::serve_static(&mut stream, &config.static_dir, &head).await;
    }

    match check_upgrade(&head, &config.auth_token) {
        Ok(key) => accept_tunnel(stream, peer, key, salt, cancel).await,
        Err(reject) => {
            warn!("reject upgrade from {peer}: {}", reject.reason);
            http::write_response(&mut stream, reject.status, "text/plain", reject.reason.as_bytes())
                .await
        }
    }
}

#[derive(Debug)]
struct Reject {
    status: &'static str,
    reason: String,
}

fn check_upgrade<'a>(head: &'a RequestHead, token: &str) -> Result<&'a str, Reject> {
    // An empty configured token never matches, even if a client sends an
    // empty bearer value.
    let bearer = head.bearer_token().unwrap_or_default();
    if bearer.is_empty() || bearer != token {
        return Err(Reject {
            status: "401 Unauthorized",
            reason: "bad token".to_owned(),
        });
    }

    match head.header("Sec-Websocket-Key") {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(Reject {
            status: "400 Bad Request",
            reason: "missing sec-websocket-key".to_owned(),
        }),
    }
}

async fn accept_tunnel(
    mut stream: TcpStream,
    peer: &str,
    key: &str,
    salt: u32,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    let response = ws::format_upgrade_response(&ws::hash_key(key));
    stream
        .write_all(response.as_bytes())
        .await
        .context("send upgrade response")?;
    stream.flush().await.context("flush upgrade response")?;

    info!("new client {peer}");
    let rng = seeded_rng(peer.as_bytes());
    let tunnel = Tunnel::spawn(stream, salt, rng, Arc::new(RelayHandler));

    tokio::select! {
        _ = tunnel.closed() => {}
        _ = cancel.cancelled() => tunnel.shutdown(),
    }
    info!("drop client {peer}");
    Ok(())
}
