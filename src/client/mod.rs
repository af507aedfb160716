//! Intercepting client: connects the tunnel, installs the NAT redirect
//! and dispatches intercepted traffic by the routing policy.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use crate::config::{self, Settings};
use crate::dns;
use crate::tunnel;

pub mod listener;
pub mod resolver;
pub mod router;
pub mod sys;

pub use listener::LocalServer;
pub use resolver::Resolver;
pub use router::{Action, Router};

const DEFAULT_ROUTES_FILE: &str = "routes.txt";

/// Time-to-live put on answers served from the static name table.
const STATIC_ANSWER_TTL: u32 = 300;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub proxy_url: String,
    pub auth_token: String,

    pub routes_file: String,
    pub names_file: Option<String>,

    /// Standard output is used when no log file is set.
    pub log_file: Option<String>,
    pub log_level: Level,

    pub local_tcp_port: u16,
    pub local_udp_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            proxy_url: String::new(),
            auth_token: String::new(),
            routes_file: DEFAULT_ROUTES_FILE.to_owned(),
            names_file: None,
            log_file: None,
            log_level: Level::INFO,
            local_tcp_port: 0,
            local_udp_port: 0,
        }
    }
}

impl Settings for ClientConfig {
    fn apply(&mut self, name: &str, raw: &str) -> Result<(), String> {
        match name {
            "proxy_url" => self.proxy_url = config::parse_string(raw)?,
            "auth_token" => self.auth_token = config::parse_string(raw)?,
            "routes_file" => self.routes_file = config::parse_string(raw)?,
            "names_file" => self.names_file = Some(config::parse_string(raw)?),
            "log_file" => self.log_file = Some(config::parse_string(raw)?),
            "log_level" => self.log_level = config::parse_level(raw)?,
            "local_tcp_port" => self.local_tcp_port = config::parse_u16(raw)?,
            "local_udp_port" => self.local_udp_port = config::parse_u16(raw)?,
            _ => return Err("unknown field".into()),
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), String> {
        if self.proxy_url.is_empty() {
            return Err("empty proxy url".into());
        }
        if self.auth_token.is_empty() {
            return Err("empty auth token".into());
        }
        if self.local_tcp_port == 0 {
            return Err("empty or zero local tcp port".into());
        }
        if self.local_udp_port == 0 {
            return Err("empty or zero local udp port".into());
        }
        Ok(())
    }
}

/// Run the client until interrupted or the listener fails.
pub async fn run(config: ClientConfig) -> anyhow::Result<()> {
    let router = Arc::new(Router::load(Path::new(&config.routes_file))?);
    info!("loaded {} routes", router.len());

    let resolver = match &config.names_file {
        Some(path) => {
            let resolver = Arc::new(Resolver::load(Path::new(path))?);
            info!("loaded {} names", resolver.len());
            Some(resolver)
        }
        None => None,
    };

    let tunnel = tunnel::connect(&config.proxy_url, &config.auth_token).await?;
    info!("tunnel established");

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

    sys::install_redirect(config.local_tcp_port, config.local_udp_port)
        .await
        .context("set up local nat")?;
    let _nat = scopeguard::guard((), |()| sys::remove_redirect());

    {
        let resolver = resolver.clone();
        let cancel = cancel.clone();
        let port = config.local_udp_port;
        tokio::spawn(async move {
            if let Err(err) = serve_dns(port, resolver, cancel).await {
                warn!("local dns: {err:#}");
            }
        });
    }

    let server = LocalServer::new(router, tunnel.clone());
    let res = server.listen(config.local_tcp_port, cancel.clone()).await;

    cancel.cancel();
    tunnel.shutdown();
    res
}

/// Answer redirected DNS queries from the static name table. This is a
/// stand-alone helper, not a recursive resolver: names absent from the
/// table get a name error.
async fn serve_dns(
    port: u16,
    resolver: Option<Arc<Resolver>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind local udp port {port}"))?;
    info!("local dns listening on port {port}");

    let mut buf = vec![0u8; 1 << 12];
    loop {
        let (n, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = socket.recv_from(&mut buf) => res.context("receive datagram")?,
        };

        let query = match dns::decode(&buf[..n]) {
            Ok(query) => query,
            Err(err) => {
                warn!("drop malformed dns query from {peer}: {err}");
                continue;
            }
        };

        let response = answer_query(&query, resolver.as_deref());
        let data = dns::encode(&response);
        if let Err(err) = socket.send_to(&data, peer).await {
            warn!("send dns response to {peer}: {err}");
        }
    }
}

fn answer_query(query: &dns::Message, resolver: Option<&Resolver>) -> dns::Message {
    let mut response = dns::Message {
        id: query.id,
        opcode: query.opcode,
        rcode: dns::Rcode::OK,
        quests: query.quests.clone(),
        answers: Vec::new(),
        records: Vec::new(),
    };

    let Some(resolver) = resolver else {
        response.rcode = dns::Rcode::SERVER_FAILURE;
        return response;
    };
    let Some(quest) = query.quests.first() else {
        response.rcode = dns::Rcode::FORMAT_ERROR;
        return response;
    };
    if quest.rtype != dns::RecordType::A {
        response.rcode = dns::Rcode::NOT_IMPLEMENTED;
        return response;
    }

    match resolver.resolve(&quest.name) {
        Some(list) => {
            for addr in list.iter() {
                if let IpAddr::V4(v4) = addr {
                    response
                        .answers
                        .push(dns::Record::a(&quest.name, *v4, STATIC_ANSWER_TTL));
                }
            }
        }
        None => response.rcode = dns::Rcode::NAME_ERROR,
    }
    response
}
