//! Linux collaterals of the intercepting client: NAT redirect rules,
//! original-destination recovery and the owning-process lookup.

use std::time::Duration;

use anyhow::{bail, Context};
use tokio::process::Command;
use tracing::warn;

const EXEC_TIMEOUT: Duration = Duration::from_secs(1);

/// Redirect outbound tcp/443 and udp/53 into the local listeners.
/// Traffic owned by root is skipped so the client's own tunnel socket
/// does not loop back into itself.
pub async fn install_redirect(tcp_port: u16, udp_port: u16) -> anyhow::Result<()> {
    let tcp = tcp_port.to_string();
    run(
        "iptables",
        &[
            "-t", "nat", "-A", "OUTPUT", "-p", "tcp", "-m", "owner", "!", "--uid-owner", "root",
            "--dport", "443", "-j", "REDIRECT", "--to-port", &tcp,
        ],
    )
    .await
    .context("install tcp redirect")?;

    let udp = udp_port.to_string();
    run(
        "iptables",
        &[
            "-t", "nat", "-A", "OUTPUT", "-p", "udp", "-m", "owner", "!", "--uid-owner", "root",
            "--dport", "53", "-j", "REDIRECT", "--to-port", &udp,
        ],
    )
    .await
    .context("install udp redirect")?;

    Ok(())
}

/// Flush the NAT table. Deliberately synchronous so it can run from a
/// teardown guard on any exit path.
pub fn remove_redirect() {
    let res = std::process::Command::new("iptables")
        .args(["-t", "nat", "-F"])
        .output();
    match res {
        Ok(output) if !output.status.success() => {
            warn!(
                "remove nat redirect: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(_) => {}
        Err(err) => warn!("remove nat redirect: {err}"),
    }
}

async fn run(program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::time::timeout(
        EXEC_TIMEOUT,
        Command::new(program).args(args).output(),
    )
    .await
    .with_context(|| format!("{program} timed out"))?
    .with_context(|| format!("execute {program}"))?;

    if !output.status.success() {
        bail!(
            "{program} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(target_os = "linux")]
pub use linux::original_destination;

#[cfg(target_os = "linux")]
mod linux {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use anyhow::Context;
    use nix::sys::socket::sockopt::OriginalDst;
    use tokio::net::TcpStream;

    /// Recover the pre-redirect destination of an intercepted connection
    /// from the kernel NAT table.
    pub fn original_destination(stream: &TcpStream) -> anyhow::Result<SocketAddrV4> {
        let sin = nix::sys::socket::getsockopt(stream, OriginalDst)
            .context("getsockopt SO_ORIGINAL_DST")?;
        let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        let port = u16::from_be(sin.sin_port);
        Ok(SocketAddrV4::new(ip, port))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn original_destination(
    _stream: &tokio::net::TcpStream,
) -> anyhow::Result<std::net::SocketAddrV4> {
    anyhow::bail!("transparent interception is only supported on linux")
}

/// Best-effort lookup of the executable name owning the local port of an
/// intercepted connection. Scans `ss -tanp` output for the port, then
/// reads the process exe link.
pub async fn executable_for_port(port: u16) -> Option<String> {
    let output = match run("ss", &["-tanp"]).await {
        Ok(output) => output,
        Err(err) => {
            warn!("execute ss: {err:#}");
            return None;
        }
    };

    let needle = format!(":{port} ");
    for line in output.lines() {
        if !line.contains(&needle) {
            continue;
        }
        // Format: LISTEN 0 128 *:443 *:* users:(("nginx",pid=1234,fd=3))
        let Some(idx) = line.find("pid=") else {
            continue;
        };
        let digits: String = line[idx + 4..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let Ok(pid) = digits.parse::<u32>() else {
            continue;
        };
        return executable_name(pid);
    }
    None
}

fn executable_name(pid: u32) -> Option<String> {
    if let Ok(target) = std::fs::read_link(format!("/proc/{pid}/exe")) {
        return target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
    }

    // The exe link is unreadable for some processes, fall back to the
    // first element of cmdline.
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let first = cmdline.split(|&b| b == 0).next()?;
    if first.is_empty() {
        return None;
    }
    let path = String::from_utf8_lossy(first).into_owned();
    path.rsplit('/').next().map(str::to_owned)
}
