//! Per-destination routing policy.
//!
//! One entry per line: an address followed by an optional action. The
//! action defaults to proxy, so listing an address is enough to pull it
//! into the tunnel. Addresses that appear in no entry resolve to auto,
//! which the caller maps to its default policy.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{bail, Context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No explicit entry; caller decides (default policy is direct).
    Auto,
    /// Dial the destination directly, bypassing the tunnel.
    Direct,
    /// Carry the connection through the tunnel.
    Proxy,
    /// Drop the intercepted connection immediately.
    Block,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Auto => "auto",
            Action::Direct => "direct",
            Action::Proxy => "proxy",
            Action::Block => "block",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
pub struct Router {
    table: HashMap<IpAddr, Action>,
}

impl Router {
    pub fn load(path: &Path) -> anyhow::Result<Router> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read routes file {}", path.display()))?;
        Router::parse(&text)
    }

    pub fn parse(text: &str) -> anyhow::Result<Router> {
        let mut table = HashMap::new();
        for (i, raw_line) in text.lines().enumerate() {
            let ln = i + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next() else {
                continue;
            };
            let ip: IpAddr = addr
                .parse()
                .with_context(|| format!("bad ip on line {ln}"))?;

            let action = match fields.next() {
                None => Action::Proxy,
                Some("direct") => Action::Direct,
                Some("proxy") => Action::Proxy,
                Some("block") => Action::Block,
                Some(other) => bail!("unknown action \"{other}\" on line {ln}"),
            };
            if fields.next().is_some() {
                bail!("trailing fields on line {ln}");
            }

            // Last entry wins for duplicate addresses.
            table.insert(ip, action);
        }
        Ok(Router { table })
    }

    pub fn lookup(&self, ip: IpAddr) -> Action {
        self.table.get(&ip).copied().unwrap_or(Action::Auto)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ROUTES: &str = "
# youtube.com

64.233.162.91        proxy
64.233.162.93        proxy
64.233.162.136
64.233.162.190

142.250.102.198

# youtube.ru

209.85.233.91       direct
209.85.233.93
209.85.233.136
209.85.233.190
209.85.233.198      direct

# instagram.com

188.186.154.88      block
";

    #[test]
    fn lookup_actions() {
        let router = Router::parse(TEST_ROUTES).unwrap();

        let cases = [
            ("10.10.10.10", Action::Auto),
            ("209.85.233.198", Action::Direct),
            ("64.233.162.190", Action::Proxy),
            ("64.233.162.91", Action::Proxy),
            ("64.233.162.136", Action::Proxy),
            ("188.186.154.88", Action::Block),
        ];
        for (addr, want) in cases {
            let got = router.lookup(addr.parse().unwrap());
            assert_eq!(got, want, "lookup {addr}");
        }
    }

    #[test]
    fn bad_address_is_rejected() {
        let err = Router::parse("not.an.ip direct\n").unwrap_err();
        assert!(err.to_string().contains("bad ip on line 1"), "{err}");
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = Router::parse("10.0.0.1 tunnel\n").unwrap_err();
        assert!(err.to_string().contains("unknown action"), "{err}");
    }

    #[test]
    fn trailing_fields_are_rejected() {
        assert!(Router::parse("10.0.0.1 direct extra\n").is_err());
    }

    #[test]
    fn duplicate_last_entry_wins() {
        let router = Router::parse("10.0.0.1 direct\n10.0.0.1 block\n").unwrap();
        assert_eq!(router.lookup("10.0.0.1".parse().unwrap()), Action::Block);
    }

    #[test]
    fn empty_file_routes_everything_auto() {
        let router = Router::parse("# nothing here\n").unwrap();
        assert!(router.is_empty());
        assert_eq!(router.lookup("1.2.3.4".parse().unwrap()), Action::Auto);
    }
}
