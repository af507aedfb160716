//! Static name table.
//!
//! Groups of aliases share one ordered address list:
//!
//! ```text
//! youtube.com, www.youtube.com:
//!     64.233.162.91
//!     64.233.162.93
//! ```
//!
//! A group header is a comma-separated list of names ending with a
//! colon, followed by one address per line. All aliases of a group
//! resolve to the same shared list.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};

#[derive(Debug, Default)]
pub struct Resolver {
    map: HashMap<String, Arc<Vec<IpAddr>>>,
}

impl Resolver {
    pub fn load(path: &Path) -> anyhow::Result<Resolver> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read names file {}", path.display()))?;
        Resolver::parse(&text)
    }

    pub fn parse(text: &str) -> anyhow::Result<Resolver> {
        let mut map = HashMap::new();
        let mut names: Vec<String> = Vec::new();
        let mut list: Vec<IpAddr> = Vec::new();

        let mut flush = |names: &mut Vec<String>, list: &mut Vec<IpAddr>| -> anyhow::Result<()> {
            if names.is_empty() {
                return Ok(());
            }
            if list.is_empty() {
                bail!("empty address list for names {names:?}");
            }
            let shared = Arc::new(std::mem::take(list));
            for name in names.drain(..) {
                map.insert(name, shared.clone());
            }
            Ok(())
        };

        for (i, raw_line) in text.lines().enumerate() {
            let ln = i + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(header) = line.strip_suffix(':') {
                flush(&mut names, &mut list)?;
                names = parse_names_line(header).with_context(|| format!("parse line {ln}"))?;
            } else {
                if names.is_empty() {
                    bail!("line {ln} contains address before any names");
                }
                let addr: IpAddr = line
                    .parse()
                    .with_context(|| format!("parse address line {ln}"))?;
                list.push(addr);
            }
        }
        flush(&mut names, &mut list)?;

        Ok(Resolver { map })
    }

    /// Returns the shared address list for any alias of a group, or
    /// nothing when the name is unknown.
    pub fn resolve(&self, name: &str) -> Option<Arc<Vec<IpAddr>>> {
        self.map.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn parse_names_line(header: &str) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for part in header.split(',') {
        let name = part.trim();
        if name.is_empty() {
            bail!("empty name");
        }
        names.push(name.to_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_NAMES: &str = "
# comment
# another comment
youtube.com, www.youtube.com:

    64.233.162.91
    64.233.162.93
    64.233.162.136
    64.233.162.190

youtube.ru, www.youtube.ru:

    209.85.233.91
    209.85.233.93
    209.85.233.136
    209.85.233.190
    209.85.233.198

instagram.com:

    188.186.154.88

# end comment
";

    fn addrs(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn resolve_groups_and_aliases() {
        let r = Resolver::parse(TEST_NAMES).unwrap();

        assert!(r.resolve("ya.ru").is_none());
        assert_eq!(
            *r.resolve("instagram.com").unwrap(),
            addrs(&["188.186.154.88"])
        );

        let want = addrs(&[
            "64.233.162.91",
            "64.233.162.93",
            "64.233.162.136",
            "64.233.162.190",
        ]);
        assert_eq!(*r.resolve("youtube.com").unwrap(), want);
        assert_eq!(*r.resolve("www.youtube.com").unwrap(), want);
    }

    #[test]
    fn aliases_share_one_list() {
        let r = Resolver::parse(TEST_NAMES).unwrap();
        let a = r.resolve("youtube.com").unwrap();
        let b = r.resolve("www.youtube.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn group_without_addresses_is_rejected() {
        let err = Resolver::parse("a.com:\nb.com:\n    1.2.3.4\n").unwrap_err();
        assert!(err.to_string().contains("empty address list"), "{err}");

        let err = Resolver::parse("a.com:\n").unwrap_err();
        assert!(err.to_string().contains("empty address list"), "{err}");
    }

    #[test]
    fn address_before_any_group_is_rejected() {
        let err = Resolver::parse("1.2.3.4\n").unwrap_err();
        assert!(err.to_string().contains("address before any names"), "{err}");
    }

    #[test]
    fn empty_name_in_header_is_rejected() {
        assert!(Resolver::parse("a.com,:\n    1.2.3.4\n").is_err());
    }

    #[test]
    fn bad_address_is_rejected() {
        assert!(Resolver::parse("a.com:\n    not-an-ip\n").is_err());
    }
}
