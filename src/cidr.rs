//! Remote-address filtering by CIDR block (component C).

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

/// A parsed set of CIDR blocks a session's remote address must fall within.
///
/// An empty set rejects every remote address — sessions are opt-in, not
/// opt-out, to networks.
#[derive(Debug, Clone, Default)]
pub struct NetFilter {
    nets: Vec<IpNet>,
}

impl NetFilter {
    /// Parse a comma-separated list of CIDRs or bare IPs.
    ///
    /// Invalid entries are logged and dropped rather than failing the whole
    /// parse, matching the original daemon's best-effort `parseAddr`.
    pub fn parse(spec: &str) -> Self {
        let mut nets = Vec::new();
        for raw in spec.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match IpNet::from_str(raw) {
                Ok(net) => nets.push(net),
                Err(_) => match IpAddr::from_str(raw) {
                    Ok(ip) => nets.push(IpNet::from(ip)),
                    Err(e) => log::warn!("ignoring invalid CIDR entry {raw:?}: {e}"),
                },
            }
        }
        Self { nets }
    }

    /// True iff `remote` lies within any configured net.
    pub fn allows(&self, remote: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&remote))
    }

    /// True iff no nets are configured (every remote address is rejected).
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_matching_ip() {
        let filter = NetFilter::parse("10.0.0.0/8,192.168.0.0/16");
        assert!(filter.allows("10.1.2.3".parse().unwrap()));
        assert!(filter.allows("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_rejects_non_matching_ip() {
        let filter = NetFilter::parse("10.0.0.0/8,192.168.0.0/16");
        assert!(!filter.allows("127.0.0.1".parse().unwrap()));
        assert!(!filter.allows("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_empty_spec_rejects_everything() {
        let filter = NetFilter::parse("");
        assert!(filter.is_empty());
        assert!(!filter.allows("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_bare_ip_matches_only_itself() {
        let filter = NetFilter::parse("127.0.0.1");
        assert!(filter.allows("127.0.0.1".parse().unwrap()));
        assert!(!filter.allows("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_invalid_entry_is_dropped_not_fatal() {
        let filter = NetFilter::parse("not-a-cidr,10.0.0.0/8");
        assert!(filter.allows("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_wide_open_net() {
        let filter = NetFilter::parse("0.0.0.0/0");
        assert!(filter.allows("203.0.113.9".parse().unwrap()));
    }
}
