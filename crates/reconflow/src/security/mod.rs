use std::{net::IpAddr, str::FromStr};

use ipnet::IpNet;
use tracing::warn;

use crate::models::{normalize_host, Scope};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScopeRule {
    /// A domain and everything below it.
    Domain(String),
    Network(IpNet),
}

/// Operator allowlist consulted before any scan is accepted. An empty
/// allowlist accepts every target.
#[derive(Debug, Clone, Default)]
pub struct ScopeGuard {
    rules: Vec<ScopeRule>,
}

impl ScopeGuard {
    pub fn new(allowlist: &[String]) -> Self {
        let rules = allowlist
            .iter()
            .filter_map(|entry| {
                let entry = entry.trim();
                if entry.is_empty() {
                    return None;
                }
                if let Ok(net) = IpNet::from_str(entry) {
                    return Some(ScopeRule::Network(net));
                }
                if let Ok(ip) = IpAddr::from_str(entry) {
                    return Some(ScopeRule::Network(IpNet::from(ip)));
                }
                let host = normalize_host(entry);
                if host.is_empty() {
                    warn!(entry, "ignoring unusable scope allowlist entry");
                    return None;
                }
                Some(ScopeRule::Domain(host))
            })
            .collect();
        Self { rules }
    }

    pub fn is_open(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn allows_host(&self, target: &str) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let host = normalize_host(target);
        if let Ok(ip) = IpAddr::from_str(&host) {
            return self.rules.iter().any(|rule| match rule {
                ScopeRule::Network(net) => net.contains(&ip),
                ScopeRule::Domain(_) => false,
            });
        }
        self.rules.iter().any(|rule| match rule {
            ScopeRule::Domain(root) => host == *root || host.ends_with(&format!(".{root}")),
            ScopeRule::Network(_) => false,
        })
    }

    /// Every host of the scope must be allowed.
    pub fn allows(&self, scope: &Scope) -> bool {
        scope.hosts().iter().all(|h| self.allows_host(h))
    }
}
