use std::{fmt, net::IpAddr, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TargetId = Uuid;
pub type ScanId = Uuid;
pub type JobId = Uuid;

/// What a target covers: a root domain (and everything below it) or an
/// explicit list of hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    Domain { root: String },
    Hosts { hosts: Vec<String> },
}

impl Scope {
    /// Parses `example.com` as a domain scope and `a.example.com,b.example.org`
    /// as a host list. Every entry must be a hostname or an IP address; the
    /// first one that is not is reported back.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut hosts = Vec::new();
        for token in raw.split([',', '\n', ' ']).map(str::trim) {
            if token.is_empty() {
                continue;
            }
            // Scope hosts end up on tool command lines.
            if token.starts_with('-') {
                return Err(format!("{token:?} must not start with '-'"));
            }
            let host = match token.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
                Ok(ip) => ip.to_string(),
                Err(_) => normalize_host(token),
            };
            if host.parse::<IpAddr>().is_err() && !is_hostname(&host) {
                return Err(format!("{token:?} is not a hostname or IP address"));
            }
            hosts.push(host);
        }
        hosts.sort();
        hosts.dedup();

        match hosts.len() {
            0 => Err("no hosts given".to_string()),
            1 => Ok(Scope::Domain {
                root: hosts.remove(0),
            }),
            _ => Ok(Scope::Hosts { hosts }),
        }
    }

    /// Canonical identity of the scope, used to find an existing target.
    pub fn key(&self) -> String {
        match self {
            Scope::Domain { root } => root.clone(),
            Scope::Hosts { hosts } => hosts.join(","),
        }
    }

    /// Host handed to tools that take a single target argument.
    pub fn primary(&self) -> &str {
        match self {
            Scope::Domain { root } => root,
            Scope::Hosts { hosts } => hosts.first().map(String::as_str).unwrap_or_default(),
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        match self {
            Scope::Domain { root } => vec![root.clone()],
            Scope::Hosts { hosts } => hosts.clone(),
        }
    }

    /// True when `host` is one of the scope hosts or a subdomain of one.
    pub fn contains_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        let covers = |root: &str| host == root || host.ends_with(&format!(".{root}"));
        match self {
            Scope::Domain { root } => covers(root.as_str()),
            Scope::Hosts { hosts } => hosts.iter().any(|h| covers(h.as_str())),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Lowercases a hostname and strips schemes, paths, ports, wildcard prefixes
/// and the trailing root dot.
pub fn normalize_host(raw: &str) -> String {
    let mut host = raw.trim();
    if let Some((_, rest)) = host.split_once("://") {
        host = rest;
    }
    host = host.split(['/', '?', '#']).next().unwrap_or_default();
    if let Some((h, port)) = host.rsplit_once(':') {
        if port.chars().all(|c| c.is_ascii_digit()) {
            host = h;
        }
    }
    host.trim_start_matches("*.")
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// A DNS name with at least two labels. Underscores are tolerated since
/// enumeration tools report them.
pub fn is_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.contains('.')
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub const ALL: [ScanStatus; 4] = [
        ScanStatus::Running,
        ScanStatus::Completed,
        ScanStatus::Failed,
        ScanStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScanStatus::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown scan status: {s}"))
    }
}

impl From<ScanStatus> for TargetStatus {
    fn from(status: ScanStatus) -> Self {
        match status {
            ScanStatus::Running => TargetStatus::Running,
            ScanStatus::Completed => TargetStatus::Completed,
            ScanStatus::Failed => TargetStatus::Failed,
            ScanStatus::Cancelled => TargetStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for predecessor stages.
    Pending,
    /// Jobs may be dispatched.
    Released,
    /// Never ran; its jobs were cancelled.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Subdomain,
    LiveHost,
    Url,
    Finding,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Subdomain,
        RecordKind::LiveHost,
        RecordKind::Url,
        RecordKind::Finding,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Subdomain => "subdomain",
            RecordKind::LiveHost => "live_host",
            RecordKind::Url => "url",
            RecordKind::Finding => "finding",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown record kind: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subdomain {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveHost {
    pub url: String,
    pub host: String,
    pub status_code: Option<u16>,
    pub title: Option<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRecord {
    pub url: String,
    pub status_code: Option<u16>,
    pub content_length: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub template_id: String,
    pub name: String,
    pub severity: String,
    pub matched_at: String,
    pub matcher_name: Option<String>,
    pub description: Option<String>,
}

/// A normalized entity produced by a parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetRecord {
    Subdomain(Subdomain),
    LiveHost(LiveHost),
    Url(UrlRecord),
    Finding(Finding),
}

impl AssetRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            AssetRecord::Subdomain(_) => RecordKind::Subdomain,
            AssetRecord::LiveHost(_) => RecordKind::LiveHost,
            AssetRecord::Url(_) => RecordKind::Url,
            AssetRecord::Finding(_) => RecordKind::Finding,
        }
    }

    /// Deduplication key, unique per target and kind.
    pub fn natural_key(&self) -> String {
        match self {
            AssetRecord::Subdomain(s) => s.hostname.to_ascii_lowercase(),
            AssetRecord::LiveHost(h) => h.url.clone(),
            AssetRecord::Url(u) => u.url.clone(),
            AssetRecord::Finding(f) => format!(
                "{}|{}|{}",
                f.template_id,
                f.matched_at,
                f.matcher_name.as_deref().unwrap_or_default()
            ),
        }
    }

    /// Value handed to downstream tools that consume this kind of record.
    pub fn input_value(&self) -> &str {
        match self {
            AssetRecord::Subdomain(s) => &s.hostname,
            AssetRecord::LiveHost(h) => &h.url,
            AssetRecord::Url(u) => &u.url,
            AssetRecord::Finding(f) => &f.matched_at,
        }
    }

    pub fn tags(&self) -> &[String] {
        match self {
            AssetRecord::Url(u) => &u.tags,
            _ => &[],
        }
    }

    /// Folds a newer observation of the same record into `self`. Identity
    /// fields are kept; mutable fields take the newer value when it carries
    /// one, and tags accumulate.
    pub fn merged_with(&self, newer: &AssetRecord) -> AssetRecord {
        match (self, newer) {
            (AssetRecord::LiveHost(old), AssetRecord::LiveHost(new)) => {
                AssetRecord::LiveHost(LiveHost {
                    url: old.url.clone(),
                    host: old.host.clone(),
                    status_code: new.status_code.or(old.status_code),
                    title: new.title.clone().or_else(|| old.title.clone()),
                    technologies: if new.technologies.is_empty() {
                        old.technologies.clone()
                    } else {
                        new.technologies.clone()
                    },
                })
            }
            (AssetRecord::Url(old), AssetRecord::Url(new)) => {
                let mut tags = old.tags.clone();
                tags.extend(new.tags.iter().cloned());
                tags.sort();
                tags.dedup();
                AssetRecord::Url(UrlRecord {
                    url: old.url.clone(),
                    status_code: new.status_code.or(old.status_code),
                    content_length: new.content_length.or(old.content_length),
                    tags,
                })
            }
            (AssetRecord::Finding(old), AssetRecord::Finding(new)) => {
                AssetRecord::Finding(Finding {
                    template_id: old.template_id.clone(),
                    matched_at: old.matched_at.clone(),
                    matcher_name: old.matcher_name.clone(),
                    name: new.name.clone(),
                    severity: new.severity.clone(),
                    description: new.description.clone().or_else(|| old.description.clone()),
                })
            }
            _ => self.clone(),
        }
    }
}

/// A record as held by the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub target_id: TargetId,
    pub kind: RecordKind,
    pub natural_key: String,
    pub source_tool: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub record: AssetRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Substring match on the natural key.
    pub search: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<u32>,
}
