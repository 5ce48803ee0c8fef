//! Line parsers turning raw tool output into [`AssetRecord`]s.
//!
//! Every tool family gets one [`ParserKind`] variant. Parsers see one complete
//! line at a time; [`LineAssembler`] is responsible for cutting raw pipe
//! chunks into lines first.

mod tags;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::ParseWarning,
    models::{
        is_hostname, normalize_host, AssetRecord, Finding, LiveHost, RecordKind, Scope, Subdomain,
        UrlRecord,
    },
};

pub use tags::tag_url;

/// Lines longer than this are cut and emitted as-is.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Reassembles newline-delimited lines out of arbitrary byte chunks.
#[derive(Debug)]
pub struct LineAssembler {
    buf: Vec<u8>,
    max_line: usize,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

impl LineAssembler {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line: max_line.max(1),
        }
    }

    /// Appends a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                lines.push(self.take());
            } else {
                self.buf.push(byte);
                if self.buf.len() >= self.max_line {
                    lines.push(self.take());
                }
            }
        }
        lines
    }

    /// Flushes a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<String> {
        (!self.buf.is_empty()).then(|| self.take())
    }

    fn take(&mut self) -> String {
        let raw = std::mem::take(&mut self.buf);
        let mut line = String::from_utf8_lossy(&raw).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

/// Output format family of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    /// One hostname per line (subfinder, assetfinder, findomain, amass).
    HostList,
    /// httpx JSON lines or bare URLs.
    Httpx,
    /// One URL per line or katana JSON lines.
    UrlList,
    /// ffuf `-json` lines.
    Ffuf,
    /// nuclei `-jsonl` lines.
    Nuclei,
    /// dalfox `--format json` output, one PoC object per line.
    Dalfox,
    /// Console only, nothing is ingested.
    Raw,
}

impl ParserKind {
    pub fn emits(self) -> Option<RecordKind> {
        match self {
            ParserKind::HostList => Some(RecordKind::Subdomain),
            ParserKind::Httpx => Some(RecordKind::LiveHost),
            ParserKind::UrlList | ParserKind::Ffuf => Some(RecordKind::Url),
            ParserKind::Nuclei | ParserKind::Dalfox => Some(RecordKind::Finding),
            ParserKind::Raw => None,
        }
    }

    pub fn build(self, scope: &Scope) -> ToolParser {
        match self {
            ParserKind::HostList => ToolParser::HostList(HostListParser::new(scope.clone())),
            ParserKind::Httpx => ToolParser::Httpx(HttpxParser),
            ParserKind::UrlList => ToolParser::UrlList(UrlListParser::new(scope.clone())),
            ParserKind::Ffuf => ToolParser::Ffuf(FfufParser),
            ParserKind::Nuclei => ToolParser::Nuclei(NucleiParser),
            ParserKind::Dalfox => ToolParser::Dalfox(DalfoxParser),
            ParserKind::Raw => ToolParser::Raw,
        }
    }
}

/// Consume one line, produce zero or more records.
pub trait LineParser: Send {
    fn parse_line(&mut self, line: &str) -> Result<Vec<AssetRecord>, ParseWarning>;
}

#[derive(Debug)]
pub enum ToolParser {
    HostList(HostListParser),
    Httpx(HttpxParser),
    UrlList(UrlListParser),
    Ffuf(FfufParser),
    Nuclei(NucleiParser),
    Dalfox(DalfoxParser),
    Raw,
}

impl LineParser for ToolParser {
    fn parse_line(&mut self, line: &str) -> Result<Vec<AssetRecord>, ParseWarning> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(vec![]);
        }
        match self {
            ToolParser::HostList(p) => p.parse_line(line),
            ToolParser::Httpx(p) => p.parse_line(line),
            ToolParser::UrlList(p) => p.parse_line(line),
            ToolParser::Ffuf(p) => p.parse_line(line),
            ToolParser::Nuclei(p) => p.parse_line(line),
            ToolParser::Dalfox(p) => p.parse_line(line),
            ToolParser::Raw => Ok(vec![]),
        }
    }
}

#[derive(Debug)]
pub struct HostListParser {
    scope: Scope,
    seen: HashSet<String>,
}

impl HostListParser {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            seen: HashSet::new(),
        }
    }
}

impl LineParser for HostListParser {
    fn parse_line(&mut self, line: &str) -> Result<Vec<AssetRecord>, ParseWarning> {
        let host = normalize_host(line);
        if !is_hostname(&host) {
            return Err(ParseWarning::new(format!("not a hostname: {line}")));
        }
        // Enumeration sources happily report neighbours of the target.
        if !self.scope.contains_host(&host) || !self.seen.insert(host.clone()) {
            return Ok(vec![]);
        }
        Ok(vec![AssetRecord::Subdomain(Subdomain { hostname: host })])
    }
}

#[derive(Debug)]
pub struct HttpxParser;

#[derive(Debug, Deserialize)]
struct HttpxLine {
    url: String,
    #[serde(default, alias = "status-code")]
    status_code: Option<u16>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    tech: Vec<String>,
}

impl LineParser for HttpxParser {
    fn parse_line(&mut self, line: &str) -> Result<Vec<AssetRecord>, ParseWarning> {
        let parsed = if line.starts_with('{') {
            serde_json::from_str::<HttpxLine>(line)
                .map_err(|e| ParseWarning::new(format!("httpx json: {e}")))?
        } else {
            HttpxLine {
                url: line.to_string(),
                status_code: None,
                title: None,
                tech: vec![],
            }
        };

        let url = parse_http_url(&parsed.url)?;
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        Ok(vec![AssetRecord::LiveHost(LiveHost {
            url: origin_of(&url),
            host,
            status_code: parsed.status_code,
            title: parsed.title.filter(|t| !t.is_empty()),
            technologies: parsed.tech,
        })])
    }
}

/// Crawled and archived URLs. Static assets, hosts outside the scope and
/// URLs differing only in parameter values are dropped.
#[derive(Debug)]
pub struct UrlListParser {
    scope: Scope,
    signatures: HashSet<String>,
}

const STATIC_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".css", ".woff", ".woff2", ".svg", ".ico",
];

impl UrlListParser {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            signatures: HashSet::new(),
        }
    }
}

/// Host, path and the sorted parameter names: `?id=1` and `?id=2` collapse.
fn url_signature(url: &Url) -> String {
    let mut params: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
    params.sort();
    params.dedup();
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}{}?{}", url.path(), params.join("&")),
        None => format!("{host}{}?{}", url.path(), params.join("&")),
    }
}

fn is_static_asset(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

#[derive(Debug, Deserialize)]
struct KatanaLine {
    #[serde(default)]
    request: Option<KatanaRequest>,
    #[serde(default)]
    response: Option<KatanaResponse>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KatanaRequest {
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct KatanaResponse {
    #[serde(default)]
    status_code: Option<u16>,
}

impl LineParser for UrlListParser {
    fn parse_line(&mut self, line: &str) -> Result<Vec<AssetRecord>, ParseWarning> {
        let (raw, status_code) = if line.starts_with('{') {
            let entry: KatanaLine = serde_json::from_str(line)
                .map_err(|e| ParseWarning::new(format!("url json: {e}")))?;
            let status = entry.response.and_then(|r| r.status_code);
            let endpoint = entry
                .request
                .map(|r| r.endpoint)
                .or(entry.url)
                .ok_or_else(|| ParseWarning::new("json line without endpoint"))?;
            (endpoint, status)
        } else {
            (line.to_string(), None)
        };

        let url = parse_http_url(&raw)?;
        if is_static_asset(&url)
            || !self.scope.contains_host(url.host_str().unwrap_or_default())
            || !self.signatures.insert(url_signature(&url))
        {
            return Ok(vec![]);
        }
        Ok(vec![url_record(url.as_str(), status_code, None)])
    }
}

#[derive(Debug)]
pub struct FfufParser;

#[derive(Debug, Deserialize)]
struct FfufLine {
    url: String,
    status: u16,
    #[serde(default)]
    length: Option<u64>,
}

impl LineParser for FfufParser {
    fn parse_line(&mut self, line: &str) -> Result<Vec<AssetRecord>, ParseWarning> {
        let hit: FfufLine =
            serde_json::from_str(line).map_err(|e| ParseWarning::new(format!("ffuf json: {e}")))?;
        let url = parse_http_url(&hit.url)?;
        Ok(vec![url_record(url.as_str(), Some(hit.status), hit.length)])
    }
}

#[derive(Debug)]
pub struct NucleiParser;

#[derive(Debug, Deserialize)]
struct NucleiLine {
    #[serde(rename = "template-id")]
    template_id: String,
    #[serde(default)]
    info: NucleiInfo,
    #[serde(rename = "matched-at", default)]
    matched_at: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(rename = "matcher-name", default)]
    matcher_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NucleiInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl LineParser for NucleiParser {
    fn parse_line(&mut self, line: &str) -> Result<Vec<AssetRecord>, ParseWarning> {
        let hit: NucleiLine = serde_json::from_str(line)
            .map_err(|e| ParseWarning::new(format!("nuclei json: {e}")))?;
        let matched_at = hit
            .matched_at
            .or(hit.host)
            .ok_or_else(|| ParseWarning::new("finding without location"))?;

        Ok(vec![AssetRecord::Finding(Finding {
            name: hit.info.name.unwrap_or_else(|| hit.template_id.clone()),
            severity: hit
                .info
                .severity
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or_else(|| "info".to_string()),
            template_id: hit.template_id,
            matched_at,
            matcher_name: hit.matcher_name,
            description: hit.info.description,
        })])
    }
}

#[derive(Debug)]
pub struct DalfoxParser;

#[derive(Debug, Deserialize)]
struct DalfoxPoc {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default, alias = "url", alias = "target", alias = "request_url")]
    data: Option<String>,
    #[serde(default)]
    param: Option<String>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    severity: Option<String>,
}

impl LineParser for DalfoxParser {
    fn parse_line(&mut self, line: &str) -> Result<Vec<AssetRecord>, ParseWarning> {
        // The json format wraps the objects in an array, one per line.
        let line = line.trim_start_matches('[').trim_end_matches(']').trim_end_matches(',');
        if !line.starts_with('{') {
            return Ok(vec![]);
        }
        let poc: DalfoxPoc = serde_json::from_str(line)
            .map_err(|e| ParseWarning::new(format!("dalfox json: {e}")))?;
        let (Some(kind), Some(matched_at)) = (poc.kind, poc.data.filter(|d| !d.is_empty())) else {
            return Ok(vec![]);
        };

        Ok(vec![AssetRecord::Finding(Finding {
            template_id: format!("dalfox-xss-{}", kind.to_ascii_lowercase()),
            name: format!("XSS ({kind})"),
            severity: poc
                .severity
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or_else(|| "high".to_string()),
            matched_at,
            matcher_name: poc.param,
            description: poc.payload.map(|p| format!("Payload: {p}")),
        })])
    }
}

fn url_record(url: &str, status_code: Option<u16>, content_length: Option<u64>) -> AssetRecord {
    AssetRecord::Url(UrlRecord {
        url: url.to_string(),
        status_code,
        content_length,
        tags: tag_url(url),
    })
}

fn parse_http_url(raw: &str) -> Result<Url, ParseWarning> {
    let url = Url::parse(raw.trim()).map_err(|e| ParseWarning::new(format!("bad url {raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ParseWarning::new(format!("not an http url: {raw}")));
    }
    Ok(url)
}

fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::parse("example.com").unwrap()
    }

    #[test]
    fn assembler_buffers_partial_lines() {
        let mut asm = LineAssembler::default();
        assert!(asm.push(b"api.exa").is_empty());
        assert_eq!(asm.push(b"mple.com\r\nwww."), vec!["api.example.com"]);
        assert_eq!(asm.push(b"example.com\n"), vec!["www.example.com"]);
        assert_eq!(asm.finish(), None);

        asm.push(b"tail-without-newline");
        assert_eq!(asm.finish().as_deref(), Some("tail-without-newline"));
    }

    #[test]
    fn assembler_cuts_oversized_lines() {
        let mut asm = LineAssembler::new(4);
        assert_eq!(asm.push(b"abcdefg\n"), vec!["abcd", "efg"]);
    }

    #[test]
    fn host_list_filters_scope_and_duplicates() {
        let mut parser = ParserKind::HostList.build(&scope());
        let records = parser.parse_line("API.example.com").unwrap();
        assert_eq!(
            records,
            vec![AssetRecord::Subdomain(Subdomain {
                hostname: "api.example.com".into()
            })]
        );
        assert!(parser.parse_line("api.example.com").unwrap().is_empty());
        assert!(parser.parse_line("cdn.other.net").unwrap().is_empty());
        assert!(parser.parse_line("[INF] Loading provider config").is_err());
        assert!(parser.parse_line("   ").unwrap().is_empty());
    }

    #[test]
    fn httpx_json_and_plain_lines() {
        let mut parser = ParserKind::Httpx.build(&scope());
        let json = r#"{"url":"https://api.example.com:443","status_code":200,"title":"API","tech":["nginx"]}"#;
        let records = parser.parse_line(json).unwrap();
        let AssetRecord::LiveHost(host) = &records[0] else {
            panic!("expected live host");
        };
        assert_eq!(host.url, "https://api.example.com");
        assert_eq!(host.status_code, Some(200));
        assert_eq!(host.technologies, vec!["nginx"]);

        let records = parser.parse_line("http://www.example.com:8080").unwrap();
        assert_eq!(records[0].natural_key(), "http://www.example.com:8080");
        assert!(parser.parse_line("{not json").is_err());
    }

    #[test]
    fn url_list_reads_katana_json_and_plain_urls() {
        let mut parser = ParserKind::UrlList.build(&scope());
        let katana = r#"{"request":{"method":"GET","endpoint":"https://example.com/search?q=1"},"response":{"status_code":200}}"#;
        let AssetRecord::Url(url) = parser.parse_line(katana).unwrap().remove(0) else {
            panic!("expected url");
        };
        assert_eq!(url.status_code, Some(200));
        assert!(url.tags.contains(&"xss".to_string()));

        assert_eq!(parser.parse_line("https://example.com/a").unwrap().len(), 1);
        assert!(parser.parse_line("ftp://example.com/a").is_err());
    }

    #[test]
    fn url_list_drops_static_assets_foreign_hosts_and_parameter_variants() {
        let mut parser = ParserKind::UrlList.build(&scope());
        assert!(parser.parse_line("https://example.com/static/logo.PNG").unwrap().is_empty());
        assert!(parser.parse_line("https://cdn.example.com/site.css?v=3").unwrap().is_empty());
        assert!(parser.parse_line("https://tracker.other.net/item?id=1").unwrap().is_empty());
        assert!(parser.parse_line("https://badexample.com/item?id=1").unwrap().is_empty());

        assert_eq!(parser.parse_line("https://shop.example.com/item?id=1&ref=a").unwrap().len(), 1);
        assert!(parser.parse_line("https://shop.example.com/item?ref=b&id=2").unwrap().is_empty());
        assert_eq!(parser.parse_line("https://shop.example.com/item?id=1&sort=asc").unwrap().len(), 1);
        assert_eq!(parser.parse_line("https://shop.example.com:8443/item?id=1&ref=a").unwrap().len(), 1);
        assert_eq!(parser.parse_line("https://shop.example.com/item.js").unwrap().len(), 1);
    }

    #[test]
    fn ffuf_hits_become_urls_with_status() {
        let mut parser = ParserKind::Ffuf.build(&scope());
        let line = r#"{"input":{"FUZZ":"admin"},"status":301,"length":0,"url":"https://example.com/admin"}"#;
        let AssetRecord::Url(url) = parser.parse_line(line).unwrap().remove(0) else {
            panic!("expected url");
        };
        assert_eq!(url.status_code, Some(301));
        assert_eq!(url.content_length, Some(0));
        assert!(url.tags.contains(&"admin".to_string()));
    }

    #[test]
    fn nuclei_findings_use_matched_at() {
        let mut parser = ParserKind::Nuclei.build(&scope());
        let line = r#"{"template-id":"git-config","info":{"name":"Git Config","severity":"LOW"},"matcher-name":"git","host":"https://example.com","matched-at":"https://example.com/.git/config"}"#;
        let AssetRecord::Finding(finding) = parser.parse_line(line).unwrap().remove(0) else {
            panic!("expected finding");
        };
        assert_eq!(finding.severity, "low");
        assert_eq!(finding.matched_at, "https://example.com/.git/config");
        assert!(parser.parse_line(r#"{"info":{}}"#).is_err());
    }

    #[test]
    fn dalfox_pocs_become_findings() {
        let mut parser = ParserKind::Dalfox.build(&scope());
        let poc = r#"[{"type":"V","inject_type":"inHTML","method":"GET","data":"https://example.com/search?q=%3Csvg%3E","param":"q","payload":"<svg onload=alert(1)>","severity":"High"},"#;
        let AssetRecord::Finding(finding) = parser.parse_line(poc).unwrap().remove(0) else {
            panic!("expected finding");
        };
        assert_eq!(finding.name, "XSS (V)");
        assert_eq!(finding.severity, "high");
        assert_eq!(finding.matcher_name.as_deref(), Some("q"));
        assert_eq!(finding.description.as_deref(), Some("Payload: <svg onload=alert(1)>"));

        assert!(parser.parse_line("]").unwrap().is_empty());
        assert!(parser.parse_line(r#"{"type":null,"data":""}"#).unwrap().is_empty());
        assert!(parser.parse_line("{broken").is_err());
    }

    #[test]
    fn parser_kinds_declare_emitted_records() {
        assert_eq!(ParserKind::Dalfox.emits(), Some(RecordKind::Finding));
        assert_eq!(ParserKind::HostList.emits(), Some(RecordKind::Subdomain));
        assert_eq!(ParserKind::Ffuf.emits(), Some(RecordKind::Url));
        assert_eq!(ParserKind::Raw.emits(), None);
    }
}
