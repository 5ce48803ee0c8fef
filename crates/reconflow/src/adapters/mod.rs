//! Declarative tool adapters.
//!
//! A tool is described entirely by data: which binary to run, how its
//! arguments are templated, how it receives its input and which parser reads
//! its output. The orchestrator never special-cases a tool by name.

use std::{
    collections::{BTreeMap, HashMap},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempPath};

use crate::{
    error::LaunchError,
    models::{RecordKind, Scope},
    parser::ParserKind,
    runner::CommandSpec,
};

/// Which stored records a tool is fed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSelector {
    /// Records of every listed kind are concatenated, in this order.
    pub kinds: Vec<RecordKind>,
    /// Only records carrying this tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl InputSelector {
    pub fn of(kinds: &[RecordKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            tag: None,
        }
    }

    pub fn tagged(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }
}

/// How a tool receives the records it works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InputMode {
    /// The scope's primary host through `{target}`.
    Target,
    /// Newline-separated records written to stdin.
    Stdin(InputSelector),
    /// Newline-separated records in a temporary file passed as `{input_file}`.
    ListFile(InputSelector),
}

impl InputMode {
    pub fn stdin(kind: RecordKind) -> Self {
        InputMode::Stdin(InputSelector::of(&[kind]))
    }

    pub fn list_file(kind: RecordKind) -> Self {
        InputMode::ListFile(InputSelector::of(&[kind]))
    }

    pub fn selector(&self) -> Option<&InputSelector> {
        match self {
            InputMode::Target => None,
            InputMode::Stdin(selector) | InputMode::ListFile(selector) => Some(selector),
        }
    }

    pub fn consumes(&self) -> &[RecordKind] {
        self.selector().map(|s| s.kinds.as_slice()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub program: String,
    /// Supports `{target}`, `{input_file}` and `{wordlist}` placeholders.
    #[serde(default)]
    pub args: Vec<String>,
    pub input: InputMode,
    pub parser: ParserKind,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ToolSpec {
    fn new(name: &str, input: InputMode, parser: ParserKind, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            input,
            parser,
            timeout_secs: None,
            env: BTreeMap::new(),
        }
    }

    pub fn consumes(&self) -> &[RecordKind] {
        self.input.consumes()
    }

    pub fn emits(&self) -> Option<RecordKind> {
        self.parser.emits()
    }
}

/// A command ready to launch. `input_file` must outlive the process.
#[derive(Debug)]
pub struct PreparedCommand {
    pub spec: CommandSpec,
    pub input_file: Option<TempPath>,
}

#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolSpec>,
    wordlist: PathBuf,
    wordlist_dir: Option<PathBuf>,
}

impl ToolCatalog {
    pub fn builtin(wordlist: impl Into<PathBuf>) -> Self {
        use InputMode::*;
        use ParserKind as P;
        use RecordKind::{LiveHost, Subdomain, Url};

        let hosts = InputMode::list_file(LiveHost);
        let ffuf = |name, flags: &[&str]| {
            let mut args = vec!["-w", "{input_file}:HOST", "-w", "{wordlist}:FUZZ", "-u", "HOST/FUZZ", "-json", "-s"];
            args.extend_from_slice(flags);
            let mut tool = ToolSpec::new(name, hosts.clone(), P::Ffuf, &args);
            tool.program = "ffuf".to_string();
            tool
        };
        let tools = [
            ToolSpec::new("subfinder", Target, P::HostList, &["-d", "{target}", "-silent", "-all"]),
            ToolSpec::new("assetfinder", Target, P::HostList, &["--subs-only", "{target}"]),
            ToolSpec::new("findomain", Target, P::HostList, &["-t", "{target}", "-q"]),
            ToolSpec::new(
                "httpx",
                InputMode::stdin(Subdomain),
                P::Httpx,
                &["-silent", "-json", "-title", "-tech-detect", "-status-code"],
            ),
            ToolSpec::new("katana", hosts.clone(), P::UrlList, &["-list", "{input_file}", "-jsonl", "-silent", "-d", "3"]),
            ToolSpec::new("gau", Target, P::UrlList, &["--threads", "10", "{target}"]),
            ffuf(
                "ffuf",
                &["-mc", "all", "-fc", "401,403,404", "-e", ".html,.php,.txt,.pdf", "-ac", "-t", "60", "-rate", "100"],
            ),
            ffuf(
                "ffuf-deep",
                &[
                    "-mc", "all", "-fc", "400,401,402,403,404,429,500,501,502,503",
                    "-e", ".html,.php,.txt,.pdf,.js,.zip,.bak,.old,.log,.json,.xml,.config,.env,.asp,.aspx,.jsp,.gz,.tar,.sql,.db",
                    "-ac", "-t", "100",
                    "-H", "X-Forwarded-For: 127.0.0.1",
                    "-H", "X-Originating-IP: 127.0.0.1",
                ],
            ),
            ToolSpec::new(
                "nuclei",
                ListFile(InputSelector::of(&[LiveHost, Url])),
                P::Nuclei,
                &["-l", "{input_file}", "-jsonl", "-silent"],
            ),
            ToolSpec::new(
                "dalfox",
                ListFile(InputSelector::of(&[Url]).tagged("xss")),
                P::Dalfox,
                &["file", "{input_file}", "--format", "json", "--silence", "--skip-bav", "--worker", "10"],
            ),
            ToolSpec::new(
                "sqlmap",
                ListFile(InputSelector::of(&[Url]).tagged("sqli")),
                P::Raw,
                &["-m", "{input_file}", "--batch", "--random-agent", "--level", "2", "--risk", "2"],
            ),
        ];

        Self {
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
            wordlist: wordlist.into(),
            wordlist_dir: None,
        }
    }

    /// Directory operators may pick per-scan wordlists from.
    pub fn with_wordlist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.wordlist_dir = Some(dir.into());
        self
    }

    /// Adds tools or replaces built-ins of the same name.
    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = ToolSpec>) -> Self {
        for tool in overrides {
            self.tools.insert(tool.name.clone(), tool);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tools, sorted by name.
    pub fn tools(&self) -> Vec<&ToolSpec> {
        let mut tools: Vec<_> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn wordlist(&self) -> &Path {
        &self.wordlist
    }

    /// `.txt` files in the wordlist directory, sorted by name.
    pub async fn wordlists(&self) -> io::Result<Vec<String>> {
        let Some(dir) = &self.wordlist_dir else {
            return Ok(Vec::new());
        };
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".txt") && entry.file_type().await?.is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Resolves a wordlist chosen by name. Only plain file names inside the
    /// wordlist directory are accepted.
    pub async fn resolve_wordlist(&self, name: &str) -> Result<PathBuf, String> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(format!("invalid wordlist name {name:?}"));
        }
        let available = self
            .wordlists()
            .await
            .map_err(|e| format!("wordlists unavailable: {e}"))?;
        match (&self.wordlist_dir, available.iter().any(|w| w == name)) {
            (Some(dir), true) => Ok(dir.join(name)),
            _ => Err(format!("unknown wordlist {name:?}")),
        }
    }

    /// Renders the tool's command line for `scope`, feeding `inputs` the way
    /// the tool expects them. `wordlist` replaces the default one.
    pub fn build_command(
        &self,
        tool: &ToolSpec,
        scope: &Scope,
        inputs: &[String],
        wordlist: Option<&Path>,
    ) -> Result<PreparedCommand, LaunchError> {
        let mut payload = inputs.join("\n");
        if !payload.is_empty() {
            payload.push('\n');
        }

        let input_file = match tool.input {
            InputMode::ListFile(_) => Some(write_list_file(&tool.program, payload.as_bytes())?),
            _ => None,
        };
        let input_path = input_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let wordlist = wordlist.unwrap_or(&self.wordlist).to_string_lossy();

        let args = tool.args.iter().map(|arg| {
            arg.replace("{target}", scope.primary())
                .replace("{input_file}", &input_path)
                .replace("{wordlist}", &wordlist)
        });

        let mut spec = CommandSpec::new(tool.program.clone()).args(args);
        spec.env = tool.env.clone();
        if matches!(tool.input, InputMode::Stdin(_)) {
            spec = spec.stdin(payload.into_bytes());
        }

        Ok(PreparedCommand { spec, input_file })
    }
}

fn write_list_file(program: &str, payload: &[u8]) -> Result<TempPath, LaunchError> {
    let input_err = |source| LaunchError::Input {
        program: program.to_string(),
        source,
    };
    let mut file = NamedTempFile::with_prefix("reconflow-input-").map_err(input_err)?;
    file.write_all(payload).map_err(input_err)?;
    file.flush().map_err(input_err)?;
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ToolCatalog {
        ToolCatalog::builtin("/opt/wordlists/common.txt")
    }

    #[test]
    fn builtin_tools_declare_their_record_flow() {
        let catalog = catalog();
        let httpx = catalog.get("httpx").unwrap();
        assert_eq!(httpx.consumes(), &[RecordKind::Subdomain]);
        assert_eq!(httpx.emits(), Some(RecordKind::LiveHost));
        assert!(catalog.get("gau").unwrap().consumes().is_empty());
        let nuclei = catalog.get("nuclei").unwrap();
        assert_eq!(nuclei.consumes(), &[RecordKind::LiveHost, RecordKind::Url]);
        assert_eq!(nuclei.emits(), Some(RecordKind::Finding));
        assert_eq!(catalog.tools().len(), 11);
    }

    #[test]
    fn target_placeholder_uses_primary_host() {
        let catalog = catalog();
        let scope = Scope::parse("Example.com").unwrap();
        let cmd = catalog
            .build_command(catalog.get("subfinder").unwrap(), &scope, &[], None)
            .unwrap();
        assert_eq!(cmd.spec.program, "subfinder");
        assert_eq!(cmd.spec.args, vec!["-d", "example.com", "-silent", "-all"]);
        assert!(cmd.spec.stdin.is_none());
        assert!(cmd.input_file.is_none());
    }

    #[test]
    fn stdin_tools_receive_records_as_lines() {
        let catalog = catalog();
        let scope = Scope::parse("example.com").unwrap();
        let inputs = vec!["api.example.com".to_string(), "www.example.com".to_string()];
        let cmd = catalog
            .build_command(catalog.get("httpx").unwrap(), &scope, &inputs, None)
            .unwrap();
        assert_eq!(
            cmd.spec.stdin.as_deref(),
            Some(&b"api.example.com\nwww.example.com\n"[..])
        );
    }

    #[test]
    fn list_file_tools_get_a_temp_file_and_wordlist() {
        let catalog = catalog();
        let scope = Scope::parse("example.com").unwrap();
        let inputs = vec!["https://api.example.com".to_string()];
        let cmd = catalog
            .build_command(catalog.get("ffuf").unwrap(), &scope, &inputs, None)
            .unwrap();
        let path = cmd.input_file.as_ref().unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "https://api.example.com\n"
        );
        assert!(cmd.spec.args.contains(&format!("{}:HOST", path.display())));
        assert!(cmd
            .spec
            .args
            .contains(&"/opt/wordlists/common.txt:FUZZ".to_string()));

        let path = path.to_path_buf();
        drop(cmd);
        assert!(!path.exists());
    }

    #[test]
    fn injection_tools_select_tagged_urls() {
        let catalog = catalog();
        let dalfox = catalog.get("dalfox").unwrap().input.selector().unwrap();
        assert_eq!(dalfox.kinds, vec![RecordKind::Url]);
        assert_eq!(dalfox.tag.as_deref(), Some("xss"));
        let sqlmap = catalog.get("sqlmap").unwrap();
        assert_eq!(sqlmap.input.selector().unwrap().tag.as_deref(), Some("sqli"));
        assert_eq!(sqlmap.emits(), None);
    }

    #[test]
    fn ffuf_presets_share_the_binary() {
        let catalog = catalog();
        let deep = catalog.get("ffuf-deep").unwrap();
        assert_eq!(deep.program, "ffuf");
        assert!(deep.args.contains(&"400,401,402,403,404,429,500,501,502,503".to_string()));
        assert!(catalog.get("ffuf").unwrap().args.contains(&"401,403,404".to_string()));
    }

    #[test]
    fn chosen_wordlist_replaces_the_default() {
        let catalog = catalog();
        let scope = Scope::parse("example.com").unwrap();
        let cmd = catalog
            .build_command(
                catalog.get("ffuf").unwrap(),
                &scope,
                &["https://example.com".to_string()],
                Some(Path::new("/srv/lists/raft.txt")),
            )
            .unwrap();
        assert!(cmd.spec.args.contains(&"/srv/lists/raft.txt:FUZZ".to_string()));
    }

    #[tokio::test]
    async fn wordlists_are_listed_and_resolved_by_plain_name() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["raft.txt", "common.txt", "notes.md"] {
            std::fs::write(dir.path().join(name), "admin\n").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.txt")).unwrap();
        let catalog = catalog().with_wordlist_dir(dir.path());

        assert_eq!(catalog.wordlists().await.unwrap(), vec!["common.txt", "raft.txt"]);
        assert_eq!(
            catalog.resolve_wordlist("raft.txt").await.unwrap(),
            dir.path().join("raft.txt")
        );
        assert!(catalog.resolve_wordlist("../etc/passwd").await.is_err());
        assert!(catalog.resolve_wordlist("notes.md").await.is_err());
        assert!(catalog.resolve_wordlist("missing.txt").await.is_err());
        assert!(ToolCatalog::builtin("x").wordlists().await.unwrap().is_empty());
    }

    #[test]
    fn overrides_replace_builtins() {
        let custom: ToolSpec = serde_json::from_value(serde_json::json!({
            "name": "subfinder",
            "program": "/usr/local/bin/subfinder",
            "args": ["-d", "{target}"],
            "input": { "mode": "target" },
            "parser": "host_list",
            "timeout_secs": 120
        }))
        .unwrap();
        let nuclei: ToolSpec = serde_json::from_value(serde_json::json!({
            "name": "nuclei",
            "program": "nuclei",
            "args": ["-l", "{input_file}", "-tags", "cve"],
            "input": { "mode": "list_file", "kinds": ["url"], "tag": "api" },
            "parser": "nuclei"
        }))
        .unwrap();
        assert_eq!(
            nuclei.input,
            InputMode::ListFile(InputSelector::of(&[RecordKind::Url]).tagged("api"))
        );
        let catalog = catalog().with_overrides([custom]);
        let tool = catalog.get("subfinder").unwrap();
        assert_eq!(tool.program, "/usr/local/bin/subfinder");
        assert_eq!(tool.timeout_secs, Some(120));
    }
}
