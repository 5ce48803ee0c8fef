use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{adapters::ToolSpec, pipeline::{PipelineDefinition, StagePolicy}, store::RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Domains, IPs or CIDR ranges scans may touch. Empty allows everything.
    pub scope_allowlist: Vec<String>,
    pub max_concurrent_jobs: usize,
    pub max_jobs_per_target: usize,
    pub console_history_lines: usize,
    pub retained_consoles: usize,
    pub grace_period_secs: u64,
    /// Applied to tools without their own timeout. 0 disables it.
    pub default_job_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
    pub stage_policy: StagePolicy,
    /// Default `{wordlist}` for fuzzing tools.
    pub wordlist: PathBuf,
    /// Directory scans may pick an alternative wordlist from.
    pub wordlist_dir: PathBuf,
    pub tools: Vec<ToolSpec>,
    pub pipelines: Vec<PipelineDefinition>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("RECONFLOW_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// A zero job limit would leave every scan queued forever.
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_concurrent_jobs >= 1, "max_concurrent_jobs must be at least 1");
        anyhow::ensure!(self.max_jobs_per_target >= 1, "max_jobs_per_target must be at least 1");
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = var("RF_HOST") {
            self.host = v;
        }
        if let Some(v) = var("RF_PORT") {
            self.port = v.parse().context("RF_PORT must be a port number")?;
        }
        if let Some(v) = var("RF_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("RF_SCOPE_ALLOWLIST") {
            self.scope_allowlist = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = var("RF_MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = v.parse().context("RF_MAX_CONCURRENT_JOBS must be a number")?;
        }
        if let Some(v) = var("RF_MAX_JOBS_PER_TARGET") {
            self.max_jobs_per_target = v.parse().context("RF_MAX_JOBS_PER_TARGET must be a number")?;
        }
        if let Some(v) = var("RF_WORDLIST_DIR") {
            self.wordlist_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn default_job_timeout(&self) -> Option<Duration> {
        (self.default_job_timeout_secs > 0).then(|| Duration::from_secs(self.default_job_timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.store_retry_attempts.max(1),
            initial_backoff: Duration::from_millis(self.store_retry_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://reconflow.db".to_string(),
            scope_allowlist: Vec::new(),
            max_concurrent_jobs: 4,
            max_jobs_per_target: 3,
            console_history_lines: 500,
            retained_consoles: 200,
            grace_period_secs: 5,
            default_job_timeout_secs: 600,
            poll_interval_ms: 1000,
            store_retry_attempts: 4,
            store_retry_backoff_ms: 50,
            stage_policy: StagePolicy::AnySucceeded,
            wordlist: PathBuf::from("wordlists/common.txt"),
            wordlist_dir: PathBuf::from("/usr/share/seclists/Discovery/Web-Content"),
            tools: Vec::new(),
            pipelines: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{ "port": 9000, "stage_policy": "all_succeeded" }"#).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.stage_policy, StagePolicy::AllSucceeded);
        assert_eq!(cfg.max_concurrent_jobs, 4);
        assert_eq!(cfg.default_job_timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn env_overrides_win() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("RF_PORT", "9100"),
            ("RF_SCOPE_ALLOWLIST", "example.com, 10.0.0.0/8,"),
            ("RF_MAX_CONCURRENT_JOBS", "2"),
        ]);
        let mut cfg = AppConfig::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.scope_allowlist, vec!["example.com", "10.0.0.0/8"]);
        assert_eq!(cfg.max_concurrent_jobs, 2);
        assert_eq!(cfg.max_jobs_per_target, 3);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut cfg = AppConfig::default();
        assert!(cfg
            .apply_env(|k| (k == "RF_PORT").then(|| "http".to_string()))
            .is_err());
    }

    #[test]
    fn zero_job_limits_are_rejected() {
        let mut cfg = AppConfig::default();
        cfg.apply_env(|k| (k == "RF_MAX_CONCURRENT_JOBS").then(|| "0".to_string()))
            .unwrap();
        assert!(cfg.validate().is_err());

        let cfg: AppConfig = serde_json::from_str(r#"{ "max_jobs_per_target": 0 }"#).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_jobs_per_target"), "{err}");
        AppConfig::default().validate().unwrap();
    }
}
