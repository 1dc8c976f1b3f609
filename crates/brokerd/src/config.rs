use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

/// Daemon configuration, loaded from a TOML file.
///
/// Every field has a sensible default, so an absent file yields a broker with no
/// children and the default store location.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default)]
    pub children: Vec<ChildConfig>,
    #[serde(default)]
    pub job: JobConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            children: Vec::new(),
            job: JobConfig::default(),
        }
    }
}

/// One worker to spawn at startup.
#[derive(Debug, Deserialize)]
pub struct ChildConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Auto-restart budget; absent means no restart supervision.
    #[serde(default)]
    pub max_restarts: Option<u32>,
    /// Mark the child as an RPC-capable peer.
    #[serde(default)]
    pub rpc: bool,
}

/// Settings for the fetch→store job pipeline.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    #[serde(default = "default_remote_id")]
    pub remote_id: String,
    #[serde(default = "default_local_id")]
    pub local_id: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default)]
    pub start_index: u64,
    #[serde(default = "default_results_per_batch")]
    pub results_per_batch: u64,
    /// Start a fresh run at boot when nothing is active or recovered.
    #[serde(default)]
    pub autostart: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            remote_id: default_remote_id(),
            local_id: default_local_id(),
            data_type: default_data_type(),
            start_index: 0,
            results_per_batch: default_results_per_batch(),
            autostart: false,
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("brokerd-runs.db")
}

fn default_remote_id() -> String {
    "remote".to_string()
}

fn default_local_id() -> String {
    "local".to_string()
}

fn default_data_type() -> String {
    "cve".to_string()
}

fn default_results_per_batch() -> u64 {
    200
}

impl Config {
    /// Loads `path`, or the defaults when the file does not exist (a bare broker is a
    /// valid deployment).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file `{}`", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file `{}`", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let raw = r#"
            store_path = "/var/lib/brokerd/runs.db"

            [[children]]
            id = "remote"
            command = "v2e-remote"
            args = ["--api-key-file", "/etc/v2e/key"]
            max_restarts = 3
            rpc = true

            [[children]]
            id = "local"
            command = "v2e-local"
            rpc = true

            [job]
            remote_id = "remote"
            local_id = "local"
            data_type = "cve"
            results_per_batch = 500
            autostart = true
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/var/lib/brokerd/runs.db"));
        assert_eq!(config.children.len(), 2);
        assert_eq!(config.children[0].max_restarts, Some(3));
        assert!(config.children[1].rpc);
        assert!(config.children[1].args.is_empty());
        assert_eq!(config.job.results_per_batch, 500);
        assert!(config.job.autostart);
    }

    #[test]
    fn empty_config_gets_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.store_path, PathBuf::from("brokerd-runs.db"));
        assert!(config.children.is_empty());
        assert_eq!(config.job.remote_id, "remote");
        assert_eq!(config.job.local_id, "local");
        assert_eq!(config.job.results_per_batch, 200);
        assert!(!config.job.autostart);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert!(config.children.is_empty());
        assert_eq!(config.store_path, PathBuf::from("brokerd-runs.db"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "children = 3").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
