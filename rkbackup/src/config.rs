use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";
pub const DEFAULT_LOCK_NAME: &str = "/etcd-backup-lock";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub xline_config: XlineConfig,
    // directory the snapshot file is written into, must already exist
    pub backup_dir: PathBuf,
    pub file_prefix: String,
    pub lock_name: String,
    // overall budget of one run, from connect to lock release
    pub deadline_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            xline_config: XlineConfig::default(),
            backup_dir: PathBuf::from("/backup"),
            file_prefix: "etcd_snapshot".to_string(),
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            deadline_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub dial_timeout_secs: u64,
    // TTL of the lease backing the lock session
    pub session_ttl_secs: i64,
}

impl Default for XlineConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            username: None,
            password: None,
            dial_timeout_secs: 5,
            session_ttl_secs: 60,
        }
    }
}

impl XlineConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl Config {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let xline = &self.xline_config;
        if xline.endpoints.is_empty() || xline.endpoints.iter().any(|e| e.trim().is_empty()) {
            bail!("xline_config.endpoints must list at least one non-empty endpoint");
        }
        if xline.dial_timeout_secs == 0 {
            bail!("xline_config.dial_timeout_secs must be greater than 0");
        }
        if xline.session_ttl_secs < 1 {
            bail!(
                "Invalid xline_config.session_ttl_secs ({}), must be at least 1",
                xline.session_ttl_secs
            );
        }
        if xline.username.is_some() != xline.password.is_some() {
            bail!("xline_config.username and xline_config.password must be set together");
        }
        if self.deadline_secs == 0 {
            bail!("deadline_secs must be greater than 0");
        }
        if self.lock_name.is_empty() {
            bail!("lock_name must not be empty");
        }
        if self.file_prefix.is_empty() || self.file_prefix.contains('/') {
            bail!("file_prefix must be a non-empty file name component");
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&content)
}
