use crate::agent::driver::{
    DriverSettings, DEFAULT_BASE_PORT, DEFAULT_POLL_INTERVAL, DEFAULT_PORT_SPAN,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::agent::key_store::{FileKeyStore, KeyStore};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.toml";
const ACCESS_KEY_FILE_NAME: &str = "access_key";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory the config was loaded from. Not serialized.
    #[serde(skip)]
    pub config_dir: PathBuf,
    pub agent: AgentConfig,
    pub backend: BackendConfig,
    pub storage: StorageConfig,
}

/// Where and how to look for the local agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub host: String,
    pub base_port: u16,
    pub port_span: u16,
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            base_port: DEFAULT_BASE_PORT,
            port_span: DEFAULT_PORT_SPAN,
            request_timeout_ms: duration_ms(DEFAULT_REQUEST_TIMEOUT),
            poll_interval_ms: duration_ms(DEFAULT_POLL_INTERVAL),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Update backend the agent is told to use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub persist_access_key: bool,
    /// Relative paths resolve against the config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persist_access_key: true,
            access_key_file: None,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Loads `config.toml` from `dir`, falling back to defaults when absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        let mut config = match fs::read_to_string(&path) {
            Ok(raw) => toml::from_str::<Self>(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        config.config_dir = dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(&self.config_dir)
            .with_context(|| format!("Failed to create {}", self.config_dir.display()))?;
        let path = self.config_path();
        let raw = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, raw).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.host.trim().is_empty() {
            bail!("agent.host must not be empty");
        }
        if self.agent.port_span == 0 {
            bail!("agent.port_span must be at least 1");
        }
        if self.agent.request_timeout_ms == 0 {
            bail!("agent.request_timeout_ms must be greater than 0");
        }
        if self.agent.poll_interval_ms == 0 {
            bail!("agent.poll_interval_ms must be greater than 0");
        }
        if let Some(url) = self.backend_url() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("backend.url must be an http(s) URL, got {url:?}");
            }
        }
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    /// The backend URL, ignoring blank values.
    pub fn backend_url(&self) -> Option<&str> {
        self.backend
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            base_port: self.agent.base_port,
            port_span: self.agent.port_span,
            request_timeout: Duration::from_millis(self.agent.request_timeout_ms),
            poll_interval: Duration::from_millis(self.agent.poll_interval_ms),
        }
    }

    pub fn access_key_path(&self) -> PathBuf {
        match &self.storage.access_key_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.config_dir.join(path),
            None => self.config_dir.join(ACCESS_KEY_FILE_NAME),
        }
    }

    /// File-backed key storage, unless persistence is switched off.
    pub fn key_store(&self) -> Option<Arc<dyn KeyStore>> {
        self.storage
            .persist_access_key
            .then(|| Arc::new(FileKeyStore::new(self.access_key_path())) as Arc<dyn KeyStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempdir().expect("tempdir");
        let config = Config::load(tmp.path()).expect("load");

        assert_eq!(config.agent, AgentConfig::default());
        assert_eq!(config.backend_url(), None);
        assert_eq!(config.config_dir, tmp.path());
        assert_eq!(config.driver_settings(), DriverSettings::default());
        assert_eq!(config.access_key_path(), tmp.path().join("access_key"));
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let tmp = tempdir().expect("tempdir");
        fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
[agent]
base_port = 18000
poll_interval_ms = 250

[backend]
url = "https://updates.example.com"
"#,
        )
        .expect("write");

        let config = Config::load(tmp.path()).expect("load");
        let settings = config.driver_settings();
        assert_eq!(settings.base_port, 18000);
        assert_eq!(settings.port_span, 20);
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.request_timeout, Duration::from_secs(3));
        assert_eq!(config.backend_url(), Some("https://updates.example.com"));
    }

    #[test]
    fn malformed_file_reports_its_path() {
        let tmp = tempdir().expect("tempdir");
        fs::write(tmp.path().join(CONFIG_FILE_NAME), "[agent\nport = ").expect("write");

        let error = Config::load(tmp.path()).expect_err("must fail");
        assert!(format!("{error:#}").contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn zero_span_and_zero_timeouts_are_rejected() {
        let mut config = Config::default();
        config.agent.port_span = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.agent.request_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.agent.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn blank_backend_counts_as_unset() {
        let mut config = Config::default();
        config.backend.url = Some("   ".to_string());
        assert_eq!(config.backend_url(), None);
        assert!(config.validate().is_ok());

        config.backend.url = Some("ftp://nope".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_key_file_resolves_against_config_dir() {
        let mut config = Config {
            config_dir: PathBuf::from("/etc/agent-driver"),
            ..Config::default()
        };
        config.storage.access_key_file = Some(PathBuf::from("keys/agent"));
        assert_eq!(
            config.access_key_path(),
            PathBuf::from("/etc/agent-driver/keys/agent")
        );

        config.storage.persist_access_key = false;
        assert!(config.key_store().is_none());
    }

    #[test]
    fn saved_config_loads_back() {
        let tmp = tempdir().expect("tempdir");
        let mut config = Config::load(tmp.path()).expect("load");
        config.backend.url = Some("http://backend.local".to_string());
        config.agent.port_span = 5;
        config.save().expect("save");

        let reloaded = Config::load(tmp.path()).expect("reload");
        assert_eq!(reloaded, config);
    }
}
