use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::security::credential_cache::RefreshPolicy;
use crate::security::token_issuer::CredentialKey;

pub const DEFAULT_API_BASE: &str = "https://qyapi.weixin.qq.com";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Relay configuration, stored as JSON on disk.
///
/// Older deployments wrote different key names; both spellings are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, alias = "corpid")]
    pub corp_id: String,
    #[serde(default, alias = "agentid", deserialize_with = "string_or_number")]
    pub agent_id: String,
    #[serde(default, alias = "corpsecret")]
    pub corp_secret: String,
    /// Callback signature token.
    #[serde(default)]
    pub token: String,
    /// 43-character base64 callback key.
    #[serde(default, alias = "aes_key")]
    pub encoding_aes_key: String,
    /// Push API base URL; empty means the public endpoint.
    #[serde(default, alias = "api_host")]
    pub proxy_url: String,
    #[serde(default, alias = "card_url")]
    pub nas_url: String,
    #[serde(default)]
    pub photo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configured: Option<bool>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut cfg: Config = serde_json::from_str(raw).context("parsing config JSON")?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Like [`Config::from_file`], but a missing file yields an unconfigured relay.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, relay starts unconfigured");
            return Ok(Self::default());
        }
        let cfg = Self::from_file(path)?;
        info!(path = %path.display(), ready = cfg.is_ready(), "config loaded");
        Ok(cfg)
    }

    fn normalize(&mut self) {
        for url in [&mut self.proxy_url, &mut self.nas_url] {
            let trimmed = url.trim().trim_end_matches('/').to_string();
            *url = trimmed;
        }
        self.corp_id = self.corp_id.trim().to_string();
        self.agent_id = self.agent_id.trim().to_string();
    }

    /// Effective push API base URL.
    pub fn base_url(&self) -> &str {
        if self.proxy_url.is_empty() {
            DEFAULT_API_BASE
        } else {
            &self.proxy_url
        }
    }

    pub fn credential_key(&self) -> CredentialKey {
        CredentialKey::new(&self.corp_id, &self.corp_secret, self.base_url())
    }

    /// Numeric application id; the push API rejects anything else.
    pub fn agent_id_number(&self) -> i64 {
        self.agent_id.parse().unwrap_or(0)
    }

    /// Whether events should be forwarded.
    pub fn is_ready(&self) -> bool {
        self.configured
            .unwrap_or_else(|| !self.corp_id.is_empty())
    }

    /// Whether the callback challenge can be answered.
    pub fn can_verify(&self) -> bool {
        !self.token.is_empty() && !self.encoding_aes_key.is_empty()
    }
}

/// Modification time and size of the config file when it was last read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

async fn stamp_of(path: &Path) -> Option<FileStamp> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(FileStamp {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

#[derive(Debug)]
struct Loaded {
    stamp: Option<FileStamp>,
    config: Arc<Config>,
}

/// Source of the [`Config`] each request runs against.
///
/// A file-backed store checks the file before handing out the config and
/// re-reads it when it changed, so edits apply without a restart. A file that
/// no longer parses leaves the last good config in effect; a file that
/// disappears leaves the relay unconfigured.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<Arc<PathBuf>>,
    loaded: Arc<RwLock<Loaded>>,
}

impl ConfigStore {
    /// A store that always returns `config`.
    pub fn fixed(config: Config) -> Self {
        Self {
            path: None,
            loaded: Arc::new(RwLock::new(Loaded {
                stamp: None,
                config: Arc::new(config),
            })),
        }
    }

    /// A store backed by the JSON file at `path`; the first read happens now
    /// and fails on invalid JSON.
    pub async fn watch(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let stamp = stamp_of(&path).await;
        let config = Config::load_or_default(&path)?;
        Ok(Self {
            path: Some(Arc::new(path)),
            loaded: Arc::new(RwLock::new(Loaded {
                stamp,
                config: Arc::new(config),
            })),
        })
    }

    /// The config as of now.
    pub async fn current(&self) -> Arc<Config> {
        let Some(path) = self.path.as_deref() else {
            return self.loaded.read().await.config.clone();
        };

        let stamp = stamp_of(path).await;
        {
            let loaded = self.loaded.read().await;
            if loaded.stamp == stamp {
                return loaded.config.clone();
            }
        }

        let mut loaded = self.loaded.write().await;
        if loaded.stamp == stamp {
            return loaded.config.clone();
        }
        match stamp {
            None => {
                warn!(path = %path.display(), "config file removed, relay is now unconfigured");
                loaded.config = Arc::new(Config::default());
            }
            Some(_) => match read_config(path).await {
                Ok(cfg) => {
                    info!(path = %path.display(), ready = cfg.is_ready(), "config reloaded");
                    loaded.config = Arc::new(cfg);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "config reload failed, keeping previous settings");
                }
            },
        }
        loaded.stamp = stamp;
        loaded.config.clone()
    }
}

async fn read_config(path: &Path) -> Result<Config> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config file {}", path.display()))?;
    Config::from_json(&raw)
}

/// Process tunables read from the environment once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub http_timeout: Duration,
    pub refresh_policy: RefreshPolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            refresh_policy: RefreshPolicy::Wait,
        }
    }
}

impl RelaySettings {
    /// `RELAY_HTTP_TIMEOUT_SECS` and `RELAY_REFRESH_POLICY`.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(raw) = std::env::var("RELAY_HTTP_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => settings.http_timeout = Duration::from_secs(secs),
                _ => warn!(value = %raw, "ignoring invalid RELAY_HTTP_TIMEOUT_SECS"),
            }
        }
        if let Ok(raw) = std::env::var("RELAY_REFRESH_POLICY") {
            match raw.parse() {
                Ok(policy) => settings.refresh_policy = policy,
                Err(e) => warn!(error = %e, "ignoring RELAY_REFRESH_POLICY"),
            }
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parsing() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "corp_id": "ww0123456789",
                "agent_id": "1000002",
                "corp_secret": "secret",
                "token": "QDG6eK",
                "encoding_aes_key": "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C",
                "proxy_url": "http://1.2.3.4:5080/",
                "nas_url": "http://quickconnect.to/mynas/",
                "configured": true
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.corp_id, "ww0123456789");
        assert_eq!(config.agent_id_number(), 1000002);
        assert_eq!(config.proxy_url, "http://1.2.3.4:5080");
        assert_eq!(config.base_url(), "http://1.2.3.4:5080");
        assert_eq!(config.nas_url, "http://quickconnect.to/mynas");
        assert!(config.is_ready());
        assert!(config.can_verify());
    }

    #[test]
    fn test_legacy_key_names() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "corpid": "ww42",
                "agentid": 1000005,
                "corpsecret": "s",
                "token": "t",
                "aes_key": "k",
                "api_host": "",
                "card_url": "https://nas.example.com"
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.corp_id, "ww42");
        assert_eq!(config.agent_id, "1000005");
        assert_eq!(config.encoding_aes_key, "k");
        assert_eq!(config.nas_url, "https://nas.example.com");
        assert_eq!(config.base_url(), DEFAULT_API_BASE);
        // no explicit flag: a corp id means configured
        assert!(config.is_ready());
    }

    #[test]
    fn test_missing_file_is_unconfigured() {
        let config = Config::load_or_default("/nonexistent/path/config.json").unwrap();
        assert!(!config.is_ready());
        assert!(!config.can_verify());
        assert!(Config::from_file("/nonexistent/path/config.json").is_err());
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();
        assert!(Config::load_or_default(file.path()).is_err());
    }

    #[test]
    fn test_explicit_flag_wins() {
        let config = Config {
            corp_id: "ww1".into(),
            configured: Some(false),
            ..Default::default()
        };
        assert!(!config.is_ready());
    }

    #[test]
    fn test_credential_key_uses_effective_base() {
        let config = Config {
            corp_id: "ww1".into(),
            corp_secret: "s".into(),
            ..Default::default()
        };
        let key = config.credential_key();
        assert_eq!(key.base_url, DEFAULT_API_BASE);
        assert_eq!(key.corp_id, "ww1");
    }

    #[test]
    fn test_non_numeric_agent_id() {
        let config = Config {
            agent_id: "abc".into(),
            ..Default::default()
        };
        assert_eq!(config.agent_id_number(), 0);
    }

    fn write_config(path: &Path, json: &str) {
        fs::write(path, json).unwrap();
    }

    #[tokio::test]
    async fn test_store_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, r#"{"corpid": "ww1", "configured": false}"#);

        let store = ConfigStore::watch(&path).await.unwrap();
        assert!(!store.current().await.is_ready());

        write_config(
            &path,
            r#"{"corpid": "ww2", "agentid": "1000002", "configured": true}"#,
        );
        let cfg = store.current().await;
        assert!(cfg.is_ready());
        assert_eq!(cfg.corp_id, "ww2");
    }

    #[tokio::test]
    async fn test_store_keeps_last_good_config_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, r#"{"corpid": "ww1", "configured": true}"#);

        let store = ConfigStore::watch(&path).await.unwrap();
        write_config(&path, "{\"corpid\": \"ww");
        assert_eq!(store.current().await.corp_id, "ww1");
    }

    #[tokio::test]
    async fn test_store_tracks_file_creation_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let store = ConfigStore::watch(&path).await.unwrap();
        assert!(!store.current().await.is_ready());

        write_config(&path, r#"{"corp_id": "ww9"}"#);
        assert!(store.current().await.is_ready());

        fs::remove_file(&path).unwrap();
        assert!(!store.current().await.is_ready());
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_file_at_startup() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();
        assert!(ConfigStore::watch(file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_fixed_store() {
        let store = ConfigStore::fixed(Config {
            corp_id: "ww1".into(),
            ..Default::default()
        });
        assert_eq!(store.current().await.corp_id, "ww1");
    }

    #[test]
    fn test_settings_defaults() {
        let settings = RelaySettings::default();
        assert_eq!(settings.http_timeout, Duration::from_secs(10));
        assert_eq!(settings.refresh_policy, RefreshPolicy::Wait);
    }
}
