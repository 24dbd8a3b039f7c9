//! Bridge configuration shared by the daemon and its clients.
//!
//! Stored as camelCase JSON (`~/.config/teabridge/config.json` on Linux).
//! Every field has a default, so a missing or partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

pub const ENV_HOST: &str = "TEABRIDGE_HOST";
pub const ENV_PORT: &str = "TEABRIDGE_PORT";
pub const ENV_TOKEN: &str = "TEABRIDGE_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket endpoint path
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default)]
    pub token: String,

    /// Token reserved for the presentation process; wins over `token` when set.
    #[serde(default)]
    pub ui_token: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Reconnect delays tried in order after a failed attempt
    #[serde(default = "default_retry_intervals")]
    pub retry_intervals_secs: Vec<u64>,

    /// Delay used once `retry_intervals_secs` is exhausted
    #[serde(default = "default_steady_retry")]
    pub steady_retry_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/bridge".to_string()
}
fn default_heartbeat_interval() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    10
}
fn default_retry_intervals() -> Vec<u64> {
    vec![1, 2, 5, 10]
}
fn default_steady_retry() -> u64 {
    5
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            token: String::new(),
            ui_token: String::new(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            request_timeout_secs: default_request_timeout(),
            retry_intervals_secs: default_retry_intervals(),
            steady_retry_secs: default_steady_retry(),
        }
    }
}

impl BridgeConfig {
    /// Load config from file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file, creating the parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override fields from `TEABRIDGE_*` environment variables.
    #[must_use]
    pub fn apply_env(self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = var(ENV_HOST).filter(|h| !h.is_empty()) {
            self.host = host;
        }
        if let Some(port) = var(ENV_PORT) {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(e) => warn!("Ignoring invalid {}={:?}: {}", ENV_PORT, port, e),
            }
        }
        if let Some(token) = var(ENV_TOKEN) {
            self.token = token;
        }
        self
    }

    /// The token presented on connect: `ui_token` if set, else `token`.
    #[must_use]
    pub fn effective_token(&self) -> &str {
        if self.ui_token.is_empty() {
            &self.token
        } else {
            &self.ui_token
        }
    }

    #[must_use]
    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
            token: self.effective_token().to_string(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            retry_intervals: self
                .retry_intervals_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            steady_retry: Duration::from_secs(self.steady_retry_secs),
        }
    }

    #[must_use]
    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
            token: self.effective_token().to_string(),
        }
    }
}

/// Default config file location for the current user.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "teabridge").map(|dirs| dirs.config_dir().join("config.json"))
}

/// Connection settings for [`BridgeClient`](crate::client::BridgeClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub token: String,
    pub heartbeat_interval: Duration,
    /// Default timeout for [`request`](crate::client::BridgeClient::request)
    pub request_timeout: Duration,
    pub retry_intervals: Vec<Duration>,
    pub steady_retry: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        BridgeConfig::default().client()
    }
}

impl ClientConfig {
    /// Settings for a daemon listening at `host:port` with default timings.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            token: token.into(),
            ..Self::default()
        }
    }

    /// WebSocket URL including the percent-encoded `token` query parameter.
    #[must_use]
    pub fn url(&self) -> String {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("token", &self.token)
            .finish();
        format!("ws://{}:{}{}?{}", self.host, self.port, self.path, query)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Expected connection token. Empty accepts only an empty token.
    pub token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        BridgeConfig::default().server()
    }
}

impl ServerConfig {
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.path, "/bridge");
        assert_eq!(config.retry_intervals_secs, vec![1, 2, 5, 10]);
        assert_eq!(config.steady_retry_secs, 5);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: BridgeConfig = serde_json::from_str(r#"{"port": 9000, "uiToken": "ui"}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.ui_token, "ui");
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.request_timeout_secs, 10);
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let config = BridgeConfig::load(&dir.path().join("missing.json")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = BridgeConfig {
            token: "secret".to_string(),
            port: 4321,
            ..BridgeConfig::default()
        };
        config.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"requestTimeoutSecs\""));
        assert_eq!(BridgeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_json_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(BridgeConfig::load(&path).is_err());
    }

    #[test]
    fn test_ui_token_takes_priority() {
        let mut config = BridgeConfig {
            token: "shared".to_string(),
            ..BridgeConfig::default()
        };
        assert_eq!(config.effective_token(), "shared");

        config.ui_token = "ui-only".to_string();
        assert_eq!(config.effective_token(), "ui-only");
        assert_eq!(config.client().token, "ui-only");
        assert_eq!(config.server().token, "ui-only");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_HOST, "0.0.0.0"),
            (ENV_PORT, "9999"),
            (ENV_TOKEN, "from-env"),
        ]
        .into_iter()
        .collect();

        let config = BridgeConfig::default().apply_vars(|k| vars.get(k).map(ToString::to_string));
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9999);
        assert_eq!(config.token, "from-env");
    }

    #[test]
    fn test_invalid_env_port_is_ignored() {
        let config = BridgeConfig::default()
            .apply_vars(|k| (k == ENV_PORT).then(|| "not-a-port".to_string()));
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_client_url_encodes_token() {
        let client = ClientConfig::new("localhost", 8080, "a b&c=d");
        assert_eq!(client.url(), "ws://localhost:8080/bridge?token=a+b%26c%3Dd");
    }

    #[test]
    fn test_client_durations() {
        let client = BridgeConfig::default().client();
        assert_eq!(client.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(client.request_timeout, Duration::from_secs(10));
        assert_eq!(client.retry_intervals.len(), 4);
        assert_eq!(client.steady_retry, Duration::from_secs(5));
    }

    #[test]
    fn test_server_bind_addr() {
        assert_eq!(ServerConfig::default().bind_addr(), "127.0.0.1:8080");
    }
}
