//! Session configuration, loaded from a `config.toml` next to the host
//! application. Missing or malformed files fall back to defaults.

use std::path::Path;

use serde::Deserialize;

use crate::gateway::Backend;

#[derive(Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Clone)]
pub struct ApiConfig {
    /// Direct-mode API key. Leave empty when using a proxy.
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

/// Trusted intermediary that holds the real credential server-side. A
/// non-empty url selects proxy mode for the whole session.
#[derive(Deserialize, Clone, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub url: String,
}

#[derive(Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

#[derive(Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,
    /// Override the session transcript directory.
    pub directory: Option<String>,
}

fn default_model() -> String { "gemini-2.0-flash-exp".into() }
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/models".into()
}
fn default_max_attempts() -> u32 { 3 }
fn default_delay_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> u32 { 2 }
fn default_logging_enabled() -> bool { true }

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            model: default_model(),
            base_url: default_base_url(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            directory: None,
        }
    }
}

impl Config {
    /// Read and parse `path`. Falls back to defaults (with a warning) when
    /// the file is missing or malformed -- a broken config should degrade,
    /// not crash the host.
    pub fn load(path: &Path) -> Config {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("failed to parse {}: {e}", path.display());
                    Config::default()
                }
            },
            Err(_) => {
                tracing::warn!(
                    "config not found at {}, using defaults",
                    path.display()
                );
                Config::default()
            }
        }
    }

    /// Select the backend for this session. A configured proxy url wins;
    /// otherwise the direct provider endpoint with the caller-held key.
    pub fn backend(&self) -> Backend {
        if !self.proxy.url.is_empty() {
            Backend::Proxy {
                base_url: self.proxy.url.trim_end_matches('/').to_string(),
            }
        } else {
            Backend::Direct {
                base_url: self.api.base_url.trim_end_matches('/').to_string(),
                model: self.api.model.clone(),
                key: self.api.key.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay_ms, 1000);
        assert_eq!(config.api.model, "gemini-2.0-flash-exp");
        assert!(config.logging.enabled);
    }

    #[test]
    fn defaults_when_file_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is [not toml").unwrap();
        let config = Config::load(&path);
        assert_eq!(config.retry.backoff_multiplier, 2);
    }

    #[test]
    fn parses_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[api]\nkey = \"K\"\n").unwrap();
        let config = Config::load(&path);
        assert_eq!(config.api.key, "K");
        assert_eq!(config.api.model, "gemini-2.0-flash-exp");
    }

    #[test]
    fn proxy_url_selects_proxy_backend() {
        let mut config = Config::default();
        config.proxy.url = "https://worker.example.com/".into();
        match config.backend() {
            Backend::Proxy { base_url } => {
                assert_eq!(base_url, "https://worker.example.com");
            }
            Backend::Direct { .. } => panic!("expected proxy backend"),
        }
    }

    #[test]
    fn empty_proxy_url_selects_direct_backend() {
        let mut config = Config::default();
        config.api.key = "K".into();
        match config.backend() {
            Backend::Direct { key, model, .. } => {
                assert_eq!(key, "K");
                assert_eq!(model, "gemini-2.0-flash-exp");
            }
            Backend::Proxy { .. } => panic!("expected direct backend"),
        }
    }
}
