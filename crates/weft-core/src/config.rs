use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level Weft configuration, loaded from a TOML file.
///
/// Bootstrap values (bind address, WAL path, log verbosity) can be
/// overridden from the command line / environment by the binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::NotFound(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address for the HTTP surface.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable base URL that executor servers use for
    /// callbacks (e.g. "http://orchestrator:7540").
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:7540".to_string()
}

fn default_public_url() -> String {
    "http://127.0.0.1:7540".to_string()
}

/// Event log storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Path of the SQLite event log database.
    #[serde(default = "default_wal_path")]
    pub path: String,
    /// Optional HTTP endpoint receiving a mirrored copy of every record.
    #[serde(default)]
    pub mirror_url: Option<String>,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: default_wal_path(),
            mirror_url: None,
        }
    }
}

fn default_wal_path() -> String {
    "weft-events.db".to_string()
}

/// Retry and backoff policy. The delay for attempt `n` (0-based) is
/// `initial_delay_ms * multiplier^n`, capped at `max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Exact backoff delay in milliseconds for a 0-based attempt number.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        (delay as u64).min(self.max_delay_ms)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Access token issuance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Issuer identity embedded in every token.
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Default time-to-live for issued tokens, in seconds. TTLs should be
    /// short relative to the risk window; expiry is the only revocation.
    #[serde(default = "default_token_ttl")]
    pub ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            ttl_secs: default_token_ttl(),
        }
    }
}

fn default_issuer() -> String {
    "weft-orchestrator".to_string()
}

fn default_token_ttl() -> u64 {
    3600
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Config parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = AppConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.tokens.ttl_secs, 3600);
        assert_eq!(config.gateway.bind, "0.0.0.0:7540");
    }

    #[test]
    fn backoff_formula() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_ms(0), 1000);
        assert_eq!(retry.delay_ms(1), 2000);
        assert_eq!(retry.delay_ms(2), 4000);
        // Capped at max_delay_ms
        assert_eq!(retry.delay_ms(10), 30_000);
    }

    #[test]
    fn load_from_file() {
        let toml_content = r#"
[gateway]
bind = "127.0.0.1:9000"
public_url = "http://orchestrator.internal:9000"

[wal]
path = "/var/lib/weft/events.db"
mirror_url = "http://collector:8080/records"

[retry]
max_retries = 5
initial_delay_ms = 250

[tokens]
issuer = "test-client"
ttl_secs = 60
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(toml_content.as_bytes()).expect("write toml");

        let config = AppConfig::load(tmp.path()).expect("load config");
        assert_eq!(config.gateway.bind, "127.0.0.1:9000");
        assert_eq!(config.wal.path, "/var/lib/weft/events.db");
        assert_eq!(
            config.wal.mirror_url.as_deref(),
            Some("http://collector:8080/records")
        );
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.delay_ms(1), 500);
        assert_eq!(config.tokens.issuer, "test-client");
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let config =
            AppConfig::load_or_default(Path::new("/nonexistent/weft.toml")).expect("defaults");
        assert_eq!(config.wal.path, "weft-events.db");
    }
}
