//! Configuration - TOML file with a default for every field
//!
//! Loaded from `$DAYTRADE_CONFIG`, then `config.toml`, then built-in defaults.
//! Nothing requires recompilation to retune cache lifetimes or intervals.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub quote: QuoteConfig,
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,
    pub triggers: TriggerConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Command listener address
    pub listen_addr: String,
    /// Name stamped on every audit record
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            name: "transaction-server".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteConfig {
    /// Quote server address (host:port)
    pub addr: String,
    /// Serve prices from the in-process mock instead of the quote server
    pub mock: bool,
    /// Mock price in minor units
    pub mock_price: i64,
    pub mock_latency_ms: u64,
    /// Connect + read deadline for the quote server
    pub timeout_ms: u64,
    pub ttl_secs: u64,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            addr: "quoteserve.seng:4444".to_string(),
            mock: true,
            mock_price: 1250,
            mock_latency_ms: 300,
            timeout_ms: 5000,
            ttl_secs: 60,
        }
    }
}

impl QuoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn mock_latency(&self) -> Duration {
        Duration::from_millis(self.mock_latency_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of positive and negative user/trigger entries
    pub entity_ttl_secs: u64,
    /// How long a BUY/SELL intent waits for its COMMIT
    pub intent_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entity_ttl_secs: 60,
            intent_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn entity_ttl(&self) -> Duration {
        Duration::from_secs(self.entity_ttl_secs)
    }

    pub fn intent_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.intent_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Caller deadline covering all retries of one ledger call
    pub timeout_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            retry_backoff_ms: 50,
        }
    }
}

impl LedgerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub interval_secs: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl TriggerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Bounded queue between callers and the writer task
    pub queue_capacity: usize,
    /// Max events persisted per ledger append
    pub batch_size: usize,
    pub retry_backoff_ms: u64,
    /// Backoff ceiling for persistent failures
    pub max_backoff_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 256,
            retry_backoff_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl AuditConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from `$DAYTRADE_CONFIG` or `config.toml`, falling back to defaults
    pub fn load_default() -> Self {
        let mut candidates = Vec::new();
        if let Ok(path) = std::env::var("DAYTRADE_CONFIG") {
            candidates.push(path);
        }
        candidates.push("config.toml".to_string());
        candidates.push(concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml").to_string());

        for path in &candidates {
            match Self::load(Path::new(path)) {
                Ok(cfg) => {
                    tracing::info!("📋 Loaded config from {}", path);
                    return cfg;
                }
                Err(e) => tracing::debug!("config candidate {} skipped: {}", path, e),
            }
        }

        tracing::warn!("⚠️ No config.toml found, using defaults");
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg = Config::parse(
            r#"
            [quote]
            mock = false
            addr = "127.0.0.1:4444"

            [triggers]
            interval_secs = 5
            "#,
        )
        .unwrap();

        assert!(!cfg.quote.mock);
        assert_eq!(cfg.quote.addr, "127.0.0.1:4444");
        assert_eq!(cfg.quote.ttl(), Duration::from_secs(60));
        assert_eq!(cfg.triggers.interval(), Duration::from_secs(5));
        assert_eq!(cfg.cache.intent_secs, 60);
        assert_eq!(cfg.server.name, "transaction-server");
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = Config::parse("[quote\nmock = ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
