//! Engine configuration.
//!
//! Settings come from code (`EngineConfig::default()` plus field updates),
//! from a JSON document, or from `LIVEPG_*` environment variables.

use crate::error::{LiveError, Result};
use crate::sql::validate_identifier;
use serde::Deserialize;
use std::time::Duration;

/// Longest channel name accepted. Trigger names are `<channel>_<table>` and
/// PostgreSQL truncates identifiers at 63 bytes.
pub const MAX_CHANNEL_LEN: usize = 40;

/// Configuration for a [`LivePg`](crate::LivePg) engine.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// `tokio-postgres` connection string, key-value or URI form.
    pub connection_string: String,

    /// LISTEN/NOTIFY channel; also prefixes trigger and function names.
    pub channel: String,

    /// Delay before re-checking an empty pending set (default: 100 ms).
    pub stagnant_timeout_ms: u64,

    /// Maximum pooled connections for DDL and refresh queries (default: 10).
    pub max_pool_size: usize,

    /// Per-statement timeout in seconds (default: 30).
    pub query_timeout_secs: u64,

    /// Evaluate row predicates even for caches that are already pending.
    pub check_condition_when_queued: bool,

    /// Maximum characters per NOTIFY part written by the trigger function.
    /// Four bytes per character worst case keeps parts under the 8000 byte
    /// NOTIFY limit.
    pub notify_chunk_chars: usize,

    /// Drop partially reassembled notices older than this. `None` keeps
    /// them until the missing parts arrive.
    pub reassembly_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            channel: "livepg".to_string(),
            stagnant_timeout_ms: 100,
            max_pool_size: 10,
            query_timeout_secs: 30,
            check_condition_when_queued: false,
            notify_chunk_chars: 1900,
            reassembly_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    /// Create a configuration for a connection string and channel, keeping
    /// every other setting at its default.
    pub fn new(connection_string: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| LiveError::Config(format!("invalid config document: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from `LIVEPG_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();

        if let Some(url) = lookup("LIVEPG_URL") {
            config.connection_string = url;
        }
        if let Some(channel) = lookup("LIVEPG_CHANNEL") {
            config.channel = channel;
        }
        if let Some(ms) = lookup("LIVEPG_IDLE_MS") {
            config.stagnant_timeout_ms = parse_var("LIVEPG_IDLE_MS", &ms)?;
        }
        if let Some(size) = lookup("LIVEPG_POOL_SIZE") {
            config.max_pool_size = parse_var("LIVEPG_POOL_SIZE", &size)?;
        }
        if let Some(secs) = lookup("LIVEPG_QUERY_TIMEOUT_SECS") {
            config.query_timeout_secs = parse_var("LIVEPG_QUERY_TIMEOUT_SECS", &secs)?;
        }
        if let Some(flag) = lookup("LIVEPG_CHECK_WHEN_QUEUED") {
            config.check_condition_when_queued = parse_var("LIVEPG_CHECK_WHEN_QUEUED", &flag)?;
        }
        if let Some(chars) = lookup("LIVEPG_CHUNK_CHARS") {
            config.notify_chunk_chars = parse_var("LIVEPG_CHUNK_CHARS", &chars)?;
        }
        if let Some(ms) = lookup("LIVEPG_REASSEMBLY_TIMEOUT_MS") {
            config.reassembly_timeout_ms = Some(parse_var("LIVEPG_REASSEMBLY_TIMEOUT_MS", &ms)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the settings that end up inside generated SQL or size buffers.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.channel)
            .map_err(|e| LiveError::Config(format!("channel: {e}")))?;
        if self.channel.len() > MAX_CHANNEL_LEN {
            return Err(LiveError::Config(format!(
                "channel '{}' is longer than {} characters",
                self.channel, MAX_CHANNEL_LEN
            )));
        }
        if self.max_pool_size == 0 {
            return Err(LiveError::Config("max_pool_size must be at least 1".into()));
        }
        if self.notify_chunk_chars == 0 {
            return Err(LiveError::Config("notify_chunk_chars must be at least 1".into()));
        }
        Ok(())
    }

    /// Name of the shared PL/pgSQL notice function.
    pub fn function_name(&self) -> String {
        format!("livepg_{}", self.channel)
    }

    pub fn stagnant_timeout(&self) -> Duration {
        Duration::from_millis(self.stagnant_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn reassembly_timeout(&self) -> Option<Duration> {
        self.reassembly_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| LiveError::Config(format!("{name}={raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.stagnant_timeout(), Duration::from_millis(100));
        assert_eq!(config.max_pool_size, 10);
        assert!(!config.check_condition_when_queued);
        assert_eq!(config.reassembly_timeout(), None);
        assert!(config.validate().is_ok());
        assert_eq!(config.function_name(), "livepg_livepg");
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(
            r#"{"connection_string": "host=localhost", "channel": "orders", "stagnant_timeout_ms": 25}"#,
        )
        .unwrap();
        assert_eq!(config.channel, "orders");
        assert_eq!(config.stagnant_timeout_ms, 25);
        assert_eq!(config.max_pool_size, 10);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("LIVEPG_URL", "postgres://app@db/app"),
            ("LIVEPG_CHANNEL", "app_events"),
            ("LIVEPG_POOL_SIZE", "4"),
            ("LIVEPG_CHECK_WHEN_QUEUED", "true"),
            ("LIVEPG_REASSEMBLY_TIMEOUT_MS", "5000"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.connection_string, "postgres://app@db/app");
        assert_eq!(config.channel, "app_events");
        assert_eq!(config.max_pool_size, 4);
        assert!(config.check_condition_when_queued);
        assert_eq!(config.reassembly_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_bad_number_is_config_error() {
        let err = EngineConfig::from_lookup(|k| {
            (k == "LIVEPG_POOL_SIZE").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, LiveError::Config(_)));
    }

    #[test]
    fn test_channel_must_be_identifier() {
        let mut config = EngineConfig::default();
        config.channel = "bad\"; DROP TABLE users; --".into();
        assert!(matches!(config.validate(), Err(LiveError::Config(_))));

        config.channel = "a".repeat(MAX_CHANNEL_LEN + 1);
        assert!(config.validate().is_err());
    }
}
