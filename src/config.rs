//! Scout configuration: schema, TOML loading, environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the cache is kept consistent with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheUpdateProtocol {
    /// No coordination: every transaction snapshots at the committed clock
    /// estimate. Does not work well with update notifications.
    NoCacheOrUncoordinated,
    /// The cache follows a causal stream of server-initiated notifications.
    CausalNotificationsStream,
    /// The cache is refreshed by a periodic client-initiated batch fetch.
    CausalPeriodicRefresh,
}

impl CacheUpdateProtocol {
    pub fn is_uncoordinated(self) -> bool {
        self == CacheUpdateProtocol::NoCacheOrUncoordinated
    }

    pub fn is_notifications(self) -> bool {
        self == CacheUpdateProtocol::CausalNotificationsStream
    }

    pub fn is_periodic_refresh(self) -> bool {
        self == CacheUpdateProtocol::CausalPeriodicRefresh
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Full,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    /// `tracing` EnvFilter directive; `RUST_LOG` wins when set.
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutConfig {
    /// Surrogate endpoints, first entry is the primary.
    pub server_hostnames: Vec<String>,
    /// Read only from the disaster-durable committed clock, so reads never
    /// block on a data center failure.
    pub disaster_safe: bool,
    /// Allow multiple pending transactions. Transactions still commit in
    /// begin order, and every update transaction then commits globally even
    /// when empty or rolled back.
    pub concurrent_open_transactions: bool,
    /// Locally committed transactions queued before commit blocks.
    pub max_async_transactions_queued: usize,
    /// Transactions per commit request to the store.
    pub max_commit_batch_size: usize,
    /// TTL for unused cache entries.
    pub cache_eviction_time_millis: u64,
    /// Cache capacity in entries.
    pub cache_size: usize,
    pub cache_update_protocol: CacheUpdateProtocol,
    pub cache_refresh_period_millis: u64,
    /// Per-operation RPC deadline.
    pub deadline_millis: u64,
    /// Durable client-side commit log; none by default.
    pub log_filename: Option<PathBuf>,
    pub log_flush_on_commit: bool,
    pub logging: LoggingConfig,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            server_hostnames: Vec::new(),
            disaster_safe: false,
            concurrent_open_transactions: false,
            max_async_transactions_queued: 50,
            max_commit_batch_size: 10,
            cache_eviction_time_millis: 120_000,
            cache_size: 512,
            cache_update_protocol: CacheUpdateProtocol::CausalNotificationsStream,
            cache_refresh_period_millis: 1_000,
            deadline_millis: 10_000,
            log_filename: None,
            log_flush_on_commit: false,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ScoutConfig {
    /// Parse the comma-separated endpoint list of the `serverHostnames`
    /// option form.
    pub fn with_servers(mut self, servers: &str) -> Self {
        self.server_hostnames = parse_server_list(servers);
        self
    }

    /// Load from a TOML file, apply environment overrides. A missing file
    /// yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };
        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(%err, "config load failed, using defaults");
                let mut config = Self::default();
                apply_env_overrides(&mut config);
                config
            }
        }
    }
}

pub fn parse_server_list(servers: &str) -> Vec<String> {
    servers
        .split(',')
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(str::to_string)
        .collect()
}

fn apply_env_overrides(config: &mut ScoutConfig) {
    if let Ok(servers) = std::env::var("SCOUT_SERVERS") {
        config.server_hostnames = parse_server_list(&servers);
    }
    if let Ok(value) = std::env::var("SCOUT_DISASTER_SAFE") {
        config.disaster_safe = matches!(value.as_str(), "1" | "true" | "yes");
    }
    if let Ok(value) = std::env::var("SCOUT_DEADLINE_MILLIS")
        && let Ok(millis) = value.parse()
    {
        config.deadline_millis = millis;
    }
    if let Ok(value) = std::env::var("SCOUT_LOG_FILE") {
        config.log_filename = Some(PathBuf::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_list_parsing_trims_and_drops_empty() {
        assert_eq!(
            parse_server_list("dc0.example.org:8001, dc1.example.org:8001,,"),
            vec![
                "dc0.example.org:8001".to_string(),
                "dc1.example.org:8001".to_string()
            ]
        );
    }

    #[test]
    fn defaults_are_sane() {
        let config = ScoutConfig::default();
        assert!(!config.disaster_safe);
        assert!(config.max_async_transactions_queued > 0);
        assert!(config.cache_size > 0);
        assert!(config.cache_update_protocol.is_notifications());
    }

    #[test]
    fn toml_roundtrip_preserves_options() {
        let mut config = ScoutConfig::default().with_servers("dc0:8001,dc1:8001");
        config.disaster_safe = true;
        config.cache_update_protocol = CacheUpdateProtocol::CausalPeriodicRefresh;

        let rendered = toml::to_string(&config).unwrap();
        let parsed: ScoutConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server_hostnames, config.server_hostnames);
        assert!(parsed.disaster_safe);
        assert!(parsed.cache_update_protocol.is_periodic_refresh());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScoutConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.cache_size, ScoutConfig::default().cache_size);
    }
}
