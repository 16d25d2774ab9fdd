//! Client Configuration Module
//!
//! Loads the client configuration from an optional TOML file with environment
//! variable overrides (`CACHE_CLIENT__POOLS__DEFAULT__MIN_CONNECTIONS=4`).

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::defaults;
use crate::logging::LoggingSettings;

/// Main client configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Named pools
    pub pools: BTreeMap<String, PoolSettings>,

    /// Bucket metadata refresh behaviour
    pub metadata: MetadataSettings,

    pub logging: LoggingSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut pools = BTreeMap::new();
        pools.insert(defaults::DEFAULT_POOL_NAME.to_string(), PoolSettings::default());
        Self {
            pools,
            metadata: MetadataSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Settings of one connection pool
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    /// Locator addresses (`host:port`); takes precedence over `servers`
    pub locators: Vec<String>,
    /// Explicit server addresses used when no locator is configured
    pub servers: Vec<String>,

    pub min_connections: usize,
    /// `None` means unbounded
    pub max_connections: Option<usize>,

    /// 0 disables the idle sweep
    pub idle_timeout_ms: u64,
    /// 0 disables load conditioning
    pub load_conditioning_interval_ms: u64,
    /// 0 disables pinging
    pub ping_interval_ms: u64,
    pub free_connection_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub update_locator_list_interval_ms: u64,

    /// -1 tries every server once
    pub retry_attempts: i32,

    pub server_group: Option<String>,
    pub single_hop_enabled: bool,

    pub subscription: SubscriptionSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            locators: Vec::new(),
            servers: Vec::new(),
            min_connections: defaults::pool::MIN_CONNECTIONS,
            max_connections: None,
            idle_timeout_ms: defaults::pool::IDLE_TIMEOUT_MS,
            load_conditioning_interval_ms: defaults::pool::LOAD_CONDITIONING_INTERVAL_MS,
            ping_interval_ms: defaults::pool::PING_INTERVAL_MS,
            free_connection_timeout_ms: defaults::pool::FREE_CONNECTION_TIMEOUT_MS,
            read_timeout_ms: defaults::pool::READ_TIMEOUT_MS,
            connect_timeout_ms: defaults::pool::CONNECT_TIMEOUT_MS,
            update_locator_list_interval_ms: defaults::pool::UPDATE_LOCATOR_LIST_INTERVAL_MS,
            retry_attempts: defaults::pool::RETRY_ATTEMPTS,
            server_group: None,
            single_hop_enabled: defaults::pool::SINGLE_HOP_ENABLED,
            subscription: SubscriptionSettings::default(),
        }
    }
}

impl PoolSettings {
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_locators<I, S>(locators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            locators: locators.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Short timers for tests and local development
    pub fn fast_maintenance(mut self) -> Self {
        self.idle_timeout_ms = 200;
        self.load_conditioning_interval_ms = 1_000;
        self.ping_interval_ms = 500;
        self.free_connection_timeout_ms = 500;
        self.read_timeout_ms = 1_000;
        self.connect_timeout_ms = 1_000;
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero(self.idle_timeout_ms)
    }

    pub fn load_conditioning_interval(&self) -> Option<Duration> {
        non_zero(self.load_conditioning_interval_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        non_zero(self.ping_interval_ms)
    }

    pub fn update_locator_list_interval(&self) -> Option<Duration> {
        non_zero(self.update_locator_list_interval_ms)
    }

    pub fn free_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.free_connection_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.locators.is_empty() && self.servers.is_empty() {
            bail!("pool '{}' needs at least one locator or server", name);
        }
        if let Some(max) = self.max_connections {
            if max == 0 {
                bail!("pool '{}': max_connections must be positive", name);
            }
            if self.min_connections > max {
                bail!(
                    "pool '{}': min_connections {} exceeds max_connections {}",
                    name,
                    self.min_connections,
                    max
                );
            }
        }
        if self.retry_attempts < -1 {
            bail!("pool '{}': retry_attempts must be -1 or greater", name);
        }
        if self.free_connection_timeout_ms == 0 || self.read_timeout_ms == 0 {
            bail!("pool '{}': timeouts must be positive", name);
        }
        self.subscription
            .validate()
            .with_context(|| format!("pool '{}' subscription settings", name))
    }
}

/// Conflation of subscription events
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflationPolicy {
    /// Use whatever the server is configured with
    #[default]
    #[serde(rename = "server")]
    Server,
    #[serde(rename = "true")]
    Enabled,
    #[serde(rename = "false")]
    Disabled,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SubscriptionSettings {
    pub enabled: bool,
    /// Number of secondary queues; -1 uses every available server
    pub redundancy: i32,
    pub message_tracking_timeout_ms: u64,
    pub ack_interval_ms: u64,
    pub durable_client_id: Option<String>,
    pub durable_timeout_ms: u64,
    pub conflate_events: ConflationPolicy,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redundancy: defaults::subscription::REDUNDANCY,
            message_tracking_timeout_ms: defaults::subscription::MESSAGE_TRACKING_TIMEOUT_MS,
            ack_interval_ms: defaults::subscription::ACK_INTERVAL_MS,
            durable_client_id: None,
            durable_timeout_ms: defaults::subscription::DURABLE_TIMEOUT_MS,
            conflate_events: ConflationPolicy::Server,
        }
    }
}

impl SubscriptionSettings {
    pub fn message_tracking_timeout(&self) -> Duration {
        Duration::from_millis(self.message_tracking_timeout_ms)
    }

    pub fn ack_interval(&self) -> Option<Duration> {
        non_zero(self.ack_interval_ms)
    }

    pub fn durable_timeout(&self) -> Duration {
        Duration::from_millis(self.durable_timeout_ms)
    }

    pub fn is_durable(&self) -> bool {
        self.durable_client_id.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.redundancy < -1 {
            bail!("redundancy must be -1 or greater, got {}", self.redundancy);
        }
        if let Some(id) = &self.durable_client_id {
            if id.trim().is_empty() {
                bail!("durable_client_id must not be blank");
            }
            if self.durable_timeout_ms == 0 {
                bail!("durable clients need a positive durable_timeout_ms");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MetadataSettings {
    /// Hop signals per region before a background refresh is queued
    pub hop_refresh_threshold: u32,
    /// Periodic refresh of every known region; 0 disables
    pub refresh_interval_ms: u64,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            hop_refresh_threshold: defaults::metadata::HOP_REFRESH_THRESHOLD,
            refresh_interval_ms: 0,
        }
    }
}

impl MetadataSettings {
    pub fn refresh_interval(&self) -> Option<Duration> {
        non_zero(self.refresh_interval_ms)
    }
}

impl ClientConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading client config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (CACHE_CLIENT__ prefix)
        builder = builder.add_source(
            Environment::with_prefix(defaults::ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let loaded: ClientConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        loaded.finish()
    }

    /// Parse a TOML document, without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to build configuration")?;
        let parsed: ClientConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        parsed.finish()
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    fn finish(mut self) -> Result<Self> {
        if self.pools.is_empty() {
            self.pools
                .insert(defaults::DEFAULT_POOL_NAME.to_string(), PoolSettings::default());
        }
        debug!(pools = self.pools.len(), "Client configuration loaded");
        Ok(self)
    }

    pub fn pool(&self, name: &str) -> Option<&PoolSettings> {
        self.pools.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, pool) in &self.pools {
            pool.validate(name)?;
        }
        Ok(())
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Convenience function to load and validate configuration
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let config = ClientConfig::load(path)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_server_expectations() {
        let pool = PoolSettings::default();
        assert_eq!(pool.min_connections, 1);
        assert_eq!(pool.max_connections, None);
        assert_eq!(pool.idle_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(pool.load_conditioning_interval(), Some(Duration::from_secs(300)));
        assert_eq!(pool.free_connection_timeout(), Duration::from_secs(10));
        assert_eq!(pool.retry_attempts, -1);
        assert!(pool.single_hop_enabled);
        assert_eq!(pool.subscription.redundancy, 0);
        assert_eq!(pool.subscription.ack_interval(), Some(Duration::from_secs(100)));
        assert_eq!(ClientConfig::default().metadata.hop_refresh_threshold, 1);
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("client.toml");

        let config_content = r#"
[pools.orders]
locators = ["locator-1:10334"]
min_connections = 4
max_connections = 8
idle_timeout_ms = 25000
server_group = "east"

[pools.orders.subscription]
enabled = true
redundancy = 1
durable_client_id = "order-feed"
conflate_events = "true"

[metadata]
hop_refresh_threshold = 3

[logging]
level = "debug"
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = load_config(Some(&config_path)).unwrap();
        let orders = config.pool("orders").unwrap();
        assert_eq!(orders.min_connections, 4);
        assert_eq!(orders.max_connections, Some(8));
        assert_eq!(orders.idle_timeout(), Some(Duration::from_millis(25_000)));
        assert_eq!(orders.server_group.as_deref(), Some("east"));
        assert_eq!(orders.ping_interval_ms, defaults::pool::PING_INTERVAL_MS);
        assert!(orders.subscription.is_durable());
        assert_eq!(orders.subscription.conflate_events, ConflationPolicy::Enabled);
        assert_eq!(config.metadata.hop_refresh_threshold, 3);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn empty_document_yields_default_pool() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert!(config.pool(defaults::DEFAULT_POOL_NAME).is_some());
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let mut pool = PoolSettings::with_servers(["a:1"]);
        pool.min_connections = 9;
        pool.max_connections = Some(8);
        assert!(pool.validate("p").is_err());

        pool.min_connections = 0;
        pool.max_connections = Some(0);
        assert!(pool.validate("p").is_err());
    }

    #[test]
    fn validation_rejects_missing_sources_and_bad_subscription() {
        assert!(PoolSettings::default().validate("p").is_err());

        let mut pool = PoolSettings::with_locators(["l:1"]);
        pool.subscription.redundancy = -2;
        assert!(pool.validate("p").is_err());

        pool.subscription.redundancy = -1;
        pool.subscription.durable_client_id = Some("d".into());
        pool.subscription.durable_timeout_ms = 0;
        assert!(pool.validate("p").is_err());
    }

    #[test]
    fn serializes_back_to_toml() {
        let config = ClientConfig::default();
        let text = config.to_toml_string().unwrap();
        let parsed = ClientConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
