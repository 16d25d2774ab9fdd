//! Default configuration values
//!
//! These match the values cache servers expect from a client that does not
//! configure anything explicitly.

/// Connection pool defaults
pub mod pool {
    pub const MIN_CONNECTIONS: usize = 1;

    /// Idle connections above the minimum are closed after this long (milliseconds)
    pub const IDLE_TIMEOUT_MS: u64 = 5_000;

    /// Connections older than this are replaced to rebalance load (milliseconds)
    pub const LOAD_CONDITIONING_INTERVAL_MS: u64 = 300_000;

    pub const PING_INTERVAL_MS: u64 = 10_000;

    /// Longest an `acquire` waits at max connections (milliseconds)
    pub const FREE_CONNECTION_TIMEOUT_MS: u64 = 10_000;

    pub const READ_TIMEOUT_MS: u64 = 10_000;

    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// -1 tries every server once
    pub const RETRY_ATTEMPTS: i32 = -1;

    pub const UPDATE_LOCATOR_LIST_INTERVAL_MS: u64 = 5_000;

    pub const SINGLE_HOP_ENABLED: bool = true;
}

/// Subscription defaults
pub mod subscription {
    pub const REDUNDANCY: i32 = 0;

    pub const MESSAGE_TRACKING_TIMEOUT_MS: u64 = 900_000;

    pub const ACK_INTERVAL_MS: u64 = 100_000;

    pub const DURABLE_TIMEOUT_MS: u64 = 300_000;
}

/// Metadata service defaults
pub mod metadata {
    /// Hop signals per region before a background refresh is queued
    pub const HOP_REFRESH_THRESHOLD: u32 = 1;
}

/// Name of the pool used when a region does not name one
pub const DEFAULT_POOL_NAME: &str = "default";

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "CACHE_CLIENT";
