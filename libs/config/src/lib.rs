//! # Cache Client Configuration
//!
//! Configuration surface and defaults for the partitioned cache client.
//!
//! ## Features
//!
//! - **Pool Settings**: connection bounds, idle / load-conditioning / ping timers, retries
//! - **Subscription Settings**: redundancy, acking, durable identity, conflation
//! - **Metadata Settings**: hop threshold and timer-driven refresh
//! - **Logging**: `tracing-subscriber` initialisation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cache_config::{load_config, PoolSettings};
//!
//! let config = load_config(Some(std::path::Path::new("client.toml")))?;
//! let orders = config.pool("orders").cloned().unwrap_or_else(|| PoolSettings::with_locators(["localhost:10334"]));
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod client_config;
pub mod defaults;
pub mod logging;

pub use client_config::{
    load_config, ClientConfig, ConflationPolicy, MetadataSettings, PoolSettings,
    SubscriptionSettings,
};
pub use logging::{init_logging, LoggingSettings};
