//! # Cache Client
//!
//! Partition-aware client for a partitioned cache cluster.
//!
//! ## Architecture
//!
//! ```text
//! CacheSession ──▶ Region ──▶ Router ──▶ Pool ──▶ Connection ──▶ server
//!      │                        │  ▲
//!      │                        ▼  │ retry / exclude
//!      │          ClientMetadataService ◀── FailureCoordinator
//!      │                (bucket → servers)
//!      └──▶ SubscriptionManager ──▶ primary + secondary queues ──▶ CacheListener
//! ```
//!
//! - [`session`]: pools, scheduler and registries of one client process
//! - [`region`]: keyed, bulk, function and interest operations on a region
//! - [`router`]: single-hop routing of keyed and bulk operations
//! - [`function`]: bucket-aware function execution with HA retries
//! - [`metadata`]: per-region bucket maps and their refresh
//! - [`failure`]: retry budget, server exclusion and error surfacing
//! - [`subscription`]: redundant event queues, dedup, conflation and listeners
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cache_client::{CacheSession, Execution};
//! use cache_config::{ClientConfig, PoolSettings};
//!
//! # async fn demo() -> cache_client::Result<()> {
//! let mut config = ClientConfig::default();
//! config.pools.insert("default".into(), PoolSettings::with_locators(["localhost:10334"]));
//!
//! let session = CacheSession::builder().config(config).build().await?;
//! let orders = session.region("orders", "default")?;
//! orders.put(1, "created").await?;
//! let totals = orders.execute(&Execution::new("order-totals")).await?;
//! println!("{:?}", totals.results);
//! session.close(false).await;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod failure;
pub mod function;
pub mod metadata;
pub mod region;
pub mod router;
pub mod session;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use context::OperationContext;
pub use error::{ClientError, Result};
pub use function::{Execution, FunctionFailure, FunctionResult};
pub use metadata::{
    ClientMetadataService, FixedPartitionResolver, PartitionMetadata, PartitionResolver,
    RegionResolver,
};
pub use region::Region;
pub use router::{BulkResult, Router};
pub use session::{CacheSession, CacheSessionBuilder};
pub use subscription::{CacheListener, EntryEvent, RegisteredInterest, SubscriptionManager};
