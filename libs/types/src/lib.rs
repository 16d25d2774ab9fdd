//! # Cache Types
//!
//! Value types shared by every layer of the partitioned cache client.
//!
//! - [`ServerLocation`]: host and port of a server or locator
//! - [`BucketId`] / [`BucketMetadata`]: which servers own a bucket
//! - [`CacheableKey`] / [`Cacheable`]: entry keys and values
//! - [`EventId`]: identity of writes and subscription events
//!
//! Key hashing lives here because both the client router and the server
//! simulator must agree on it bit for bit.

pub mod bucket;
pub mod event;
pub mod interest;
pub mod key;
pub mod location;
pub mod value;

pub use bucket::{BucketId, BucketMetadata, FixedPartition};
pub use event::{EventId, EventIdGenerator, EventSource, ThreadLease};
pub use interest::{EventKind, Interest};
pub use key::{bucket_for_hash, CacheableKey};
pub use location::ServerLocation;
pub use value::Cacheable;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("Invalid server location '{0}', expected host:port")]
    InvalidLocation(String),
}
