//! Cache keys and their routing hash
//!
//! Bucket placement must agree with the servers, so every key variant hashes
//! exactly the way the server side does: 32-bit wrapping arithmetic with the
//! classic `31 * h + x` string and array folds.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::BucketId;

/// Key of a region entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheableKey {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl CacheableKey {
    /// Routing hash shared with the servers
    pub fn hash_code(&self) -> i32 {
        match self {
            CacheableKey::Bool(true) => 1231,
            CacheableKey::Bool(false) => 1237,
            CacheableKey::Int32(v) => *v,
            CacheableKey::Int64(v) => (*v ^ ((*v as u64) >> 32) as i64) as i32,
            CacheableKey::String(s) => string_hash(s),
            CacheableKey::Bytes(b) => b
                .iter()
                .fold(1i32, |h, byte| h.wrapping_mul(31).wrapping_add(*byte as i8 as i32)),
        }
    }

    /// Bucket for this key in a region with `total_buckets` buckets
    pub fn bucket(&self, total_buckets: u32) -> Option<BucketId> {
        bucket_for_hash(self.hash_code(), total_buckets)
    }
}

/// `abs(hash % total)`; `None` when the region has no buckets
pub fn bucket_for_hash(hash: i32, total_buckets: u32) -> Option<BucketId> {
    if total_buckets == 0 {
        return None;
    }
    let total = total_buckets as i64;
    Some(BucketId::new(((hash as i64) % total).unsigned_abs() as u32))
}

fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

impl fmt::Display for CacheableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheableKey::Bool(v) => write!(f, "{}", v),
            CacheableKey::Int32(v) => write!(f, "{}", v),
            CacheableKey::Int64(v) => write!(f, "{}L", v),
            CacheableKey::String(s) => write!(f, "{}", s),
            CacheableKey::Bytes(b) => write!(f, "bytes[{}]", b.len()),
        }
    }
}

impl From<&str> for CacheableKey {
    fn from(value: &str) -> Self {
        CacheableKey::String(value.to_string())
    }
}

impl From<String> for CacheableKey {
    fn from(value: String) -> Self {
        CacheableKey::String(value)
    }
}

impl From<i32> for CacheableKey {
    fn from(value: i32) -> Self {
        CacheableKey::Int32(value)
    }
}

impl From<i64> for CacheableKey {
    fn from(value: i64) -> Self {
        CacheableKey::Int64(value)
    }
}

impl From<bool> for CacheableKey {
    fn from(value: bool) -> Self {
        CacheableKey::Bool(value)
    }
}

impl From<Vec<u8>> for CacheableKey {
    fn from(value: Vec<u8>) -> Self {
        CacheableKey::Bytes(value)
    }
}
