//! Subscription interest

use serde::{Deserialize, Serialize};

use crate::CacheableKey;

/// Which entries of a region a subscriber wants events for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interest {
    Keys(Vec<CacheableKey>),
    /// Keys whose string form matches the pattern
    Regex(String),
    AllKeys,
}

/// Kind of change carried by a subscription event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Create,
    Update,
    Destroy,
    Invalidate,
}
