//! Event identity
//!
//! Every write and every subscription event carries an [`EventId`]. The pair
//! `(member_id, thread_id)` names the source; `sequence_id` grows
//! monotonically per source. Servers use it to drop replayed writes and the
//! subscription layer uses it to drop duplicate deliveries.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventSource {
    pub member_id: String,
    pub thread_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub member_id: String,
    pub thread_id: i64,
    pub sequence_id: i64,
}

impl EventId {
    pub fn new(member_id: impl Into<String>, thread_id: i64, sequence_id: i64) -> Self {
        Self {
            member_id: member_id.into(),
            thread_id,
            sequence_id,
        }
    }

    /// Id of entry `index` of a bulk write. Each entry gets its own source so
    /// the entries of one bulk write are not mistaken for duplicates.
    pub fn for_bulk_entry(&self, index: usize) -> EventId {
        EventId {
            member_id: self.member_id.clone(),
            thread_id: ((index as i64 + 1) << 32) + self.thread_id,
            sequence_id: self.sequence_id,
        }
    }

    pub fn source(&self) -> EventSource {
        EventSource {
            member_id: self.member_id.clone(),
            thread_id: self.thread_id,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.member_id, self.thread_id, self.sequence_id)
    }
}

/// Allocates event ids for one member.
///
/// Writers lease a thread id for the length of one operation and hand it
/// back afterwards, so the number of sources a member produces is bounded by
/// its peak write concurrency rather than by its write count.
#[derive(Debug)]
pub struct EventIdGenerator {
    member_id: String,
    next_thread: AtomicI64,
    next_sequence: AtomicI64,
    free_threads: Mutex<Vec<i64>>,
}

impl EventIdGenerator {
    pub fn new(member_id: impl Into<String>) -> Self {
        Self {
            member_id: member_id.into(),
            next_thread: AtomicI64::new(1),
            next_sequence: AtomicI64::new(0),
            free_threads: Mutex::new(Vec::new()),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Thread id no other caller of this generator has been given
    pub fn new_thread_id(&self) -> i64 {
        self.next_thread.fetch_add(1, Ordering::Relaxed)
    }

    /// Thread id held by no other lease until the returned lease drops
    pub fn lease_thread(&self) -> ThreadLease<'_> {
        let thread_id = self
            .free_threads
            .lock()
            .pop()
            .unwrap_or_else(|| self.new_thread_id());
        ThreadLease {
            generator: self,
            thread_id,
        }
    }

    /// Thread ids handed out so far, leased or free
    pub fn threads_allocated(&self) -> usize {
        (self.next_thread.load(Ordering::Relaxed) - 1) as usize
    }

    /// Next id for `thread_id`. Sequences are shared across threads of the
    /// member, which keeps them monotonic per source as well.
    pub fn next(&self, thread_id: i64) -> EventId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        EventId::new(self.member_id.clone(), thread_id, sequence)
    }
}

/// Exclusive use of one thread id; returned to the generator on drop
#[derive(Debug)]
pub struct ThreadLease<'a> {
    generator: &'a EventIdGenerator,
    thread_id: i64,
}

impl ThreadLease<'_> {
    pub fn thread_id(&self) -> i64 {
        self.thread_id
    }

    pub fn next_id(&self) -> EventId {
        self.generator.next(self.thread_id)
    }
}

impl Drop for ThreadLease<'_> {
    fn drop(&mut self) {
        self.generator.free_threads.lock().push(self.thread_id);
    }
}
