//! Duplicate suppression for subscription events
//!
//! After a failover the new primary queue replays every event it holds that
//! was not acknowledged yet, some of which the old primary already
//! delivered. Sequences grow per `(member, thread)` source, so remembering
//! the highest delivered sequence of each source is enough to drop them.

use cache_types::{EventId, EventSource};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct SourceState {
    last_sequence: i64,
    last_seen: Instant,
    /// Highest sequence already included in a sent ack
    acked: Option<i64>,
}

/// Highest delivered sequence per event source
#[derive(Debug)]
pub struct EventTracker {
    sources: Mutex<HashMap<EventSource, SourceState>>,
    timeout: Duration,
}

impl EventTracker {
    /// Sources idle for longer than `timeout` are forgotten
    pub fn new(timeout: Duration) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Record a delivery. `false` when an equal or newer event of the same
    /// source was delivered before.
    pub fn accept(&self, event_id: &EventId) -> bool {
        let now = Instant::now();
        let mut sources = self.sources.lock();
        match sources.get_mut(&event_id.source()) {
            Some(state) if event_id.sequence_id <= state.last_sequence => {
                state.last_seen = now;
                false
            }
            Some(state) => {
                state.last_sequence = event_id.sequence_id;
                state.last_seen = now;
                true
            }
            None => {
                sources.insert(
                    event_id.source(),
                    SourceState {
                        last_sequence: event_id.sequence_id,
                        last_seen: now,
                        acked: None,
                    },
                );
                true
            }
        }
    }

    /// Ids to acknowledge: the latest event of every source delivered since
    /// its last ack. They count as acked from now on.
    pub fn take_unacked(&self) -> Vec<EventId> {
        let mut sources = self.sources.lock();
        sources
            .iter_mut()
            .filter(|(_, state)| state.acked != Some(state.last_sequence))
            .map(|(source, state)| {
                state.acked = Some(state.last_sequence);
                EventId::new(source.member_id.clone(), source.thread_id, state.last_sequence)
            })
            .collect()
    }

    /// The ack carrying `ids` was lost; send them again next round
    pub fn ack_failed(&self, ids: &[EventId]) {
        let mut sources = self.sources.lock();
        for id in ids {
            if let Some(state) = sources.get_mut(&id.source()) {
                if state.acked == Some(id.sequence_id) {
                    state.acked = None;
                }
            }
        }
    }

    /// Forget sources not seen within the tracking timeout
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let mut sources = self.sources.lock();
        let before = sources.len();
        sources.retain(|_, state| now.duration_since(state.last_seen) <= self.timeout);
        before - sources.len()
    }

    pub fn len(&self) -> usize {
        self.sources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.lock().is_empty()
    }
}
