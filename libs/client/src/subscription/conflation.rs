//! Client-side conflation of queued events
//!
//! When the dispatcher falls behind, successive updates of one key are
//! collapsed into the latest one. The conflated event keeps the queue
//! position of the first update so per-key order is unchanged.

use cache_types::{CacheableKey, EventKind};
use std::collections::{HashMap, VecDeque};

use super::listener::EntryEvent;

/// FIFO of events awaiting dispatch
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<EntryEvent>,
    /// Sequence of `events[0]`
    head: u64,
    /// Queued updates by entry, as queue sequences
    updates: HashMap<(String, CacheableKey), u64>,
    conflated: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `event`, replacing a queued update of the same entry when
    /// `conflate` is set
    pub fn push(&mut self, event: EntryEvent, conflate: bool) {
        let entry = (event.region.clone(), event.key.clone());
        if event.kind != EventKind::Update || !conflate {
            // anything but an update ends the run of conflatable updates
            self.updates.remove(&entry);
            self.events.push_back(event);
            return;
        }
        if let Some(&sequence) = self.updates.get(&entry) {
            let index = (sequence - self.head) as usize;
            if let Some(slot) = self.events.get_mut(index) {
                *slot = event;
                self.conflated += 1;
                return;
            }
        }
        let sequence = self.head + self.events.len() as u64;
        self.updates.insert(entry, sequence);
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<EntryEvent> {
        let event = self.events.pop_front()?;
        let sequence = self.head;
        self.head += 1;
        let entry = (event.region.clone(), event.key.clone());
        if self.updates.get(&entry) == Some(&sequence) {
            self.updates.remove(&entry);
        }
        Some(event)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Updates absorbed into an already queued one
    pub fn conflated(&self) -> u64 {
        self.conflated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_types::{Cacheable, EventId};

    fn event(key: &str, kind: EventKind, value: i32) -> EntryEvent {
        EntryEvent {
            region: "orders".into(),
            key: key.into(),
            kind,
            new_value: Some(Cacheable::Int32(value)),
            callback_arg: None,
            event_id: EventId::new("server", 1, value as i64),
        }
    }

    fn drain(queue: &mut EventQueue) -> Vec<(String, i32)> {
        std::iter::from_fn(|| queue.pop())
            .map(|e| match e.new_value {
                Some(Cacheable::Int32(v)) => (e.key.to_string(), v),
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn updates_collapse_into_the_first_position() {
        let mut queue = EventQueue::new();
        queue.push(event("a", EventKind::Update, 1), true);
        queue.push(event("b", EventKind::Update, 2), true);
        queue.push(event("a", EventKind::Update, 3), true);
        queue.push(event("a", EventKind::Update, 4), true);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.conflated(), 2);
        assert_eq!(drain(&mut queue), vec![("a".into(), 4), ("b".into(), 2)]);
    }

    #[test]
    fn other_kinds_break_the_run() {
        let mut queue = EventQueue::new();
        queue.push(event("a", EventKind::Update, 1), true);
        queue.push(event("a", EventKind::Destroy, 2), true);
        queue.push(event("a", EventKind::Update, 3), true);
        assert_eq!(queue.len(), 3);
        assert_eq!(drain(&mut queue), vec![("a".into(), 1), ("a".into(), 2), ("a".into(), 3)]);
    }

    #[test]
    fn disabled_conflation_keeps_every_event() {
        let mut queue = EventQueue::new();
        for value in 0..3 {
            queue.push(event("a", EventKind::Update, value), false);
        }
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn popped_updates_are_not_replaced() {
        let mut queue = EventQueue::new();
        queue.push(event("a", EventKind::Update, 1), true);
        assert_eq!(drain(&mut queue), vec![("a".into(), 1)]);
        queue.push(event("a", EventKind::Update, 2), true);
        queue.push(event("a", EventKind::Update, 3), true);
        assert_eq!(drain(&mut queue), vec![("a".into(), 3)]);
    }
}
