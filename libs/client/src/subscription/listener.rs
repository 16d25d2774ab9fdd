//! Application callbacks for subscription events

use cache_types::{Cacheable, CacheableKey, EventId, EventKind};

/// One delivered change of a region entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntryEvent {
    pub region: String,
    pub key: CacheableKey,
    pub kind: EventKind,
    /// `None` for destroys, invalidations and key-only interest
    pub new_value: Option<Cacheable>,
    pub callback_arg: Option<Cacheable>,
    pub event_id: EventId,
}

/// Receives the events of one region. Callbacks run on the subscription
/// dispatcher task, one at a time and in delivery order; they should not
/// block.
pub trait CacheListener: Send + Sync {
    fn after_create(&self, _event: &EntryEvent) {}

    fn after_update(&self, _event: &EntryEvent) {}

    fn after_destroy(&self, _event: &EntryEvent) {}

    fn after_invalidate(&self, _event: &EntryEvent) {}
}

pub(crate) fn deliver(listener: &dyn CacheListener, event: &EntryEvent) {
    match event.kind {
        EventKind::Create => listener.after_create(event),
        EventKind::Update => listener.after_update(event),
        EventKind::Destroy => listener.after_destroy(event),
        EventKind::Invalidate => listener.after_invalidate(event),
    }
}
