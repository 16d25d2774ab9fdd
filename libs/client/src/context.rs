//! Per-operation context

use cache_types::{Cacheable, ServerLocation};
use std::collections::HashSet;

/// State of one region operation across its attempts.
///
/// Callers pass one in through the `*_with_context` region methods to set a
/// callback argument and to observe how the operation was routed.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    callback_arg: Option<Cacheable>,
    excluded: HashSet<ServerLocation>,
    attempts: u32,
    network_hop: bool,
    single_hop: bool,
    server: Option<ServerLocation>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback_arg(mut self, arg: impl Into<Cacheable>) -> Self {
        self.callback_arg = Some(arg.into());
        self
    }

    pub fn callback_arg(&self) -> Option<&Cacheable> {
        self.callback_arg.as_ref()
    }

    /// Servers that failed this operation and will not be tried again
    pub fn excluded(&self) -> &HashSet<ServerLocation> {
        &self.excluded
    }

    pub(crate) fn exclude(&mut self, server: ServerLocation) {
        self.excluded.insert(server);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start a new operation on this context. Attempts, exclusions and the
    /// routing of the previous operation are dropped; the callback argument
    /// and the hop flag carry over.
    pub(crate) fn begin_operation(&mut self) {
        self.attempts = 0;
        self.excluded.clear();
        self.single_hop = false;
        self.server = None;
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    pub(crate) fn is_retry(&self) -> bool {
        self.attempts > 1
    }

    /// True when any response on this context came from a server that had
    /// to forward it to the bucket owner, or when an operation went out
    /// without a known owner for its key
    pub fn network_hop_observed(&self) -> bool {
        self.network_hop
    }

    pub(crate) fn observe_hop(&mut self) {
        self.network_hop = true;
    }

    /// True when the last attempt went straight to the bucket's owner
    pub fn routed_single_hop(&self) -> bool {
        self.single_hop
    }

    pub(crate) fn set_routed(&mut self, server: ServerLocation, single_hop: bool) {
        self.server = Some(server);
        self.single_hop = single_hop;
    }

    /// Server of the last attempt
    pub fn server(&self) -> Option<&ServerLocation> {
        self.server.as_ref()
    }

    /// Context for a sub-operation sharing the caller's callback argument and
    /// attempt count
    pub(crate) fn fork(&self) -> Self {
        Self {
            callback_arg: self.callback_arg.clone(),
            attempts: self.attempts,
            ..Self::default()
        }
    }

    /// Fold a finished sub-operation back into this context
    pub(crate) fn absorb(&mut self, other: &OperationContext) {
        self.network_hop |= other.network_hop;
        self.attempts = self.attempts.max(other.attempts);
        self.excluded.extend(other.excluded.iter().cloned());
    }
}
