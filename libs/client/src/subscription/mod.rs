//! # HA Subscription Manager
//!
//! Keeps one primary and `redundancy` secondary subscription queues on
//! different servers. Every server queues the client's events; only the
//! primary pushes them. When the primary goes away the first surviving
//! secondary is promoted and replays what the client has not acknowledged
//! yet, and the [`EventTracker`] drops what was already delivered.
//!
//! ```text
//! queue reader (per server) ──┐
//! queue reader (per server) ──┼─▶ signals ─▶ dispatcher ─▶ dedup ─▶ conflation ─▶ listeners
//! queue reader (per server) ──┘                  │
//!                                                └─ queue lost ─▶ promote / replace
//! ```
//!
//! Interest registrations are kept client-side and replayed onto every
//! queue server that joins later. Durable clients keep their server queues
//! across a `close(keep_alive = true)` and resume them on reconnect after
//! calling [`SubscriptionManager::ready_for_events`].

pub mod conflation;
pub mod dedup;
pub mod listener;

pub use conflation::EventQueue;
pub use dedup::EventTracker;
pub use listener::{CacheListener, EntryEvent};

use cache_codec::{Operation, RegionEvent, ResponseBody, ServerMessage, TypeRegistry};
use cache_config::{ConflationPolicy, SubscriptionSettings};
use cache_network::{Connection, Pool, Scheduler, TaskControl, TaskGroup};
use cache_types::{Cacheable, Interest, ServerLocation};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::router::unexpected;

/// An interest as registered by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredInterest {
    pub region: String,
    pub interest: Interest,
    pub durable: bool,
    pub receive_values: bool,
}

struct QueueEndpoint {
    location: ServerLocation,
    connection: Arc<Connection>,
}

#[derive(Default)]
struct QueueSet {
    primary: Option<QueueEndpoint>,
    secondaries: Vec<QueueEndpoint>,
}

impl QueueSet {
    fn locations(&self) -> HashSet<ServerLocation> {
        self.primary
            .iter()
            .chain(self.secondaries.iter())
            .map(|q| q.location.clone())
            .collect()
    }

    fn len(&self) -> usize {
        usize::from(self.primary.is_some()) + self.secondaries.len()
    }

    /// Remove the queue on `location` if it still uses `connection`, telling
    /// whether it was the primary
    fn remove(&mut self, location: &ServerLocation, connection: u64) -> Option<(QueueEndpoint, bool)> {
        let is_it = |q: &QueueEndpoint| &q.location == location && q.connection.id() == connection;
        if self.primary.as_ref().is_some_and(is_it) {
            return self.primary.take().map(|q| (q, true));
        }
        let index = self.secondaries.iter().position(is_it)?;
        Some((self.secondaries.remove(index), false))
    }

    fn drain(&mut self) -> Vec<QueueEndpoint> {
        self.primary.take().into_iter().chain(self.secondaries.drain(..)).collect()
    }
}

enum QueueSignal {
    Event {
        server: ServerLocation,
        event: RegionEvent,
    },
    Lost {
        server: ServerLocation,
        connection: u64,
    },
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    duplicates: AtomicU64,
    failovers: AtomicU64,
}

/// Subscription queues and interest registry of one pool
pub struct SubscriptionManager {
    pool: Arc<Pool>,
    settings: SubscriptionSettings,
    registry: Arc<TypeRegistry>,
    tracker: EventTracker,
    interests: Mutex<Vec<RegisteredInterest>>,
    queues: AsyncMutex<QueueSet>,
    listeners: DashMap<String, Vec<Arc<dyn CacheListener>>>,
    conflation: DashMap<String, bool>,
    signals: mpsc::UnboundedSender<QueueSignal>,
    tasks: TaskGroup,
    ready: AtomicBool,
    durable_reconnect: AtomicBool,
    closed: AtomicBool,
    counters: Counters,
}

impl SubscriptionManager {
    /// Connect the queues and start reading events
    pub async fn start(
        pool: Arc<Pool>,
        settings: SubscriptionSettings,
        registry: Arc<TypeRegistry>,
        scheduler: &Scheduler,
    ) -> Result<Arc<Self>> {
        let (signals, receiver) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            tracker: EventTracker::new(settings.message_tracking_timeout()),
            tasks: scheduler.task_group(format!("subscriptions:{}", pool.name())),
            ready: AtomicBool::new(!settings.is_durable()),
            pool,
            settings,
            registry,
            interests: Mutex::new(Vec::new()),
            queues: AsyncMutex::new(QueueSet::default()),
            listeners: DashMap::new(),
            conflation: DashMap::new(),
            signals,
            durable_reconnect: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        {
            let mut queues = manager.queues.lock().await;
            manager.fill(&mut queues, HashSet::new()).await;
            let Some(primary) = queues.primary.as_ref() else {
                manager.tasks.cancel();
                return Err(ClientError::NoServersAvailable {
                    message: format!("no server accepted a subscription queue for pool '{}'", manager.pool.name()),
                });
            };
            manager
                .durable_reconnect
                .store(primary.connection.is_durable_reconnect(), Ordering::Release);
            info!(
                pool = manager.pool.name(),
                primary = %primary.location,
                secondaries = queues.secondaries.len(),
                durable = manager.settings.is_durable(),
                durable_reconnect = primary.connection.is_durable_reconnect(),
                "Subscription queues connected"
            );
        }

        manager.spawn_dispatcher(receiver);
        manager.spawn_maintenance();
        Ok(manager)
    }

    fn spawn_dispatcher(self: &Arc<Self>, mut receiver: mpsc::UnboundedReceiver<QueueSignal>) {
        let weak = Arc::downgrade(self);
        self.tasks.spawn("subscription-dispatch", move |mut stop| async move {
            let mut queue = EventQueue::new();
            loop {
                tokio::select! {
                    signal = receiver.recv() => {
                        let Some(signal) = signal else { break };
                        let Some(manager) = weak.upgrade() else { break };
                        manager.handle(signal, &mut queue).await;
                        // take whatever else arrived so bursts can conflate
                        while let Ok(signal) = receiver.try_recv() {
                            manager.handle(signal, &mut queue).await;
                        }
                        manager.dispatch_queued(&mut queue);
                    }
                    _ = stop.stopped() => break,
                }
            }
        });
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        if let Some(interval) = self.settings.ack_interval() {
            let weak = Arc::downgrade(self);
            self.tasks.spawn_periodic("periodic-ack", interval, move || {
                let weak = weak.clone();
                async move {
                    let Some(manager) = weak.upgrade() else {
                        return TaskControl::Stop;
                    };
                    manager.send_ack().await;
                    TaskControl::Continue
                }
            });
        }

        let weak = Arc::downgrade(self);
        self.tasks.spawn_periodic(
            "event-expiry",
            self.settings.message_tracking_timeout(),
            move || {
                let weak = weak.clone();
                async move {
                    let Some(manager) = weak.upgrade() else {
                        return TaskControl::Stop;
                    };
                    let expired = manager.tracker.expire();
                    if expired > 0 {
                        debug!(pool = manager.pool.name(), expired, "Expired event sources");
                    }
                    TaskControl::Continue
                }
            },
        );

        if let Some(interval) = self.pool.settings().ping_interval() {
            let weak: Weak<Self> = Arc::downgrade(self);
            self.tasks.spawn_periodic("queue-redundancy", interval, move || {
                let weak = weak.clone();
                async move {
                    let Some(manager) = weak.upgrade() else {
                        return TaskControl::Stop;
                    };
                    manager.restore_redundancy().await;
                    TaskControl::Continue
                }
            });
        }
    }

    fn spawn_reader(&self, location: ServerLocation, connection: Arc<Connection>) {
        let signals = self.signals.clone();
        self.tasks.spawn("queue-reader", move |mut stop| async move {
            loop {
                tokio::select! {
                    message = connection.next_message() => match message {
                        Ok(ServerMessage::Event(event)) => {
                            let signal = QueueSignal::Event { server: location.clone(), event };
                            if signals.send(signal).is_err() {
                                break;
                            }
                        }
                        Ok(ServerMessage::Response(response)) => {
                            debug!(server = %location, correlation_id = response.correlation_id, "Ignoring response on queue connection");
                        }
                        Err(e) => {
                            debug!(server = %location, error = %e, "Queue connection failed");
                            let _ = signals.send(QueueSignal::Lost {
                                server: location.clone(),
                                connection: connection.id(),
                            });
                            break;
                        }
                    },
                    _ = stop.stopped() => break,
                }
            }
        });
    }

    async fn handle(&self, signal: QueueSignal, queue: &mut EventQueue) {
        match signal {
            QueueSignal::Event { server, event } => {
                if !self.tracker.accept(&event.event_id) {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    debug!(server = %server, event = %event.event_id, "Dropping duplicate event");
                    return;
                }
                let conflate = self.conflates(&event.region);
                queue.push(self.entry_event(event), conflate);
            }
            QueueSignal::Lost { server, connection } => self.failover(&server, connection).await,
        }
    }

    fn dispatch_queued(&self, queue: &mut EventQueue) {
        while let Some(event) = queue.pop() {
            let listeners = self
                .listeners
                .get(&event.region)
                .map(|l| l.clone())
                .unwrap_or_default();
            for listener in &listeners {
                listener::deliver(listener.as_ref(), &event);
            }
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn entry_event(&self, event: RegionEvent) -> EntryEvent {
        let decode = |value: Option<&cache_codec::EncodedValue>| -> Option<Cacheable> {
            let value = value?;
            match self.registry.decode(value) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    warn!(region = %event.region, key = %event.key, error = %e, "Undecodable event payload");
                    None
                }
            }
        };
        EntryEvent {
            new_value: decode(event.value.as_ref()),
            callback_arg: decode(event.callback_arg.as_ref()),
            region: event.region.clone(),
            key: event.key.clone(),
            kind: event.kind,
            event_id: event.event_id.clone(),
        }
    }

    fn conflates(&self, region: &str) -> bool {
        self.conflation
            .get(region)
            .map(|c| *c)
            .unwrap_or(self.settings.conflate_events == ConflationPolicy::Enabled)
    }

    /// Queues wanted in total; `None` for every available server
    fn wanted(&self) -> Option<usize> {
        usize::try_from(self.settings.redundancy).ok().map(|r| r + 1)
    }

    /// Open queues until the primary and all secondaries are present
    async fn fill(&self, queues: &mut QueueSet, mut excluded: HashSet<ServerLocation>) {
        let wanted = self.wanted().unwrap_or(usize::MAX);
        if queues.primary.is_some() && queues.len() >= wanted {
            return;
        }
        excluded.extend(queues.locations());
        let candidates = match self.pool.selector().select_queue_servers(None, &excluded).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(pool = self.pool.name(), error = %e, "No servers for subscription queues");
                return;
            }
        };

        for location in candidates {
            let primary = queues.primary.is_none();
            if !primary && queues.len() >= wanted {
                break;
            }
            let connection = match self.pool.connect_queue(&location, primary).await {
                Ok(connection) => Arc::new(connection),
                Err(e) => {
                    debug!(server = %location, error = %e, "Could not open subscription queue");
                    continue;
                }
            };
            self.spawn_reader(location.clone(), connection.clone());
            self.replay_interests(&location).await;
            if primary && self.ready.load(Ordering::Acquire) && self.settings.is_durable() {
                if let Err(e) = self.control(&location, "", Operation::ReadyForEvents).await {
                    warn!(server = %location, error = %e, "Ready for events failed on new primary");
                }
            }
            debug!(server = %location, primary, "Subscription queue opened");
            let endpoint = QueueEndpoint { location, connection };
            if primary {
                queues.primary = Some(endpoint);
            } else {
                queues.secondaries.push(endpoint);
            }
        }
    }

    async fn replay_interests(&self, location: &ServerLocation) {
        let interests = self.interests.lock().clone();
        for registered in interests {
            let operation = Operation::RegisterInterest {
                interest: registered.interest.clone(),
                durable: registered.durable,
                receive_values: registered.receive_values,
            };
            if let Err(e) = self.control(location, &registered.region, operation).await {
                warn!(server = %location, region = %registered.region, error = %e, "Interest replay failed");
            }
        }
    }

    async fn failover(&self, lost: &ServerLocation, connection: u64) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut queues = self.queues.lock().await;
        let Some((endpoint, was_primary)) = queues.remove(lost, connection) else {
            return;
        };
        endpoint.connection.close().await;
        self.pool.invalidate_server(lost).await;
        warn!(pool = self.pool.name(), server = %lost, primary = was_primary, "Subscription queue lost");

        if was_primary {
            self.counters.failovers.fetch_add(1, Ordering::Relaxed);
            self.promote(&mut queues).await;
        }
        self.fill(&mut queues, HashSet::from([lost.clone()])).await;
        if queues.primary.is_none() {
            warn!(pool = self.pool.name(), "No primary subscription queue; events are lost until one connects");
        }
    }

    async fn promote(&self, queues: &mut QueueSet) {
        let ready = self.ready.load(Ordering::Acquire);
        while !queues.secondaries.is_empty() {
            let candidate = queues.secondaries.remove(0);
            let operation = Operation::MakePrimary {
                ready_for_events: ready,
            };
            match self.control(&candidate.location, "", operation).await {
                Ok(()) => {
                    info!(pool = self.pool.name(), primary = %candidate.location, "Promoted secondary queue");
                    queues.primary = Some(candidate);
                    return;
                }
                Err(e) => {
                    warn!(server = %candidate.location, error = %e, "Secondary could not become primary");
                    candidate.connection.close().await;
                }
            }
        }
    }

    async fn restore_redundancy(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut queues = self.queues.lock().await;
        let before = queues.len();
        self.fill(&mut queues, HashSet::new()).await;
        if queues.len() > before {
            info!(pool = self.pool.name(), queues = queues.len(), "Subscription redundancy restored");
        }
    }

    async fn send_ack(&self) {
        let events = self.tracker.take_unacked();
        if events.is_empty() {
            return;
        }
        let primary = self.queues.lock().await.primary.as_ref().map(|q| q.location.clone());
        let result = match primary {
            Some(primary) => {
                let operation = Operation::PeriodicAck {
                    events: events.clone(),
                };
                self.control(&primary, "", operation).await
            }
            None => Err(ClientError::NoServersAvailable {
                message: "no primary queue to acknowledge to".into(),
            }),
        };
        match result {
            Ok(()) => debug!(pool = self.pool.name(), events = events.len(), "Acknowledged events"),
            Err(e) => {
                debug!(pool = self.pool.name(), error = %e, "Periodic ack failed");
                self.tracker.ack_failed(&events);
            }
        }
    }

    /// Send a control operation to one queue server over a pool connection
    async fn control(&self, server: &ServerLocation, region: &str, operation: Operation) -> Result<()> {
        let name = operation.name();
        let mut connection = self
            .pool
            .acquire_to(Some(server), &HashSet::new())
            .await
            .map_err(|e| ClientError::from_acquire(self.pool.name(), e))?;
        match connection.request(region, operation).await {
            Ok(response) => match response.body {
                ResponseBody::Ok => Ok(()),
                ResponseBody::Error(error) => Err(ClientError::from_server(error, Some(server))),
                other => Err(unexpected(name, &other)),
            },
            Err(e) => {
                connection.invalidate();
                Err(e.into())
            }
        }
    }

    pub async fn register_interest(
        &self,
        region: &str,
        interest: Interest,
        durable: bool,
        receive_values: bool,
    ) -> Result<()> {
        if durable && !self.settings.is_durable() {
            return Err(ClientError::illegal_state(
                "durable interest needs a durable client id",
            ));
        }
        let queues = self.queues.lock().await;
        let primary = queues
            .primary
            .as_ref()
            .map(|q| q.location.clone())
            .ok_or_else(|| ClientError::NoServersAvailable {
                message: "no primary subscription queue".into(),
            })?;
        let operation = Operation::RegisterInterest {
            interest: interest.clone(),
            durable,
            receive_values,
        };
        self.control(&primary, region, operation.clone()).await?;
        for secondary in &queues.secondaries {
            if let Err(e) = self.control(&secondary.location, region, operation.clone()).await {
                warn!(server = %secondary.location, region, error = %e, "Interest not registered on secondary");
            }
        }
        drop(queues);

        let registered = RegisteredInterest {
            region: region.to_string(),
            interest,
            durable,
            receive_values,
        };
        let mut interests = self.interests.lock();
        if !interests.contains(&registered) {
            debug!(region, interest = ?registered.interest, durable, "Interest registered");
            interests.push(registered);
        }
        Ok(())
    }

    pub async fn unregister_interest(&self, region: &str, interest: &Interest) -> Result<()> {
        self.interests
            .lock()
            .retain(|r| !(r.region == region && &r.interest == interest));
        let queues = self.queues.lock().await;
        let operation = Operation::UnregisterInterest {
            interest: interest.clone(),
        };
        if let Some(primary) = &queues.primary {
            self.control(&primary.location, region, operation.clone()).await?;
        }
        for secondary in &queues.secondaries {
            if let Err(e) = self.control(&secondary.location, region, operation.clone()).await {
                warn!(server = %secondary.location, region, error = %e, "Interest not unregistered on secondary");
            }
        }
        Ok(())
    }

    /// Start delivery on a durable client's queues. A no-op for non-durable
    /// clients, whose queues deliver from the start.
    pub async fn ready_for_events(&self) -> Result<()> {
        if !self.settings.is_durable() || self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let queues = self.queues.lock().await;
        let primary = queues
            .primary
            .as_ref()
            .map(|q| q.location.clone())
            .ok_or_else(|| ClientError::NoServersAvailable {
                message: "no primary subscription queue".into(),
            })?;
        self.control(&primary, "", Operation::ReadyForEvents).await?;
        self.ready.store(true, Ordering::Release);
        info!(pool = self.pool.name(), primary = %primary, "Ready for events");
        Ok(())
    }

    /// Acknowledge what was delivered and close every queue. With
    /// `keep_alive` a durable client's server queues keep collecting events.
    pub async fn close(&self, keep_alive: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send_ack().await;
        let mut queues = self.queues.lock().await;
        if let Some(primary) = &queues.primary {
            let location = primary.location.clone();
            if let Err(e) = self
                .control(&location, "", Operation::CloseConnection { keep_alive })
                .await
            {
                debug!(server = %location, error = %e, "Close notification failed");
            }
        }
        self.tasks.cancel();
        for endpoint in queues.drain() {
            endpoint.connection.close().await;
        }
        info!(pool = self.pool.name(), keep_alive, "Subscriptions closed");
    }

    pub fn add_listener(&self, region: &str, listener: Arc<dyn CacheListener>) {
        self.listeners.entry(region.to_string()).or_default().push(listener);
    }

    /// Override client-side conflation for one region; `None` restores the
    /// pool-wide policy
    pub fn set_conflation(&self, region: &str, conflate: Option<bool>) {
        match conflate {
            Some(enabled) => {
                self.conflation.insert(region.to_string(), enabled);
            }
            None => {
                self.conflation.remove(region);
            }
        }
    }

    pub fn interests(&self, region: &str) -> Vec<RegisteredInterest> {
        self.interests
            .lock()
            .iter()
            .filter(|r| r.region == region)
            .cloned()
            .collect()
    }

    pub async fn primary(&self) -> Option<ServerLocation> {
        self.queues.lock().await.primary.as_ref().map(|q| q.location.clone())
    }

    pub async fn secondaries(&self) -> Vec<ServerLocation> {
        self.queues
            .lock()
            .await
            .secondaries
            .iter()
            .map(|q| q.location.clone())
            .collect()
    }

    /// Whether the server still held this durable client's queues
    pub fn is_durable_reconnect(&self) -> bool {
        self.durable_reconnect.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Events handed to listeners
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.counters.duplicates.load(Ordering::Relaxed)
    }

    pub fn failovers(&self) -> u64 {
        self.counters.failovers.load(Ordering::Relaxed)
    }

    /// Event sources whose last sequence is remembered for deduplication
    pub fn tracked_sources(&self) -> usize {
        self.tracker.len()
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("pool", &self.pool.name())
            .field("redundancy", &self.settings.redundancy)
            .field("durable", &self.settings.is_durable())
            .field("closed", &self.is_closed())
            .finish()
    }
}
