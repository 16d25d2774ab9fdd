//! # Maintenance Scheduler
//!
//! One scheduler per session runs every background task: pool idle sweeps,
//! load conditioning, pings, locator list updates, metadata refresh workers
//! and subscription maintenance. Tasks belong to a [`TaskGroup`] owned by the
//! component that spawned them; cancelling or dropping the group stops its
//! tasks, and shutting down the scheduler stops every group.
//!
//! Periodic task bodies should hold only weak references to their owner and
//! return [`TaskControl::Stop`] once the owner is gone.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Returned by periodic task bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

/// Shared, cancellable task scheduler
#[derive(Debug)]
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// New group of tasks owned by `owner`
    pub fn task_group(&self, owner: impl Into<String>) -> TaskGroup {
        let (cancel, _) = watch::channel(false);
        TaskGroup {
            owner: owner.into(),
            cancel,
            shutdown: self.shutdown.subscribe(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop every task of every group
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Scheduler shutting down");
            self.shutdown.send_replace(true);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Tasks owned by one component
#[derive(Debug)]
pub struct TaskGroup {
    owner: String,
    cancel: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Run `body` every `period`, first run one period from now
    pub fn spawn_periodic<F, Fut>(&self, task: &'static str, period: Duration, mut body: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TaskControl> + Send + 'static,
    {
        let owner = self.owner.clone();
        self.spawn(task, move |mut stop| async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        trace!(owner = %owner, task, "Running periodic task");
                        if body().await == TaskControl::Stop {
                            break;
                        }
                    }
                    _ = stop.stopped() => break,
                }
            }
        });
    }

    /// Spawn a long-running task. The task receives a [`StopSignal`] and should
    /// return once it fires; it is aborted when the group is cancelled anyway.
    pub fn spawn<F, Fut>(&self, task: &'static str, body: F)
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = StopSignal {
            cancel: self.cancel.subscribe(),
            shutdown: self.shutdown.clone(),
        };
        if stop.is_stopped() {
            debug!(owner = %self.owner, task, "Not spawning task on a stopped group");
            return;
        }
        let future = body(stop);
        let handle = tokio::spawn(future);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        debug!(owner = %self.owner, task, "Task spawned");
    }

    /// Number of tasks still running
    pub fn active_tasks(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || *self.shutdown.borrow()
    }

    /// Stop every task in this group
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if !handles.is_empty() {
            debug!(owner = %self.owner, tasks = handles.len(), "Cancelling task group");
        }
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Fires when the owning group is cancelled or the scheduler shuts down
#[derive(Debug, Clone)]
pub struct StopSignal {
    cancel: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.cancel.borrow() || *self.shutdown.borrow()
    }

    /// Resolves once the group is cancelled or the scheduler shuts down
    pub async fn stopped(&mut self) {
        loop {
            if self.is_stopped() {
                return;
            }
            tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
