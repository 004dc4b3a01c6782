//! `MemorySink`: an in-process sink for tests and local runs.
//!
//! Records the most recent notifications and audit entries it receives, or
//! fails every call when built with [`MemorySink::failing`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::{AuditEntry, AuditSink, Notification, NotificationSink, SinkError};

/// Behaviour injected into `MemorySink` at construction time.
#[derive(Debug, Clone)]
pub enum SinkBehaviour {
    /// Keep the event.
    Record,
    /// Reject the event with `SinkError::Unavailable`.
    Fail(String),
}

/// Events kept per buffer by [`MemorySink::new`].
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Implements both [`NotificationSink`] and [`AuditSink`].
///
/// Each buffer keeps at most `capacity` events; the oldest is evicted when
/// a new one arrives. Clones share the same buffers, so a test can hand one
/// clone to the engine and inspect another.
#[derive(Debug, Clone)]
pub struct MemorySink {
    behaviour: SinkBehaviour,
    capacity: usize,
    notifications: Arc<Mutex<VecDeque<Notification>>>,
    audit: Arc<Mutex<VecDeque<AuditEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A recording sink that keeps the last `capacity` events of each kind.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(SinkBehaviour::Record, capacity)
    }

    /// A sink whose every call errors.
    pub fn failing(msg: impl Into<String>) -> Self {
        Self::build(SinkBehaviour::Fail(msg.into()), 0)
    }

    fn build(behaviour: SinkBehaviour, capacity: usize) -> Self {
        Self {
            behaviour,
            capacity,
            notifications: Arc::new(Mutex::new(VecDeque::new())),
            audit: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Snapshot of the notifications still held, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.notifications).iter().cloned().collect()
    }

    /// Snapshot of the audit entries still held, oldest first.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        lock(&self.audit).iter().cloned().collect()
    }
}

fn push_bounded<T>(buffer: &Mutex<VecDeque<T>>, capacity: usize, item: T) {
    if capacity == 0 {
        return;
    }
    let mut buffer = lock(buffer);
    if buffer.len() == capacity {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn send(&self, notification: Notification) -> Result<(), SinkError> {
        match &self.behaviour {
            SinkBehaviour::Record => {
                debug!(kind = %notification.kind, task_id = %notification.task_id, "notification recorded");
                push_bounded(&self.notifications, self.capacity, notification);
                Ok(())
            }
            SinkBehaviour::Fail(msg) => Err(SinkError::Unavailable(msg.clone())),
        }
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn record(&self, entry: AuditEntry) -> Result<(), SinkError> {
        match &self.behaviour {
            SinkBehaviour::Record => {
                push_bounded(&self.audit, self.capacity, entry);
                Ok(())
            }
            SinkBehaviour::Fail(msg) => Err(SinkError::Unavailable(msg.clone())),
        }
    }
}
