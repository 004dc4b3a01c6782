//! Fire-and-forget delivery to the notification and audit collaborators.
//!
//! Events are queued on a bounded channel and handed to the sinks by one
//! background worker, in the order they were queued. A full queue drops
//! the event with a warning instead of waiting.

use std::sync::Arc;
use std::time::Duration;

use notify::{AuditEntry, AuditSink, Notification, NotificationSink};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Events that may wait for delivery before new ones are dropped.
pub const QUEUE_CAPACITY: usize = 1024;

enum Delivery {
    Notify(Notification),
    Audit(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// The two side channels every engine service reports to.
///
/// `notify` and `audit` return immediately. Each sink call made by the
/// worker is capped at `timeout`; errors and timeouts are logged and
/// dropped so the primary operation never sees them.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct Sinks {
    tx: mpsc::Sender<Delivery>,
}

impl Sinks {
    pub fn new(notifier: Arc<dyn NotificationSink>, audit: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(deliver(rx, notifier, audit, timeout));
        Self { tx }
    }

    pub fn notify(&self, notification: Notification) {
        self.enqueue(Delivery::Notify(notification));
    }

    pub fn audit(&self, entry: AuditEntry) {
        self.enqueue(Delivery::Audit(entry));
    }

    /// Wait until everything queued before this call has been handed to
    /// the sinks (or given up on).
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Delivery::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    fn enqueue(&self, delivery: Delivery) {
        match self.tx.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => warn!("sink queue full, event dropped"),
            Err(mpsc::error::TrySendError::Closed(_)) => warn!("sink worker stopped, event dropped"),
        }
    }
}

async fn deliver(
    mut rx: mpsc::Receiver<Delivery>,
    notifier: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditSink>,
    timeout: Duration,
) {
    let timeout_ms = timeout.as_millis() as u64;
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Notify(notification) => {
                let kind = notification.kind;
                let task_id = notification.task_id;
                match tokio::time::timeout(timeout, notifier.send(notification)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(%kind, %task_id, error = %err, "notification dropped"),
                    Err(_) => warn!(%kind, %task_id, timeout_ms, "notification timed out"),
                }
            }
            Delivery::Audit(entry) => {
                let action = entry.action.clone();
                match tokio::time::timeout(timeout, audit.record(entry)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(%action, error = %err, "audit entry dropped"),
                    Err(_) => warn!(%action, timeout_ms, "audit entry timed out"),
                }
            }
            Delivery::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("sink worker finished");
}
