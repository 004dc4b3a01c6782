//! `notify` crate: the collaborator side channels of the task engine.
//!
//! The engine reports to a [`NotificationSink`] (task started, human
//! checkpoint reached, reminders) and an [`AuditSink`] (who did what).
//! Both are fire-and-forget from the engine's point of view: a sink error
//! is logged and dropped, never propagated into the primary operation.

pub mod error;
pub mod events;
pub mod memory;
pub mod postgres;

pub use error::SinkError;
pub use events::{AuditEntry, AuditSink, Notification, NotificationKind, NotificationSink};
