//! Sink-level error type.

use thiserror::Error;

/// Errors returned by a sink's `send` / `record` method.
///
/// The engine never retries; it logs the error and carries on.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink could not reach its backing store or channel.
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// Persisting the event to the outbox table failed.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}
