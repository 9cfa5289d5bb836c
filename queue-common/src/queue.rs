use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;

/// Enumeration of errors for operations against a durable queue.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("message {id} not found in queue {queue}")]
    MessageNotFound { queue: String, id: i64 },
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// The consumed interface of an at-least-once durable queue.
///
/// A `read` hides the returned messages from other readers for the given
/// visibility timeout; a message that is neither archived nor rescheduled
/// within that window becomes visible again on its own. Implementations must
/// increment each message's read count on every delivery.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Read up to `quantity` visible messages, hiding them for `visibility_timeout`.
    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        quantity: usize,
    ) -> QueueResult<Vec<Message>>;

    /// Permanently remove a message from delivery.
    async fn archive(&self, queue: &str, message_id: i64) -> QueueResult<()>;

    /// Make a message visible again after `delay`.
    async fn set_visibility_timeout(
        &self,
        queue: &str,
        message_id: i64,
        delay: Duration,
    ) -> QueueResult<()>;

    /// Enqueue a new message, visible after `delay`. Returns the new message id.
    async fn send(&self, queue: &str, body: serde_json::Value, delay: Duration)
        -> QueueResult<i64>;
}
