//! Durable work queues.
//!
//! Each named queue is three linked structures: a FIFO of ready messages, a
//! delayed set ordered by due time, and a dead-letter list. Messages are
//! immutable values; a retry produces a new message with a bumped count.
//!
//! A pop leases the head message instead of removing it. The message stays
//! invisible to other consumers until it is acked or its visibility timeout
//! passes, after which it is handed out again. A consumer acks only once the
//! message is handled or durably parked elsewhere, so a crash or a failed
//! requeue never drops it.
//!
//! Two backends implement [`WorkQueue`]: [`PgQueue`] on PostgreSQL and
//! [`MemoryQueue`] for development and tests.

pub mod memory;
pub mod postgres;

pub use memory::MemoryQueue;
pub use postgres::{PgQueue, QueueNames};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long a popped message stays hidden before it is handed out again.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// A payload plus pipeline bookkeeping.
///
/// Serialized flat: `{ ...payload, retries?, availableAt? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage<T> {
    #[serde(flatten)]
    pub payload: T,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    /// Epoch milliseconds; set once the message has been scheduled for retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_at: Option<i64>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl<T> QueueMessage<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            retries: 0,
            available_at: None,
        }
    }

    /// The next attempt of this message.
    pub fn retried(&self) -> Self
    where
        T: Clone,
    {
        Self {
            payload: self.payload.clone(),
            retries: self.retries.saturating_add(1),
            available_at: self.available_at,
        }
    }

    pub fn with_available_at(self, available_at: i64) -> Self {
        Self {
            available_at: Some(available_at),
            ..self
        }
    }
}

/// A popped message together with the receipt that acks it.
#[derive(Debug, Clone, PartialEq)]
pub struct Leased<T> {
    pub receipt: i64,
    pub message: QueueMessage<T>,
}

impl<T> Deref for Leased<T> {
    type Target = QueueMessage<T>;

    fn deref(&self) -> &QueueMessage<T> {
        &self.message
    }
}

/// A message that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry<T> {
    pub message: QueueMessage<T>,
    pub error: String,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: time::OffsetDateTime,
}

/// Sizes of the structures behind one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepths {
    pub ready: u64,
    /// Leased and not yet acked.
    pub in_flight: u64,
    pub delayed: u64,
    pub dead: u64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to decode queued message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

#[async_trait]
pub trait WorkQueue<T>: Send + Sync {
    /// Queue name, for logs and metrics.
    fn name(&self) -> &str;

    /// Append to the tail of the ready FIFO.
    async fn enqueue(&self, msg: QueueMessage<T>) -> Result<(), QueueError>;

    /// Lease the head of the ready FIFO, waiting up to `timeout` for one.
    ///
    /// Messages whose lease expired count as ready again and come first.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Leased<T>>, QueueError>;

    /// Remove a leased message for good. An unknown receipt is a no-op.
    async fn ack(&self, receipt: i64) -> Result<(), QueueError>;

    /// Park a message until `available_at` (epoch milliseconds).
    async fn schedule_delayed(
        &self,
        msg: QueueMessage<T>,
        available_at: i64,
    ) -> Result<(), QueueError>;

    /// Move up to `limit` due delayed messages onto the ready FIFO, oldest
    /// due time first. Each message is moved, never copied.
    async fn promote_due(&self, limit: usize) -> Result<usize, QueueError>;

    /// Record a terminal failure.
    async fn dead_letter(&self, msg: QueueMessage<T>, error: &str) -> Result<(), QueueError>;

    async fn depths(&self) -> Result<QueueDepths, QueueError>;

    /// Newest dead letters first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry<T>>, QueueError>;
}

pub type SharedQueue<T> = Arc<dyn WorkQueue<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u32,
    }

    #[test]
    fn test_retried_is_a_new_value() {
        let original = QueueMessage::new(Job { id: 1 });
        let next = original.retried();
        assert_eq!(original.retries, 0);
        assert_eq!(next.retries, 1);
        assert_eq!(next.payload, original.payload);
    }

    #[test]
    fn test_leased_reads_through_to_message() {
        let leased = Leased {
            receipt: 4,
            message: QueueMessage::new(Job { id: 9 }).retried(),
        };
        assert_eq!(leased.payload.id, 9);
        assert_eq!(leased.retries, 1);
    }

    #[test]
    fn test_wire_format_is_flat() {
        let msg = QueueMessage::new(Job { id: 7 }).retried().with_available_at(1_000);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"id": 7, "retries": 1, "availableAt": 1000})
        );

        let fresh: QueueMessage<Job> = serde_json::from_value(json!({"id": 3})).unwrap();
        assert_eq!(fresh, QueueMessage::new(Job { id: 3 }));
    }
}
