use super::{
    DEFAULT_VISIBILITY_TIMEOUT, DeadLetterEntry, Leased, QueueDepths, QueueError, QueueMessage,
    WorkQueue,
};
use crate::entities::queue_rows::{
    AckQueueMessage, DeadLetterLeasedMessage, EnqueueQueueMessage, GetQueueDepths,
    InsertDeadLetter, InsertDelayedMessage, LeaseQueueMessage, ListDeadLetters, PromoteDueMessages,
};
use crate::framework::DatabaseProcessor;
use crate::utils::clock::now_millis;
use async_trait::async_trait;
use kanau::processor::Processor;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// How often an empty queue is re-checked while a dequeue is waiting.
const POLL_STEP: Duration = Duration::from_millis(100);

/// Table keys of one queue and its dead-letter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub main: String,
    pub dead_letter: String,
}

/// A [`WorkQueue`] stored in the `queue_*` tables.
///
/// Safe to share between any number of workers and processes: leases use
/// `FOR UPDATE SKIP LOCKED` and promotion is one statement. A worker that
/// dies mid-batch leaves its leases to run out; the rows are then popped
/// again by whoever polls next.
pub struct PgQueue<T> {
    db: DatabaseProcessor,
    names: QueueNames,
    visibility_timeout: Duration,
    _payload: PhantomData<fn() -> T>,
}

impl<T> PgQueue<T> {
    pub fn new(db: DatabaseProcessor, names: QueueNames) -> Self {
        Self {
            db,
            names,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            _payload: PhantomData,
        }
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }
}

fn encode<T: Serialize>(msg: &QueueMessage<T>) -> Result<serde_json::Value, QueueError> {
    serde_json::to_value(msg).map_err(QueueError::Encode)
}

#[async_trait]
impl<T> WorkQueue<T> for PgQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.names.main
    }

    async fn enqueue(&self, msg: QueueMessage<T>) -> Result<(), QueueError> {
        self.db
            .process(EnqueueQueueMessage {
                queue: self.names.main.clone(),
                body: encode(&msg)?,
            })
            .await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Leased<T>>, QueueError> {
        let deadline = Instant::now() + timeout;
        let lease_ms = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        loop {
            let now = now_millis();
            let leased = self
                .db
                .process(LeaseQueueMessage {
                    queue: self.names.main.clone(),
                    now,
                    leased_until: now.saturating_add(lease_ms),
                })
                .await?;
            if let Some(row) = leased {
                return match serde_json::from_value(row.body) {
                    Ok(message) => Ok(Some(Leased {
                        receipt: row.id,
                        message,
                    })),
                    Err(e) => {
                        // Park the raw body where it can be inspected
                        // instead of leasing it again forever.
                        self.db
                            .process(DeadLetterLeasedMessage {
                                id: row.id,
                                dead_letter_queue: self.names.dead_letter.clone(),
                                error: format!("undecodable message: {e}"),
                            })
                            .await?;
                        Err(QueueError::Decode(e))
                    }
                };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(POLL_STEP)).await;
        }
    }

    async fn ack(&self, receipt: i64) -> Result<(), QueueError> {
        self.db.process(AckQueueMessage { id: receipt }).await?;
        Ok(())
    }

    async fn schedule_delayed(
        &self,
        msg: QueueMessage<T>,
        available_at: i64,
    ) -> Result<(), QueueError> {
        let msg = msg.with_available_at(available_at);
        self.db
            .process(InsertDelayedMessage {
                queue: self.names.main.clone(),
                body: encode(&msg)?,
                available_at,
            })
            .await?;
        Ok(())
    }

    async fn promote_due(&self, limit: usize) -> Result<usize, QueueError> {
        let moved = self
            .db
            .process(PromoteDueMessages {
                queue: self.names.main.clone(),
                now: now_millis(),
                limit: i64::try_from(limit).unwrap_or(i64::MAX),
            })
            .await?;
        Ok(moved as usize)
    }

    async fn dead_letter(&self, msg: QueueMessage<T>, error: &str) -> Result<(), QueueError> {
        let retries = i32::try_from(msg.retries).unwrap_or(i32::MAX);
        self.db
            .process(InsertDeadLetter {
                queue: self.names.dead_letter.clone(),
                body: encode(&msg)?,
                error: error.to_owned(),
                retries,
            })
            .await?;
        Ok(())
    }

    async fn depths(&self) -> Result<QueueDepths, QueueError> {
        let row = self
            .db
            .process(GetQueueDepths {
                queue: self.names.main.clone(),
                dead_letter_queue: self.names.dead_letter.clone(),
                now: now_millis(),
            })
            .await?;
        Ok(QueueDepths {
            ready: row.ready.max(0) as u64,
            in_flight: row.in_flight.max(0) as u64,
            delayed: row.delayed.max(0) as u64,
            dead: row.dead.max(0) as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry<T>>, QueueError> {
        let rows = self
            .db
            .process(ListDeadLetters {
                queue: self.names.dead_letter.clone(),
                limit: i64::try_from(limit).unwrap_or(i64::MAX),
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value(row.body) {
                Ok(message) => entries.push(DeadLetterEntry {
                    message,
                    error: row.error,
                    failed_at: row.failed_at,
                }),
                Err(e) => warn!(id = row.id, error = %e, "Skipping undecodable dead letter"),
            }
        }
        Ok(entries)
    }
}
