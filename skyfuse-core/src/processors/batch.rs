//! Pieces shared by the queue-backed workers: batch filling and the
//! retry / dead-letter policy.

use crate::config::WorkerConfig;
use crate::queue::{Leased, QueueError, WorkQueue};
use crate::utils::clock::now_millis;
use rand::Rng;
use std::time::Duration;
use tracing::{error, warn};

/// Exponent cap for the backoff doubling, far above any sane attempt cap.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Exponential backoff with uniform jitter, capped at `max_attempts` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub jitter_max: Duration,
}

impl From<&WorkerConfig> for RetryPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff: config.base_backoff,
            jitter_max: config.jitter_max,
        }
    }
}

impl RetryPolicy {
    /// `base_backoff * 2^(retries - 1)`, without jitter.
    pub fn base_delay(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_backoff.saturating_mul(1u32 << exponent)
    }

    /// The delay before retry number `retries`, jitter included.
    pub fn delay_for(&self, retries: u32) -> Duration {
        let jitter_ms = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.base_delay(retries) + jitter
    }

    pub fn is_exhausted(&self, retries: u32) -> bool {
        retries > self.max_attempts
    }
}

/// What happened to a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Parked in the delayed set until this epoch-millisecond time.
    Scheduled(i64),
    DeadLettered,
    /// The queue refused the retry. The message is still leased and is
    /// handed out again once its visibility timeout passes.
    Unsettled,
}

/// Retry `leased` later, or dead-letter it once retries are exhausted.
///
/// The stored message is a new value with the retry count bumped. The lease
/// is acked only after that value is stored, so a failure here leaves the
/// original in the queue.
pub async fn requeue<T>(
    queue: &dyn WorkQueue<T>,
    policy: &RetryPolicy,
    leased: &Leased<T>,
    error: &str,
) -> Result<RequeueOutcome, QueueError>
where
    T: Clone + Send + Sync,
{
    let next = leased.retried();
    let retries = next.retries;

    let outcome = if policy.is_exhausted(retries) {
        queue.dead_letter(next, error).await?;
        warn!(queue = queue.name(), retries, error, "Retries exhausted, message dead-lettered");
        RequeueOutcome::DeadLettered
    } else {
        let delay = policy.delay_for(retries);
        let available_at = now_millis().saturating_add(delay.as_millis() as i64);
        queue.schedule_delayed(next, available_at).await?;
        warn!(
            queue = queue.name(),
            retries,
            delay_ms = delay.as_millis() as u64,
            error,
            "Message scheduled for retry"
        );
        RequeueOutcome::Scheduled(available_at)
    };

    ack_or_log(queue, leased.receipt).await;
    Ok(outcome)
}

/// Like [`requeue`], but a failure to reach the queue leaves the message
/// leased instead of failing.
pub async fn requeue_or_keep<T>(
    queue: &dyn WorkQueue<T>,
    policy: &RetryPolicy,
    leased: &Leased<T>,
    error: &str,
) -> RequeueOutcome
where
    T: Clone + Send + Sync,
{
    match requeue(queue, policy, leased, error).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                queue = queue.name(),
                receipt = leased.receipt,
                error = %e,
                original_error = error,
                "Failed to requeue message, leaving it leased for redelivery"
            );
            RequeueOutcome::Unsettled
        }
    }
}

/// Ack a finished message. A failed ack only means the message is handed
/// out again later, which the idempotent handlers absorb.
pub async fn ack_or_log<T>(queue: &dyn WorkQueue<T>, receipt: i64) {
    if let Err(e) = queue.ack(receipt).await {
        warn!(queue = queue.name(), receipt, error = %e, "Failed to ack message, it will be redelivered");
    }
}

/// Promote due retries, logging instead of failing.
pub async fn promote_due<T>(queue: &dyn WorkQueue<T>, limit: usize) -> usize {
    match queue.promote_due(limit).await {
        Ok(moved) => moved,
        Err(e) => {
            error!(queue = queue.name(), error = %e, "Failed to promote delayed messages");
            0
        }
    }
}

/// Lease up to `batch_size` messages.
///
/// The first pop waits the full poll timeout; later pops use the short
/// timeout so a partial batch is processed promptly. Undecodable messages
/// were already moved to the dead-letter list by the queue and are skipped.
pub async fn fill_batch<T>(
    queue: &dyn WorkQueue<T>,
    config: &WorkerConfig,
) -> Result<Vec<Leased<T>>, QueueError> {
    let mut batch = Vec::with_capacity(config.batch_size);
    while batch.len() < config.batch_size {
        let timeout = if batch.is_empty() {
            config.poll_timeout
        } else {
            config.short_poll_timeout
        };

        match queue.dequeue(timeout).await {
            Ok(Some(msg)) => batch.push(msg),
            Ok(None) => break,
            Err(QueueError::Decode(e)) => {
                warn!(queue = queue.name(), error = %e, "Malformed queue message dead-lettered");
            }
            Err(e) if batch.is_empty() => return Err(e),
            Err(e) => {
                error!(queue = queue.name(), error = %e, "Dequeue failed, processing partial batch");
                break;
            }
        }
    }
    Ok(batch)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::queue::{DeadLetterEntry, MemoryQueue, QueueDepths, QueueMessage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(100),
            jitter_max: Duration::from_millis(50),
        }
    }

    fn config(batch_size: usize) -> WorkerConfig {
        WorkerConfig {
            batch_size,
            poll_timeout: Duration::from_millis(20),
            short_poll_timeout: Duration::ZERO,
            ..WorkerConfig::ingest_defaults()
        }
    }

    #[test]
    fn test_backoff_strictly_increases_until_cap() {
        let policy = policy(8);
        let delays: Vec<_> = (1..=policy.max_attempts).map(|n| policy.base_delay(n)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = policy(3);
        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts_plus_one_failures() {
        let queue = MemoryQueue::new("ingest");
        let policy = RetryPolicy {
            base_backoff: Duration::ZERO,
            jitter_max: Duration::ZERO,
            ..policy(3)
        };

        queue.enqueue(QueueMessage::new(7u32)).await.unwrap();
        let mut msg = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        for attempt in 1..=policy.max_attempts {
            let outcome = requeue(&queue, &policy, &msg, "storage down").await.unwrap();
            assert!(matches!(outcome, RequeueOutcome::Scheduled(_)), "attempt {attempt}");
            assert_eq!(queue.promote_due(10).await.unwrap(), 1);
            msg = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(msg.retries, attempt);
        }

        let outcome = requeue(&queue, &policy, &msg, "storage down").await.unwrap();
        assert_eq!(outcome, RequeueOutcome::DeadLettered);
        assert_eq!(queue.depths().await.unwrap().in_flight, 0);

        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.retries, policy.max_attempts + 1);
        assert_eq!(queue.promote_due(10).await.unwrap(), 0);
        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fill_batch_respects_batch_size() {
        let queue = MemoryQueue::new("ingest");
        for n in 0..5u32 {
            queue.enqueue(QueueMessage::new(n)).await.unwrap();
        }

        let batch = fill_batch(&queue, &config(3)).await.unwrap();
        assert_eq!(batch.len(), 3);
        let rest = fill_batch(&queue, &config(3)).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(fill_batch(&queue, &config(3)).await.unwrap().is_empty());
    }

    /// A memory queue whose retry writes fail a set number of times.
    pub(crate) struct FlakyQueue<T> {
        pub inner: MemoryQueue<T>,
        pub failures_left: AtomicUsize,
    }

    impl<T> FlakyQueue<T> {
        pub fn new(inner: MemoryQueue<T>, failures: usize) -> Self {
            Self {
                inner,
                failures_left: AtomicUsize::new(failures),
            }
        }

        fn fail_once(&self) -> Result<(), QueueError> {
            let left = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            match left {
                Ok(_) => Err(QueueError::Database(sqlx::Error::PoolTimedOut)),
                Err(_) => Ok(()),
            }
        }
    }

    #[async_trait]
    impl<T> WorkQueue<T> for FlakyQueue<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn enqueue(&self, msg: QueueMessage<T>) -> Result<(), QueueError> {
            self.inner.enqueue(msg).await
        }

        async fn dequeue(&self, timeout: Duration) -> Result<Option<Leased<T>>, QueueError> {
            self.inner.dequeue(timeout).await
        }

        async fn ack(&self, receipt: i64) -> Result<(), QueueError> {
            self.inner.ack(receipt).await
        }

        async fn schedule_delayed(
            &self,
            msg: QueueMessage<T>,
            available_at: i64,
        ) -> Result<(), QueueError> {
            self.fail_once()?;
            self.inner.schedule_delayed(msg, available_at).await
        }

        async fn promote_due(&self, limit: usize) -> Result<usize, QueueError> {
            self.inner.promote_due(limit).await
        }

        async fn dead_letter(&self, msg: QueueMessage<T>, error: &str) -> Result<(), QueueError> {
            self.fail_once()?;
            self.inner.dead_letter(msg, error).await
        }

        async fn depths(&self) -> Result<QueueDepths, QueueError> {
            self.inner.depths().await
        }

        async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry<T>>, QueueError> {
            self.inner.dead_letters(limit).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_requeue_keeps_message_leased() {
        let queue = FlakyQueue::new(
            MemoryQueue::new("ingest").with_visibility_timeout(Duration::from_secs(5)),
            1,
        );
        let policy = RetryPolicy {
            base_backoff: Duration::ZERO,
            jitter_max: Duration::ZERO,
            ..policy(3)
        };
        queue.enqueue(QueueMessage::new(7u32)).await.unwrap();
        let leased = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        let outcome = requeue_or_keep(&queue, &policy, &leased, "storage down").await;
        assert_eq!(outcome, RequeueOutcome::Unsettled);
        assert_eq!(
            queue.depths().await.unwrap(),
            QueueDepths {
                in_flight: 1,
                ..Default::default()
            }
        );

        // Once the lease runs out the same message comes back, and the
        // second requeue goes through.
        tokio::time::advance(Duration::from_secs(6)).await;
        let again = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!((again.payload, again.retries), (7, 0));

        let outcome = requeue_or_keep(&queue, &policy, &again, "storage down").await;
        assert!(matches!(outcome, RequeueOutcome::Scheduled(_)));
        let depths = queue.depths().await.unwrap();
        assert_eq!((depths.in_flight, depths.delayed), (0, 1));
    }
}
