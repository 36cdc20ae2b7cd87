use super::{
    DEFAULT_VISIBILITY_TIMEOUT, DeadLetterEntry, Leased, QueueDepths, QueueError, QueueMessage,
    WorkQueue,
};
use crate::utils::clock::now_millis;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Process-local queue for `storage = "memory"` and tests.
pub struct MemoryQueue<T> {
    name: String,
    visibility_timeout: Duration,
    inner: Mutex<Inner<T>>,
    ready_notify: Notify,
}

struct Inner<T> {
    ready: VecDeque<QueueMessage<T>>,
    /// Leased messages by receipt, with the instant their lease runs out.
    in_flight: HashMap<i64, (Instant, QueueMessage<T>)>,
    /// Keyed by (due time, insertion sequence) so equal due times keep order.
    delayed: BTreeMap<(i64, u64), QueueMessage<T>>,
    dead: Vec<DeadLetterEntry<T>>,
    seq: u64,
    next_receipt: i64,
}

impl<T> Inner<T> {
    /// Put expired leases back at the head of the ready FIFO, oldest lease
    /// first. Returns the earliest expiry still pending.
    fn reclaim_expired(&mut self, now: Instant) -> Option<Instant> {
        let mut expired: Vec<i64> = self
            .in_flight
            .iter()
            .filter(|(_, (until, _))| *until <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        expired.sort_unstable();
        for receipt in expired.into_iter().rev() {
            if let Some((_, msg)) = self.in_flight.remove(&receipt) {
                self.ready.push_front(msg);
            }
        }
        self.in_flight.values().map(|(until, _)| *until).min()
    }
}

impl<T> MemoryQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
                delayed: BTreeMap::new(),
                dead: Vec::new(),
                seq: 0,
                next_receipt: 1,
            }),
            ready_notify: Notify::new(),
        }
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    fn promote_due_at(&self, now: i64, limit: usize) -> usize {
        let moved = {
            let mut inner = self.inner.lock();
            let due: Vec<(i64, u64)> = inner
                .delayed
                .range(..(now.saturating_add(1), 0))
                .take(limit)
                .map(|(key, _)| *key)
                .collect();
            for key in &due {
                if let Some(msg) = inner.delayed.remove(key) {
                    inner.ready.push_back(msg);
                }
            }
            due.len()
        };
        if moved > 0 {
            self.ready_notify.notify_waiters();
        }
        moved
    }
}

#[async_trait]
impl<T> WorkQueue<T> for MemoryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, msg: QueueMessage<T>) -> Result<(), QueueError> {
        self.inner.lock().ready.push_back(msg);
        self.ready_notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Leased<T>>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking, so an enqueue racing with
            // the check still wakes us.
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let next_expiry = {
                let mut inner = self.inner.lock();
                let next_expiry = inner.reclaim_expired(now);
                if let Some(message) = inner.ready.pop_front() {
                    let receipt = inner.next_receipt;
                    inner.next_receipt = inner.next_receipt.wrapping_add(1);
                    inner
                        .in_flight
                        .insert(receipt, (now + self.visibility_timeout, message.clone()));
                    return Ok(Some(Leased { receipt, message }));
                }
                next_expiry
            };

            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, receipt: i64) -> Result<(), QueueError> {
        self.inner.lock().in_flight.remove(&receipt);
        Ok(())
    }

    async fn schedule_delayed(
        &self,
        msg: QueueMessage<T>,
        available_at: i64,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq = inner.seq.wrapping_add(1);
        inner
            .delayed
            .insert((available_at, seq), msg.with_available_at(available_at));
        Ok(())
    }

    async fn promote_due(&self, limit: usize) -> Result<usize, QueueError> {
        Ok(self.promote_due_at(now_millis(), limit))
    }

    async fn dead_letter(&self, msg: QueueMessage<T>, error: &str) -> Result<(), QueueError> {
        self.inner.lock().dead.push(DeadLetterEntry {
            message: msg,
            error: error.to_owned(),
            failed_at: time::OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn depths(&self) -> Result<QueueDepths, QueueError> {
        let mut inner = self.inner.lock();
        inner.reclaim_expired(Instant::now());
        Ok(QueueDepths {
            ready: inner.ready.len() as u64,
            in_flight: inner.in_flight.len() as u64,
            delayed: inner.delayed.len() as u64,
            dead: inner.dead.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry<T>>, QueueError> {
        let inner = self.inner.lock();
        Ok(inner.dead.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> MemoryQueue<u32> {
        MemoryQueue::new("test")
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = queue();
        for n in 1..=3 {
            q.enqueue(QueueMessage::new(n)).await.unwrap();
        }
        for n in 1..=3 {
            let msg = q.dequeue(Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(msg.payload, n);
        }
        assert!(q.dequeue(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_lease_is_handed_out_again() {
        let q = queue().with_visibility_timeout(Duration::from_secs(5));
        q.enqueue(QueueMessage::new(1)).await.unwrap();
        q.enqueue(QueueMessage::new(2)).await.unwrap();

        let first = q.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.payload, 1);
        let depths = q.depths().await.unwrap();
        assert_eq!((depths.ready, depths.in_flight), (1, 1));

        tokio::time::advance(Duration::from_secs(6)).await;

        // The expired lease goes back ahead of the untouched message.
        let again = q.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.payload, 1);
        assert_ne!(again.receipt, first.receipt);

        // Acking the stale receipt does not release the new lease.
        q.ack(first.receipt).await.unwrap();
        assert_eq!(q.depths().await.unwrap().in_flight, 1);

        q.ack(again.receipt).await.unwrap();
        let depths = q.depths().await.unwrap();
        assert_eq!((depths.ready, depths.in_flight), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_dequeue_picks_up_expired_lease() {
        let q = queue().with_visibility_timeout(Duration::from_secs(2));
        q.enqueue(QueueMessage::new(7)).await.unwrap();
        let _lost = q.dequeue(Duration::ZERO).await.unwrap().unwrap();

        let msg = q.dequeue(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(msg.payload, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_empty() {
        let q = queue();
        let started = tokio::time::Instant::now();
        assert!(q.dequeue(Duration::from_secs(2)).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_wakes_on_enqueue() {
        let q = Arc::new(queue());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        q.enqueue(QueueMessage::new(9)).await.unwrap();

        let msg = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(msg.payload, 9);
    }

    #[tokio::test]
    async fn test_promotion_moves_due_entries_in_due_order() {
        let q = queue();
        q.schedule_delayed(QueueMessage::new(3), 300).await.unwrap();
        q.schedule_delayed(QueueMessage::new(1), 100).await.unwrap();
        q.schedule_delayed(QueueMessage::new(2), 200).await.unwrap();
        q.schedule_delayed(QueueMessage::new(4), 10_000).await.unwrap();

        assert_eq!(q.promote_due_at(500, 2), 2);
        assert_eq!(q.promote_due_at(500, 10), 1);
        assert_eq!(q.promote_due_at(500, 10), 0);

        let depths = q.depths().await.unwrap();
        assert_eq!((depths.ready, depths.delayed), (3, 1));

        for n in 1..=3 {
            let msg = q.dequeue(Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(msg.payload, n);
            assert!(msg.available_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_dead_letters_are_terminal() {
        let q = queue();
        q.dead_letter(QueueMessage::new(1), "first").await.unwrap();
        q.dead_letter(QueueMessage::new(2), "second").await.unwrap();

        let newest = q.dead_letters(1).await.unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].error, "second");

        assert_eq!(q.promote_due(100).await.unwrap(), 0);
        assert!(q.dequeue(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(q.depths().await.unwrap().dead, 2);
    }
}
