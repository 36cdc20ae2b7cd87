//! IngestionWorker processor.
//!
//! Each iteration:
//! - promotes due retries from the delayed set
//! - fills a batch from the ingest queue
//! - for every message, concurrently: validates the report, merges it into
//!   the previous record, persists the result, refreshes the live cache and
//!   publishes a `ChangeEvent`
//!
//! A message is acked only after its event was taken by every durable bus
//! subscriber. Malformed reports are acked and dropped. Storage or publish
//! failures go through the retry policy and end in the dead-letter list once
//! retries are exhausted; if even the retry cannot be stored, the message
//! stays leased and comes back after its visibility timeout.

use crate::config::WorkerConfig;
use crate::entities::AircraftLiveRecord;
use crate::events::{ChangeEvent, EventBus};
use crate::live_store::LiveStateStore;
use crate::mapper::map_envelope;
use crate::merge::merge;
use crate::processors::batch::{
    RequeueOutcome, RetryPolicy, ack_or_log, fill_batch, promote_due, requeue_or_keep,
};
use crate::queue::{Leased, QueueMessage, SharedQueue};
use crate::repository::{RepositoryError, SharedRepository};
use futures_util::future::join_all;
use skyfuse_sdk::objects::ReportEnvelope;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub type IngestMessage = QueueMessage<ReportEnvelope>;
type LeasedReport = Leased<ReportEnvelope>;

/// Counters for one iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub promoted: usize,
    pub received: usize,
    pub persisted: usize,
    pub dropped: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Failed and could not be requeued; left leased for redelivery.
    pub unsettled: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Persisted => self.persisted += 1,
            MessageOutcome::Dropped => self.dropped += 1,
            MessageOutcome::Retried => self.retried += 1,
            MessageOutcome::DeadLettered => self.dead_lettered += 1,
            MessageOutcome::Unsettled => self.unsettled += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Persisted,
    Dropped,
    Retried,
    DeadLettered,
    Unsettled,
}

impl From<RequeueOutcome> for MessageOutcome {
    fn from(outcome: RequeueOutcome) -> Self {
        match outcome {
            RequeueOutcome::Scheduled(_) => MessageOutcome::Retried,
            RequeueOutcome::DeadLettered => MessageOutcome::DeadLettered,
            RequeueOutcome::Unsettled => MessageOutcome::Unsettled,
        }
    }
}

pub struct IngestionWorker {
    queue: SharedQueue<ReportEnvelope>,
    repository: SharedRepository,
    live: Arc<LiveStateStore>,
    bus: EventBus,
    config: WorkerConfig,
    policy: RetryPolicy,
    shutdown_rx: watch::Receiver<bool>,
}

impl IngestionWorker {
    pub fn new(
        queue: SharedQueue<ReportEnvelope>,
        repository: SharedRepository,
        live: Arc<LiveStateStore>,
        bus: EventBus,
        config: WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let policy = RetryPolicy::from(&config);
        Self {
            queue,
            repository,
            live,
            bus,
            config,
            policy,
            shutdown_rx,
        }
    }

    /// Run until the shutdown flag is set.
    ///
    /// The flag is checked between iterations only, so an in-flight batch
    /// always finishes before the worker returns. Returning drops the bus,
    /// which is what stops the event subscribers.
    pub async fn run(self) {
        info!(queue = self.queue.name(), "IngestionWorker started");

        while !*self.shutdown_rx.borrow() {
            match self.run_once().await {
                Ok(report) if report.received > 0 || report.promoted > 0 => {
                    debug!(?report, "Ingestion batch complete");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Failed to read ingest queue");
                    tokio::time::sleep(self.config.poll_timeout).await;
                }
            }
        }

        info!("IngestionWorker received shutdown signal");
        info!("IngestionWorker shutdown complete");
    }

    /// One promote / fill / process iteration.
    pub async fn run_once(&self) -> Result<BatchReport, crate::queue::QueueError> {
        let mut report = BatchReport {
            promoted: promote_due(self.queue.as_ref(), self.config.promote_batch_size).await,
            ..Default::default()
        };

        let batch = fill_batch(self.queue.as_ref(), &self.config).await?;
        report.received = batch.len();

        let outcomes = join_all(batch.iter().map(|msg| self.handle(msg))).await;
        for outcome in outcomes {
            report.record(outcome);
        }
        Ok(report)
    }

    async fn handle(&self, msg: &LeasedReport) -> MessageOutcome {
        let incoming = match map_envelope(&msg.payload) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(error = %e, retries = msg.retries, "Dropping malformed report");
                ack_or_log(self.queue.as_ref(), msg.receipt).await;
                return MessageOutcome::Dropped;
            }
        };

        let previous = match self.previous_record(&incoming.hex).await {
            Ok(previous) => previous,
            Err(e) => return self.retry(msg, &e).await,
        };

        let merged = merge(previous.as_ref(), &incoming);
        let changed_fields = merged
            .state
            .changed_since(previous.as_ref().map(|p| &p.state));

        if let Err(e) = self.repository.upsert(&merged).await {
            return self.retry(msg, &e).await;
        }

        self.live.upsert_state(merged.clone());
        if let Err(e) = self
            .bus
            .publish(ChangeEvent::position_updated(merged, changed_fields))
            .await
        {
            // The record is stored; the retry re-merges to the same state
            // and publishes again.
            return self.retry(msg, &e).await;
        }

        ack_or_log(self.queue.as_ref(), msg.receipt).await;
        debug!(entity_key = %incoming.hex, "Report merged");
        MessageOutcome::Persisted
    }

    /// The cached record, or the durable one once the cache entry expired.
    async fn previous_record(
        &self,
        hex: &str,
    ) -> Result<Option<AircraftLiveRecord>, RepositoryError> {
        if let Some(record) = self.live.get(hex) {
            return Ok(Some(record));
        }
        self.repository.get(hex).await
    }

    async fn retry(
        &self,
        msg: &LeasedReport,
        error: &(dyn std::fmt::Display + Sync),
    ) -> MessageOutcome {
        let error = error.to_string();
        requeue_or_keep(self.queue.as_ref(), &self.policy, msg, &error)
            .await
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::batch::tests::FlakyQueue;
    use crate::processors::webhook_dispatch::{WebhookFanIn, WebhookJob};
    use crate::queue::{MemoryQueue, WorkQueue};
    use crate::repository::{MemoryStateRepository, StateRepository};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct FailingRepository;

    #[async_trait]
    impl StateRepository for FailingRepository {
        async fn get(&self, _hex: &str) -> Result<Option<AircraftLiveRecord>, RepositoryError> {
            Ok(None)
        }

        async fn upsert(&self, _record: &AircraftLiveRecord) -> Result<(), RepositoryError> {
            Err(RepositoryError::Unavailable("connection refused".into()))
        }
    }

    /// Stores records after a fixed delay.
    struct SlowRepository {
        inner: MemoryStateRepository,
        delay: Duration,
    }

    #[async_trait]
    impl StateRepository for SlowRepository {
        async fn get(&self, hex: &str) -> Result<Option<AircraftLiveRecord>, RepositoryError> {
            self.inner.get(hex).await
        }

        async fn upsert(&self, record: &AircraftLiveRecord) -> Result<(), RepositoryError> {
            tokio::time::sleep(self.delay).await;
            self.inner.upsert(record).await
        }
    }

    fn test_config(batch_size: usize) -> WorkerConfig {
        WorkerConfig {
            batch_size,
            poll_timeout: Duration::from_millis(10),
            short_poll_timeout: Duration::ZERO,
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            jitter_max: Duration::ZERO,
            ..WorkerConfig::ingest_defaults()
        }
    }

    fn worker(
        queue: SharedQueue<ReportEnvelope>,
        repository: SharedRepository,
        bus: EventBus,
        batch_size: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> IngestionWorker {
        IngestionWorker::new(
            queue,
            repository,
            Arc::new(LiveStateStore::new(100, Duration::from_secs(60))),
            bus,
            test_config(batch_size),
            shutdown_rx,
        )
    }

    struct Harness {
        queue: Arc<MemoryQueue<ReportEnvelope>>,
        live: Arc<LiveStateStore>,
        bus: EventBus,
        worker: IngestionWorker,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn harness(repository: SharedRepository, batch_size: usize) -> Harness {
        let queue = Arc::new(MemoryQueue::<ReportEnvelope>::new("ingest"));
        let bus = EventBus::new(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = worker(queue.clone(), repository, bus.clone(), batch_size, shutdown_rx);
        Harness {
            queue,
            live: worker.live.clone(),
            bus,
            worker,
            _shutdown_tx: shutdown_tx,
        }
    }

    /// A webhook queue fed by a fan-in that subscribes to `bus`.
    fn webhook_fan_in(bus: &mut EventBus) -> (Arc<MemoryQueue<WebhookJob>>, tokio::task::JoinHandle<()>) {
        let webhook_queue = Arc::new(MemoryQueue::<WebhookJob>::new("webhook"));
        let fan_in = WebhookFanIn::new(bus, webhook_queue.clone());
        (webhook_queue, tokio::spawn(fan_in.run()))
    }

    fn report(hex: &str, priority: i32, ts: i64, lat: f64) -> IngestMessage {
        QueueMessage::new(
            serde_json::from_value(json!({
                "state": {"hex": hex, "lat": lat, "lon": 8.5},
                "source": "adsb",
                "sourcePriority": priority,
                "ingestionTimestamp": ts
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_batch_is_merged_persisted_cached_and_published() {
        let repository = Arc::new(MemoryStateRepository::new());
        let h = harness(repository.clone(), 10);
        let mut events = h.bus.subscribe();

        h.queue.enqueue(report("abc123", 40, 1000, 10.0)).await.unwrap();
        h.queue.enqueue(report("def456", 40, 1000, 20.0)).await.unwrap();

        let batch = h.worker.run_once().await.unwrap();
        assert_eq!(batch.received, 2);
        assert_eq!(batch.persisted, 2);
        assert_eq!(repository.len(), 2);
        assert_eq!(h.live.get("abc123").unwrap().state.lat, Some(10.0));

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        let mut keys = vec![first.entity_key.clone(), second.entity_key.clone()];
        keys.sort();
        assert_eq!(keys, ["abc123", "def456"]);
        assert_eq!(first.changed_fields.len(), 2);
    }

    #[tokio::test]
    async fn test_merge_uses_previous_record_and_reports_changes() {
        let repository = Arc::new(MemoryStateRepository::new());
        let h = harness(repository.clone(), 10);

        h.queue.enqueue(report("abc123", 40, 1000, 10.0)).await.unwrap();
        h.worker.run_once().await.unwrap();

        let mut events = h.bus.subscribe();
        h.queue.enqueue(report("abc123", 80, 900, 20.0)).await.unwrap();
        h.worker.run_once().await.unwrap();

        let stored = repository.get("abc123").await.unwrap().unwrap();
        assert_eq!(stored.state.lat, Some(20.0));
        assert_eq!(stored.provenance.source_priority, 80);

        let event = events.recv().await.unwrap();
        assert_eq!(event.changed_fields.len(), 1);
        assert_eq!(event.changed_fields["lat"], json!(20.0));
    }

    #[tokio::test]
    async fn test_single_iteration_respects_batch_size() {
        let h = harness(Arc::new(MemoryStateRepository::new()), 2);
        for n in 0..5 {
            h.queue
                .enqueue(report(&format!("aaaa{n:02}"), 40, 1000, 1.0))
                .await
                .unwrap();
        }

        let batch = h.worker.run_once().await.unwrap();
        assert_eq!(batch.received, 2);
        assert_eq!(h.queue.depths().await.unwrap().ready, 3);
    }

    #[tokio::test]
    async fn test_malformed_report_is_dropped_without_retry() {
        let h = harness(Arc::new(MemoryStateRepository::new()), 10);
        h.queue.enqueue(report("nothex", 40, 1000, 1.0)).await.unwrap();

        let batch = h.worker.run_once().await.unwrap();
        assert_eq!(batch.dropped, 1);
        let depths = h.queue.depths().await.unwrap();
        assert_eq!((depths.ready, depths.delayed, depths.dead), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_storage_failure_retries_then_dead_letters() {
        let h = harness(Arc::new(FailingRepository), 10);
        let mut events = h.bus.subscribe();
        h.queue.enqueue(report("abc123", 40, 1000, 1.0)).await.unwrap();

        let first = h.worker.run_once().await.unwrap();
        assert_eq!(first.retried, 1);
        assert_eq!(h.queue.depths().await.unwrap().delayed, 1);

        let second = h.worker.run_once().await.unwrap();
        assert_eq!(second.promoted, 1);
        assert_eq!(second.dead_lettered, 1);

        let depths = h.queue.depths().await.unwrap();
        assert_eq!((depths.ready, depths.delayed, depths.dead), (0, 0, 1));
        let dead = h.queue.dead_letters(1).await.unwrap();
        assert_eq!(dead[0].message.retries, 2);
        assert!(dead[0].error.contains("connection refused"));

        assert!(h.live.get("abc123").is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let queue = Arc::new(MemoryQueue::<ReportEnvelope>::new("ingest"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = IngestionWorker::new(
            queue,
            Arc::new(MemoryStateRepository::new()),
            Arc::new(LiveStateStore::new(10, Duration::from_secs(60))),
            EventBus::new(8),
            WorkerConfig {
                poll_timeout: Duration::from_millis(10),
                ..WorkerConfig::ingest_defaults()
            },
            shutdown_rx,
        );

        let handle = tokio::spawn(worker.run());
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_every_persisted_report_reaches_the_webhook_queue() {
        let repository = Arc::new(MemoryStateRepository::new());
        let queue = Arc::new(MemoryQueue::<ReportEnvelope>::new("ingest"));
        // Far smaller than one batch, so publishing has to wait on the fan-in.
        let mut bus = EventBus::new(2);
        let (webhook_queue, fan_in) = webhook_fan_in(&mut bus);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = worker(queue.clone(), repository.clone(), bus, 10, shutdown_rx);

        for n in 0..20 {
            queue
                .enqueue(report(&format!("aaaa{n:02}"), 40, 1000, 1.0))
                .await
                .unwrap();
        }
        let first = worker.run_once().await.unwrap();
        let second = worker.run_once().await.unwrap();
        assert_eq!(first.persisted + second.persisted, 20);

        drop(worker);
        fan_in.await.unwrap();

        assert_eq!(repository.len(), 20);
        assert_eq!(webhook_queue.depths().await.unwrap().ready, 20);
        assert_eq!(queue.depths().await.unwrap(), Default::default());
    }

    #[tokio::test]
    async fn test_shutdown_mid_batch_still_hands_off_events() {
        let repository = Arc::new(SlowRepository {
            inner: MemoryStateRepository::new(),
            delay: Duration::from_millis(300),
        });
        let queue = Arc::new(MemoryQueue::<ReportEnvelope>::new("ingest"));
        for n in 0..3 {
            queue
                .enqueue(report(&format!("bbbb{n:02}"), 40, 1000, 1.0))
                .await
                .unwrap();
        }
        let mut bus = EventBus::new(16);
        let (webhook_queue, fan_in) = webhook_fan_in(&mut bus);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ingestion = tokio::spawn(
            worker(queue.clone(), repository.clone(), bus, 10, shutdown_rx).run(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            ingestion.await.unwrap();
            fan_in.await.unwrap();
        })
        .await
        .unwrap();

        assert_eq!(repository.inner.len(), 3);
        assert_eq!(webhook_queue.depths().await.unwrap().ready, 3);
        assert_eq!(queue.depths().await.unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_rejected_publish_retries_report() {
        let repository = Arc::new(MemoryStateRepository::new());
        let queue = Arc::new(MemoryQueue::<ReportEnvelope>::new("ingest"));
        let mut bus = EventBus::new(4);
        let mut durable = bus.subscribe_durable();
        let rejecter = tokio::spawn(async move {
            while let Some(delivery) = durable.recv().await {
                delivery.reject("webhook queue unavailable");
            }
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = worker(queue.clone(), repository.clone(), bus, 10, shutdown_rx);

        queue.enqueue(report("abc123", 40, 1000, 1.0)).await.unwrap();
        let batch = worker.run_once().await.unwrap();
        assert_eq!((batch.persisted, batch.retried), (0, 1));

        // Stored, but the report stays queued until the event is handed off.
        assert_eq!(repository.len(), 1);
        let depths = queue.depths().await.unwrap();
        assert_eq!((depths.delayed, depths.in_flight), (1, 0));

        drop(worker);
        rejecter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_requeue_leaves_report_for_redelivery() {
        let queue = Arc::new(FlakyQueue::new(
            MemoryQueue::<ReportEnvelope>::new("ingest").with_visibility_timeout(Duration::from_secs(5)),
            2,
        ));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = worker(
            queue.clone(),
            Arc::new(FailingRepository),
            EventBus::new(4),
            10,
            shutdown_rx,
        );

        queue.enqueue(report("abc123", 40, 1000, 1.0)).await.unwrap();
        let batch = worker.run_once().await.unwrap();
        assert_eq!((batch.received, batch.unsettled), (1, 1));
        assert_eq!(queue.depths().await.unwrap().in_flight, 1);

        // Nothing is handed out while the lease holds.
        let idle = worker.run_once().await.unwrap();
        assert_eq!(idle.received, 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        let redelivered = worker.run_once().await.unwrap();
        assert_eq!((redelivered.received, redelivered.unsettled), (1, 1));

        // The queue recovered: the retry is stored and the lease released.
        tokio::time::advance(Duration::from_secs(6)).await;
        let recovered = worker.run_once().await.unwrap();
        assert_eq!(recovered.retried, 1);
        let depths = queue.depths().await.unwrap();
        assert_eq!((depths.in_flight, depths.delayed), (0, 1));
    }
}
