//! Webhook delivery.
//!
//! Two tasks cooperate:
//! - `WebhookFanIn` is a durable `EventBus` subscriber. It enqueues one
//!   fan-out job per change event on the webhook queue and confirms the
//!   event only once the job is stored, so the publishing worker keeps its
//!   report until then.
//! - `WebhookDispatchWorker` consumes that queue. A fan-out job is resolved
//!   against the subscriber directory into one delivery job per endpoint, so
//!   a failing endpoint is retried alone. A delivery job POSTs the signed
//!   envelope to its endpoint.
//!
//! Both job kinds share the retry / dead-letter policy of the ingest queue.

use crate::config::WorkerConfig;
use crate::events::{DurableDelivery, DurableReceiver, EventBus};
use crate::processors::batch::{
    RequeueOutcome, RetryPolicy, ack_or_log, fill_batch, promote_due, requeue_or_keep,
};
use crate::queue::{Leased, QueueError, QueueMessage, SharedQueue};
use crate::subscribers::{SharedDirectory, WebhookEndpoint};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use skyfuse_sdk::objects::ChangeEventEnvelope;
use skyfuse_sdk::signature::{EVENT_ID_HEADER, SIGNATURE_HEADER, SignedObject};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A unit of work on the webhook queue.
///
/// Without a target this is a fan-out job; with one it is a delivery job
/// for that endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookJob {
    pub event: ChangeEventEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<Uuid>,
}

impl WebhookJob {
    pub fn fan_out(event: ChangeEventEnvelope) -> Self {
        Self {
            event,
            endpoint_id: None,
        }
    }

    pub fn for_endpoint(&self, endpoint_id: Uuid) -> Self {
        Self {
            event: self.event.clone(),
            endpoint_id: Some(endpoint_id),
        }
    }
}

pub type WebhookMessage = QueueMessage<WebhookJob>;
type LeasedJob = Leased<WebhookJob>;

/// Errors that fail one delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection failure or timeout.
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook delivery failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Sends one envelope to one endpoint.
#[async_trait]
pub trait WebhookDelivery: Send + Sync {
    async fn deliver(
        &self,
        endpoint: &WebhookEndpoint,
        event: &ChangeEventEnvelope,
    ) -> Result<(), DeliveryError>;
}

/// Signed JSON POST over reqwest. Any 2xx is success.
pub struct HttpWebhookDelivery {
    http: reqwest::Client,
}

impl HttpWebhookDelivery {
    /// `http` should carry the delivery timeout (see
    /// [`crate::connections::webhook_http_client`]).
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

/// Body and `Skyfuse-Signature` header value for one delivery.
pub fn sign_envelope(
    event: &ChangeEventEnvelope,
    secret: &[u8],
) -> Result<(String, String), serde_json::Error> {
    let signed = SignedObject::new(event.clone(), secret)?;
    let header = signed.to_header();
    Ok((signed.json, header))
}

#[async_trait]
impl WebhookDelivery for HttpWebhookDelivery {
    async fn deliver(
        &self,
        endpoint: &WebhookEndpoint,
        event: &ChangeEventEnvelope,
    ) -> Result<(), DeliveryError> {
        let (body, signature) = sign_envelope(event, &endpoint.secret)?;

        let response = self
            .http
            .post(&endpoint.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_ID_HEADER, event.event_id.to_string())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-in: bus -> webhook queue
// ---------------------------------------------------------------------------

/// Moves change events from the bus onto the durable webhook queue.
pub struct WebhookFanIn {
    events: DurableReceiver,
    queue: SharedQueue<WebhookJob>,
}

impl WebhookFanIn {
    /// Must be called before `bus` is handed to a publisher.
    pub fn new(bus: &mut EventBus, queue: SharedQueue<WebhookJob>) -> Self {
        Self {
            events: bus.subscribe_durable(),
            queue,
        }
    }

    /// Run until every publisher has dropped the bus.
    ///
    /// There is no shutdown flag: the publishers stop first, and anything
    /// they published before stopping is still taken from the channel.
    pub async fn run(mut self) {
        info!("WebhookFanIn started");

        while let Some(delivery) = self.events.recv().await {
            self.enqueue(delivery).await;
        }

        info!("Event bus closed, WebhookFanIn shutdown complete");
    }

    async fn enqueue(&self, delivery: DurableDelivery) {
        let envelope = delivery.event.to_envelope();
        let event_id = envelope.event_id;
        match self
            .queue
            .enqueue(QueueMessage::new(WebhookJob::fan_out(envelope)))
            .await
        {
            Ok(()) => delivery.confirm(),
            Err(e) => {
                error!(event_id = %event_id, error = %e, "Failed to enqueue webhook fan-out job");
                delivery.reject(e.to_string());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch worker
// ---------------------------------------------------------------------------

/// Counters for one iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub promoted: usize,
    pub received: usize,
    /// Delivery jobs created from fan-out jobs.
    pub fanned_out: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Failed and could not be requeued; left leased for redelivery.
    pub unsettled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    FannedOut(usize),
    Delivered,
    Dropped,
    Retried,
    DeadLettered,
    Unsettled,
}

impl JobOutcome {
    /// The job is finished and its lease can be released.
    fn is_done(self) -> bool {
        matches!(
            self,
            JobOutcome::FannedOut(_) | JobOutcome::Delivered | JobOutcome::Dropped
        )
    }
}

impl From<RequeueOutcome> for JobOutcome {
    fn from(outcome: RequeueOutcome) -> Self {
        match outcome {
            RequeueOutcome::Scheduled(_) => JobOutcome::Retried,
            RequeueOutcome::DeadLettered => JobOutcome::DeadLettered,
            RequeueOutcome::Unsettled => JobOutcome::Unsettled,
        }
    }
}

impl DispatchReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::FannedOut(n) => self.fanned_out += n,
            JobOutcome::Delivered => self.delivered += 1,
            JobOutcome::Dropped => self.dropped += 1,
            JobOutcome::Retried => self.retried += 1,
            JobOutcome::DeadLettered => self.dead_lettered += 1,
            JobOutcome::Unsettled => self.unsettled += 1,
        }
    }
}

pub struct WebhookDispatchWorker {
    queue: SharedQueue<WebhookJob>,
    directory: SharedDirectory,
    delivery: std::sync::Arc<dyn WebhookDelivery>,
    config: WorkerConfig,
    policy: RetryPolicy,
    shutdown_rx: watch::Receiver<bool>,
}

impl WebhookDispatchWorker {
    pub fn new(
        queue: SharedQueue<WebhookJob>,
        directory: SharedDirectory,
        delivery: std::sync::Arc<dyn WebhookDelivery>,
        config: WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let policy = RetryPolicy::from(&config);
        Self {
            queue,
            directory,
            delivery,
            config,
            policy,
            shutdown_rx,
        }
    }

    /// Run until the shutdown flag is set, finishing the in-flight batch.
    pub async fn run(self) {
        info!(queue = self.queue.name(), "WebhookDispatchWorker started");

        while !*self.shutdown_rx.borrow() {
            match self.run_once().await {
                Ok(report) if report.received > 0 || report.promoted > 0 => {
                    debug!(?report, "Webhook batch complete");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Failed to read webhook queue");
                    tokio::time::sleep(self.config.poll_timeout).await;
                }
            }
        }

        info!("WebhookDispatchWorker received shutdown signal");
        info!("WebhookDispatchWorker shutdown complete");
    }

    pub async fn run_once(&self) -> Result<DispatchReport, QueueError> {
        let mut report = DispatchReport {
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

    async fn handle(&self, msg: &LeasedJob) -> JobOutcome {
        let outcome = match msg.payload.endpoint_id {
            None => self.fan_out(msg).await,
            Some(endpoint_id) => self.deliver(msg, endpoint_id).await,
        };
        if outcome.is_done() {
            ack_or_log(self.queue.as_ref(), msg.receipt).await;
        }
        outcome
    }

    async fn fan_out(&self, msg: &LeasedJob) -> JobOutcome {
        let job = &msg.payload;
        let endpoints = match self.directory.active_endpoints(job.event.event_type).await {
            Ok(endpoints) => endpoints,
            Err(e) => return self.retry(msg, &e.to_string()).await,
        };

        if endpoints.is_empty() {
            debug!(event_id = %job.event.event_id, "No webhook subscribers for event");
            return JobOutcome::FannedOut(0);
        }

        let mut created = 0;
        for endpoint in &endpoints {
            if let Err(e) = self
                .queue
                .enqueue(QueueMessage::new(job.for_endpoint(endpoint.id)))
                .await
            {
                // Endpoints already enqueued may see the event twice.
                return self.retry(msg, &e.to_string()).await;
            }
            created += 1;
        }
        JobOutcome::FannedOut(created)
    }

    async fn deliver(&self, msg: &LeasedJob, endpoint_id: Uuid) -> JobOutcome {
        let event = &msg.payload.event;
        let endpoint = match self.directory.endpoint(endpoint_id).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                info!(
                    endpoint_id = %endpoint_id,
                    event_id = %event.event_id,
                    "Webhook endpoint no longer registered, dropping delivery"
                );
                return JobOutcome::Dropped;
            }
            Err(e) => return self.retry(msg, &e.to_string()).await,
        };

        match self.delivery.deliver(&endpoint, event).await {
            Ok(()) => {
                debug!(endpoint_id = %endpoint_id, event_id = %event.event_id, "Webhook delivered");
                JobOutcome::Delivered
            }
            Err(DeliveryError::Serialization(e)) => {
                error!(event_id = %event.event_id, error = %e, "Dropping unserializable webhook payload");
                JobOutcome::Dropped
            }
            Err(e) => {
                warn!(endpoint_id = %endpoint_id, retries = msg.retries, error = %e, "Webhook delivery failed");
                self.retry(msg, &e.to_string()).await
            }
        }
    }

    async fn retry(&self, msg: &LeasedJob, error: &str) -> JobOutcome {
        requeue_or_keep(self.queue.as_ref(), &self.policy, msg, error)
            .await
            .into()
    }
}
