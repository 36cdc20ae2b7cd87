//! Validated runtime configuration shared by the workers.
//!
//! Loading, defaults and environment overrides live in the server crate;
//! these types only carry the result.

mod config_store;
mod webhook;

pub use config_store::ConfigStore;
pub use webhook::StaticWebhookConfig;

use std::time::Duration;

/// Knobs of one queue-backed worker (ingestion or webhook dispatch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Name of the main queue; the delayed set shares it.
    pub queue_name: String,
    pub dead_letter_queue: String,
    /// Upper bound on messages processed per iteration.
    pub batch_size: usize,
    /// Wait for the first message of a batch.
    pub poll_timeout: Duration,
    /// Wait for each further message of a partially filled batch.
    pub short_poll_timeout: Duration,
    /// Retries allowed before a message is dead-lettered.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    /// Upper bound of the uniform jitter added to every backoff.
    pub jitter_max: Duration,
    /// Delayed entries promoted per iteration.
    pub promote_batch_size: usize,
    /// How long a popped message stays leased before another pop may take
    /// it. Must outlast the processing of one batch.
    pub visibility_timeout: Duration,
}

impl WorkerConfig {
    pub fn ingest_defaults() -> Self {
        Self {
            queue_name: "ingest".to_owned(),
            dead_letter_queue: "ingest:dead".to_owned(),
            batch_size: 100,
            poll_timeout: Duration::from_secs(1),
            short_poll_timeout: Duration::from_millis(10),
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            jitter_max: Duration::from_millis(250),
            promote_batch_size: 100,
            visibility_timeout: Duration::from_secs(30),
        }
    }

    pub fn webhook_defaults() -> Self {
        Self {
            queue_name: "webhook".to_owned(),
            dead_letter_queue: "webhook:dead".to_owned(),
            batch_size: 20,
            poll_timeout: Duration::from_secs(1),
            short_poll_timeout: Duration::from_millis(10),
            max_attempts: 8,
            base_backoff: Duration::from_secs(1),
            jitter_max: Duration::from_millis(500),
            promote_batch_size: 50,
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveStoreConfig {
    pub max_entries: usize,
    /// Idle time after the last write before an entry expires.
    pub ttl: Duration,
    pub janitor_interval: Duration,
}

impl Default for LiveStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 50_000,
            ttl: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Buffer window; must stay below one second.
    pub flush_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(250),
        }
    }
}

/// Everything the workers need, grouped by component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub ingest: WorkerConfig,
    pub webhook: WorkerConfig,
    pub live: LiveStoreConfig,
    pub broadcast: BroadcastConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest: WorkerConfig::ingest_defaults(),
            webhook: WorkerConfig::webhook_defaults(),
            live: LiveStoreConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}
