//! Configuration module for skyfuse-server.
//!
//! Handles loading configuration from TOML files, CLI arguments,
//! and `SKYFUSE_*` environment variables.

pub mod file;

use crate::config::file::{FileConfig, StorageKind, WebhookFileConfig, WorkerFileConfig};
use skyfuse_core::config::{
    BroadcastConfig, LiveStoreConfig, PipelineConfig, StaticWebhookConfig, WorkerConfig,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: String, value: String },

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Loaded configuration with every default and override applied.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub storage: StorageKind,
    pub listen: SocketAddr,
    pub max_connections: u32,
    pub feeder_secret: Box<[u8]>,
    pub pipeline: PipelineConfig,
    pub webhooks: Vec<StaticWebhookConfig>,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file
    /// 2. Apply environment and CLI overrides
    /// 3. Validate the result
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        self.load_str(&config_content, |name| std::env::var(name).ok())
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }

    fn load_str(
        &self,
        content: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<LoadedConfig, ConfigError> {
        let mut file_config: FileConfig = toml::from_str(content)?;

        apply_env_overrides(&mut file_config, &env)?;
        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }

        let loaded = build_loaded_config(file_config);
        validate(&loaded)?;
        Ok(loaded)
    }
}

fn env_value<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match env(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_owned(),
                value,
            }),
    }
}

fn apply_worker_env(
    worker: &mut WorkerFileConfig,
    prefix: &str,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let var = |suffix: &str| format!("SKYFUSE_{prefix}_{suffix}");

    if let Some(v) = env_value(env, &var("BATCH_SIZE"))? {
        worker.batch_size = Some(v);
    }
    if let Some(v) = env_value(env, &var("POLL_INTERVAL_MS"))? {
        worker.poll_interval_ms = Some(v);
    }
    if let Some(v) = env_value(env, &var("MAX_ATTEMPTS"))? {
        worker.max_attempts = Some(v);
    }
    if let Some(v) = env_value(env, &var("BASE_BACKOFF_MS"))? {
        worker.base_backoff_ms = Some(v);
    }
    if let Some(v) = env_value(env, &var("JITTER_MS"))? {
        worker.jitter_ms = Some(v);
    }
    if let Some(v) = env_value(env, &var("PROMOTE_BATCH_SIZE"))? {
        worker.promote_batch_size = Some(v);
    }
    if let Some(v) = env_value(env, &var("VISIBILITY_TIMEOUT_SECS"))? {
        worker.visibility_timeout_secs = Some(v);
    }
    if let Some(v) = env(&var("DEAD_LETTER_QUEUE")) {
        worker.dead_letter_queue = Some(v);
    }
    Ok(())
}

fn apply_env_overrides(
    config: &mut FileConfig,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    apply_worker_env(&mut config.pipeline.ingest, "INGEST", env)?;
    apply_worker_env(&mut config.pipeline.webhook, "WEBHOOK", env)?;

    if let Some(v) = env_value(env, "SKYFUSE_LIVE_MAX_ENTRIES")? {
        config.pipeline.live.max_entries = Some(v);
    }
    if let Some(v) = env_value(env, "SKYFUSE_LIVE_TTL_SECS")? {
        config.pipeline.live.ttl_secs = Some(v);
    }
    if let Some(v) = env_value(env, "SKYFUSE_BROADCAST_INTERVAL_MS")? {
        config.pipeline.broadcast.interval_ms = Some(v);
    }
    Ok(())
}

fn merge_worker(defaults: WorkerConfig, file: WorkerFileConfig) -> WorkerConfig {
    WorkerConfig {
        queue_name: defaults.queue_name,
        dead_letter_queue: file.dead_letter_queue.unwrap_or(defaults.dead_letter_queue),
        batch_size: file.batch_size.unwrap_or(defaults.batch_size),
        poll_timeout: file
            .poll_interval_ms
            .map_or(defaults.poll_timeout, Duration::from_millis),
        short_poll_timeout: file
            .short_poll_ms
            .map_or(defaults.short_poll_timeout, Duration::from_millis),
        max_attempts: file.max_attempts.unwrap_or(defaults.max_attempts),
        base_backoff: file
            .base_backoff_ms
            .map_or(defaults.base_backoff, Duration::from_millis),
        jitter_max: file
            .jitter_ms
            .map_or(defaults.jitter_max, Duration::from_millis),
        promote_batch_size: file
            .promote_batch_size
            .unwrap_or(defaults.promote_batch_size),
        visibility_timeout: file
            .visibility_timeout_secs
            .map_or(defaults.visibility_timeout, Duration::from_secs),
    }
}

fn convert_webhook(w: WebhookFileConfig) -> StaticWebhookConfig {
    StaticWebhookConfig {
        id: w.id,
        url: w.url,
        secret: w.secret.into_bytes().into_boxed_slice(),
        event_types: w.event_types,
    }
}

fn build_loaded_config(file_config: FileConfig) -> LoadedConfig {
    let pipeline = file_config.pipeline;
    let live_defaults = LiveStoreConfig::default();
    let broadcast_defaults = BroadcastConfig::default();

    LoadedConfig {
        storage: file_config.storage,
        listen: file_config.server.listen,
        max_connections: file_config.database.max_connections,
        feeder_secret: file_config.feeder.secret.into_bytes().into_boxed_slice(),
        pipeline: PipelineConfig {
            ingest: merge_worker(WorkerConfig::ingest_defaults(), pipeline.ingest),
            webhook: merge_worker(WorkerConfig::webhook_defaults(), pipeline.webhook),
            live: LiveStoreConfig {
                max_entries: pipeline.live.max_entries.unwrap_or(live_defaults.max_entries),
                ttl: pipeline
                    .live
                    .ttl_secs
                    .map_or(live_defaults.ttl, Duration::from_secs),
                janitor_interval: pipeline
                    .live
                    .janitor_interval_secs
                    .map_or(live_defaults.janitor_interval, Duration::from_secs),
            },
            broadcast: BroadcastConfig {
                flush_interval: pipeline
                    .broadcast
                    .interval_ms
                    .map_or(broadcast_defaults.flush_interval, Duration::from_millis),
            },
        },
        webhooks: file_config
            .webhooks
            .into_iter()
            .map(convert_webhook)
            .collect(),
    }
}

fn validate_worker(name: &str, worker: &WorkerConfig) -> Result<(), ConfigError> {
    if worker.batch_size == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{name} batch_size must be positive"
        )));
    }
    if worker.promote_batch_size == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{name} promote_batch_size must be positive"
        )));
    }
    if worker.poll_timeout.is_zero() {
        return Err(ConfigError::ValidationError(format!(
            "{name} poll_interval_ms must be positive"
        )));
    }
    if worker.visibility_timeout <= worker.poll_timeout {
        return Err(ConfigError::ValidationError(format!(
            "{name} visibility_timeout_secs must exceed the poll interval"
        )));
    }
    if worker.dead_letter_queue.is_empty() || worker.dead_letter_queue == worker.queue_name {
        return Err(ConfigError::ValidationError(format!(
            "{name} dead_letter_queue must be a distinct, non-empty name"
        )));
    }
    Ok(())
}

fn validate(config: &LoadedConfig) -> Result<(), ConfigError> {
    if config.feeder_secret.is_empty() {
        return Err(ConfigError::ValidationError(
            "feeder secret must not be empty".to_owned(),
        ));
    }

    validate_worker("ingest", &config.pipeline.ingest)?;
    validate_worker("webhook", &config.pipeline.webhook)?;

    if config.pipeline.live.max_entries == 0 {
        return Err(ConfigError::ValidationError(
            "live max_entries must be positive".to_owned(),
        ));
    }
    if config.pipeline.live.ttl.is_zero() || config.pipeline.live.janitor_interval.is_zero() {
        return Err(ConfigError::ValidationError(
            "live ttl_secs and janitor_interval_secs must be positive".to_owned(),
        ));
    }

    let flush = config.pipeline.broadcast.flush_interval;
    if flush.is_zero() || flush >= Duration::from_secs(1) {
        return Err(ConfigError::ValidationError(format!(
            "broadcast interval_ms must be between 1 and 999, got {}",
            flush.as_millis()
        )));
    }

    let mut seen = HashSet::new();
    for webhook in &config.webhooks {
        if !seen.insert(webhook.id) {
            return Err(ConfigError::ValidationError(format!(
                "duplicate webhook id {}",
                webhook.id
            )));
        }
        if webhook.secret.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "webhook {} has an empty secret",
                webhook.id
            )));
        }
    }
    Ok(())
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
