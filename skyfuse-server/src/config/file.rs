//! TOML file configuration structures.
//!
//! These structs directly map to the `skyfuse.toml` file format. Every
//! section except `[feeder]` is optional.

use serde::{Deserialize, Serialize};
use skyfuse_sdk::objects::EventType;
use std::net::{Ipv4Addr, SocketAddr};
use url::Url;
use uuid::Uuid;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub feeder: FeederConfig,
    #[serde(default)]
    pub pipeline: PipelineFileConfig,
    #[serde(default)]
    pub webhooks: Vec<WebhookFileConfig>,
}

/// Where queues and merged records live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Postgres,
    /// Everything in process memory; state is lost on restart.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

/// Feeder authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeederConfig {
    /// HMAC key feeders sign `POST /api/v1/reports` bodies with.
    pub secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineFileConfig {
    #[serde(default)]
    pub ingest: WorkerFileConfig,
    #[serde(default)]
    pub webhook: WorkerFileConfig,
    #[serde(default)]
    pub live: LiveFileConfig,
    #[serde(default)]
    pub broadcast: BroadcastFileConfig,
}

/// One worker section. Missing keys fall back to the worker's defaults,
/// applied in [`super::ConfigLoader`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFileConfig {
    pub batch_size: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub short_poll_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub promote_batch_size: Option<usize>,
    pub dead_letter_queue: Option<String>,
    /// How long a popped message stays leased.
    pub visibility_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveFileConfig {
    pub max_entries: Option<usize>,
    pub ttl_secs: Option<u64>,
    pub janitor_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFileConfig {
    pub interval_ms: Option<u64>,
}

/// A `[[webhooks]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookFileConfig {
    pub id: Uuid,
    pub url: Url,
    pub secret: String,
    #[serde(default = "default_event_types")]
    pub event_types: Vec<EventType>,
}

fn default_event_types() -> Vec<EventType> {
    vec![EventType::PositionUpdated]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parsing() {
        let config: FileConfig = toml::from_str(
            r#"
[feeder]
secret = "feeder-secret"
"#,
        )
        .unwrap();
        assert_eq!(config.storage, StorageKind::Postgres);
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.pipeline.ingest, WorkerFileConfig::default());
        assert!(config.webhooks.is_empty());
    }

    #[test]
    fn test_full_config_parsing() {
        let toml_str = r#"
storage = "memory"

[server]
listen = "127.0.0.1:3000"

[feeder]
secret = "feeder-secret"

[pipeline.ingest]
batch_size = 50
dead_letter_queue = "ingest:failed"

[pipeline.live]
ttl_secs = 120

[pipeline.broadcast]
interval_ms = 500

[[webhooks]]
id = "0191d5b4-7c1e-7c3a-9a55-0d2f6c1e8b10"
url = "https://hooks.example.com/skyfuse"
secret = "hook-secret"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.pipeline.ingest.batch_size, Some(50));
        assert_eq!(
            config.pipeline.ingest.dead_letter_queue.as_deref(),
            Some("ingest:failed")
        );
        assert_eq!(config.pipeline.webhook.batch_size, None);
        assert_eq!(config.pipeline.live.ttl_secs, Some(120));
        assert_eq!(config.pipeline.broadcast.interval_ms, Some(500));
        assert_eq!(config.webhooks.len(), 1);
        assert_eq!(config.webhooks[0].event_types, vec![EventType::PositionUpdated]);
    }

    #[test]
    fn test_missing_feeder_section_is_rejected() {
        assert!(toml::from_str::<FileConfig>("storage = \"memory\"").is_err());
    }
}
