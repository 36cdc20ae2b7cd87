//! Lookup of registered webhook endpoints.
//!
//! Registration belongs to the account side of the product; the dispatcher
//! only asks "who wants event X" and "is endpoint Y still active".

use crate::config::{ConfigStore, StaticWebhookConfig};
use crate::entities::WebhookSubscription;
use crate::entities::webhook_subscription::{GetActiveSubscriptionById, GetActiveSubscriptions};
use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use kanau::processor::Processor;
use skyfuse_sdk::objects::EventType;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// One active delivery target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub url: String,
    pub secret: Box<[u8]>,
}

impl From<WebhookSubscription> for WebhookEndpoint {
    fn from(sub: WebhookSubscription) -> Self {
        Self {
            id: sub.id,
            url: sub.url,
            secret: sub.secret.into_bytes().into_boxed_slice(),
        }
    }
}

impl From<&StaticWebhookConfig> for WebhookEndpoint {
    fn from(config: &StaticWebhookConfig) -> Self {
        Self {
            id: config.id,
            url: config.url.to_string(),
            secret: config.secret.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    /// Every active endpoint registered for `event_type`.
    async fn active_endpoints(
        &self,
        event_type: EventType,
    ) -> Result<Vec<WebhookEndpoint>, DirectoryError>;

    /// The endpoint with this id, if it is still active.
    async fn endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>, DirectoryError>;
}

pub type SharedDirectory = Arc<dyn SubscriberDirectory>;

/// Endpoints from the `webhook_subscriptions` table.
pub struct PgSubscriberDirectory {
    db: DatabaseProcessor,
}

impl PgSubscriberDirectory {
    pub fn new(db: DatabaseProcessor) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubscriberDirectory for PgSubscriberDirectory {
    async fn active_endpoints(
        &self,
        event_type: EventType,
    ) -> Result<Vec<WebhookEndpoint>, DirectoryError> {
        let rows = self.db.process(GetActiveSubscriptions { event_type }).await?;
        Ok(rows.into_iter().map(WebhookEndpoint::from).collect())
    }

    async fn endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>, DirectoryError> {
        let row = self.db.process(GetActiveSubscriptionById { id }).await?;
        Ok(row.map(WebhookEndpoint::from))
    }
}

/// Endpoints declared in the config file, swapped on reload.
#[derive(Clone)]
pub struct StaticSubscriberDirectory {
    webhooks: ConfigStore<Vec<StaticWebhookConfig>>,
}

impl StaticSubscriberDirectory {
    pub fn new(webhooks: ConfigStore<Vec<StaticWebhookConfig>>) -> Self {
        Self { webhooks }
    }
}

#[async_trait]
impl SubscriberDirectory for StaticSubscriberDirectory {
    async fn active_endpoints(
        &self,
        event_type: EventType,
    ) -> Result<Vec<WebhookEndpoint>, DirectoryError> {
        let webhooks = self.webhooks.read().await;
        Ok(webhooks
            .iter()
            .filter(|w| w.subscribes_to(event_type))
            .map(WebhookEndpoint::from)
            .collect())
    }

    async fn endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>, DirectoryError> {
        let webhooks = self.webhooks.read().await;
        Ok(webhooks
            .iter()
            .find(|w| w.id == id)
            .map(WebhookEndpoint::from))
    }
}

/// Endpoints from several directories, in order. Ids are assumed unique
/// across them.
pub struct CompositeDirectory {
    directories: Vec<SharedDirectory>,
}

impl CompositeDirectory {
    pub fn new(directories: Vec<SharedDirectory>) -> Self {
        Self { directories }
    }
}

#[async_trait]
impl SubscriberDirectory for CompositeDirectory {
    async fn active_endpoints(
        &self,
        event_type: EventType,
    ) -> Result<Vec<WebhookEndpoint>, DirectoryError> {
        let mut endpoints = Vec::new();
        for directory in &self.directories {
            endpoints.extend(directory.active_endpoints(event_type).await?);
        }
        Ok(endpoints)
    }

    async fn endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>, DirectoryError> {
        for directory in &self.directories {
            if let Some(endpoint) = directory.endpoint(id).await? {
                return Ok(Some(endpoint));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook(n: u128, event_types: Vec<EventType>) -> StaticWebhookConfig {
        StaticWebhookConfig {
            id: Uuid::from_u128(n),
            url: format!("https://hooks.example.com/{n}").parse().unwrap(),
            secret: b"secret".to_vec().into_boxed_slice(),
            event_types,
        }
    }

    #[tokio::test]
    async fn test_static_directory_filters_and_reloads() {
        let store = ConfigStore::new(vec![
            webhook(1, vec![EventType::PositionUpdated]),
            webhook(2, vec![]),
        ]);
        let directory = StaticSubscriberDirectory::new(store.clone());

        let endpoints = directory
            .active_endpoints(EventType::PositionUpdated)
            .await
            .unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].id, Uuid::from_u128(1));
        assert!(directory.endpoint(Uuid::from_u128(2)).await.unwrap().is_some());

        store.update(vec![]).await;
        assert!(directory.endpoint(Uuid::from_u128(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_composite_directory_concatenates() {
        let a: SharedDirectory = Arc::new(StaticSubscriberDirectory::new(ConfigStore::new(vec![
            webhook(1, vec![EventType::PositionUpdated]),
        ])));
        let b: SharedDirectory = Arc::new(StaticSubscriberDirectory::new(ConfigStore::new(vec![
            webhook(2, vec![EventType::PositionUpdated]),
        ])));
        let directory = CompositeDirectory::new(vec![a, b]);

        let endpoints = directory
            .active_endpoints(EventType::PositionUpdated)
            .await
            .unwrap();
        assert_eq!(endpoints.len(), 2);
        assert!(directory.endpoint(Uuid::from_u128(2)).await.unwrap().is_some());
    }
}
