use skyfuse_sdk::objects::EventType;
use url::Url;
use uuid::Uuid;

/// A webhook endpoint declared in the configuration file rather than the
/// `webhook_subscriptions` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticWebhookConfig {
    pub id: Uuid,
    pub url: Url,
    /// HMAC key for the `Skyfuse-Signature` header.
    pub secret: Box<[u8]>,
    pub event_types: Vec<EventType>,
}

impl StaticWebhookConfig {
    pub fn subscribes_to(&self, event_type: EventType) -> bool {
        self.event_types.contains(&event_type)
    }
}
