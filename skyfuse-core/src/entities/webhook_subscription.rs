use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use skyfuse_sdk::objects::EventType;
use uuid::Uuid;

/// A registered webhook endpoint. Rows are owned by the account/admin
/// side; the pipeline only reads them.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    pub secret: String,
    pub event_types: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct GetActiveSubscriptions {
    pub event_type: EventType,
}

impl Processor<GetActiveSubscriptions> for DatabaseProcessor {
    type Output = Vec<WebhookSubscription>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetActiveSubscriptions")]
    async fn process(
        &self,
        query: GetActiveSubscriptions,
    ) -> Result<Vec<WebhookSubscription>, sqlx::Error> {
        let rows = sqlx::query_as::<_, WebhookSubscription>(
            r#"
            SELECT id, url, secret, event_types, active
            FROM webhook_subscriptions
            WHERE active AND $1 = ANY(event_types)
            ORDER BY id
            "#,
        )
        .bind(query.event_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone)]
/// Look up one active subscription, e.g. right before a delivery.
pub struct GetActiveSubscriptionById {
    pub id: Uuid,
}

impl Processor<GetActiveSubscriptionById> for DatabaseProcessor {
    type Output = Option<WebhookSubscription>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetActiveSubscriptionById")]
    async fn process(
        &self,
        query: GetActiveSubscriptionById,
    ) -> Result<Option<WebhookSubscription>, sqlx::Error> {
        let row = sqlx::query_as::<_, WebhookSubscription>(
            r#"
            SELECT id, url, secret, event_types, active
            FROM webhook_subscriptions
            WHERE id = $1 AND active
            "#,
        )
        .bind(query.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
