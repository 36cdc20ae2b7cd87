//! SQL for the durable queue tables.
//!
//! Three tables back every named queue: `queue_messages` (ready and leased,
//! FIFO by id), `queue_delayed` (ordered by `available_at`) and
//! `queue_dead_letters`. Bodies are stored as JSONB so the same tables
//! carry ingest and webhook queues.

use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;

#[derive(Debug, Clone)]
pub struct EnqueueQueueMessage {
    pub queue: String,
    pub body: serde_json::Value,
}

impl Processor<EnqueueQueueMessage> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:EnqueueQueueMessage")]
    async fn process(&self, cmd: EnqueueQueueMessage) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO queue_messages (queue, body) VALUES ($1, $2)")
            .bind(cmd.queue)
            .bind(cmd.body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeasedRow {
    pub id: i64,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone)]
/// Lease the oldest visible message until `leased_until`.
///
/// A row is visible when it was never leased or its lease ran out.
/// `SKIP LOCKED` lets several workers pop concurrently without ever
/// handing the same row to two of them.
pub struct LeaseQueueMessage {
    pub queue: String,
    /// Epoch milliseconds.
    pub now: i64,
    pub leased_until: i64,
}

impl Processor<LeaseQueueMessage> for DatabaseProcessor {
    type Output = Option<LeasedRow>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:LeaseQueueMessage")]
    async fn process(&self, cmd: LeaseQueueMessage) -> Result<Option<LeasedRow>, sqlx::Error> {
        let row = sqlx::query_as::<_, LeasedRow>(
            r#"
            UPDATE queue_messages
            SET leased_until = $3
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = $1 AND (leased_until IS NULL OR leased_until <= $2)
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, body
            "#,
        )
        .bind(cmd.queue)
        .bind(cmd.now)
        .bind(cmd.leased_until)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[derive(Debug, Clone)]
pub struct AckQueueMessage {
    pub id: i64,
}

impl Processor<AckQueueMessage> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:AckQueueMessage")]
    async fn process(&self, cmd: AckQueueMessage) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(cmd.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Move a leased row, body untouched, onto a dead-letter list.
///
/// Used for bodies that no longer decode; they can be inspected but never
/// processed.
pub struct DeadLetterLeasedMessage {
    pub id: i64,
    pub dead_letter_queue: String,
    pub error: String,
}

impl Processor<DeadLetterLeasedMessage> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:DeadLetterLeasedMessage")]
    async fn process(&self, cmd: DeadLetterLeasedMessage) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            WITH gone AS (
                DELETE FROM queue_messages WHERE id = $1 RETURNING body
            )
            INSERT INTO queue_dead_letters (queue, body, error, retries)
            SELECT $2, body, $3, 0 FROM gone
            "#,
        )
        .bind(cmd.id)
        .bind(cmd.dead_letter_queue)
        .bind(cmd.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InsertDelayedMessage {
    pub queue: String,
    pub body: serde_json::Value,
    /// Epoch milliseconds.
    pub available_at: i64,
}

impl Processor<InsertDelayedMessage> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertDelayedMessage")]
    async fn process(&self, cmd: InsertDelayedMessage) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO queue_delayed (queue, body, available_at) VALUES ($1, $2, $3)")
            .bind(cmd.queue)
            .bind(cmd.body)
            .bind(cmd.available_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Move up to `limit` due entries from the delayed set onto the ready queue
/// in one statement, oldest due time first.
///
/// Returns the number of rows moved.
pub struct PromoteDueMessages {
    pub queue: String,
    pub now: i64,
    pub limit: i64,
}

impl Processor<PromoteDueMessages> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PromoteDueMessages")]
    async fn process(&self, cmd: PromoteDueMessages) -> Result<u64, sqlx::Error> {
        if cmd.limit <= 0 {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            WITH due AS (
                DELETE FROM queue_delayed
                WHERE id IN (
                    SELECT id FROM queue_delayed
                    WHERE queue = $1 AND available_at <= $2
                    ORDER BY available_at, id
                    FOR UPDATE SKIP LOCKED
                    LIMIT $3
                )
                RETURNING id, body, available_at
            )
            INSERT INTO queue_messages (queue, body)
            SELECT $1::text, body FROM due ORDER BY available_at, id
            "#,
        )
        .bind(cmd.queue)
        .bind(cmd.now)
        .bind(cmd.limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct InsertDeadLetter {
    pub queue: String,
    pub body: serde_json::Value,
    pub error: String,
    pub retries: i32,
}

impl Processor<InsertDeadLetter> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertDeadLetter")]
    async fn process(&self, cmd: InsertDeadLetter) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO queue_dead_letters (queue, body, error, retries) VALUES ($1, $2, $3, $4)",
        )
        .bind(cmd.queue)
        .bind(cmd.body)
        .bind(cmd.error)
        .bind(cmd.retries)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct QueueDepthRow {
    pub ready: i64,
    pub in_flight: i64,
    pub delayed: i64,
    pub dead: i64,
}

#[derive(Debug, Clone)]
pub struct GetQueueDepths {
    pub queue: String,
    pub dead_letter_queue: String,
    /// Epoch milliseconds; leases running out before this count as ready.
    pub now: i64,
}

impl Processor<GetQueueDepths> for DatabaseProcessor {
    type Output = QueueDepthRow;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetQueueDepths")]
    async fn process(&self, query: GetQueueDepths) -> Result<QueueDepthRow, sqlx::Error> {
        let row = sqlx::query_as::<_, QueueDepthRow>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM queue_messages
                    WHERE queue = $1 AND (leased_until IS NULL OR leased_until <= $3)) AS ready,
                (SELECT COUNT(*) FROM queue_messages
                    WHERE queue = $1 AND leased_until > $3) AS in_flight,
                (SELECT COUNT(*) FROM queue_delayed WHERE queue = $1) AS delayed,
                (SELECT COUNT(*) FROM queue_dead_letters WHERE queue = $2) AS dead
            "#,
        )
        .bind(query.queue)
        .bind(query.dead_letter_queue)
        .bind(query.now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterRow {
    pub id: i64,
    pub body: serde_json::Value,
    pub error: String,
    pub retries: i32,
    pub failed_at: time::OffsetDateTime,
}

#[derive(Debug, Clone)]
/// Newest dead letters first.
pub struct ListDeadLetters {
    pub queue: String,
    pub limit: i64,
}

impl Processor<ListDeadLetters> for DatabaseProcessor {
    type Output = Vec<DeadLetterRow>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListDeadLetters")]
    async fn process(&self, query: ListDeadLetters) -> Result<Vec<DeadLetterRow>, sqlx::Error> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT id, body, error, retries, failed_at
            FROM queue_dead_letters
            WHERE queue = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(query.queue)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
