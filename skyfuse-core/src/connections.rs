//! Process-wide connection handles.
//!
//! Built once in `main` and handed to every component that needs them.

use crate::framework::DatabaseProcessor;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Timeout for one webhook delivery request.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to build webhook HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct Connections {
    pub pool: PgPool,
    pub http: reqwest::Client,
}

impl Connections {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, ConnectionError> {
        let http = webhook_http_client()?;

        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!("Database connection established");

        Ok(Self { pool, http })
    }

    pub fn database(&self) -> DatabaseProcessor {
        DatabaseProcessor::new(self.pool.clone())
    }

    /// Close the pool. Call only after every worker has stopped.
    pub async fn close(&self) {
        info!("Closing database connections...");
        self.pool.close().await;
    }
}

/// The HTTP client used for webhook delivery.
pub fn webhook_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(WEBHOOK_TIMEOUT)
        .user_agent(concat!("skyfuse/", env!("CARGO_PKG_VERSION")))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_client_builds() {
        assert!(webhook_http_client().is_ok());
    }
}
