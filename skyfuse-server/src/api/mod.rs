//! HTTP API handlers, mounted under `/api/v1`.
//!
//! # Endpoints
//!
//! - `POST /reports`                  – signed feeder push, enqueued for ingestion
//! - `GET  /aircraft`                 – every aircraft in the live cache
//! - `GET  /aircraft/{hex}`           – one aircraft, cache first, then storage
//! - `GET  /pipeline`                 – queue depths, cache size, viewer count
//! - `GET  /pipeline/dead-letters`    – newest dead letters of one queue
//! - `GET  /live`                     – WebSocket live stream

use axum::{
    Router,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use skyfuse_core::queue::QueueError;
use skyfuse_core::repository::RepositoryError;

use crate::state::AppState;

pub mod extractors;

mod aircraft;
mod live;
mod pipeline;
mod reports;

/// Build the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/reports", post(reports::submit_reports))
        .route("/aircraft", get(aircraft::list_aircraft))
        .route("/aircraft/{hex}", get(aircraft::get_aircraft))
        .route("/pipeline", get(pipeline::pipeline_status))
        .route("/pipeline/dead-letters", get(pipeline::list_dead_letters))
        .route("/live", get(live::live_ws))
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

/// Errors that can occur in API handlers.
#[derive(Debug)]
enum ApiError {
    Queue(QueueError),
    Repository(RepositoryError),
    NotFound,
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        Self::Repository(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::Queue(e) => {
                tracing::error!(error = %e, "API queue error");
                (StatusCode::SERVICE_UNAVAILABLE, "queue unavailable").into_response()
            }
            ApiError::Repository(e) => {
                tracing::error!(error = %e, "API storage error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, "aircraft not found").into_response(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::state::AppState;
    use skyfuse_core::config::ConfigStore;
    use skyfuse_core::events::ViewerHub;
    use skyfuse_core::live_store::LiveStateStore;
    use skyfuse_core::processors::WebhookJob;
    use skyfuse_core::queue::MemoryQueue;
    use skyfuse_core::repository::MemoryStateRepository;
    use skyfuse_sdk::objects::ReportEnvelope;
    use std::sync::Arc;
    use std::time::Duration;

    pub const FEEDER_SECRET: &[u8] = b"feeder-secret";

    pub fn app_state() -> AppState {
        AppState {
            ingest_queue: Arc::new(MemoryQueue::<ReportEnvelope>::new("ingest")),
            webhook_queue: Arc::new(MemoryQueue::<WebhookJob>::new("webhook")),
            repository: Arc::new(MemoryStateRepository::new()),
            live: Arc::new(LiveStateStore::new(100, Duration::from_secs(60))),
            hub: ViewerHub::new(),
            feeder_secret: ConfigStore::new(FEEDER_SECRET.to_vec().into_boxed_slice()),
            webhooks: ConfigStore::new(Vec::new()),
        }
    }

    pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
