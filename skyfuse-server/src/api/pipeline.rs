use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use skyfuse_core::queue::QueueDepths;

use super::ApiError;
use crate::state::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PipelineStatus {
    ingest: QueueDepths,
    webhook: QueueDepths,
    live_entries: usize,
    viewers: usize,
}

/// `GET /pipeline`: queue depths (ready, leased, delayed, dead) and live
/// fan-out size.
pub(super) async fn pipeline_status(
    State(state): State<AppState>,
) -> Result<Json<PipelineStatus>, ApiError> {
    Ok(Json(PipelineStatus {
        ingest: state.ingest_queue.depths().await?,
        webhook: state.webhook_queue.depths().await?,
        live_entries: state.live.len(),
        viewers: state.hub.viewer_count(),
    }))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(super) enum QueueSelector {
    Ingest,
    Webhook,
}

#[derive(Debug, Deserialize)]
pub(super) struct DeadLetterQuery {
    queue: QueueSelector,
    limit: Option<usize>,
}

/// `GET /pipeline/dead-letters?queue=ingest|webhook&limit=N`: newest first.
pub(super) async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Response, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);

    let response = match query.queue {
        QueueSelector::Ingest => Json(state.ingest_queue.dead_letters(limit).await?).into_response(),
        QueueSelector::Webhook => {
            Json(state.webhook_queue.dead_letters(limit).await?).into_response()
        }
    };
    Ok(response)
}
