use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use skyfuse_core::queue::QueueMessage;
use skyfuse_sdk::objects::{ReportBatch, ReportBatchAccepted};

use super::ApiError;
use crate::api::extractors::SignedBody;
use crate::state::AppState;

/// `POST /reports`: accept a signed batch of feeder reports.
///
/// Each report becomes one ingestion message; validation happens in the
/// worker, so malformed reports are accepted here and dropped there.
/// A queue failure part-way through leaves the earlier reports enqueued;
/// the feeder retries the whole batch and the merge absorbs duplicates.
pub(super) async fn submit_reports(
    State(state): State<AppState>,
    SignedBody(batch): SignedBody<ReportBatch>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = batch.reports.len();
    for report in batch.reports {
        state.ingest_queue.enqueue(QueueMessage::new(report)).await?;
    }
    tracing::debug!(accepted, "Feeder batch enqueued");

    Ok((StatusCode::ACCEPTED, Json(ReportBatchAccepted { accepted })))
}
