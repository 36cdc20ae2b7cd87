use axum::{
    Json,
    extract::{Path, State},
};
use skyfuse_core::mapper::record_to_entity;
use skyfuse_sdk::objects::EntityRecord;

use super::ApiError;
use crate::state::AppState;

/// `GET /aircraft`: every aircraft in the live cache, ordered by key.
pub(super) async fn list_aircraft(State(state): State<AppState>) -> Json<Vec<EntityRecord>> {
    let mut aircraft: Vec<EntityRecord> =
        state.live.snapshot().iter().map(record_to_entity).collect();
    aircraft.sort_by(|a, b| a.hex.cmp(&b.hex));
    Json(aircraft)
}

/// `GET /aircraft/{hex}`: one aircraft.
///
/// Served from the live cache when present; otherwise read from the
/// durable store, which still holds aircraft that have gone idle.
pub(super) async fn get_aircraft(
    State(state): State<AppState>,
    Path(hex): Path<String>,
) -> Result<Json<EntityRecord>, ApiError> {
    let hex = hex.trim().to_ascii_lowercase();

    if let Some(record) = state.live.get(&hex) {
        return Ok(Json(record_to_entity(&record)));
    }

    let record = state
        .repository
        .get(&hex)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(record_to_entity(&record)))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{app_state, body_json};
    use crate::server::build_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use compact_str::CompactString;
    use skyfuse_core::entities::{AircraftLiveRecord, ReportProvenance, StateFields};
    use tower::ServiceExt;

    fn record(hex: &str, lat: f64) -> AircraftLiveRecord {
        AircraftLiveRecord {
            hex: CompactString::from(hex),
            state: StateFields {
                lat: Some(lat),
                lon: Some(10.0),
                ..Default::default()
            },
            provenance: ReportProvenance {
                source: CompactString::from("adsb"),
                source_priority: 100,
                predicted: false,
                observed_at: 1_700_000_000_000,
            },
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_list_returns_cached_aircraft_sorted() {
        let state = app_state();
        state.live.upsert_state(record("def456", 2.0));
        state.live.upsert_state(record("abc123", 1.0));
        let app = build_router(state);

        let response = app.oneshot(get("/api/v1/aircraft")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let hexes: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["hex"].as_str().unwrap())
            .collect();
        assert_eq!(hexes, vec!["abc123", "def456"]);
        assert_eq!(body[0]["source"], "adsb");
    }

    #[tokio::test]
    async fn test_get_prefers_live_cache() {
        let state = app_state();
        state.repository.upsert(&record("abc123", 1.0)).await.unwrap();
        state.live.upsert_state(record("abc123", 2.0));
        let app = build_router(state);

        let response = app.oneshot(get("/api/v1/aircraft/ABC123")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["lat"], 2.0);
    }

    #[tokio::test]
    async fn test_get_falls_back_to_storage() {
        let state = app_state();
        state.repository.upsert(&record("abc123", 1.0)).await.unwrap();
        let app = build_router(state);

        let response = app.oneshot(get("/api/v1/aircraft/abc123")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["lat"], 1.0);
    }

    #[tokio::test]
    async fn test_unknown_aircraft_is_not_found() {
        let app = build_router(app_state());
        let response = app.oneshot(get("/api/v1/aircraft/ffffff")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
