//! Inbound report types pushed by feeders and pollers.

use serde::{Deserialize, Serialize};

use crate::signature::Signature;

/// Positional state for one aircraft, in object form.
///
/// Units: feet, knots, feet per minute, degrees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReport {
    /// 24-bit ICAO address as 6 hex digits.
    pub hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_baro: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_geom: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baro_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_ground: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squawk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Set when the position was extrapolated rather than observed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub predicted: bool,
}

/// The `state` field of a report.
///
/// Feeders may send the object form, an OpenSky-style state vector array,
/// or anything else; shape errors are reported by the ingestion worker, not
/// at the HTTP boundary.
///
/// `Tuple` is tried first: serde would otherwise read a short array into
/// `StateReport` positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateInput {
    Tuple(Vec<serde_json::Value>),
    Report(StateReport),
    Other(serde_json::Value),
}

/// Either epoch seconds/milliseconds or an ISO-8601 / RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportTimestamp {
    Epoch(f64),
    Text(String),
}

/// One report plus its provenance, as pushed by a feeder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEnvelope {
    pub state: StateInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Base priority score; higher is more authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestion_timestamp: Option<ReportTimestamp>,
}

/// Body of `POST /api/v1/reports`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBatch {
    pub reports: Vec<ReportEnvelope>,
}

impl Signature for ReportBatch {}

/// Response of `POST /api/v1/reports`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportBatchAccepted {
    pub accepted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_input_shapes() {
        let object: StateInput = serde_json::from_value(json!({"hex": "abc123", "lat": 1.5})).unwrap();
        assert!(matches!(object, StateInput::Report(ref r) if r.hex == "abc123"));

        let tuple: StateInput = serde_json::from_value(json!(["abc123", "DLH1  ", null])).unwrap();
        assert!(matches!(tuple, StateInput::Tuple(ref v) if v.len() == 3));

        let other: StateInput = serde_json::from_value(json!("garbage")).unwrap();
        assert!(matches!(other, StateInput::Other(_)));
    }

    #[test]
    fn test_envelope_wire_names() {
        let envelope: ReportEnvelope = serde_json::from_value(json!({
            "state": {"hex": "abc123"},
            "source": "adsb",
            "sourcePriority": 40,
            "ingestionTimestamp": "2024-05-01T12:00:00Z"
        }))
        .unwrap();
        assert_eq!(envelope.source_priority, Some(40));
        assert_eq!(
            envelope.ingestion_timestamp,
            Some(ReportTimestamp::Text("2024-05-01T12:00:00Z".into()))
        );

        let epoch: ReportEnvelope = serde_json::from_value(json!({
            "state": {"hex": "abc123"},
            "ingestionTimestamp": 1714564800
        }))
        .unwrap();
        assert_eq!(epoch.ingestion_timestamp, Some(ReportTimestamp::Epoch(1714564800.0)));
    }
}
