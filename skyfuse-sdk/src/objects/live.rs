//! WebSocket message types for the live viewer stream.
//!
//! `GET /api/v1/live` upgrades to a WebSocket connection and pushes
//! [`LiveServerMessage`] JSON frames.
//!
//! # Protocol
//!
//! 1. Right after the upgrade the server sends a
//!    [`LiveServerMessage::Snapshot`] with every aircraft currently cached.
//! 2. On every flush tick that saw changes, the server sends one
//!    [`LiveServerMessage::Incremental`] listing the changed aircraft.
//!    Each aircraft appears at most once per frame.
//! 3. Viewers filter by their own viewport; the server does not.

use serde::{Deserialize, Serialize};

/// Server-to-viewer message, tagged by `"type"`:
///
/// ```json
/// {"type":"incremental","timestamp":1714564800000,"data":{"updated":[ ... ]}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveServerMessage {
    Snapshot { timestamp: i64, data: SnapshotData },
    Incremental { timestamp: i64, data: IncrementalData },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub aircraft: Vec<EntityRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalData {
    pub updated: Vec<EntityRecord>,
}

/// Live-client view of one merged aircraft record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_baro: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_geom: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baro_rate: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_ground: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squawk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub source: String,
    pub predicted: bool,
    /// Timestamp of the winning report, epoch milliseconds.
    pub seen: i64,
}
