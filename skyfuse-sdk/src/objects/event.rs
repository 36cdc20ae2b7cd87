//! Change event envelope delivered to webhook subscribers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signature::Signature;

/// Event types a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "entity.position.updated")]
    PositionUpdated,
}

impl EventType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventType::PositionUpdated => "entity.position.updated",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity.position.updated" => Ok(EventType::PositionUpdated),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// Who reported the winning state, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub source: String,
    pub source_priority: i32,
    pub predicted: bool,
    /// Report timestamp in epoch milliseconds.
    pub timestamp: i64,
}

/// Event payload: the entity key, every changed field flattened next to
/// it, and the provenance of the winning report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    pub entity_key: String,
    #[serde(flatten)]
    pub changed_fields: serde_json::Map<String, serde_json::Value>,
    pub provenance: Provenance,
}

/// `{ eventId, eventType, occurredAt, payload }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEventEnvelope {
    pub event_id: Uuid,
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: time::OffsetDateTime,
    pub payload: ChangePayload,
}

impl Signature for ChangeEventEnvelope {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let mut changed = serde_json::Map::new();
        changed.insert("lat".into(), json!(51.5));
        let envelope = ChangeEventEnvelope {
            event_id: Uuid::nil(),
            event_type: EventType::PositionUpdated,
            occurred_at: time::OffsetDateTime::UNIX_EPOCH,
            payload: ChangePayload {
                entity_key: "abc123".into(),
                changed_fields: changed,
                provenance: Provenance {
                    source: "adsb".into(),
                    source_priority: 80,
                    predicted: false,
                    timestamp: 1_000,
                },
            },
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["eventType"], "entity.position.updated");
        assert_eq!(value["occurredAt"], "1970-01-01T00:00:00Z");
        assert_eq!(value["payload"]["entityKey"], "abc123");
        assert_eq!(value["payload"]["lat"], 51.5);
        assert_eq!(value["payload"]["provenance"]["sourcePriority"], 80);

        let back: ChangeEventEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back.payload.changed_fields.len(), 1);
    }
}
