//! Event types for the pipeline.

use crate::entities::AircraftLiveRecord;
use compact_str::CompactString;
use serde_json::{Map, Value};
use skyfuse_sdk::objects::{ChangeEventEnvelope, ChangePayload, EventType, Provenance};
use time::OffsetDateTime;
use uuid::Uuid;

/// Published by the ingestion worker after a record was merged and persisted.
///
/// Carries the full merged record so in-process subscribers never re-read
/// storage; only `changed_fields` leaves the process.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub occurred_at: OffsetDateTime,
    pub entity_key: CompactString,
    /// Fields that differ from the previous record, by wire name.
    pub changed_fields: Map<String, Value>,
    pub record: AircraftLiveRecord,
}

impl ChangeEvent {
    pub fn position_updated(record: AircraftLiveRecord, changed_fields: Map<String, Value>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: EventType::PositionUpdated,
            occurred_at: OffsetDateTime::now_utc(),
            entity_key: record.hex.clone(),
            changed_fields,
            record,
        }
    }

    /// The external webhook envelope.
    pub fn to_envelope(&self) -> ChangeEventEnvelope {
        let provenance = &self.record.provenance;
        ChangeEventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type,
            occurred_at: self.occurred_at,
            payload: ChangePayload {
                entity_key: self.entity_key.to_string(),
                changed_fields: self.changed_fields.clone(),
                provenance: Provenance {
                    source: provenance.source.to_string(),
                    source_priority: provenance.source_priority,
                    predicted: provenance.predicted,
                    timestamp: provenance.observed_at,
                },
            },
        }
    }
}
