use crate::framework::DatabaseProcessor;
use compact_str::CompactString;
use kanau::processor::Processor;
use serde::Serialize;

/// The positional part of a report or record. Every field is optional;
/// merging takes a field-level union of two of these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StateFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flight: Option<CompactString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_baro: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_geom: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baro_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_ground: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub squawk: Option<CompactString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<CompactString>,
}

impl StateFields {
    /// Keep every field set on `self`, fill the rest from `fallback`.
    pub fn or(self, fallback: &StateFields) -> StateFields {
        StateFields {
            flight: self.flight.or_else(|| fallback.flight.clone()),
            lat: self.lat.or(fallback.lat),
            lon: self.lon.or(fallback.lon),
            alt_baro: self.alt_baro.or(fallback.alt_baro),
            alt_geom: self.alt_geom.or(fallback.alt_geom),
            gs: self.gs.or(fallback.gs),
            track: self.track.or(fallback.track),
            baro_rate: self.baro_rate.or(fallback.baro_rate),
            on_ground: self.on_ground.or(fallback.on_ground),
            squawk: self.squawk.or_else(|| fallback.squawk.clone()),
            category: self.category.or_else(|| fallback.category.clone()),
        }
    }

    /// Fields whose value differs from `previous`, keyed by wire name.
    ///
    /// With no previous state every set field counts as changed. A field
    /// that became unset is reported as `null`.
    pub fn changed_since(
        &self,
        previous: Option<&StateFields>,
    ) -> serde_json::Map<String, serde_json::Value> {
        let current = to_map(self);
        let Some(previous) = previous else {
            return current;
        };
        let previous = to_map(previous);

        let mut changed = serde_json::Map::new();
        for (key, value) in &current {
            if previous.get(key) != Some(value) {
                changed.insert(key.clone(), value.clone());
            }
        }
        for key in previous.keys() {
            if !current.contains_key(key) {
                changed.insert(key.clone(), serde_json::Value::Null);
            }
        }
        changed
    }
}

fn to_map(fields: &StateFields) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::to_value(fields) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

/// Where the winning report came from.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ReportProvenance {
    pub source: CompactString,
    /// Base score before any predicted penalty.
    pub source_priority: i32,
    pub predicted: bool,
    /// Report timestamp, epoch milliseconds. 0 when the producer sent none.
    pub observed_at: i64,
}

/// Merged, authoritative state of one aircraft.
///
/// Only `merge::merge` creates these.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AircraftLiveRecord {
    pub hex: CompactString,
    #[sqlx(flatten)]
    pub state: StateFields,
    #[sqlx(flatten)]
    pub provenance: ReportProvenance,
}

#[derive(Debug, Clone)]
/// Insert or replace the durable copy of one record.
pub struct UpsertAircraftLive {
    pub record: AircraftLiveRecord,
}

impl Processor<UpsertAircraftLive> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:UpsertAircraftLive")]
    async fn process(&self, cmd: UpsertAircraftLive) -> Result<(), sqlx::Error> {
        let AircraftLiveRecord {
            hex,
            state,
            provenance,
        } = cmd.record;
        sqlx::query(
            r#"
            INSERT INTO aircraft_live (
                hex, flight, lat, lon, alt_baro, alt_geom, gs, track, baro_rate,
                on_ground, squawk, category, source, source_priority, predicted, observed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (hex) DO UPDATE SET
                flight = EXCLUDED.flight,
                lat = EXCLUDED.lat,
                lon = EXCLUDED.lon,
                alt_baro = EXCLUDED.alt_baro,
                alt_geom = EXCLUDED.alt_geom,
                gs = EXCLUDED.gs,
                track = EXCLUDED.track,
                baro_rate = EXCLUDED.baro_rate,
                on_ground = EXCLUDED.on_ground,
                squawk = EXCLUDED.squawk,
                category = EXCLUDED.category,
                source = EXCLUDED.source,
                source_priority = EXCLUDED.source_priority,
                predicted = EXCLUDED.predicted,
                observed_at = EXCLUDED.observed_at,
                updated_at = NOW()
            "#,
        )
        .bind(hex)
        .bind(state.flight)
        .bind(state.lat)
        .bind(state.lon)
        .bind(state.alt_baro)
        .bind(state.alt_geom)
        .bind(state.gs)
        .bind(state.track)
        .bind(state.baro_rate)
        .bind(state.on_ground)
        .bind(state.squawk)
        .bind(state.category)
        .bind(provenance.source)
        .bind(provenance.source_priority)
        .bind(provenance.predicted)
        .bind(provenance.observed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GetAircraftLiveByHex {
    pub hex: CompactString,
}

impl Processor<GetAircraftLiveByHex> for DatabaseProcessor {
    type Output = Option<AircraftLiveRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetAircraftLiveByHex")]
    async fn process(
        &self,
        query: GetAircraftLiveByHex,
    ) -> Result<Option<AircraftLiveRecord>, sqlx::Error> {
        let record = sqlx::query_as::<_, AircraftLiveRecord>(
            r#"
            SELECT
                hex, flight, lat, lon, alt_baro, alt_geom, gs, track, baro_rate,
                on_ground, squawk, category, source, source_priority, predicted, observed_at
            FROM aircraft_live
            WHERE hex = $1
            "#,
        )
        .bind(query.hex)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(lat: Option<f64>, squawk: Option<&str>) -> StateFields {
        StateFields {
            lat,
            lon: lat.map(|_| 0.5),
            squawk: squawk.map(CompactString::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_or_prefers_self() {
        let merged = fields(Some(1.0), None).or(&fields(Some(2.0), Some("7700")));
        assert_eq!(merged.lat, Some(1.0));
        assert_eq!(merged.squawk.as_deref(), Some("7700"));
    }

    #[test]
    fn test_changed_since_first_record_reports_all_set_fields() {
        let changed = fields(Some(1.0), Some("1200")).changed_since(None);
        assert_eq!(changed.len(), 3);
        assert_eq!(changed["squawk"], json!("1200"));
    }

    #[test]
    fn test_changed_since_only_reports_differences() {
        let before = fields(Some(1.0), Some("1200"));
        let after = fields(Some(1.5), Some("1200"));
        let changed = after.changed_since(Some(&before));
        assert_eq!(changed.len(), 1);
        assert_eq!(changed["lat"], json!(1.5));

        let cleared = fields(Some(1.5), None).changed_since(Some(&before));
        assert_eq!(cleared["squawk"], serde_json::Value::Null);
    }
}
