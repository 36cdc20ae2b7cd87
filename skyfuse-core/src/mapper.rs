//! Translation between wire reports and canonical records.
//!
//! Everything here is pure. A report that fails validation is malformed
//! and will never become valid on retry, so callers drop it.

use crate::entities::{AircraftLiveRecord, ReportProvenance, StateFields};
use crate::source::{LOWEST_PRIORITY, SourceKind};
use compact_str::CompactString;
use serde_json::Value;
use skyfuse_sdk::objects::{EntityRecord, ReportEnvelope, ReportTimestamp, StateInput, StateReport};
use thiserror::Error;

const FEET_PER_METER: f64 = 3.280_84;
const KNOTS_PER_MPS: f64 = 1.943_844;
const FPM_PER_MPS: f64 = 196.850_4;

/// Epoch values above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

const MAX_FLIGHT_LEN: usize = 8;
const MAX_CATEGORY_LEN: usize = 16;

/// Number of leading elements an OpenSky state vector must carry.
const TUPLE_MIN_LEN: usize = 17;

/// Errors that make a report malformed.
#[derive(Debug, Error, PartialEq)]
pub enum MapError {
    #[error("invalid entity key: {0:?}")]
    InvalidKey(String),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("{0} is not a finite number")]
    NonFinite(&'static str),

    #[error("latitude and longitude must be given together")]
    PartialPosition,

    #[error("invalid squawk: {0:?}")]
    InvalidSquawk(String),

    #[error("{0} is too long")]
    TooLong(&'static str),

    #[error("state is neither an object nor a state vector")]
    UnrecognizedShape,

    #[error("state vector has {0} elements, expected at least {TUPLE_MIN_LEN}")]
    TupleTooShort(usize),

    #[error("state vector element {index} should be {expected}")]
    TupleField { index: usize, expected: &'static str },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// A validated observation with resolved provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStateReport {
    pub hex: CompactString,
    pub state: StateFields,
    pub provenance: ReportProvenance,
}

/// Validate a queued envelope and resolve its provenance.
pub fn map_envelope(envelope: &ReportEnvelope) -> Result<RawStateReport, MapError> {
    let (state, inferred_source) = match &envelope.state {
        StateInput::Report(report) => (report.clone(), None),
        StateInput::Tuple(values) => state_from_tuple(values)?,
        StateInput::Other(_) => return Err(MapError::UnrecognizedShape),
    };

    let hex = validate_hex(&state.hex)?;
    let fields = validate_fields(&state)?;
    let timestamp = parse_timestamp(envelope.ingestion_timestamp.as_ref())?;
    let source = envelope.source.as_deref().or(inferred_source);
    let provenance = resolve_provenance(source, envelope.source_priority, state.predicted, timestamp);

    Ok(RawStateReport {
        hex,
        state: fields,
        provenance,
    })
}

/// Fill in provenance defaults.
///
/// A missing priority falls back to the tier table for the source name;
/// a missing or unknown name lands in the lowest tier.
pub fn resolve_provenance(
    source: Option<&str>,
    source_priority: Option<i32>,
    predicted: bool,
    observed_at: i64,
) -> ReportProvenance {
    let kind = source.map(SourceKind::from_name).unwrap_or(SourceKind::Unknown);
    let source_priority = source_priority.unwrap_or_else(|| match source {
        Some(_) => kind.default_priority(),
        None => LOWEST_PRIORITY,
    });
    ReportProvenance {
        source: CompactString::from(source.map(str::trim).unwrap_or(kind.as_str())),
        source_priority,
        predicted: predicted || kind.is_predicted(),
        observed_at,
    }
}

/// Parse a report timestamp into epoch milliseconds. Absent means 0.
pub fn parse_timestamp(timestamp: Option<&ReportTimestamp>) -> Result<i64, MapError> {
    match timestamp {
        None => Ok(0),
        Some(ReportTimestamp::Epoch(value)) => epoch_to_millis(*value),
        Some(ReportTimestamp::Text(text)) => {
            let text = text.trim();
            if let Ok(value) = text.parse::<f64>() {
                return epoch_to_millis(value);
            }
            let parsed = time::OffsetDateTime::parse(
                text,
                &time::format_description::well_known::Rfc3339,
            )
            .map_err(|_| MapError::InvalidTimestamp(text.to_owned()))?;
            let millis = parsed.unix_timestamp_nanos() / 1_000_000;
            if millis < 0 {
                return Err(MapError::InvalidTimestamp(text.to_owned()));
            }
            i64::try_from(millis).map_err(|_| MapError::InvalidTimestamp(text.to_owned()))
        }
    }
}

fn epoch_to_millis(value: f64) -> Result<i64, MapError> {
    if !value.is_finite() || value < 0.0 {
        return Err(MapError::InvalidTimestamp(value.to_string()));
    }
    if value > EPOCH_MILLIS_THRESHOLD {
        Ok(value.round() as i64)
    } else {
        Ok((value * 1000.0).round() as i64)
    }
}

fn validate_hex(raw: &str) -> Result<CompactString, MapError> {
    let hex = raw.trim();
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MapError::InvalidKey(raw.to_owned()));
    }
    Ok(CompactString::from(hex.to_ascii_lowercase()))
}

fn validate_fields(state: &StateReport) -> Result<StateFields, MapError> {
    let lat = finite("lat", state.lat)?;
    let lon = finite("lon", state.lon)?;
    match (lat, lon) {
        (Some(lat), Some(lon)) => {
            check_range("lat", lat, -90.0, 90.0)?;
            check_range("lon", lon, -180.0, 180.0)?;
        }
        (None, None) => {}
        _ => return Err(MapError::PartialPosition),
    }

    let alt_baro = altitude("altBaro", state.alt_baro)?;
    let alt_geom = altitude("altGeom", state.alt_geom)?;

    let gs = finite("gs", state.gs)?;
    if let Some(gs) = gs {
        check_range("gs", gs, 0.0, 2000.0)?;
    }

    let track = finite("track", state.track)?.map(|t| if t == 360.0 { 0.0 } else { t });
    if let Some(track) = track {
        if !(0.0..360.0).contains(&track) {
            return Err(MapError::OutOfRange {
                field: "track",
                value: track,
            });
        }
    }

    let baro_rate = finite("baroRate", state.baro_rate)?;
    if let Some(rate) = baro_rate {
        check_range("baroRate", rate, -30_000.0, 30_000.0)?;
    }

    let squawk = match non_empty(state.squawk.as_deref()) {
        Some(s) if s.len() == 4 && s.chars().all(|c| ('0'..='7').contains(&c)) => {
            Some(CompactString::from(s))
        }
        Some(s) => return Err(MapError::InvalidSquawk(s.to_owned())),
        None => None,
    };

    Ok(StateFields {
        flight: bounded("flight", state.flight.as_deref(), MAX_FLIGHT_LEN)?,
        lat,
        lon,
        alt_baro,
        alt_geom,
        gs,
        track,
        baro_rate: baro_rate.map(|r| r.round() as i32),
        on_ground: state.on_ground,
        squawk,
        category: bounded("category", state.category.as_deref(), MAX_CATEGORY_LEN)?,
    })
}

fn finite(field: &'static str, value: Option<f64>) -> Result<Option<f64>, MapError> {
    match value {
        Some(v) if !v.is_finite() => Err(MapError::NonFinite(field)),
        other => Ok(other),
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), MapError> {
    if value < min || value > max {
        return Err(MapError::OutOfRange { field, value });
    }
    Ok(())
}

fn altitude(field: &'static str, value: Option<f64>) -> Result<Option<i32>, MapError> {
    let Some(feet) = finite(field, value)? else {
        return Ok(None);
    };
    check_range(field, feet, -2_000.0, 100_000.0)?;
    Ok(Some(feet.round() as i32))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn bounded(
    field: &'static str,
    value: Option<&str>,
    max_len: usize,
) -> Result<Option<CompactString>, MapError> {
    match non_empty(value) {
        Some(s) if s.chars().count() > max_len => Err(MapError::TooLong(field)),
        Some(s) => Ok(Some(CompactString::from(s))),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// OpenSky state vectors
// ---------------------------------------------------------------------------

/// Convert an OpenSky state vector into the object form.
///
/// Layout: `[icao24, callsign, origin_country, time_position, last_contact,
/// longitude, latitude, baro_altitude, on_ground, velocity, true_track,
/// vertical_rate, sensors, geo_altitude, squawk, spi, position_source,
/// category?]`. Metric units are converted. Also returns the source name
/// implied by `position_source`, used when the envelope names none.
fn state_from_tuple(values: &[Value]) -> Result<(StateReport, Option<&'static str>), MapError> {
    if values.len() < TUPLE_MIN_LEN {
        return Err(MapError::TupleTooShort(values.len()));
    }

    let hex = tuple_str(values, 0)?.ok_or(MapError::TupleField {
        index: 0,
        expected: "a string",
    })?;

    let report = StateReport {
        hex: hex.to_owned(),
        flight: tuple_str(values, 1)?.map(str::to_owned),
        lon: tuple_f64(values, 5)?,
        lat: tuple_f64(values, 6)?,
        alt_baro: tuple_f64(values, 7)?.map(|m| m * FEET_PER_METER),
        on_ground: tuple_bool(values, 8)?,
        gs: tuple_f64(values, 9)?.map(|v| v * KNOTS_PER_MPS),
        track: tuple_f64(values, 10)?,
        baro_rate: tuple_f64(values, 11)?.map(|v| v * FPM_PER_MPS),
        alt_geom: tuple_f64(values, 13)?.map(|m| m * FEET_PER_METER),
        squawk: tuple_str(values, 14)?.map(str::to_owned),
        category: tuple_f64(values, 17)?.and_then(|c| opensky_category(c as i64)),
        predicted: false,
    };

    let source = match tuple_f64(values, 16)?.map(|s| s as i64) {
        Some(0) => Some("adsb"),
        Some(1) => Some("asterix"),
        Some(2) => Some("mlat"),
        Some(3) => Some("flarm"),
        _ => None,
    };

    Ok((report, source))
}

fn tuple_str(values: &[Value], index: usize) -> Result<Option<&str>, MapError> {
    match values.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(MapError::TupleField {
            index,
            expected: "a string",
        }),
    }
}

fn tuple_f64(values: &[Value], index: usize) -> Result<Option<f64>, MapError> {
    match values.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or(MapError::TupleField {
            index,
            expected: "a number",
        }),
        Some(_) => Err(MapError::TupleField {
            index,
            expected: "a number",
        }),
    }
}

fn tuple_bool(values: &[Value], index: usize) -> Result<Option<bool>, MapError> {
    match values.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(MapError::TupleField {
            index,
            expected: "a boolean",
        }),
    }
}

/// OpenSky category codes to DO-260 emitter categories.
fn opensky_category(code: i64) -> Option<String> {
    match code {
        2..=8 => Some(format!("A{}", code - 1)),
        9..=15 => Some(format!("B{}", code - 8)),
        16..=20 => Some(format!("C{}", code - 15)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// The live-client wire shape of a merged record.
pub fn record_to_entity(record: &AircraftLiveRecord) -> EntityRecord {
    let state = &record.state;
    EntityRecord {
        hex: record.hex.to_string(),
        flight: state.flight.as_ref().map(|s| s.to_string()),
        lat: state.lat,
        lon: state.lon,
        alt_baro: state.alt_baro,
        alt_geom: state.alt_geom,
        gs: state.gs,
        track: state.track,
        baro_rate: state.baro_rate,
        on_ground: state.on_ground,
        squawk: state.squawk.as_ref().map(|s| s.to_string()),
        category: state.category.as_ref().map(|s| s.to_string()),
        source: record.provenance.source.to_string(),
        predicted: record.provenance.predicted,
        seen: record.provenance.observed_at,
    }
}
