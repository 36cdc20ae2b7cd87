//! Reconciliation of conflicting reports for one aircraft.

use crate::entities::{AircraftLiveRecord, ReportProvenance};
use crate::mapper::RawStateReport;
use std::cmp::Ordering;

/// Subtracted from the base score of extrapolated reports.
pub const PREDICTED_PENALTY: i32 = 10;

/// Base score minus the predicted penalty.
pub fn adjusted_score(provenance: &ReportProvenance) -> i32 {
    if provenance.predicted {
        provenance.source_priority.saturating_sub(PREDICTED_PENALTY)
    } else {
        provenance.source_priority
    }
}

/// Whether `incoming` outranks the provenance of the stored record.
///
/// Higher adjusted score wins. On a tie the newer or equal timestamp wins,
/// so re-sending an unchanged report still refreshes the record.
pub fn incoming_wins(existing: &ReportProvenance, incoming: &ReportProvenance) -> bool {
    match adjusted_score(incoming).cmp(&adjusted_score(existing)) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => incoming.observed_at >= existing.observed_at,
    }
}

/// Merge an incoming report into the previous record, if any.
///
/// The winner's fields take precedence and unset fields fall back to the
/// loser's. The result carries the winner's provenance.
pub fn merge(existing: Option<&AircraftLiveRecord>, incoming: &RawStateReport) -> AircraftLiveRecord {
    let Some(existing) = existing else {
        return AircraftLiveRecord::from_report(incoming);
    };

    if incoming_wins(&existing.provenance, &incoming.provenance) {
        AircraftLiveRecord {
            hex: incoming.hex.clone(),
            state: incoming.state.clone().or(&existing.state),
            provenance: incoming.provenance.clone(),
        }
    } else {
        AircraftLiveRecord {
            hex: existing.hex.clone(),
            state: existing.state.clone().or(&incoming.state),
            provenance: existing.provenance.clone(),
        }
    }
}

impl AircraftLiveRecord {
    /// First-ever record for a key.
    pub fn from_report(report: &RawStateReport) -> Self {
        Self {
            hex: report.hex.clone(),
            state: report.state.clone(),
            provenance: report.provenance.clone(),
        }
    }
}
