pub mod event;
pub mod live;
pub mod report;

pub use event::{ChangeEventEnvelope, ChangePayload, EventType, Provenance};
pub use live::{EntityRecord, IncrementalData, LiveServerMessage, SnapshotData};
pub use report::{
    ReportBatch, ReportBatchAccepted, ReportEnvelope, ReportTimestamp, StateInput, StateReport,
};
