pub mod aircraft_live;
pub mod queue_rows;
pub mod webhook_subscription;

pub use aircraft_live::{AircraftLiveRecord, ReportProvenance, StateFields};
pub use webhook_subscription::WebhookSubscription;
