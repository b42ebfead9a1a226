//! Snapshot delivery.
//!
//! Snapshots go to the remote collector first. Anything the collector did
//! not accept (transport error, non-success status, missing endpoint) is
//! appended to a local CSV fallback log instead. Exactly one of the two
//! paths is taken per snapshot.

mod collector;
mod fallback;
mod worker;

#[cfg(feature = "collector-http")]
pub use collector::HttpCollector;
pub use collector::{Collector, SubmitOutcome};
pub use fallback::FallbackLog;
pub use worker::{DeliveryReport, PersistPath, ReportingSink, SinkOptions};
