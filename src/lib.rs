//! PathGuard occupancy aggregator
//!
//! This crate turns per-frame tracked person detections from a camera feed
//! into a low-bandwidth congestion signal that is uploaded once per minute.
//!
//! # Architecture
//!
//! - `ledger`: per-track first-seen/last-seen bookkeeping with re-entry debouncing
//! - `window`: fixed-duration rolling windows of instantaneous counts
//! - `congestion`: count to congestion level mapping
//! - `scheduler`: minute-boundary emission state machine
//! - `snapshot`: the periodic payload, its sequence ids and value obfuscation
//! - `sink`: collector submission with append-only CSV fallback
//! - `aggregator`: the per-tick loop tying everything together
//! - `detect`: detection intake (the detector/tracker itself is external)
//!
//! Detection, frame decoding and camera reconnection are not part of this
//! crate. Frames of detections arrive through a [`DetectionSource`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod aggregator;
pub mod config;
pub mod congestion;
pub mod detect;
pub mod ledger;
pub mod scheduler;
pub mod sink;
pub mod snapshot;
pub mod window;

pub use aggregator::{Aggregator, LoopStats, TickOutcome};
pub use congestion::{CongestionLevel, CongestionThresholds};
pub use detect::{
    BoundingBox, Detection, DetectionFilter, DetectionFrame, DetectionSource, FramePoll,
    JsonLinesSource, ThreadedSource, TrackId,
};
pub use ledger::{Observation, TrackLedger, TrackRecord};
pub use scheduler::{SchedulerState, SnapshotScheduler};
pub use sink::{
    Collector, DeliveryReport, FallbackLog, PersistPath, ReportingSink, SinkOptions, SubmitOutcome,
};
#[cfg(feature = "collector-http")]
pub use sink::HttpCollector;
pub use snapshot::{Obfuscator, SiteMetadata, Snapshot, SnapshotSequence};
pub use window::{RollingWindow, WindowSample};

// -------------------- Timestamps --------------------

const ONE_MINUTE: Duration = Duration::from_secs(60);

/// Wall-clock instant in milliseconds since the Unix epoch.
///
/// Ticks, window samples and track records all share this representation so
/// that replayed detection streams and live ones behave identically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    epoch_ms: u64,
}

impl Timestamp {
    pub fn now() -> Result<Self> {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
        Ok(Self::from_epoch_ms(elapsed.as_millis() as u64))
    }

    pub const fn from_epoch_ms(epoch_ms: u64) -> Self {
        Self { epoch_ms }
    }

    pub const fn from_epoch_s(epoch_s: u64) -> Self {
        Self {
            epoch_ms: epoch_s.saturating_mul(1000),
        }
    }

    pub fn epoch_ms(self) -> u64 {
        self.epoch_ms
    }

    pub fn epoch_s(self) -> u64 {
        self.epoch_ms / 1000
    }

    /// Round down to a multiple of `granularity`. A zero granularity is a no-op.
    pub fn floor_to(self, granularity: Duration) -> Self {
        let size = granularity.as_millis() as u64;
        if size == 0 {
            return self;
        }
        Self {
            epoch_ms: (self.epoch_ms / size) * size,
        }
    }

    pub fn minute_floor(self) -> Self {
        self.floor_to(ONE_MINUTE)
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self {
            epoch_ms: self.epoch_ms.saturating_sub(duration.as_millis() as u64),
        }
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Self {
            epoch_ms: self.epoch_ms.saturating_add(duration.as_millis() as u64),
        }
    }

    /// Elapsed time since `earlier`, zero when `earlier` is in the future.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.epoch_ms.saturating_sub(earlier.epoch_ms))
    }
}
