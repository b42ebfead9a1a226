//! The per-tick aggregation loop.
//!
//! One tick takes the detections of one processed frame and:
//! 1. refreshes the track ledger for every distinct track id
//! 2. pushes the instantaneous count into both rolling windows
//! 3. evicts tracks that fell out of the long window
//! 4. asks the scheduler whether a snapshot is due and, if so, builds it
//!
//! All state is owned by a single [`Aggregator`]; ticks are strictly
//! sequential so nothing here needs locking. Delivery happens off-thread in
//! the [`ReportingSink`].

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::AggregatorConfig;
use crate::congestion::{CongestionLevel, CongestionThresholds};
use crate::detect::{
    Detection, DetectionFilter, DetectionFrame, DetectionSource, FramePoll, TrackId,
};
use crate::ledger::{Observation, TrackLedger};
use crate::scheduler::SnapshotScheduler;
use crate::sink::{DeliveryReport, PersistPath, ReportingSink};
use crate::snapshot::{Obfuscator, SiteMetadata, Snapshot, SnapshotSequence, SNAPSHOT_TYPE};
use crate::window::RollingWindow;
use crate::Timestamp;

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SOURCE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq)]
pub struct TickOutcome {
    pub at: Timestamp,
    pub instantaneous_count: u32,
    pub congestion_level: CongestionLevel,
    pub new_tracks: usize,
    pub evicted_tracks: usize,
    /// Set on the tick that crossed a reporting boundary.
    pub snapshot: Option<Snapshot>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub snapshots: u64,
    pub delivered: u64,
    pub fallback: u64,
    pub lost: u64,
}

pub struct Aggregator {
    ledger: TrackLedger,
    short_window: RollingWindow,
    long_window: RollingWindow,
    thresholds: CongestionThresholds,
    scheduler: SnapshotScheduler,
    filter: DetectionFilter,
    obfuscator: Obfuscator,
    sequence: SnapshotSequence,
    site: SiteMetadata,
    rng: StdRng,
    last_tick: Option<Timestamp>,
    stats: LoopStats,
    health_interval: Duration,
    source_retry_delay: Duration,
}

impl Aggregator {
    /// Build an aggregator from validated settings. `started_at` anchors the
    /// snapshot scheduler: the first boundary crossed after it emits.
    pub fn new(
        cfg: &AggregatorConfig,
        started_at: Timestamp,
        sequence: SnapshotSequence,
    ) -> Result<Self> {
        Ok(Self {
            ledger: TrackLedger::new(cfg.reentry_grace),
            short_window: RollingWindow::new(cfg.windows.short)?,
            long_window: RollingWindow::new(cfg.windows.long)?,
            thresholds: cfg.thresholds()?,
            scheduler: SnapshotScheduler::new(cfg.reporting.interval, started_at)?,
            filter: cfg.detection.clone(),
            obfuscator: Obfuscator::new(cfg.reporting.obfuscate),
            sequence,
            site: cfg.site.clone(),
            rng: StdRng::from_entropy(),
            last_tick: None,
            stats: LoopStats::default(),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            source_retry_delay: DEFAULT_SOURCE_RETRY_DELAY,
        })
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn with_source_retry_delay(mut self, delay: Duration) -> Self {
        self.source_retry_delay = delay;
        self
    }

    pub fn ledger(&self) -> &TrackLedger {
        &self.ledger
    }

    pub fn short_window(&self) -> &RollingWindow {
        &self.short_window
    }

    pub fn long_window(&self) -> &RollingWindow {
        &self.long_window
    }

    pub fn scheduler(&self) -> &SnapshotScheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Run one tick over already-filtered detections.
    ///
    /// An empty detection set is a valid tick with count zero. A timestamp
    /// earlier than the previous tick is clamped to it.
    pub fn tick(&mut self, detections: &[Detection], now: Timestamp) -> Result<TickOutcome> {
        let now = match self.last_tick {
            Some(last) if now < last => {
                log::debug!(
                    "tick at {} ms precedes previous tick {} ms; clamping",
                    now.epoch_ms(),
                    last.epoch_ms()
                );
                last
            }
            _ => now,
        };

        let track_ids: HashSet<TrackId> = detections.iter().map(|det| det.track_id).collect();
        let mut new_tracks = 0;
        for track_id in &track_ids {
            if self.ledger.observe(*track_id, now) == Observation::NewLifetime {
                new_tracks += 1;
            }
        }
        let instantaneous_count = u32::try_from(track_ids.len()).unwrap_or(u32::MAX);

        self.short_window.push(now, instantaneous_count)?;
        self.long_window.push(now, instantaneous_count)?;
        self.last_tick = Some(now);

        let retention_edge = now.saturating_sub(self.long_window.duration());
        let evicted_tracks = self.ledger.evict(retention_edge);

        let congestion_level = self.thresholds.classify(instantaneous_count);
        let snapshot = match self.scheduler.poll(now) {
            Some(minute) => {
                let snapshot = self.build_snapshot(minute, retention_edge, congestion_level);
                self.scheduler.mark_emitted();
                self.stats.snapshots += 1;
                Some(snapshot)
            }
            None => None,
        };

        self.stats.ticks += 1;
        log::debug!(
            "tick {}: count={} level={} new_tracks={} active_tracks={}",
            self.stats.ticks,
            instantaneous_count,
            congestion_level,
            new_tracks,
            self.ledger.len()
        );

        Ok(TickOutcome {
            at: now,
            instantaneous_count,
            congestion_level,
            new_tracks,
            evicted_tracks,
            snapshot,
        })
    }

    fn build_snapshot(
        &mut self,
        minute: Timestamp,
        retention_edge: Timestamp,
        congestion_level: CongestionLevel,
    ) -> Snapshot {
        let avg_short = self
            .obfuscator
            .apply(self.short_window.average(), &mut self.rng);
        let avg_long = self
            .obfuscator
            .apply(self.long_window.average(), &mut self.rng);
        Snapshot {
            id: self.sequence.next_id(),
            kind: SNAPSHOT_TYPE.to_string(),
            emitted_at: minute.epoch_s(),
            avg_count_short_window: avg_short,
            avg_count_long_window: avg_long,
            unique_count_long_window: self.ledger.unique_count_since(retention_edge) as u64,
            congestion_level,
            device_id: self.site.device_id.clone(),
            lat: self.site.lat,
            lng: self.site.lng,
        }
    }

    /// Stamp, filter and tick one frame from the detection source.
    pub fn process_frame(&mut self, frame: DetectionFrame) -> Result<TickOutcome> {
        let at = match frame.at {
            Some(at) => at,
            None => Timestamp::now()?,
        };
        let detections = self.filter.apply(frame.detections);
        self.tick(&detections, at)
    }

    /// Account for and log a settled snapshot.
    pub fn record_report(&mut self, report: &DeliveryReport) {
        match report.path {
            PersistPath::Delivered => self.stats.delivered += 1,
            PersistPath::Fallback => self.stats.fallback += 1,
            PersistPath::Lost => self.stats.lost += 1,
        }
        log::info!(
            "[summary] snapshot={} minute={} delivered={} path={:?} detail={}",
            report.snapshot_id,
            report.emitted_at,
            report.outcome.delivered,
            report.path,
            report.outcome.detail
        );
    }

    /// Drive ticks until the source ends or `stop` is raised.
    ///
    /// The stop flag is checked once per tick, or once per poll interval when
    /// the source is idle. Per-tick failures are logged
    /// and never end the loop. The caller owns the sink and shuts it down
    /// afterwards so unsettled snapshots reach the fallback log.
    pub fn run<S: DetectionSource + ?Sized>(
        &mut self,
        source: &mut S,
        sink: &mut ReportingSink,
        stop: &AtomicBool,
    ) -> LoopStats {
        let mut last_health_log = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            match source.poll_frame() {
                Ok(FramePoll::Ready(frame)) => match self.process_frame(frame) {
                    Ok(outcome) => {
                        if let Some(snapshot) = outcome.snapshot {
                            log::debug!(
                                "snapshot {} ready: {}",
                                snapshot.id,
                                snapshot.to_json().unwrap_or_default()
                            );
                            for report in sink.dispatch(snapshot) {
                                self.record_report(&report);
                            }
                        }
                    }
                    Err(e) => {
                        self.stats.skipped_ticks += 1;
                        log::warn!("tick skipped: {:#}", e);
                    }
                },
                Ok(FramePoll::Idle) => {}
                Ok(FramePoll::Ended) => {
                    log::info!("detection source {} ended", source.name());
                    break;
                }
                Err(e) => {
                    self.stats.skipped_ticks += 1;
                    log::warn!("detection source {}: {:#}", source.name(), e);
                    std::thread::sleep(self.source_retry_delay);
                }
            }

            for report in sink.poll_reports() {
                self.record_report(&report);
            }

            if last_health_log.elapsed() >= self.health_interval {
                log::info!(
                    "health: ticks={} skipped={} active_tracks={} snapshots={} in_flight={}",
                    self.stats.ticks,
                    self.stats.skipped_ticks,
                    self.ledger.len(),
                    self.stats.snapshots,
                    sink.in_flight()
                );
                last_health_log = Instant::now();
            }
        }
        if stop.load(Ordering::SeqCst) {
            log::info!("stop requested; leaving aggregation loop");
        }
        self.stats.clone()
    }
}
