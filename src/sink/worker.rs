use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::collector::{Collector, SubmitOutcome};
use super::fallback::FallbackLog;
use crate::snapshot::Snapshot;

/// Where a snapshot ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistPath {
    Delivered,
    Fallback,
    /// Delivery failed and the fallback write failed too.
    Lost,
}

#[derive(Clone, Debug)]
pub struct DeliveryReport {
    pub snapshot_id: u64,
    pub emitted_at: u64,
    pub outcome: SubmitOutcome,
    pub path: PersistPath,
}

#[derive(Clone, Debug)]
pub struct SinkOptions {
    /// Longest a dispatch waits for the previous submission to settle.
    pub handoff_timeout: Duration,
    /// Longest shutdown waits for the worker before flushing leftovers itself.
    pub shutdown_grace: Duration,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            handoff_timeout: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(12),
        }
    }
}

impl SinkOptions {
    /// Shutdown grace covering one full network timeout plus a small margin.
    pub fn for_network_timeout(timeout: Duration) -> Self {
        Self {
            shutdown_grace: timeout + Duration::from_secs(2),
            ..Self::default()
        }
    }
}

struct SinkShared {
    fallback: Mutex<FallbackLog>,
    /// Snapshot ids whose persistence path has been decided.
    settled: Mutex<HashSet<u64>>,
    draining: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SinkShared {
    fn claim(&self, snapshot_id: u64) -> bool {
        lock(&self.settled).insert(snapshot_id)
    }

    fn write_fallback(&self, snapshot: &Snapshot) -> PersistPath {
        let fallback = lock(&self.fallback);
        match fallback.append(snapshot) {
            Ok(()) => PersistPath::Fallback,
            Err(e) => {
                log::error!(
                    "snapshot {} lost: fallback write to {} failed: {:#}",
                    snapshot.id,
                    fallback.path().display(),
                    e
                );
                PersistPath::Lost
            }
        }
    }

    /// Decide the single persistence path for a finished submission.
    fn settle(&self, snapshot: &Snapshot, outcome: SubmitOutcome) -> DeliveryReport {
        let path = if !self.claim(snapshot.id) {
            if outcome.delivered {
                log::warn!(
                    "snapshot {} reached the collector after it was already flushed to fallback",
                    snapshot.id
                );
            }
            PersistPath::Fallback
        } else if outcome.delivered {
            PersistPath::Delivered
        } else {
            self.write_fallback(snapshot)
        };
        DeliveryReport {
            snapshot_id: snapshot.id,
            emitted_at: snapshot.emitted_at,
            outcome,
            path,
        }
    }
}

/// Delivers snapshots on a background thread so a slow collector never
/// stalls the detection loop.
///
/// Every dispatched snapshot settles exactly once: either the collector
/// accepted it, or it was appended to the fallback log.
pub struct ReportingSink {
    jobs: Option<Sender<Snapshot>>,
    reports: Receiver<DeliveryReport>,
    shared: Arc<SinkShared>,
    join: Option<JoinHandle<()>>,
    pending: BTreeMap<u64, Snapshot>,
    options: SinkOptions,
}

impl ReportingSink {
    pub fn spawn(
        collector: Box<dyn Collector>,
        fallback: FallbackLog,
        options: SinkOptions,
    ) -> Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<Snapshot>();
        let (report_tx, report_rx) = mpsc::channel::<DeliveryReport>();
        let shared = Arc::new(SinkShared {
            fallback: Mutex::new(fallback),
            settled: Mutex::new(HashSet::new()),
            draining: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let join = std::thread::Builder::new()
            .name("pathguard-sink".into())
            .spawn(move || run_worker(collector, job_rx, report_tx, worker_shared))
            .context("spawn reporting sink worker")?;

        Ok(Self {
            jobs: Some(job_tx),
            reports: report_rx,
            shared,
            join: Some(join),
            pending: BTreeMap::new(),
            options,
        })
    }

    /// Snapshots handed to the worker and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Hand a snapshot to the worker.
    ///
    /// Waits at most `handoff_timeout` for earlier submissions; a submission
    /// still running after that keeps going on its own and settles later.
    pub fn dispatch(&mut self, snapshot: Snapshot) -> Vec<DeliveryReport> {
        let mut reports = self.poll_reports();
        if !self.pending.is_empty() {
            reports.extend(self.wait_for_reports(self.options.handoff_timeout));
            if !self.pending.is_empty() {
                log::warn!(
                    "{} earlier snapshot(s) still being submitted; not waiting for them",
                    self.pending.len()
                );
            }
        }

        self.pending.insert(snapshot.id, snapshot.clone());
        let undelivered = match &self.jobs {
            Some(jobs) => jobs.send(snapshot).err().map(|err| err.0),
            None => Some(snapshot),
        };
        if let Some(snapshot) = undelivered {
            log::error!(
                "reporting worker unavailable; writing snapshot {} to fallback",
                snapshot.id
            );
            reports.extend(self.flush_owned(&snapshot, "reporting worker unavailable"));
        }
        reports
    }

    /// Collect reports for submissions that have settled since the last call.
    pub fn poll_reports(&mut self) -> Vec<DeliveryReport> {
        let mut reports = Vec::new();
        while let Ok(report) = self.reports.try_recv() {
            self.pending.remove(&report.snapshot_id);
            reports.push(report);
        }
        reports
    }

    fn wait_for_reports(&mut self, timeout: Duration) -> Vec<DeliveryReport> {
        let deadline = Instant::now() + timeout;
        let mut reports = Vec::new();
        while !self.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.reports.recv_timeout(remaining) {
                Ok(report) => {
                    self.pending.remove(&report.snapshot_id);
                    reports.push(report);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        reports
    }

    fn flush_owned(&mut self, snapshot: &Snapshot, reason: &str) -> Option<DeliveryReport> {
        self.pending.remove(&snapshot.id);
        if !self.shared.claim(snapshot.id) {
            return None;
        }
        Some(DeliveryReport {
            snapshot_id: snapshot.id,
            emitted_at: snapshot.emitted_at,
            outcome: SubmitOutcome::failed(reason),
            path: self.shared.write_fallback(snapshot),
        })
    }

    fn finish(&mut self) -> Vec<DeliveryReport> {
        self.shared.draining.store(true, Ordering::SeqCst);
        drop(self.jobs.take());

        let mut reports = self.poll_reports();
        reports.extend(self.wait_for_reports(self.options.shutdown_grace));

        let leftovers: Vec<Snapshot> = std::mem::take(&mut self.pending).into_values().collect();
        for snapshot in leftovers {
            log::warn!(
                "snapshot {} not settled before shutdown; flushing to fallback",
                snapshot.id
            );
            reports.extend(self.flush_owned(&snapshot, "not confirmed before shutdown"));
        }

        if let Some(join) = self.join.take() {
            if join.is_finished() {
                if join.join().is_err() {
                    log::error!("reporting worker panicked");
                }
            } else {
                log::warn!("reporting worker still busy at shutdown; detaching it");
            }
        }
        reports
    }

    /// Stop accepting snapshots, drain the queue and flush anything unsettled.
    ///
    /// Queued snapshots skip delivery and go straight to fallback; the one in
    /// flight gets up to `shutdown_grace` to finish.
    pub fn shutdown(mut self) -> Vec<DeliveryReport> {
        self.finish()
    }
}

impl Drop for ReportingSink {
    fn drop(&mut self) {
        if self.jobs.is_some() {
            for report in self.finish() {
                log::info!(
                    "snapshot {} settled at drop: {:?}",
                    report.snapshot_id,
                    report.path
                );
            }
        }
    }
}

fn run_worker(
    mut collector: Box<dyn Collector>,
    jobs: Receiver<Snapshot>,
    reports: Sender<DeliveryReport>,
    shared: Arc<SinkShared>,
) {
    log::debug!("reporting worker started for {}", collector.name());
    while let Ok(snapshot) = jobs.recv() {
        let outcome = if shared.draining.load(Ordering::SeqCst) {
            SubmitOutcome::failed("shutting down; delivery skipped")
        } else {
            collector.submit(&snapshot)
        };
        let report = shared.settle(&snapshot, outcome);
        // The receiver may be gone after shutdown; persistence already happened.
        let _ = reports.send(report);
    }
    log::debug!("reporting worker stopped");
}
