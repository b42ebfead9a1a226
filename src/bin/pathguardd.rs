//! pathguardd - people-counting aggregation daemon
//!
//! This daemon:
//! 1. Reads tracked person detections as JSON lines (stdin or a file)
//! 2. Maintains the track ledger and the 5/30 minute rolling windows
//! 3. Emits one congestion snapshot per reporting interval
//! 4. Posts snapshots to the collector, falling back to a local CSV log

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pathguard_counter::{
    config::AggregatorConfig, Aggregator, DetectionSource, FallbackLog, HttpCollector,
    JsonLinesSource, ReportingSink, SinkOptions, SnapshotSequence, ThreadedSource, Timestamp,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Aggregate tracked person detections into congestion snapshots")]
struct Args {
    /// JSON or TOML config file. Environment variables override its values.
    #[arg(long, env = "PATHGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Detection input: a JSON-lines file, or "-" for stdin.
    #[arg(long, default_value = "-")]
    input: String,

    /// Seconds between health log lines.
    #[arg(long, env = "PATHGUARD_HEALTH_INTERVAL_SECS", default_value_t = 30)]
    health_interval_secs: u64,

    /// Longest the loop waits for a frame before rechecking for shutdown.
    #[arg(long, default_value_t = 250)]
    poll_interval_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = AggregatorConfig::load_from(args.config.as_deref())?;

    log::info!("camera stream {}", cfg.camera.stream_url());
    log::info!(
        "detection: confidence >= {:.2}, iou <= {:.2}, class {}",
        cfg.detection.min_confidence,
        cfg.detection.iou_threshold,
        cfg.detection.class_id
    );
    log::info!(
        "windows {}s/{}s, reentry grace {}s, reporting every {}s",
        cfg.windows.short.as_secs(),
        cfg.windows.long.as_secs(),
        cfg.reentry_grace.as_secs(),
        cfg.reporting.interval.as_secs()
    );
    match &cfg.reporting.collector_url {
        Some(url) => log::info!("collector {}", url),
        None => log::warn!(
            "no collector configured; every snapshot goes to {}",
            cfg.reporting.fallback_path.display()
        ),
    }

    let fallback = FallbackLog::open(cfg.reporting.fallback_path.clone())?;
    let collector = HttpCollector::new(
        cfg.reporting.collector_url.clone(),
        cfg.reporting.api_key.clone(),
        cfg.reporting.timeout,
    );
    let mut sink = ReportingSink::spawn(
        Box::new(collector),
        fallback,
        SinkOptions::for_network_timeout(cfg.reporting.timeout),
    )?;

    let sequence = match &cfg.reporting.counter_path {
        Some(path) => SnapshotSequence::open(path),
        None => SnapshotSequence::in_memory(),
    };
    log::info!("snapshot ids resume after {}", sequence.last());

    let mut aggregator = Aggregator::new(&cfg, Timestamp::now()?, sequence)?
        .with_health_interval(Duration::from_secs(args.health_interval_secs.max(1)));

    // Reading happens on its own thread so Ctrl-C is honoured while the input is quiet.
    let poll_interval = Duration::from_millis(args.poll_interval_ms.max(1));
    let mut source = if args.input == "-" {
        let stdin = JsonLinesSource::new("stdin", BufReader::new(std::io::stdin()));
        ThreadedSource::spawn(stdin, poll_interval)?
    } else {
        let file = File::open(&args.input).with_context(|| format!("open {}", args.input))?;
        let replay = JsonLinesSource::new(args.input.clone(), BufReader::new(file));
        ThreadedSource::spawn(replay, poll_interval)?
    };

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("pathguardd reading detections from {}", source.name());
    aggregator.run(&mut source, &mut sink, &stop);

    log::info!("shutting down reporting sink...");
    for report in sink.shutdown() {
        aggregator.record_report(&report);
    }

    let stats = aggregator.stats();
    log::info!(
        "pathguardd stopped: ticks={} skipped={} snapshots={} delivered={} fallback={} lost={}",
        stats.ticks,
        stats.skipped_ticks,
        stats.snapshots,
        stats.delivered,
        stats.fallback,
        stats.lost
    );
    Ok(())
}
