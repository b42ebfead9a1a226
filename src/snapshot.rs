//! Periodic congestion snapshot: payload, sequence ids and value obfuscation.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::congestion::CongestionLevel;

pub const SNAPSHOT_TYPE: &str = "congestion";

/// Column order of the fallback CSV; identical to the JSON field order.
pub const SNAPSHOT_FIELDS: [&str; 10] = [
    "id",
    "type",
    "emitted_at",
    "avg_count_short_window",
    "avg_count_long_window",
    "unique_count_long_window",
    "congestion_level",
    "device_id",
    "lat",
    "lng",
];

/// Where the counter is installed. Attached verbatim to every snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct SiteMetadata {
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
}

/// One per-interval summary, delivered to the collector or written to the
/// fallback log, never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    /// Minute-aligned emission time, seconds since epoch.
    pub emitted_at: u64,
    pub avg_count_short_window: f64,
    pub avg_count_long_window: f64,
    pub unique_count_long_window: u64,
    pub congestion_level: CongestionLevel,
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize snapshot")
    }

    pub fn csv_fields(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.kind.clone(),
            self.emitted_at.to_string(),
            self.avg_count_short_window.to_string(),
            self.avg_count_long_window.to_string(),
            self.unique_count_long_window.to_string(),
            self.congestion_level.as_str().to_string(),
            self.device_id.clone(),
            self.lat.to_string(),
            self.lng.to_string(),
        ]
    }

    pub fn from_csv_fields(fields: &[String]) -> Result<Self> {
        if fields.len() != SNAPSHOT_FIELDS.len() {
            return Err(anyhow!(
                "snapshot row has {} fields, expected {}",
                fields.len(),
                SNAPSHOT_FIELDS.len()
            ));
        }
        let congestion_level = match fields[6].as_str() {
            "low" => CongestionLevel::Low,
            "med" => CongestionLevel::Medium,
            "high" => CongestionLevel::High,
            other => return Err(anyhow!("unknown congestion level '{}'", other)),
        };
        Ok(Self {
            id: fields[0].parse().context("snapshot id")?,
            kind: fields[1].clone(),
            emitted_at: fields[2].parse().context("snapshot emitted_at")?,
            avg_count_short_window: fields[3].parse().context("avg_count_short_window")?,
            avg_count_long_window: fields[4].parse().context("avg_count_long_window")?,
            unique_count_long_window: fields[5].parse().context("unique_count_long_window")?,
            congestion_level,
            device_id: fields[7].clone(),
            lat: fields[8].parse().context("snapshot lat")?,
            lng: fields[9].parse().context("snapshot lng")?,
        })
    }
}

// -------------------- Obfuscation --------------------

/// Bound on the uniform jitter added after half-unit rounding.
pub const OBFUSCATION_JITTER: f64 = 0.04;
const DEFAULT_DECIMALS: u32 = 2;

/// Precision reduction applied to window averages before they leave the device.
///
/// Enabled: round to the nearest 0.5, add jitter in
/// `[-OBFUSCATION_JITTER, OBFUSCATION_JITTER]`, clamp at zero. The result is
/// within 0.3 of the input. Disabled: plain rounding to two decimals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Obfuscator {
    enabled: bool,
    decimals: u32,
}

impl Obfuscator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            decimals: DEFAULT_DECIMALS,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn apply<R: Rng + ?Sized>(&self, value: f64, rng: &mut R) -> f64 {
        if !self.enabled {
            return round_to(value, self.decimals);
        }
        let half_unit = (value * 2.0).round() / 2.0;
        let jitter = rng.gen_range(-OBFUSCATION_JITTER..=OBFUSCATION_JITTER);
        round_to((half_unit + jitter).max(0.0), self.decimals)
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

// -------------------- Sequence ids --------------------

/// Monotonic snapshot ids that survive restarts when backed by a file.
#[derive(Debug)]
pub struct SnapshotSequence {
    path: Option<PathBuf>,
    last: u64,
}

impl SnapshotSequence {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            last: 0,
        }
    }

    /// Resume from the counter file. A missing or unreadable counter starts at zero.
    pub fn open(path: &Path) -> Self {
        let last = match std::fs::read_to_string(path) {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                log::warn!(
                    "snapshot counter {} is corrupt; restarting ids at 1",
                    path.display()
                );
                0
            }),
            Err(_) => 0,
        };
        Self {
            path: Some(path.to_path_buf()),
            last,
        }
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    /// Allocate the next id. A failure to persist the counter is logged, not fatal.
    pub fn next_id(&mut self) -> u64 {
        self.last += 1;
        if let Some(path) = &self.path {
            if let Err(e) = persist_counter(path, self.last) {
                log::warn!("snapshot counter not persisted: {:#}", e);
            }
        }
        self.last
    }
}

fn persist_counter(path: &Path, value: u64) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, value.to_string())
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample() -> Snapshot {
        Snapshot {
            id: 12,
            kind: SNAPSHOT_TYPE.to_string(),
            emitted_at: 1_700_000_040,
            avg_count_short_window: 2.17,
            avg_count_long_window: 1.5,
            unique_count_long_window: 9,
            congestion_level: CongestionLevel::Medium,
            device_id: "esp32cam-01".to_string(),
            lat: 51.0189,
            lng: -114.1594,
        }
    }

    #[test]
    fn json_fields_follow_wire_names() {
        let value: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        for field in SNAPSHOT_FIELDS {
            assert!(obj.contains_key(field), "missing {field}");
        }
        assert_eq!(obj.len(), SNAPSHOT_FIELDS.len());
        assert_eq!(obj["type"], "congestion");
        assert_eq!(obj["congestion_level"], "med");
    }

    #[test]
    fn csv_fields_parse_back() {
        let snap = sample();
        let parsed = Snapshot::from_csv_fields(&snap.csv_fields()).unwrap();
        assert_eq!(parsed, snap);
    }

    #[test]
    fn csv_row_with_wrong_arity_is_rejected() {
        let mut fields = sample().csv_fields();
        fields.pop();
        assert!(Snapshot::from_csv_fields(&fields).is_err());
    }

    #[test]
    fn disabled_obfuscation_rounds_to_two_decimals() {
        let mut rng = StdRng::seed_from_u64(1);
        let obf = Obfuscator::new(false);
        assert_eq!(obf.apply(2.16666, &mut rng), 2.17);
        assert_eq!(obf.apply(0.0, &mut rng), 0.0);
    }

    #[test]
    fn obfuscation_stays_close_and_non_negative() {
        let mut rng = StdRng::seed_from_u64(7);
        let obf = Obfuscator::new(true);
        for i in 0..=2000 {
            let value = i as f64 * 0.01;
            for _ in 0..5 {
                let out = obf.apply(value, &mut rng);
                assert!(out >= 0.0, "negative output for {value}");
                assert!((out - value).abs() <= 0.3 + 1e-9, "{out} too far from {value}");
            }
        }
    }

    #[test]
    fn sequence_resumes_from_counter_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".counter");

        let mut seq = SnapshotSequence::open(&path);
        assert_eq!(seq.next_id(), 1);
        assert_eq!(seq.next_id(), 2);

        let mut resumed = SnapshotSequence::open(&path);
        assert_eq!(resumed.last(), 2);
        assert_eq!(resumed.next_id(), 3);
    }

    #[test]
    fn corrupt_counter_restarts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".counter");
        std::fs::write(&path, "not-a-number").unwrap();
        let mut seq = SnapshotSequence::open(&path);
        assert_eq!(seq.next_id(), 1);
    }
}
