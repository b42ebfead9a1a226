use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Categorical occupancy level, ordered `Low < Medium < High`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CongestionLevel {
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "med")]
    Medium,
    #[serde(rename = "high")]
    High,
}

impl CongestionLevel {
    /// Wire value, shared by the collector payload and the fallback CSV.
    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionLevel::Low => "low",
            CongestionLevel::Medium => "med",
            CongestionLevel::High => "high",
        }
    }
}

impl std::fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive upper bounds for the `low` and `medium` levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CongestionThresholds {
    low_max: u32,
    medium_max: u32,
}

impl Default for CongestionThresholds {
    fn default() -> Self {
        Self {
            low_max: 1,
            medium_max: 3,
        }
    }
}

impl CongestionThresholds {
    pub fn new(low_max: u32, medium_max: u32) -> Result<Self> {
        if low_max >= medium_max {
            return Err(anyhow!(
                "congestion thresholds must be increasing (low_max={} medium_max={})",
                low_max,
                medium_max
            ));
        }
        Ok(Self {
            low_max,
            medium_max,
        })
    }

    pub fn low_max(&self) -> u32 {
        self.low_max
    }

    pub fn medium_max(&self) -> u32 {
        self.medium_max
    }

    pub fn classify(&self, count: u32) -> CongestionLevel {
        if count <= self.low_max {
            CongestionLevel::Low
        } else if count <= self.medium_max {
            CongestionLevel::Medium
        } else {
            CongestionLevel::High
        }
    }
}
