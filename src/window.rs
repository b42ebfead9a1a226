//! Rolling time windows of instantaneous counts.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::time::Duration;

use crate::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSample {
    pub at: Timestamp,
    pub count: u32,
}

/// Fixed-duration sliding window.
///
/// Samples must arrive in non-decreasing timestamp order, which keeps
/// eviction at the front amortized O(1). A running sum makes `average` O(1).
#[derive(Debug)]
pub struct RollingWindow {
    duration: Duration,
    samples: VecDeque<WindowSample>,
    sum: u64,
}

impl RollingWindow {
    pub fn new(duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Err(anyhow!("rolling window duration must be greater than zero"));
        }
        Ok(Self {
            duration,
            samples: VecDeque::new(),
            sum: 0,
        })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Append a sample and evict everything older than `at - duration`.
    pub fn push(&mut self, at: Timestamp, count: u32) -> Result<()> {
        if let Some(last) = self.samples.back() {
            if at < last.at {
                return Err(anyhow!(
                    "out-of-order window sample: {} ms is before {} ms",
                    at.epoch_ms(),
                    last.at.epoch_ms()
                ));
            }
        }
        self.samples.push_back(WindowSample { at, count });
        self.sum += u64::from(count);
        self.evict_before(at.saturating_sub(self.duration));
        Ok(())
    }

    fn evict_before(&mut self, cutoff: Timestamp) {
        while let Some(front) = self.samples.front() {
            if front.at >= cutoff {
                break;
            }
            self.sum -= u64::from(front.count);
            self.samples.pop_front();
        }
    }

    /// Mean of the retained counts; `0.0` for an empty window.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum as f64 / self.samples.len() as f64
    }

    pub fn peak(&self) -> u32 {
        self.samples.iter().map(|s| s.count).max().unwrap_or(0)
    }

    pub fn oldest(&self) -> Option<Timestamp> {
        self.samples.front().map(|s| s.at)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> Timestamp {
        Timestamp::from_epoch_s(1_700_000_000 + secs)
    }

    #[test]
    fn zero_duration_is_rejected() {
        let err = RollingWindow::new(Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn empty_window_averages_to_zero() {
        let window = RollingWindow::new(Duration::from_secs(300)).unwrap();
        assert_eq!(window.average(), 0.0);
        assert_eq!(window.peak(), 0);
    }

    #[test]
    fn average_is_arithmetic_mean_of_retained_samples() {
        let mut window = RollingWindow::new(Duration::from_secs(300)).unwrap();
        let counts = [0u32, 0, 1, 2, 2, 3, 5, 5, 0];
        for (i, count) in counts.iter().enumerate() {
            window.push(at(i as u64), *count).unwrap();
        }
        let expected = counts.iter().sum::<u32>() as f64 / counts.len() as f64;
        assert!((window.average() - expected).abs() < 1e-12);
        assert_eq!(window.len(), counts.len());
        assert_eq!(window.peak(), 5);
    }

    #[test]
    fn samples_older_than_duration_are_evicted() {
        let mut window = RollingWindow::new(Duration::from_secs(10)).unwrap();
        window.push(at(0), 10).unwrap();
        window.push(at(5), 2).unwrap();
        window.push(at(10), 4).unwrap();
        // cutoff is at(0): sample exactly on the edge stays
        assert_eq!(window.len(), 3);

        window.push(at(11), 6).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window.oldest(), Some(at(5)));
        assert!((window.average() - 4.0).abs() < 1e-12);

        window.push(at(100), 1).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window.average(), 1.0);
    }

    #[test]
    fn out_of_order_sample_is_rejected() {
        let mut window = RollingWindow::new(Duration::from_secs(10)).unwrap();
        window.push(at(5), 1).unwrap();
        assert!(window.push(at(4), 1).is_err());
        assert_eq!(window.len(), 1);
        window.push(at(5), 3).unwrap();
        assert_eq!(window.len(), 2);
    }
}
