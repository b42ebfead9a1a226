//! Minute-boundary snapshot scheduling.
//!
//! The scheduler is a two-state machine. In `Idle` it waits for the next
//! reporting boundary; once one has been crossed it moves to `DueNow` and
//! hands out the minute to emit for. The caller performs the emission and
//! calls [`SnapshotScheduler::mark_emitted`], which returns it to `Idle`.
//! Any number of ticks inside the same minute yields at most one emission.

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    DueNow { minute: Timestamp },
}

#[derive(Debug)]
pub struct SnapshotScheduler {
    interval: Duration,
    state: SchedulerState,
    last_emitted_minute: Timestamp,
}

impl SnapshotScheduler {
    /// Start idle, with the last emission placed one second before the
    /// current minute so the first boundary crossed after `started_at` emits.
    pub fn new(interval: Duration, started_at: Timestamp) -> Result<Self> {
        if interval.is_zero() {
            return Err(anyhow!("reporting interval must be greater than zero"));
        }
        Ok(Self {
            interval,
            state: SchedulerState::Idle,
            last_emitted_minute: started_at
                .minute_floor()
                .saturating_sub(Duration::from_secs(1)),
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_emitted_minute(&self) -> Timestamp {
        self.last_emitted_minute
    }

    /// Evaluate the tick at `now`. Returns the minute an emission is due for.
    ///
    /// While an emission is outstanding the same minute is returned again.
    pub fn poll(&mut self, now: Timestamp) -> Option<Timestamp> {
        if let SchedulerState::DueNow { minute } = self.state {
            return Some(minute);
        }
        let current_minute = now.minute_floor();
        if current_minute.duration_since(self.last_emitted_minute) >= self.interval {
            self.state = SchedulerState::DueNow {
                minute: current_minute,
            };
            return Some(current_minute);
        }
        None
    }

    /// Complete the outstanding emission. No-op when idle.
    pub fn mark_emitted(&mut self) {
        if let SchedulerState::DueNow { minute } = self.state {
            self.last_emitted_minute = minute;
            self.state = SchedulerState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_START: u64 = 1_700_000_040; // minute aligned

    fn at_ms(offset_ms: u64) -> Timestamp {
        Timestamp::from_epoch_ms(MINUTE_START * 1000 + offset_ms)
    }

    fn emissions_for_ticks(ticks: u64) -> usize {
        let mut scheduler =
            SnapshotScheduler::new(Duration::from_secs(60), at_ms(0)).unwrap();
        let mut emitted = 0;
        // all ticks land inside the minute that follows the start minute
        for i in 0..ticks {
            let offset = 60_000 + i * 59_999 / ticks.max(1);
            if scheduler.poll(at_ms(offset)).is_some() {
                emitted += 1;
                scheduler.mark_emitted();
            }
        }
        emitted
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(SnapshotScheduler::new(Duration::ZERO, at_ms(0)).is_err());
    }

    #[test]
    fn no_emission_inside_start_minute() {
        let mut scheduler = SnapshotScheduler::new(Duration::from_secs(60), at_ms(0)).unwrap();
        for offset in (0..60_000).step_by(1_000) {
            assert!(scheduler.poll(at_ms(offset)).is_none());
        }
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn exactly_one_emission_per_minute_regardless_of_tick_rate() {
        assert_eq!(emissions_for_ticks(1), 1);
        assert_eq!(emissions_for_ticks(10), 1);
        assert_eq!(emissions_for_ticks(1000), 1);
    }

    #[test]
    fn due_state_holds_until_marked() {
        let mut scheduler = SnapshotScheduler::new(Duration::from_secs(60), at_ms(0)).unwrap();
        let minute = scheduler.poll(at_ms(61_000)).expect("boundary crossed");
        assert_eq!(minute, at_ms(60_000));
        assert_eq!(scheduler.state(), SchedulerState::DueNow { minute });
        assert_eq!(scheduler.poll(at_ms(62_000)), Some(minute));

        scheduler.mark_emitted();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.last_emitted_minute(), minute);
        assert!(scheduler.poll(at_ms(63_000)).is_none());
        assert_eq!(scheduler.poll(at_ms(120_000)), Some(at_ms(120_000)));
    }

    #[test]
    fn skipped_minutes_emit_once_on_resume() {
        let mut scheduler = SnapshotScheduler::new(Duration::from_secs(60), at_ms(0)).unwrap();
        assert_eq!(scheduler.poll(at_ms(600_500)), Some(at_ms(600_000)));
        scheduler.mark_emitted();
        assert!(scheduler.poll(at_ms(601_000)).is_none());
    }

    #[test]
    fn longer_interval_spaces_emissions() {
        let mut scheduler = SnapshotScheduler::new(Duration::from_secs(120), at_ms(0)).unwrap();
        assert!(scheduler.poll(at_ms(60_000)).is_none());
        assert_eq!(scheduler.poll(at_ms(120_000)), Some(at_ms(120_000)));
        scheduler.mark_emitted();
        assert!(scheduler.poll(at_ms(180_000)).is_none());
        assert!(scheduler.poll(at_ms(240_000)).is_some());
    }
}
