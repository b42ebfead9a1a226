//! Track lifecycle bookkeeping.
//!
//! The ledger remembers when each tracker identity was first and last seen.
//! Short tracker dropouts (occlusion, missed frames) are debounced: a track
//! that reappears within the re-entry grace period continues its previous
//! lifetime instead of counting as a new visit.

use std::collections::HashMap;
use std::time::Duration;

use crate::detect::TrackId;
use crate::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackRecord {
    pub track_id: TrackId,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

/// What a single `observe` call did to the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// First sighting, or a reappearance after the grace period elapsed.
    NewLifetime,
    /// Sighting within the grace period of the previous one.
    Continued,
}

#[derive(Debug)]
pub struct TrackLedger {
    reentry_grace: Duration,
    records: HashMap<TrackId, TrackRecord>,
}

impl TrackLedger {
    pub fn new(reentry_grace: Duration) -> Self {
        Self {
            reentry_grace,
            records: HashMap::new(),
        }
    }

    pub fn reentry_grace(&self) -> Duration {
        self.reentry_grace
    }

    /// Record that `track_id` was visible at `at`.
    ///
    /// A gap strictly longer than the grace period starts a new lifetime
    /// (`first_seen` reset). Out-of-order sightings never move `last_seen`
    /// backwards.
    pub fn observe(&mut self, track_id: TrackId, at: Timestamp) -> Observation {
        match self.records.get_mut(&track_id) {
            Some(record) if at.duration_since(record.last_seen) <= self.reentry_grace => {
                record.last_seen = record.last_seen.max(at);
                Observation::Continued
            }
            Some(record) => {
                record.first_seen = at;
                record.last_seen = at;
                Observation::NewLifetime
            }
            None => {
                self.records.insert(
                    track_id,
                    TrackRecord {
                        track_id,
                        first_seen: at,
                        last_seen: at,
                    },
                );
                Observation::NewLifetime
            }
        }
    }

    /// Drop every record last seen strictly before `before`. Returns how many went.
    pub fn evict(&mut self, before: Timestamp) -> usize {
        let start = self.records.len();
        self.records.retain(|_, record| record.last_seen >= before);
        start - self.records.len()
    }

    /// Number of tracks seen at or after `since`.
    pub fn unique_count_since(&self, since: Timestamp) -> usize {
        self.records
            .values()
            .filter(|record| record.last_seen >= since)
            .count()
    }

    pub fn get(&self, track_id: TrackId) -> Option<&TrackRecord> {
        self.records.get(&track_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const GRACE: Duration = Duration::from_secs(45);

    fn at(secs: u64) -> Timestamp {
        Timestamp::from_epoch_s(1_700_000_000 + secs)
    }

    #[test]
    fn first_sighting_opens_a_lifetime() {
        let mut ledger = TrackLedger::new(GRACE);
        assert_eq!(ledger.observe(TrackId::new(1), at(0)), Observation::NewLifetime);
        let record = ledger.get(TrackId::new(1)).unwrap();
        assert_eq!(record.first_seen, at(0));
        assert_eq!(record.last_seen, at(0));
    }

    #[test]
    fn reappearance_within_grace_keeps_first_seen() {
        let mut ledger = TrackLedger::new(GRACE);
        ledger.observe(TrackId::new(1), at(0));
        assert_eq!(ledger.observe(TrackId::new(1), at(30)), Observation::Continued);
        assert_eq!(ledger.observe(TrackId::new(1), at(75)), Observation::Continued);
        let record = ledger.get(TrackId::new(1)).unwrap();
        assert_eq!(record.first_seen, at(0));
        assert_eq!(record.last_seen, at(75));
    }

    #[test]
    fn gap_exactly_at_grace_is_continuous() {
        let mut ledger = TrackLedger::new(GRACE);
        ledger.observe(TrackId::new(1), at(0));
        assert_eq!(ledger.observe(TrackId::new(1), at(45)), Observation::Continued);
    }

    #[test]
    fn reappearance_after_grace_starts_new_lifetime() {
        let mut ledger = TrackLedger::new(GRACE);
        ledger.observe(TrackId::new(1), at(0));
        assert_eq!(ledger.observe(TrackId::new(1), at(46)), Observation::NewLifetime);
        let record = ledger.get(TrackId::new(1)).unwrap();
        assert_eq!(record.first_seen, at(46));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn late_sighting_does_not_rewind_last_seen() {
        let mut ledger = TrackLedger::new(GRACE);
        ledger.observe(TrackId::new(1), at(10));
        ledger.observe(TrackId::new(1), at(5));
        let record = ledger.get(TrackId::new(1)).unwrap();
        assert_eq!(record.last_seen, at(10));
        assert!(record.first_seen <= record.last_seen);
    }

    #[test]
    fn evict_removes_only_stale_records() {
        let mut ledger = TrackLedger::new(GRACE);
        ledger.observe(TrackId::new(1), at(0));
        ledger.observe(TrackId::new(2), at(100));
        ledger.observe(TrackId::new(3), at(200));

        assert_eq!(ledger.evict(at(100)), 1);
        assert!(ledger.get(TrackId::new(1)).is_none());
        assert!(ledger.get(TrackId::new(2)).is_some());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn unique_count_since_uses_last_seen() {
        let mut ledger = TrackLedger::new(GRACE);
        ledger.observe(TrackId::new(1), at(0));
        ledger.observe(TrackId::new(2), at(50));
        ledger.observe(TrackId::new(2), at(60));
        ledger.observe(TrackId::new(3), at(90));

        assert_eq!(ledger.unique_count_since(at(0)), 3);
        assert_eq!(ledger.unique_count_since(at(55)), 2);
        assert_eq!(ledger.unique_count_since(at(91)), 0);
    }

    #[test]
    fn first_seen_only_moves_after_a_gap_longer_than_grace() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut ledger = TrackLedger::new(GRACE);
        let mut now = 0u64;
        let mut previous: HashMap<TrackId, TrackRecord> = HashMap::new();

        for _ in 0..5_000 {
            now += rng.gen_range(0..20);
            let id = TrackId::new(rng.gen_range(0..6));
            ledger.observe(id, at(now));
            let record = *ledger.get(id).unwrap();
            assert!(record.first_seen <= record.last_seen);

            if let Some(prev) = previous.get(&id) {
                let gap = at(now).duration_since(prev.last_seen);
                if gap <= GRACE {
                    assert_eq!(record.first_seen, prev.first_seen);
                } else {
                    assert_eq!(record.first_seen, at(now));
                }
            }
            previous.insert(id, record);
        }
    }
}
