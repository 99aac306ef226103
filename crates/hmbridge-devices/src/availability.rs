//! Availability tracking.
//!
//! A device goes offline only after `threshold` consecutive response
//! timeouts, and comes back online on the first telegram received on an
//! availability-controlling channel. Each armed timeout is retired exactly
//! once: by [`AvailabilityTracker::expire`] or by a response, whichever comes
//! first. A late expiry of an already retired timeout is ignored.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use hmbridge_core::Device;

/// Handle of an armed response timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(u64);

/// A change in reported availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityChange {
    Online,
    Offline,
}

impl AvailabilityChange {
    /// Retained payload on the availability topic.
    pub fn payload(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

/// What an expiring timeout did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Already retired by a response or an earlier expiry
    Stale,
    /// Counted as a miss
    Missed,
    /// Counted as a miss that crossed the threshold
    Offline,
}

impl TimeoutOutcome {
    pub fn change(&self) -> Option<AvailabilityChange> {
        match self {
            Self::Offline => Some(AvailabilityChange::Offline),
            Self::Stale | Self::Missed => None,
        }
    }
}

#[derive(Debug, Default)]
struct TimeoutRecord {
    outstanding: HashSet<TimeoutId>,
    misses: u32,
    /// Last reported availability, `None` before the first report
    online: Option<bool>,
}

/// Per-device timeout bookkeeping.
pub struct AvailabilityTracker {
    threshold: u32,
    next_id: AtomicU64,
    records: Mutex<HashMap<Device, TimeoutRecord>>,
}

impl AvailabilityTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            next_id: AtomicU64::new(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Arm a response timeout.
    pub fn arm(&self, device: &Device) -> TimeoutId {
        let id = TimeoutId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records
            .lock()
            .entry(device.clone())
            .or_default()
            .outstanding
            .insert(id);
        id
    }

    /// A timeout fired. Only an outstanding id counts as a miss.
    pub fn expire(&self, device: &Device, id: TimeoutId) -> TimeoutOutcome {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(device) else {
            return TimeoutOutcome::Stale;
        };
        if !record.outstanding.remove(&id) {
            return TimeoutOutcome::Stale;
        }

        record.misses = record.misses.saturating_add(1);
        if record.misses >= self.threshold && record.online != Some(false) {
            record.online = Some(false);
            return TimeoutOutcome::Offline;
        }
        TimeoutOutcome::Missed
    }

    /// A qualifying response arrived: reset the miss counter and retire all
    /// outstanding timeouts. Returns `Online` unless already online.
    pub fn record_response(&self, device: &Device) -> Option<AvailabilityChange> {
        let mut records = self.records.lock();
        let record = records.entry(device.clone()).or_default();
        record.outstanding.clear();
        record.misses = 0;
        if record.online == Some(true) {
            return None;
        }
        record.online = Some(true);
        Some(AvailabilityChange::Online)
    }

    pub fn misses(&self, device: &Device) -> u32 {
        self.records.lock().get(device).map_or(0, |r| r.misses)
    }

    pub fn outstanding(&self, device: &Device) -> usize {
        self.records.lock().get(device).map_or(0, |r| r.outstanding.len())
    }

    pub fn is_online(&self, device: &Device) -> bool {
        self.records.lock().get(device).is_some_and(|r| r.online == Some(true))
    }

    pub fn is_offline(&self, device: &Device) -> bool {
        self.records.lock().get(device).is_some_and(|r| r.online == Some(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_offline_after_threshold() {
        let tracker = AvailabilityTracker::new(3);
        let device = Device::new("HMA-1", "abc");

        for _ in 0..2 {
            let id = tracker.arm(&device);
            assert_eq!(tracker.expire(&device, id), TimeoutOutcome::Missed);
        }
        assert!(!tracker.is_offline(&device));

        let id = tracker.arm(&device);
        let outcome = tracker.expire(&device, id);
        assert_eq!(outcome, TimeoutOutcome::Offline);
        assert_eq!(outcome.change(), Some(AvailabilityChange::Offline));
        assert!(tracker.is_offline(&device));

        // Further misses do not report again.
        let id = tracker.arm(&device);
        assert_eq!(tracker.expire(&device, id), TimeoutOutcome::Missed);
        assert_eq!(tracker.misses(&device), 4);
    }

    #[test]
    fn test_response_resets_and_retires() {
        let tracker = AvailabilityTracker::new(2);
        let device = Device::new("HMA-1", "abc");

        let first = tracker.arm(&device);
        assert_eq!(tracker.expire(&device, first), TimeoutOutcome::Missed);
        let second = tracker.arm(&device);
        assert_eq!(tracker.record_response(&device), Some(AvailabilityChange::Online));
        assert_eq!(tracker.misses(&device), 0);
        assert_eq!(tracker.outstanding(&device), 0);

        // Late expiry of a retired timeout is a no-op.
        assert_eq!(tracker.expire(&device, second), TimeoutOutcome::Stale);
        assert_eq!(tracker.misses(&device), 0);
        assert_eq!(tracker.record_response(&device), None);
    }

    #[test]
    fn test_double_expire_is_idempotent() {
        let tracker = AvailabilityTracker::new(1);
        let device = Device::new("HMA-1", "abc");
        let id = tracker.arm(&device);
        assert_eq!(tracker.expire(&device, id), TimeoutOutcome::Offline);
        assert_eq!(tracker.expire(&device, id), TimeoutOutcome::Stale);
        assert_eq!(tracker.misses(&device), 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Miss,
        Response,
        LateExpiry,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![Just(Step::Miss), Just(Step::Response), Just(Step::LateExpiry)]
    }

    proptest! {
        #[test]
        fn prop_offline_iff_threshold_consecutive_misses(
            threshold in 1u32..6,
            steps in proptest::collection::vec(step(), 0..100)
        ) {
            let tracker = AvailabilityTracker::new(threshold);
            let device = Device::new("HMA-1", "abc");
            let mut consecutive = 0u32;
            let mut retired = Vec::new();

            for step in steps {
                match step {
                    Step::Miss => {
                        let id = tracker.arm(&device);
                        tracker.expire(&device, id);
                        retired.push(id);
                        consecutive += 1;
                    }
                    Step::Response => {
                        retired.push(tracker.arm(&device));
                        tracker.record_response(&device);
                        consecutive = 0;
                    }
                    Step::LateExpiry => {
                        if let Some(id) = retired.last() {
                            tracker.expire(&device, *id);
                        }
                    }
                }
                prop_assert_eq!(tracker.is_offline(&device), consecutive >= threshold);
                prop_assert_eq!(tracker.misses(&device), consecutive);
            }
        }
    }
}
