//! Refresh polling.
//!
//! Every (device, channel) pair moves through
//! `Idle → Due → Requested → Answered | TimedOut`. On each tick the scheduler
//! plans, per device, which enabled channels are due, whether a response
//! timeout must be armed, and at which stagger each refresh is sent. The
//! scheduler never sends anything itself; the manager executes the plan.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use hmbridge_core::{Device, PollOptions};

use crate::schema::DeviceSchema;

/// Poll state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    /// Never requested
    Idle,
    /// Interval elapsed, waiting for the next tick
    Due,
    Requested,
    Answered,
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
struct ChannelRecord {
    last_request: Instant,
    phase: ChannelPhase,
}

/// One refresh to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub channel: String,
    pub payload: String,
    /// Stagger relative to the tick
    pub delay: Duration,
}

/// Everything to do for one device in one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePoll {
    pub device: Device,
    /// Arm a response timeout before sending
    pub arm_timeout: bool,
    pub requests: Vec<RefreshRequest>,
}

/// Poll scheduler.
pub struct PollScheduler {
    default_interval: Duration,
    spacing: Duration,
    options: PollOptions,
    records: Mutex<HashMap<(Device, String), ChannelRecord>>,
}

impl PollScheduler {
    pub fn new(default_interval: Duration, spacing: Duration, options: PollOptions) -> Self {
        Self {
            default_interval,
            spacing,
            options,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Current phase of a channel.
    pub fn phase(&self, device: &Device, channel: &str, interval: Duration, now: Instant) -> ChannelPhase {
        let records = self.records.lock();
        match records.get(&(device.clone(), channel.to_string())) {
            None => ChannelPhase::Idle,
            Some(record) if is_elapsed(record.last_request, interval, now) => ChannelPhase::Due,
            Some(record) => record.phase,
        }
    }

    /// Plan the refreshes of one device and record them as requested.
    pub fn plan(&self, device: &Device, schema: &DeviceSchema, now: Instant) -> Option<DevicePoll> {
        let mut records = self.records.lock();
        let mut arm_timeout = false;
        let mut requests = Vec::new();

        for channel in schema.channels.iter().filter(|c| c.is_enabled(&self.options)) {
            let key = (device.clone(), channel.key.clone());
            let interval = channel.interval(self.default_interval);
            let due = records
                .get(&key)
                .map_or(true, |record| is_elapsed(record.last_request, interval, now));
            if !due {
                continue;
            }

            arm_timeout |= channel.controls_availability;
            requests.push(RefreshRequest {
                channel: channel.key.clone(),
                payload: channel.refresh_payload.clone(),
                delay: self.spacing.saturating_mul(requests.len() as u32),
            });
            records.insert(
                key,
                ChannelRecord {
                    last_request: now,
                    phase: ChannelPhase::Requested,
                },
            );
        }

        if requests.is_empty() {
            return None;
        }
        Some(DevicePoll {
            device: device.clone(),
            arm_timeout,
            requests,
        })
    }

    pub fn mark_answered(&self, device: &Device, channel: &str) {
        self.set_phase(device, channel, ChannelPhase::Answered);
    }

    /// Mark every still-requested channel of a device as timed out.
    pub fn mark_timed_out(&self, device: &Device) {
        let mut records = self.records.lock();
        for ((d, _), record) in records.iter_mut() {
            if d == device && record.phase == ChannelPhase::Requested {
                record.phase = ChannelPhase::TimedOut;
            }
        }
    }

    fn set_phase(&self, device: &Device, channel: &str, phase: ChannelPhase) {
        if let Some(record) = self.records.lock().get_mut(&(device.clone(), channel.to_string())) {
            record.phase = phase;
        }
    }

    /// Tick period for a set of schemas: the GCD of every enabled channel's
    /// interval, at millisecond resolution.
    pub fn tick_period<'a>(&self, schemas: impl IntoIterator<Item = &'a DeviceSchema>) -> Duration {
        let intervals = schemas.into_iter().flat_map(|schema| {
            schema
                .channels
                .iter()
                .filter(|c| c.is_enabled(&self.options))
                .map(|c| c.interval(self.default_interval))
        });
        gcd_period(intervals).unwrap_or(self.default_interval)
    }
}

fn is_elapsed(last: Instant, interval: Duration, now: Instant) -> bool {
    now.saturating_duration_since(last) >= interval
}

fn gcd(a: u128, b: u128) -> u128 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// GCD of a set of durations in whole milliseconds. `None` if empty or all zero.
pub fn gcd_period(intervals: impl IntoIterator<Item = Duration>) -> Option<Duration> {
    let millis = intervals
        .into_iter()
        .map(|d| d.as_millis())
        .filter(|ms| *ms > 0)
        .fold(0u128, gcd);
    (millis > 0).then(|| Duration::from_millis(millis as u64))
}
