//! Per-address failure windows
//!
//! Each address keeps the timestamps of its recent failures, sorted. The
//! window ending at `t` is the closed interval `[t - findtime, t]`, so a
//! failure exactly `findtime` seconds old still counts.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

/// Longest window `chrono::Duration::seconds` accepts
const MAX_WINDOW_SECS: u64 = (i64::MAX / 1000) as u64;

#[derive(Debug)]
pub struct WindowCounter {
    findtime: Duration,
    entries: HashMap<IpAddr, VecDeque<DateTime<Utc>>>,
}

impl WindowCounter {
    pub fn new(findtime_secs: u64) -> Self {
        Self {
            findtime: Duration::seconds(findtime_secs.min(MAX_WINDOW_SECS) as i64),
            entries: HashMap::new(),
        }
    }

    pub fn findtime(&self) -> Duration {
        self.findtime
    }

    /// Oldest timestamp still inside the window ending at `t`. `None` when
    /// the window reaches back past the representable range.
    pub fn cutoff(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        t.checked_sub_signed(self.findtime)
    }

    /// Record a failure and return the count in the window ending at the
    /// newest recorded failure. Out-of-order timestamps are inserted in place.
    pub fn record(&mut self, ip: IpAddr, at: DateTime<Utc>) -> usize {
        let timestamps = self.entries.entry(ip).or_default();

        let pos = timestamps.partition_point(|t| *t <= at);
        timestamps.insert(pos, at);

        // Evict relative to the newest entry so a late event cannot revive
        // failures that already fell out of the window
        let findtime = self.findtime;
        if let Some(cutoff) = timestamps
            .back()
            .and_then(|newest| newest.checked_sub_signed(findtime))
        {
            while timestamps.front().is_some_and(|t| *t < cutoff) {
                timestamps.pop_front();
            }
        }

        timestamps.len()
    }

    /// Failures in `[now - findtime, now]`
    pub fn count(&self, ip: &IpAddr, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        self.entries
            .get(ip)
            .map(|ts| {
                ts.iter()
                    .filter(|t| cutoff.map_or(true, |c| **t >= c) && **t <= now)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Forget an address, e.g. once it has been banned
    pub fn clear(&mut self, ip: &IpAddr) {
        self.entries.remove(ip);
    }

    /// Drop failures that can no longer count and addresses left empty.
    /// Returns how many addresses were released.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = self.cutoff(now) else {
            return 0;
        };
        let before = self.entries.len();

        self.entries.retain(|_, timestamps| {
            while timestamps.front().is_some_and(|t| *t < cutoff) {
                timestamps.pop_front();
            }
            !timestamps.is_empty()
        });

        before - self.entries.len()
    }

    /// Addresses currently holding at least one failure
    pub fn watched(&self) -> usize {
        self.entries.len()
    }

    pub fn is_watched(&self, ip: &IpAddr) -> bool {
        self.entries.contains_key(ip)
    }
}
