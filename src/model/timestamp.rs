use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            seconds: now.timestamp(),
            nanos: now.timestamp_subsec_nanos() as i32,
        }
    }

    fn normalize(&mut self) {
        let extra_seconds = self.nanos.div_euclid(1_000_000_000);
        self.seconds += extra_seconds as i64;
        self.nanos = self.nanos.rem_euclid(1_000_000_000);
        if self.seconds > 0 && self.nanos < 0 {
            self.seconds -= 1;
            self.nanos += 1_000_000_000;
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.seconds.cmp(&other.seconds) {
            Ordering::Equal => self.nanos.cmp(&other.nanos),
            ordering => ordering,
        }
    }
}

/// A server logical timestamp used for document ordering and staleness
/// checks. Wraps a [`Timestamp`] so versions and wall-clock times cannot be
/// mixed up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// The version every document starts at before the server has confirmed
    /// anything. Also the "no snapshot yet" sentinel for targets.
    pub fn min() -> Self {
        Self(Timestamp { seconds: 0, nanos: 0 })
    }

    pub fn max() -> Self {
        Self(Timestamp {
            seconds: 253_402_300_799,
            nanos: 999_999_999,
        })
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn compare_to(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
