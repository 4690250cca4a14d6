//! Job identifier generation.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AppError;

/// Identifier assigned to a job when it is first submitted.
///
/// Ids order by submission: the millisecond timestamp first, then a sequence
/// number that breaks ties between jobs submitted within the same millisecond.
/// The string form is fixed-width so that lexicographic order matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId {
    timestamp_ms: u64,
    sequence: u32,
}

impl JobId {
    /// Build an id from its parts.
    #[must_use]
    pub const fn new(timestamp_ms: u64, sequence: u32) -> Self {
        Self {
            timestamp_ms,
            sequence,
        }
    }

    /// Millisecond timestamp at which the id was assigned.
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Tie-breaking sequence within `timestamp_ms`.
    #[must_use]
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:013}-{:06}", self.timestamp_ms, self.sequence)
    }
}

impl FromStr for JobId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::Serialization(format!("invalid job id: {s}"));
        let (timestamp, sequence) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            timestamp_ms: timestamp.parse().map_err(|_| invalid())?,
            sequence: sequence.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Generator for strictly increasing job ids.
///
/// Only the most recently issued id is kept: a burst within one millisecond
/// bumps the sequence, and a wall clock that steps backwards keeps issuing
/// ids under the last timestamp seen.
#[derive(Debug, Default)]
pub struct JobIdGenerator {
    last: Mutex<Option<JobId>>,
}

impl JobIdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    /// Issue the next id using the current wall clock.
    #[must_use]
    pub fn next_id(&self) -> JobId {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.next_id_at(now)
    }

    /// Issue the next id as if the wall clock read `now_ms`.
    #[must_use]
    pub fn next_id_at(&self, now_ms: u64) -> JobId {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let id = match *last {
            Some(prev) if now_ms <= prev.timestamp_ms => {
                JobId::new(prev.timestamp_ms, prev.sequence.saturating_add(1))
            }
            _ => JobId::new(now_ms, 0),
        };
        *last = Some(id);
        id
    }
}
