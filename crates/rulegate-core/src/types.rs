//! Core types shared across Rulegate modules
//!
//! - Timestamps
//! - Content digests
//! - Time windows for audit queries

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp type alias
pub type Timestamp = DateTime<Utc>;

/// Create a timestamp for the current moment
pub fn now() -> Timestamp {
    Utc::now()
}

/// BLAKE3 hex digest of raw bytes
pub fn digest_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// BLAKE3 hex digest of a JSON value.
///
/// `serde_json::Value` objects are backed by a sorted map, so the
/// serialized form (and therefore the digest) is stable for equal values.
pub fn digest_json(value: &serde_json::Value) -> String {
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    digest_bytes(&canonical)
}

/// Closed time interval `[start, end]` used to scope audit queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    /// Window covering every representable timestamp
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    /// Window ending now and reaching `duration` into the past.
    ///
    /// Saturates at the earliest representable instant; `None` for a
    /// negative duration.
    pub fn try_last(duration: Duration) -> Option<Self> {
        if duration < Duration::zero() {
            return None;
        }
        let end = now();
        let start = end
            .checked_sub_signed(duration)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Some(Self { start, end })
    }

    /// Like [`TimeWindow::try_last`], treating a negative duration as its
    /// magnitude
    pub fn last(duration: Duration) -> Self {
        let end = now();
        let start = end
            .checked_sub_signed(duration.abs())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end }
    }

    /// Window between two instants; swapped bounds are normalized
    pub fn between(start: Timestamp, end: Timestamp) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn contains(&self, ts: &Timestamp) -> bool {
        *ts >= self.start && *ts <= self.end
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::all()
    }
}
