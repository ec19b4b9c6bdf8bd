//! # Gap Recovery Core Library
//!
//! This library recovers missing water-level observations for tide stations.
//! Stations record continuously to a field data logger; when the real-time
//! feed to the central water-level service (IWLS) drops out, the readings are
//! still on the logger's flash disk. This crate finds those holes and pulls the
//! readings back.
//!
//! ## Data Flow
//!
//! 1. **Gap lookup**: ask IWLS which windows of a station's time series are missing
//! 2. **Expansion**: split long gaps into day-sized (configurable) sub-ranges, newest first
//! 3. **Encoding**: turn each sub-range into a logger `get ... /csv` command line
//! 4. **Session**: connect to the logger, log in, run the queries one at a time
//! 5. **Validation**: keep only replies that echo their query and end on the prompt
//! 6. **Formatting**: pivot the CSV reply lines into one row per timestamp
//! 7. **Framing**: build `$`-prefixed, CRC-16/Modbus suffixed messages and post them
//!
//! ## Core Types
//!
//! - [`Gap`]: a missing-data window reported by IWLS
//! - [`DateRange`]: a bounded sub-range ready to be encoded as a logger query
//!
//! Station metadata lives in [`station`], the logger protocol in [`session`],
//! and the outbound message format in [`message`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// Module declarations
pub mod collector;
pub mod config;
pub mod crc;
pub mod formatter;
pub mod gaps;
pub mod iwls;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod query;
pub mod sensor_map;
pub mod session;
pub mod station;
pub mod validator;

#[cfg(test)]
mod tests;

/// Display format used for date-range pairs (`2021-10-28 12:46:00`).
pub const RANGE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A window of missing readings for one station.
///
/// Gaps are half-open `[start, end)` intervals in UTC at whole-minute
/// resolution. IWLS reports single missing samples as zero-length gaps
/// (`start == end`), which are still valid and still produce a query.
///
/// # Example
/// ```
/// use chrono::{TimeZone, Utc};
/// use gap_recovery::Gap;
///
/// let gap = Gap::new(
///     Utc.with_ymd_and_hms(2022, 1, 16, 18, 10, 0).unwrap(),
///     Utc.with_ymd_and_hms(2022, 1, 16, 22, 32, 0).unwrap(),
///     263,
/// )
/// .unwrap();
///
/// assert_eq!(gap.missing_samples, 263);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    /// First missing minute (inclusive)
    pub start: DateTime<Utc>,
    /// End of the window
    pub end: DateTime<Utc>,
    /// Number of samples IWLS expected but never received
    pub missing_samples: u32,
}

impl Gap {
    /// Build a gap, rejecting inverted windows.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, missing_samples: u32) -> Option<Self> {
        (start <= end).then_some(Self {
            start,
            end,
            missing_samples,
        })
    }

    /// The gap as a naive UTC date range, the form the logger speaks.
    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.start.naive_utc(),
            end: self.end.naive_utc(),
        }
    }
}

/// A `[start, end)` pair of naive UTC timestamps.
///
/// Produced by the expander from gaps and consumed by the query encoder.
/// Displays as `"YYYY-MM-DD HH:MM:SS YYYY-MM-DD HH:MM:SS"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DateRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    /// Parse a pair of `"YYYY-MM-DD HH:MM:SS"` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self {
            start: NaiveDateTime::parse_from_str(start.trim(), RANGE_FORMAT)?,
            end: NaiveDateTime::parse_from_str(end.trim(), RANGE_FORMAT)?,
        })
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.start.format(RANGE_FORMAT),
            self.end.format(RANGE_FORMAT)
        )
    }
}
