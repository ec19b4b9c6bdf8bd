//! # Data Gaps
//!
//! Interprets IWLS `find-data-gaps` replies and expands the resulting gaps
//! into logger-sized query windows.
//!
//! ## Gap replies
//!
//! A healthy reply is a JSON array of objects:
//! ```json
//! [{"start": "2022-01-16T18:10:00Z", "end": "2022-01-16T22:32:00Z", "numberOfMissingData": 263}]
//! ```
//! When IWLS cannot compute gaps it answers with a bare error object instead,
//! e.g. `{"message": "frequency per hour is null", "code": "EMPTY_STATION_EXPECTED_PRODUCTIVITY"}`.
//! Error objects and arrays of the wrong shape mean "no gap information" and
//! produce an empty list rather than an error.
//!
//! ## Expansion
//!
//! Loggers answer slowly and time out on long windows, so a gap is cut into
//! pieces no longer than a [`SplitFrequency`]. Piece boundaries are anchored
//! at the gap start (`start, start+f, start+2f, ...`) and the pieces tile the
//! gap exactly. The expanded list is ordered newest first, so a run that is
//! cut short has still recovered the most recent data.

use crate::{DateRange, Gap, RANGE_FORMAT};
use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// Timestamp format used by the gap API (`2019-11-13T19:18:00Z`).
pub const GAP_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Parse a `find-data-gaps` reply.
///
/// Returns gaps sorted by start with overlapping entries merged. Any shape
/// problem yields an empty list.
pub fn parse_gap_response(reply: &Value) -> Vec<Gap> {
    let Some(items) = reply.as_array() else {
        warn!(
            code = reply.get("code").and_then(|v| v.as_str()).unwrap_or("unknown"),
            message = reply.get("message").and_then(|v| v.as_str()).unwrap_or(""),
            "gap service returned an error payload"
        );
        return Vec::new();
    };

    let mut gaps = Vec::with_capacity(items.len());
    for item in items {
        match parse_gap(item) {
            Some(gap) => gaps.push(gap),
            None => {
                warn!(entry = %item, "gap reply entry has an unexpected shape, ignoring reply");
                return Vec::new();
            }
        }
    }

    normalize_gaps(gaps)
}

fn parse_gap(item: &Value) -> Option<Gap> {
    let start = parse_gap_time(item.get("start")?.as_str()?)?;
    let end = parse_gap_time(item.get("end")?.as_str()?)?;
    let missing = item.get("numberOfMissingData")?.as_u64()?;
    Gap::new(start, end, u32::try_from(missing).unwrap_or(u32::MAX))
}

/// Parse a gap timestamp, truncated to the whole minute.
fn parse_gap_time(text: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), GAP_TIME_FORMAT)
        .ok()?
        .with_second(0)?;
    Some(naive.and_utc())
}

/// Sort gaps by start and merge any that overlap.
///
/// Exact duplicates are dropped, and a gap that lies inside the previous one
/// (a zero-length gap at its end, say) is absorbed, so no window is queried
/// twice.
pub fn normalize_gaps(mut gaps: Vec<Gap>) -> Vec<Gap> {
    gaps.sort_by_key(|g| (g.start, g.end));
    gaps.dedup();

    let mut merged: Vec<Gap> = Vec::with_capacity(gaps.len());
    for gap in gaps {
        match merged.last_mut() {
            Some(last) if gap.start < last.end || gap.end <= last.end => {
                debug!(first = ?last, second = ?gap, "merging overlapping gaps");
                last.end = last.end.max(gap.end);
                last.missing_samples = last.missing_samples.saturating_add(gap.missing_samples);
            }
            _ => merged.push(gap),
        }
    }
    merged
}

/// Errors parsing a split frequency.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrequencyError {
    #[error("invalid split frequency `{0}`")]
    Invalid(String),
    #[error("split frequency must be positive")]
    NotPositive,
    #[error("split frequency `{0}` is too large")]
    OutOfRange(String),
}

/// Maximum length of one logger query window.
///
/// Parses pandas-style aliases: `1D`, `6H`, `30T`, `15min`, `90S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitFrequency(Duration);

impl SplitFrequency {
    pub fn new(step: Duration) -> Result<Self, FrequencyError> {
        if step <= Duration::zero() {
            return Err(FrequencyError::NotPositive);
        }
        Ok(Self(step))
    }

    /// Whole days, at least one, saturating at the largest representable step.
    pub fn days(n: i64) -> Self {
        Self(Duration::try_days(n.max(1)).unwrap_or(Duration::MAX))
    }

    pub fn step(&self) -> Duration {
        self.0
    }
}

impl Default for SplitFrequency {
    fn default() -> Self {
        Self::days(1)
    }
}

impl FromStr for SplitFrequency {
    type Err = FrequencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s.chars().take_while(|c| c.is_ascii_digit()).count();
        let (count, unit) = s.split_at(digits);
        let count: i64 = if count.is_empty() {
            1
        } else {
            count
                .parse()
                .map_err(|_| FrequencyError::Invalid(s.to_string()))?
        };
        let step = match unit.to_ascii_lowercase().as_str() {
            "d" => Duration::try_days(count),
            "h" => Duration::try_hours(count),
            "t" | "min" => Duration::try_minutes(count),
            "s" => Duration::try_seconds(count),
            _ => return Err(FrequencyError::Invalid(s.to_string())),
        };
        Self::new(step.ok_or_else(|| FrequencyError::OutOfRange(s.to_string()))?)
    }
}

impl fmt::Display for SplitFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.num_seconds();
        match secs {
            s if s % 86_400 == 0 => write!(f, "{}D", s / 86_400),
            s if s % 3_600 == 0 => write!(f, "{}H", s / 3_600),
            s if s % 60 == 0 => write!(f, "{}T", s / 60),
            s => write!(f, "{}S", s),
        }
    }
}

/// Split one range at frequency boundaries anchored on its start.
fn split_range(range: DateRange, frequency: SplitFrequency) -> Vec<DateRange> {
    let step = frequency.step();
    let mut boundaries = vec![range.start];
    let mut next = range.start + step;
    while next <= range.end {
        boundaries.push(next);
        next += step;
    }

    if boundaries.len() == 1 {
        return vec![range];
    }

    let mut pieces: Vec<DateRange> = boundaries
        .windows(2)
        .map(|w| DateRange::new(w[0], w[1]))
        .collect();
    if let Some(&last) = boundaries.last() {
        if last < range.end {
            pieces.push(DateRange::new(last, range.end));
        }
    }
    pieces
}

/// Expand ranges into pieces no longer than `frequency`, newest first.
pub fn expand_date_ranges(ranges: &[DateRange], frequency: SplitFrequency) -> Vec<DateRange> {
    let mut expanded: Vec<DateRange> = ranges
        .iter()
        .flat_map(|r| split_range(*r, frequency))
        .collect();
    expanded.sort_by(|a, b| b.start.cmp(&a.start));
    expanded
}

/// [`expand_date_ranges`] over `"YYYY-MM-DD HH:MM:SS"` string pairs.
pub fn expand_date_strings(
    pairs: &[(String, String)],
    frequency: SplitFrequency,
) -> Result<Vec<(String, String)>, chrono::ParseError> {
    let ranges = pairs
        .iter()
        .map(|(start, end)| DateRange::parse(start, end))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(expand_date_ranges(&ranges, frequency)
        .into_iter()
        .map(|r| {
            (
                r.start.format(RANGE_FORMAT).to_string(),
                r.end.format(RANGE_FORMAT).to_string(),
            )
        })
        .collect())
}
