//! # Logger Queries
//!
//! Encodes date ranges as data logger `get` commands:
//!
//! ```text
//! get [/F <log_name>] /S <MM-DD-YYYY HH:MM> /E <MM-DD-YYYY HH:MM> /ny /c /csv\r\n
//! ```
//!
//! `/ny` suppresses the interactive confirmation, `/c` and `/csv` select the
//! comma-separated reading format the formatter expects. The `/F` clause only
//! appears when the station keeps its readings in a named log file.

use crate::gaps::{expand_date_ranges, SplitFrequency};
use crate::{DateRange, Gap};
use std::borrow::Cow;

/// Date format understood by the logger's `/S` and `/E` switches.
pub const LOGGER_DATE_FORMAT: &str = "%m-%d-%Y %H:%M";

/// One encoded logger command and the window it asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    line: Vec<u8>,
    range: DateRange,
}

impl Query {
    /// Raw bytes written to the socket, terminator included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.line
    }

    /// The command as text, for echo comparison and logging.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.line)
    }

    pub fn range(&self) -> DateRange {
        self.range
    }
}

/// Encode one range as a logger `get` command.
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use gap_recovery::{query::encode_query, DateRange};
///
/// let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
/// let range = DateRange::new(day.and_hms_opt(0, 0, 0).unwrap(), day.and_hms_opt(0, 1, 0).unwrap());
/// let query = encode_query(range, None);
/// assert_eq!(query.as_bytes(), b"get /S 01-01-2024 00:00 /E 01-01-2024 00:01 /ny /c /csv\r\n");
/// ```
pub fn encode_query(range: DateRange, log_name: Option<&str>) -> Query {
    let start = range.start.format(LOGGER_DATE_FORMAT).to_string();
    let end = range.end.format(LOGGER_DATE_FORMAT).to_string();

    let mut line = Vec::with_capacity(64);
    line.extend_from_slice(b"get ");
    if let Some(name) = log_name.map(str::trim).filter(|n| !n.is_empty()) {
        line.extend_from_slice(b"/F ");
        line.extend_from_slice(name.as_bytes());
        line.push(b' ');
    }
    line.extend_from_slice(b"/S ");
    line.extend_from_slice(start.as_bytes());
    line.extend_from_slice(b" /E ");
    line.extend_from_slice(end.as_bytes());
    line.extend_from_slice(b" /ny /c /csv\r\n");

    Query { line, range }
}

/// Expand gaps into bounded windows and encode each, newest first.
pub fn build_queries(gaps: &[Gap], frequency: SplitFrequency, log_name: Option<&str>) -> Vec<Query> {
    let ranges: Vec<DateRange> = gaps.iter().map(Gap::range).collect();
    expand_date_ranges(&ranges, frequency)
        .into_iter()
        .map(|range| encode_query(range, log_name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};

    fn at(d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 10, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    /// A configured log name adds the /F clause.
    #[test]
    fn test_log_name_clause() {
        let range = DateRange::new(at(28, 18, 9), at(28, 18, 16));
        let query = encode_query(range, Some("07120_DL1"));
        assert_eq!(
            query.text(),
            "get /F 07120_DL1 /S 10-28-2021 18:09 /E 10-28-2021 18:16 /ny /c /csv\r\n"
        );
        assert_eq!(query.range(), range);
    }

    /// A blank log name is left out.
    #[test]
    fn test_blank_log_name_is_omitted() {
        let range = DateRange::new(at(28, 18, 9), at(28, 18, 16));
        let blank = encode_query(range, Some("  "));
        let none = encode_query(range, None);
        assert_eq!(blank, none);
        assert!(!none.text().contains("/F"));
        assert!(!none.text().contains("  "));
    }

    /// Queries are built newest first.
    #[test]
    fn test_build_queries_newest_first() {
        let gaps = vec![
            Gap::new(
                Utc.with_ymd_and_hms(2021, 10, 1, 9, 16, 0).unwrap(),
                Utc.with_ymd_and_hms(2021, 10, 2, 13, 25, 0).unwrap(),
                1690,
            )
            .unwrap(),
            Gap::new(
                Utc.with_ymd_and_hms(2021, 10, 28, 12, 46, 0).unwrap(),
                Utc.with_ymd_and_hms(2021, 10, 28, 12, 46, 0).unwrap(),
                1,
            )
            .unwrap(),
        ];
        let queries = build_queries(&gaps, SplitFrequency::days(1), None);
        let texts: Vec<String> = queries.iter().map(|q| q.text().into_owned()).collect();
        assert_eq!(
            texts,
            vec![
                "get /S 10-28-2021 12:46 /E 10-28-2021 12:46 /ny /c /csv\r\n",
                "get /S 10-02-2021 09:16 /E 10-02-2021 13:25 /ny /c /csv\r\n",
                "get /S 10-01-2021 09:16 /E 10-02-2021 09:16 /ny /c /csv\r\n",
            ]
        );
    }
}
