//! # Gap Data Formatting
//!
//! Reshapes validated logger reply lines into one row per timestamp with one
//! column per sensor of interest.
//!
//! Logger CSV lines look like:
//! ```text
//! Date,Time,Sensor,Value,Units,Quality Flag (G=Good, B=Bad)
//! 05/14/2020,16:29:00,SPS,8.828,,G
//! 05/14/2020,16:29:00,OTTPLSCtemp3,10.780,C,G
//! ```
//! Each cell of the resulting [`FormattedBatch`] holds the composite
//! `"value,unit,quality"` string the ingestion message carries verbatim.
//! Sensors the station does not map (battery, enclosure temperature, ...) are
//! dropped without comment; a logger reports plenty of channels nobody
//! ingests.

use crate::station::SensorMap;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Timestamp layouts a logger line may use, tried in order.
const TIMESTAMP_FORMATS: [&str; 3] = ["%m/%d/%Y %H:%M:%S", "%Y-%m-%d %H:%M:%S", "%y%m%d %H%M%S"];

/// Reading quality as flagged by the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Quality {
    Good,
    Bad,
}

impl Quality {
    /// `G` is good; any other flag is treated as bad.
    pub fn from_flag(flag: &str) -> Self {
        if flag.trim().eq_ignore_ascii_case("G") {
            Quality::Good
        } else {
            Quality::Bad
        }
    }
}

/// One parsed logger line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReading {
    pub timestamp: NaiveDateTime,
    pub sensor: String,
    pub value: String,
    pub unit: String,
    pub quality: Quality,
    /// Flag text exactly as the logger wrote it
    pub flag: String,
}

impl RawReading {
    /// `"value,unit,flag"`, the cell format used in messages.
    pub fn cell(&self) -> String {
        format!("{},{},{}", self.value, self.unit, self.flag)
    }
}

/// Parse a logger date and time pair.
pub fn parse_timestamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    let joined = format!("{} {}", date.trim(), time.trim());
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&joined, fmt).ok())
}

fn split_line(line: &str) -> Option<Vec<&str>> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    (fields.len() >= 6).then_some(fields)
}

/// Parse `date,time,sensor,value,unit,quality`.
pub fn parse_reading(line: &str) -> Option<RawReading> {
    let fields = split_line(line)?;
    Some(RawReading {
        timestamp: parse_timestamp(fields[0], fields[1])?,
        sensor: fields[2].to_string(),
        value: fields[3].to_string(),
        unit: fields[4].to_string(),
        quality: Quality::from_flag(fields[5]),
        flag: fields[5].to_string(),
    })
}

/// Readings pivoted into rows keyed by timestamp, ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormattedBatch {
    columns: Vec<String>,
    rows: BTreeMap<NaiveDateTime, HashMap<String, String>>,
}

impl FormattedBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a cell, adding the column on first use. A second value for the
    /// same timestamp and sensor is appended after a space.
    pub fn insert(&mut self, timestamp: NaiveDateTime, sensor: &str, cell: impl Into<String>) {
        if !self.columns.iter().any(|c| c == sensor) {
            self.columns.push(sensor.to_string());
        }
        let cell = cell.into();
        self.rows
            .entry(timestamp)
            .or_default()
            .entry(sensor.to_string())
            .and_modify(|existing| {
                existing.push(' ');
                existing.push_str(&cell);
            })
            .or_insert_with(|| cell.clone());
    }

    /// Logger sensor names that have at least one reading.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn timestamps(&self) -> impl Iterator<Item = &NaiveDateTime> {
        self.rows.keys()
    }

    pub fn cell(&self, timestamp: &NaiveDateTime, sensor: &str) -> Option<&str> {
        self.rows.get(timestamp)?.get(sensor).map(String::as_str)
    }

    /// Rows as `(timestamp, sensor -> cell)`.
    pub fn rows(&self) -> impl Iterator<Item = (&NaiveDateTime, &HashMap<String, String>)> {
        self.rows.iter()
    }

    /// Split into batches of at most `max_rows` rows, keeping all columns.
    pub fn chunks(&self, max_rows: usize) -> Vec<FormattedBatch> {
        let max_rows = max_rows.max(1);
        let entries: Vec<_> = self.rows.iter().collect();
        entries
            .chunks(max_rows)
            .map(|chunk| FormattedBatch {
                columns: self.columns.clone(),
                rows: chunk
                    .iter()
                    .map(|(ts, cells)| (**ts, (*cells).clone()))
                    .collect(),
            })
            .collect()
    }
}

/// Pivot logger lines into a batch for the station's mapped sensors.
///
/// Columns follow the sensor map order and only include sensors that
/// actually reported.
pub fn format_gap_data<S: AsRef<str>>(lines: &[S], sensors: &SensorMap) -> FormattedBatch {
    let mut readings = Vec::with_capacity(lines.len());
    let mut dropped = 0usize;

    for line in lines {
        let line = line.as_ref();
        let Some(fields) = split_line(line) else {
            if !line.trim().is_empty() {
                debug!(line, "dropping malformed logger line");
                dropped += 1;
            }
            continue;
        };
        if !sensors.contains(fields[2]) {
            continue;
        }
        match parse_reading(line) {
            Some(reading) => readings.push(reading),
            None => {
                debug!(line, "dropping logger line with unreadable timestamp");
                dropped += 1;
            }
        }
    }

    let mut batch = FormattedBatch::new();
    for sensor in sensors.sensors() {
        if readings.iter().any(|r| r.sensor == sensor) {
            batch.columns.push(sensor.to_string());
        }
    }
    for reading in &readings {
        batch.insert(reading.timestamp, &reading.sensor, reading.cell());
    }

    debug!(
        readings = readings.len(),
        rows = batch.len(),
        dropped,
        "formatted gap data"
    );
    batch
}
