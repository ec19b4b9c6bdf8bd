//! # Ingestion Message Framing
//!
//! Turns a [`FormattedBatch`] into the checksum-suffixed strings the IWLS
//! ingestion endpoint accepts:
//!
//! ```text
//! ["$PACIF,07120,WL1;211222,160100,5.017,m,G*3C7C"]\r\n
//! ```
//!
//! The payload between `$` and `*` is a header (`region,code,channels...;`)
//! followed by one `yymmdd,HHMMSS,cells...;` line per row, with the final `;`
//! removed. The checksum is CRC-16/Modbus over the payload, four uppercase
//! hex digits.

use crate::crc;
use crate::formatter::FormattedBatch;
use crate::station::Station;
use chrono::NaiveDateTime;
use std::fmt;
use thiserror::Error;

/// Row timestamp layout inside a message.
pub const MESSAGE_TIME_FORMAT: &str = "%y%m%d,%H%M%S";

/// Cell written for a sensor with no usable reading at a timestamp.
const EMPTY_CELL: &str = ",,";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{station}: no rows to encode")]
    EmptyBatch { station: String },

    #[error("{station}: none of the reported sensors {columns:?} map to a channel")]
    NoChannels {
        station: String,
        columns: Vec<String>,
    },
}

/// A wire string that does not have the `["$...*XXXX"]` shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed message: {0}")]
pub struct MalformedMessage(String);

/// One framed message, ready to post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    payload: String,
    checksum: u16,
    rows: usize,
}

impl WireMessage {
    /// Frame a payload, computing its checksum.
    pub fn new(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        let rows = payload.matches(';').count();
        let checksum = crc::crc16(payload.as_bytes());
        Self {
            payload,
            checksum,
            rows,
        }
    }

    /// Read a rendered message back, keeping the checksum it carries.
    pub fn parse(text: &str) -> Result<Self, MalformedMessage> {
        let body = text
            .trim_end_matches(['\r', '\n'])
            .strip_prefix("[\"$")
            .and_then(|rest| rest.strip_suffix("\"]"))
            .ok_or_else(|| MalformedMessage("expected [\"$...\"] framing".into()))?;
        let (payload, hex) = body
            .rsplit_once('*')
            .ok_or_else(|| MalformedMessage("missing '*' before checksum".into()))?;
        if hex.len() != 4 {
            return Err(MalformedMessage(format!("checksum {hex:?} is not 4 hex digits")));
        }
        let checksum = u16::from_str_radix(hex, 16)
            .map_err(|_| MalformedMessage(format!("checksum {hex:?} is not hex")))?;
        Ok(Self {
            payload: payload.to_string(),
            checksum,
            rows: payload.matches(';').count(),
        })
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Data rows carried (the header is not counted).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Whether the carried checksum matches the payload.
    pub fn verify(&self) -> bool {
        crc::crc16(self.payload.as_bytes()) == self.checksum
    }

    /// The exact string posted to the ingestion endpoint.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[\"${}*{:04X}\"]\r\n", self.payload, self.checksum)
    }
}

/// A stored cell, or empty fields when it is not exactly `value,unit,quality`.
fn message_cell(cell: Option<&str>) -> &str {
    match cell {
        Some(cell) if cell.split(',').count() == 3 => cell,
        _ => EMPTY_CELL,
    }
}

fn data_line(timestamp: &NaiveDateTime, batch: &FormattedBatch, sensors: &[&str]) -> String {
    let mut line = timestamp.format(MESSAGE_TIME_FORMAT).to_string();
    for sensor in sensors {
        line.push(',');
        line.push_str(message_cell(batch.cell(timestamp, sensor)));
    }
    line.push(';');
    line
}

/// Build the payload for one batch.
fn encode_payload(batch: &FormattedBatch, station: &Station) -> Result<String, EncodeError> {
    if batch.is_empty() {
        return Err(EncodeError::EmptyBatch {
            station: station.label(),
        });
    }

    // Sensor map order, limited to what actually reported.
    let (sensors, channels): (Vec<&str>, Vec<&str>) = station
        .sensor_map
        .iter()
        .filter(|(sensor, _)| batch.columns().iter().any(|c| c == sensor))
        .unzip();
    if channels.is_empty() {
        return Err(EncodeError::NoChannels {
            station: station.label(),
            columns: batch.columns().to_vec(),
        });
    }

    let mut payload = format!(
        "{},{},{};",
        station.region_header,
        station.code,
        channels.join(",")
    );
    for timestamp in batch.timestamps() {
        payload.push_str(&data_line(timestamp, batch, &sensors));
    }
    payload.pop();
    Ok(payload)
}

/// Encode a whole batch as a single message.
pub fn encode_message(batch: &FormattedBatch, station: &Station) -> Result<WireMessage, EncodeError> {
    encode_payload(batch, station).map(WireMessage::new)
}

/// Encode a batch as one or more messages of at most `max_rows` rows each.
pub fn encode_messages(
    batch: &FormattedBatch,
    station: &Station,
    max_rows: usize,
) -> Result<Vec<WireMessage>, EncodeError> {
    if batch.is_empty() {
        return Err(EncodeError::EmptyBatch {
            station: station.label(),
        });
    }
    batch
        .chunks(max_rows)
        .iter()
        .map(|chunk| encode_message(chunk, station))
        .collect()
}
