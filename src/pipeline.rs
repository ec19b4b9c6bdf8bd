//! # Recovery Pipeline
//!
//! Runs the full recovery for a list of stations, one after another:
//!
//! 1. look up gaps for the station's time series ([`GapSource`])
//! 2. expand them into logger queries
//! 3. collect over a logger session, retrying failed sessions
//! 4. frame what came back and hand it to a [`MessageSink`]
//!
//! Every station ends with a [`StationReport`]. Nothing a single station does,
//! whether a bad record, an unreachable logger or a rejected message, stops the
//! rest of the batch.

use crate::collector::{collect_station, GapCollection};
use crate::gaps::SplitFrequency;
use crate::iwls::{Delivery, IwlsClient, IwlsError};
use crate::message::{encode_messages, WireMessage};
use crate::query::{build_queries, Query};
use crate::sensor_map::{ConfiguredSensorMap, PushFileSensorMap, SensorMapSource};
use crate::session::{SessionError, SessionTimeouts};
use crate::station::{Station, StationConfigError};
use crate::Gap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Terminal status of one station in a run.
///
/// Failure variants carry a reason already tagged with the station label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StationStatus {
    Good,
    /// Queries ran but nothing usable came back
    NoData,
    /// IWLS reported no missing data in the window
    NoGaps,
    Configuration(String),
    Connection(String),
    Timeout(String),
    GapLookup(String),
    Delivery(String),
}

impl StationStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            StationStatus::Good | StationStatus::NoData | StationStatus::NoGaps
        )
    }

    /// Failures worth another session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StationStatus::Connection(_) | StationStatus::Timeout(_))
    }
}

impl From<&SessionError> for StationStatus {
    fn from(error: &SessionError) -> Self {
        match error {
            SessionError::Timeout { .. } => StationStatus::Timeout(error.to_string()),
            SessionError::Configuration { .. } => StationStatus::Configuration(error.to_string()),
            SessionError::Connection { .. } | SessionError::InvalidState { .. } => {
                StationStatus::Connection(error.to_string())
            }
        }
    }
}

impl From<&StationConfigError> for StationStatus {
    fn from(error: &StationConfigError) -> Self {
        StationStatus::Configuration(error.to_string())
    }
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationStatus::Good => f.write_str("Good"),
            StationStatus::NoData => f.write_str("Queries were run, but, no data received"),
            StationStatus::NoGaps => f.write_str("No gaps found"),
            StationStatus::Configuration(reason)
            | StationStatus::Connection(reason)
            | StationStatus::Timeout(reason)
            | StationStatus::GapLookup(reason)
            | StationStatus::Delivery(reason) => f.write_str(reason),
        }
    }
}

/// Outcome of one station's run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StationReport {
    /// `"<official name> <code>"`
    pub station: String,
    pub status: StationStatus,
    pub gaps: usize,
    pub queries: usize,
    /// Sessions opened (zero when the run stopped before the logger)
    pub attempts: u32,
    pub rows: usize,
    pub messages_sent: usize,
}

impl StationReport {
    fn new(station: String) -> Self {
        Self {
            station,
            status: StationStatus::NoData,
            gaps: 0,
            queries: 0,
            attempts: 0,
            rows: 0,
            messages_sent: 0,
        }
    }
}

/// Source of gap windows for a station.
#[async_trait]
pub trait GapSource: Send + Sync {
    async fn find_gaps(
        &self,
        station: &Station,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Gap>, IwlsError>;
}

/// Destination for framed messages.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: &WireMessage) -> Result<Delivery, IwlsError>;
}

#[async_trait]
impl GapSource for IwlsClient {
    async fn find_gaps(
        &self,
        station: &Station,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Gap>, IwlsError> {
        let time_series_id = match &station.time_series_id {
            Some(id) => id.clone(),
            None => self.timeseries_id(&station.id, self.time_series_code()).await?,
        };
        self.find_data_gaps(&station.id, &time_series_id, from, to).await
    }
}

#[async_trait]
impl MessageSink for IwlsClient {
    async fn deliver(&self, message: &WireMessage) -> Result<Delivery, IwlsError> {
        self.send_message(message).await
    }
}

/// Knobs for a run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub timeouts: SessionTimeouts,
    pub split_frequency: SplitFrequency,
    /// Sessions tried per station before giving up
    pub max_attempts: u32,
    pub max_rows_per_message: usize,
    /// Read the sensor map from the logger's push file when the station names one
    pub push_file_sensor_map: bool,
    /// Frame messages but do not deliver them
    pub dry_run: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeouts: SessionTimeouts::default(),
            split_frequency: SplitFrequency::default(),
            max_attempts: 3,
            max_rows_per_message: 1440,
            push_file_sensor_map: false,
            dry_run: false,
        }
    }
}

pub struct Pipeline<G, M> {
    settings: PipelineSettings,
    gaps: G,
    sink: M,
    push_file: PushFileSensorMap,
}

impl<G: GapSource, M: MessageSink> Pipeline<G, M> {
    pub fn new(settings: PipelineSettings, gaps: G, sink: M) -> Self {
        Self {
            settings,
            gaps,
            sink,
            push_file: PushFileSensorMap::default(),
        }
    }

    /// Override the push-script prefixes used to find sensor declarations.
    pub fn with_push_file(mut self, push_file: PushFileSensorMap) -> Self {
        self.push_file = push_file;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run every entry in order; invalid records become configuration reports.
    pub async fn run_all(
        &self,
        entries: Vec<Result<Station, StationConfigError>>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<StationReport> {
        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Ok(station) => reports.push(self.run_station(&station, from, to).await),
                Err(e) => {
                    warn!("skipping station: {e}");
                    let mut report = StationReport::new(e.station().to_string());
                    report.status = StationStatus::from(&e);
                    reports.push(report);
                }
            }
        }
        reports
    }

    pub async fn run(&self, stations: &[Station], from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<StationReport> {
        let mut reports = Vec::with_capacity(stations.len());
        for station in stations {
            reports.push(self.run_station(station, from, to).await);
        }
        reports
    }

    /// Full recovery for one station.
    pub async fn run_station(
        &self,
        station: &Station,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StationReport {
        let label = station.label();
        let mut report = StationReport::new(label.clone());

        let gaps = match self.gaps.find_gaps(station, from, to).await {
            Ok(gaps) => gaps,
            Err(e) => {
                warn!(station = %label, "gap lookup failed: {e}");
                report.status = StationStatus::GapLookup(format!("{label}: gap lookup failed: {e}"));
                return report;
            }
        };
        report.gaps = gaps.len();
        if gaps.is_empty() {
            info!(station = %label, "no gaps in window");
            report.status = StationStatus::NoGaps;
            return report;
        }

        let queries = build_queries(&gaps, self.settings.split_frequency, station.log_name.as_deref());
        report.queries = queries.len();
        info!(station = %label, gaps = gaps.len(), queries = queries.len(), "recovering gaps");

        let (collection, attempts) = self.collect_with_retries(station, &queries).await;
        report.attempts = attempts;
        report.rows = collection.rows();
        report.status = collection.status.clone();

        let Some(batch) = &collection.batch else {
            return report;
        };

        // Frame with the map the session actually used.
        let mut framing = station.clone();
        if let Some(map) = &collection.sensor_map {
            framing.sensor_map = map.clone();
        }
        let messages = match encode_messages(batch, &framing, self.settings.max_rows_per_message) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(station = %label, "{e}");
                report.status = StationStatus::NoData;
                return report;
            }
        };

        if self.settings.dry_run {
            for message in &messages {
                info!(station = %label, message = %message.render().trim_end(), "dry run, not sent");
            }
            return report;
        }

        for message in &messages {
            match self.sink.deliver(message).await {
                Ok(delivery) if delivery.is_success() => report.messages_sent += 1,
                Ok(delivery) => {
                    report.status = StationStatus::Delivery(format!(
                        "{label}: ingestion answered {} {}",
                        delivery.status,
                        delivery.body.trim()
                    ));
                }
                Err(e) => {
                    report.status = StationStatus::Delivery(format!("{label}: {e}"));
                }
            }
        }
        report
    }

    /// Run sessions until one does not fail with a retryable status or the
    /// attempts run out. The largest batch seen across attempts is kept.
    async fn collect_with_retries(&self, station: &Station, queries: &[Query]) -> (GapCollection, u32) {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut framing = station.clone();
        let mut sensors: &dyn SensorMapSource =
            if self.settings.push_file_sensor_map && station.basic_file_name.is_some() {
                &self.push_file
            } else {
                &ConfiguredSensorMap
            };

        let mut best: Option<GapCollection> = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut collection = collect_station(&framing, queries, sensors, self.settings.timeouts).await;

            // The push file is read once; later sessions reuse its map.
            if let Some(map) = &collection.sensor_map {
                framing.sensor_map = map.clone();
                sensors = &ConfiguredSensorMap;
            }

            if let Some(previous) = best.take() {
                if previous.rows() > collection.rows() {
                    collection.batch = previous.batch;
                    collection.sensor_map = collection.sensor_map.or(previous.sensor_map);
                }
            }

            let retry = collection.status.is_retryable() && attempt < max_attempts;
            if retry {
                warn!(
                    station = %station.label(),
                    attempt,
                    max_attempts,
                    "{}; retrying",
                    collection.status
                );
                best = Some(collection);
                continue;
            }
            return (collection, attempt);
        }
    }
}
