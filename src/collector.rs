//! # Station Collection
//!
//! Runs one logger session for one station: resolve the sensor map, send each
//! query in order, keep the replies that validate, then pivot what was
//! gathered into a [`FormattedBatch`].
//!
//! Rejected and empty replies are skipped. A timeout or transport failure
//! ends the session early, but anything already validated is still returned
//! so the caller can ingest it.

use crate::formatter::{format_gap_data, FormattedBatch};
use crate::pipeline::StationStatus;
use crate::query::Query;
use crate::sensor_map::SensorMapSource;
use crate::session::{LoggerSession, SessionError, SessionTimeouts};
use crate::station::{SensorMap, Station};
use crate::validator::validate_reply;
use tracing::{info, warn};

/// What one session brought back.
#[derive(Debug, Clone, PartialEq)]
pub struct GapCollection {
    /// Formatted readings, if any reply validated and matched a mapped sensor
    pub batch: Option<FormattedBatch>,
    /// Sensor map the session ran with
    pub sensor_map: Option<SensorMap>,
    pub status: StationStatus,
    /// Queries answered before the session ended
    pub answered: usize,
}

impl GapCollection {
    fn failed(error: &SessionError) -> Self {
        Self {
            batch: None,
            sensor_map: None,
            status: StationStatus::from(error),
            answered: 0,
        }
    }

    pub fn rows(&self) -> usize {
        self.batch.as_ref().map_or(0, FormattedBatch::len)
    }
}

/// Connect to the station's logger and collect the answers to `queries`.
pub async fn collect_station(
    station: &Station,
    queries: &[Query],
    sensors: &dyn SensorMapSource,
    timeouts: SessionTimeouts,
) -> GapCollection {
    match LoggerSession::connect(station, timeouts).await {
        Ok(session) => collect_with_session(session, station, queries, sensors).await,
        Err(e) => {
            warn!(station = %station.label(), "{e}");
            GapCollection::failed(&e)
        }
    }
}

/// Collect over a session that is already open.
///
/// The session is closed before returning, whatever the outcome.
pub async fn collect_with_session(
    mut session: LoggerSession,
    station: &Station,
    queries: &[Query],
    sensors: &dyn SensorMapSource,
) -> GapCollection {
    let label = station.label();

    let sensor_map = match sensors.sensor_map(station, &mut session).await {
        Ok(map) => map,
        Err(e) => {
            warn!(station = %label, "{e}");
            session.close().await;
            return GapCollection::failed(&e);
        }
    };

    let mut lines = Vec::new();
    let mut answered = 0;
    let mut failure = None;

    for query in queries {
        let text = query.text();
        info!(station = %label, query = %text.trim(), "querying logger");

        let reply = match session.execute(query).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(station = %label, kept = lines.len(), "{e}");
                failure = Some(e);
                break;
            }
        };
        answered += 1;

        if reply.iter().all(|line| line.trim().is_empty()) {
            info!(station = %label, query = %text.trim(), "reply was empty");
            continue;
        }
        if let Some(payload) = validate_reply(&text, reply, &label) {
            lines.extend(payload);
        }
    }

    session.close().await;

    let batch = Some(format_gap_data(&lines, &sensor_map)).filter(|b| !b.is_empty());
    let status = match (&failure, &batch) {
        (Some(e), _) => StationStatus::from(e),
        (None, Some(_)) => StationStatus::Good,
        (None, None) => StationStatus::NoData,
    };
    info!(
        station = %label,
        answered,
        rows = batch.as_ref().map_or(0, FormattedBatch::len),
        %status,
        "collection finished"
    );

    GapCollection {
        batch,
        sensor_map: Some(sensor_map),
        status,
        answered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaps::SplitFrequency;
    use crate::query::build_queries;
    use crate::sensor_map::ConfiguredSensorMap;
    use crate::station::tests::victoria_record;
    use crate::tests::fake_logger::{FakeLogger, Reply};
    use crate::Gap;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn station() -> Station {
        Station::try_from(victoria_record()).unwrap()
    }

    fn quick() -> SessionTimeouts {
        SessionTimeouts {
            prompt: Duration::from_millis(300),
            query: Duration::from_millis(300),
        }
    }

    /// Three one-day queries, newest (Jan 3) first.
    fn three_day_queries() -> Vec<Query> {
        let gap = Gap::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap(),
            4320,
        )
        .unwrap();
        build_queries(&[gap], SplitFrequency::days(1), None)
    }

    /// A reading dated on the query's start day.
    fn reading_for(command: &str) -> String {
        // "get /S MM-DD-YYYY HH:MM ..."
        let date = command.split_whitespace().nth(2).unwrap_or("01-01-2024");
        format!("{},00:00:00,VR,5.000,m,G", date.replace('-', "/"))
    }

    async fn open(logger: FakeLogger) -> LoggerSession {
        let (stream, _server) = logger.spawn_duplex();
        LoggerSession::open(stream, &station(), quick()).await.unwrap()
    }

    /// Every query answered with a mapped reading gives one row per day.
    #[tokio::test]
    async fn test_all_queries_answered() {
        let session = open(FakeLogger::new(|c| Reply::Data(vec![reading_for(c)]))).await;
        let collection =
            collect_with_session(session, &station(), &three_day_queries(), &ConfiguredSensorMap).await;

        assert_eq!(collection.status, StationStatus::Good);
        assert_eq!(collection.answered, 3);
        assert_eq!(collection.rows(), 3);
    }

    /// A silent logger mid-run still leaves the rows gathered before it.
    #[tokio::test]
    async fn test_timeout_keeps_earlier_data() {
        let mut calls = 0;
        let logger = FakeLogger::new(move |c| {
            calls += 1;
            if calls == 1 {
                Reply::Data(vec![reading_for(c)])
            } else {
                Reply::Silent
            }
        });
        let session = open(logger).await;
        let collection =
            collect_with_session(session, &station(), &three_day_queries(), &ConfiguredSensorMap).await;

        assert!(matches!(collection.status, StationStatus::Timeout(_)));
        assert_eq!(collection.answered, 1);
        assert_eq!(collection.rows(), 1);
    }

    /// Bad echoes and empty replies are skipped without ending the session.
    #[tokio::test]
    async fn test_rejected_replies_are_skipped() {
        let mut calls = 0;
        let logger = FakeLogger::new(move |c| {
            calls += 1;
            match calls {
                1 => Reply::WrongEcho(vec![reading_for(c)]),
                2 => Reply::Raw(String::new()),
                _ => Reply::Data(vec![reading_for(c)]),
            }
        });
        let session = open(logger).await;
        let collection =
            collect_with_session(session, &station(), &three_day_queries(), &ConfiguredSensorMap).await;

        assert_eq!(collection.status, StationStatus::Good);
        assert_eq!(collection.answered, 3);
        assert_eq!(collection.rows(), 1);
    }

    /// Replies ending on a prompt without the `\` directory are rejected.
    #[tokio::test]
    async fn test_prompt_without_directory_is_rejected() {
        let session = open(FakeLogger::new(|c| Reply::NoPrompt(vec![reading_for(c)]))).await;
        let collection =
            collect_with_session(session, &station(), &three_day_queries(), &ConfiguredSensorMap).await;

        assert_eq!(collection.status, StationStatus::NoData);
        assert_eq!(collection.answered, 3);
        assert!(collection.batch.is_none());
    }

    /// Readings for unmapped sensors only leave the station with no data.
    #[tokio::test]
    async fn test_no_usable_lines_is_no_data() {
        let session = open(FakeLogger::new(|_| {
            Reply::Data(vec!["01/01/2024,00:00:00,BAT,13.1,V,G".into()])
        }))
        .await;
        let collection =
            collect_with_session(session, &station(), &three_day_queries(), &ConfiguredSensorMap).await;

        assert_eq!(collection.status, StationStatus::NoData);
        assert!(collection.batch.is_none());
    }

    /// Nothing listening on the logger port is a connection failure.
    #[tokio::test]
    async fn test_unreachable_logger_is_connection_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut station = station();
        station.address.port = addr.port();

        let collection =
            collect_station(&station, &three_day_queries(), &ConfiguredSensorMap, quick()).await;
        assert!(matches!(collection.status, StationStatus::Connection(_)));
        assert!(collection.sensor_map.is_none());
    }
}
