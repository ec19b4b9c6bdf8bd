//! Where a session gets its sensor map from.
//!
//! Most stations carry the map in their metadata. Some keep it only in the
//! push script on the logger's flash disk, declared as paired constants:
//!
//! ```text
//! CONST LoggerSensor1 = "VR"
//! CONST IWLS_TimeSeries1 = "WL1"
//! ```
//!
//! [`PushFileSensorMap`] reads that script over the open session with
//! `TYPE <file> /C`.

use crate::session::{LoggerSession, SessionError};
use crate::station::{SensorMap, SensorMapError, Station};
use async_trait::async_trait;
use tracing::{debug, info};

/// Prefix of the push-script lines naming logger sensors.
pub const DEFAULT_SENSOR_PREFIX: &str = "CONST LoggerSensor";

/// Prefix of the push-script lines naming IWLS channels.
pub const DEFAULT_CHANNEL_PREFIX: &str = "CONST IWLS_TimeSeries";

const FILE_NOT_FOUND: &str = "File not found.";

/// Resolves the sensor map for a station once its session is open.
#[async_trait]
pub trait SensorMapSource: Send + Sync {
    async fn sensor_map(
        &self,
        station: &Station,
        session: &mut LoggerSession,
    ) -> Result<SensorMap, SessionError>;
}

/// Uses the map from the station's metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredSensorMap;

#[async_trait]
impl SensorMapSource for ConfiguredSensorMap {
    async fn sensor_map(
        &self,
        station: &Station,
        _session: &mut LoggerSession,
    ) -> Result<SensorMap, SessionError> {
        Ok(station.sensor_map.clone())
    }
}

/// Reads the map from the push script stored on the logger.
#[derive(Debug, Clone)]
pub struct PushFileSensorMap {
    pub sensor_prefix: String,
    pub channel_prefix: String,
}

impl Default for PushFileSensorMap {
    fn default() -> Self {
        Self {
            sensor_prefix: DEFAULT_SENSOR_PREFIX.to_string(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }
}

fn quoted(line: &str) -> Option<&str> {
    line.split('"').nth(1)
}

/// Pair up the sensor and channel declarations of a push script.
///
/// Declarations are zipped in file order; a pair where either side has no
/// quoted name is skipped.
pub fn parse_push_file<S: AsRef<str>>(
    lines: &[S],
    sensor_prefix: &str,
    channel_prefix: &str,
) -> Result<SensorMap, SensorMapError> {
    let sensors = lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|line| line.starts_with(sensor_prefix));
    let channels = lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|line| line.starts_with(channel_prefix));

    let (sensors, channels): (Vec<String>, Vec<String>) = sensors
        .zip(channels)
        .filter_map(|(s, c)| match (quoted(s), quoted(c)) {
            (Some(s), Some(c)) if !s.is_empty() && !c.is_empty() => {
                Some((s.to_string(), c.to_string()))
            }
            _ => None,
        })
        .unzip();

    SensorMap::new(sensors, channels)
}

#[async_trait]
impl SensorMapSource for PushFileSensorMap {
    async fn sensor_map(
        &self,
        station: &Station,
        session: &mut LoggerSession,
    ) -> Result<SensorMap, SessionError> {
        let configuration = |reason: String| SessionError::Configuration {
            station: station.label(),
            reason,
        };

        let file = station
            .basic_file_name
            .as_deref()
            .ok_or_else(|| configuration("no push file (.bas) configured".into()))?;

        let reply = session.command(&format!("TYPE {file} /C")).await?;
        if reply.iter().any(|line| line.contains(FILE_NOT_FOUND)) {
            return Err(configuration(format!("Push file {file} not found in logger")));
        }

        let map = parse_push_file(&reply, &self.sensor_prefix, &self.channel_prefix)
            .map_err(|e| configuration(format!("push file {file}: {e}")))?;
        info!(station = %station.label(), sensors = map.len(), "sensor map read from push file");
        debug!(station = %station.label(), map = ?map, "push file sensor map");
        Ok(map)
    }
}
