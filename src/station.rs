//! # Station Metadata
//!
//! Station records arrive from a metadata source as loosely-typed key/value
//! data: ports may be strings or numbers, sensor lists may be TOML arrays or
//! comma-separated strings, flags may be `true` or `"True"`. This module turns
//! those [`StationRecord`]s into validated, immutable [`Station`]s once per
//! run, so nothing downstream ever has to ask whether a key exists.
//!
//! A record that cannot be validated produces a [`StationConfigError`] naming
//! the station and the offending field. That error is fatal for the station
//! only; the pipeline skips it and moves on.
//!
//! [`StationDirectory`] is the scoped lookup object that replaces a global
//! station cache: it loads records from a [`StationSource`] on first use and
//! reloads them only when asked to via [`StationDirectory::refresh`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Per-station configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StationConfigError {
    #[error("{station}: missing required field `{field}`")]
    MissingField { station: String, field: &'static str },

    #[error("{station}: invalid station code `{code}` (expected five digits)")]
    InvalidCode { station: String, code: String },

    #[error("{station}: invalid port `{value}`")]
    InvalidPort { station: String, value: String },

    #[error("{station}: sensor map is empty")]
    EmptySensorMap { station: String },

    #[error("{station}: {sensors} logger sensors but {channels} IWLS channels")]
    SensorMapMismatch {
        station: String,
        sensors: usize,
        channels: usize,
    },

    #[error("{station}: invalid region header `{value}`")]
    InvalidRegionHeader { station: String, value: String },

    #[error("{station}: {reason}")]
    Other { station: String, reason: String },
}

impl StationConfigError {
    /// Label of the station the error belongs to.
    pub fn station(&self) -> &str {
        match self {
            StationConfigError::MissingField { station, .. }
            | StationConfigError::InvalidCode { station, .. }
            | StationConfigError::InvalidPort { station, .. }
            | StationConfigError::EmptySensorMap { station }
            | StationConfigError::SensorMapMismatch { station, .. }
            | StationConfigError::InvalidRegionHeader { station, .. }
            | StationConfigError::Other { station, .. } => station,
        }
    }
}

/// Failures loading the station list itself.
#[derive(Error, Debug)]
pub enum StationSourceError {
    #[error("station file IO ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("station file format ({path}): {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Errors from a directory lookup.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error(transparent)]
    Source(#[from] StationSourceError),

    #[error(transparent)]
    Config(#[from] StationConfigError),

    #[error("station {0} not found")]
    NotFound(String),
}

/// Map a CHS region code to the header tag used in ingestion messages.
pub fn region_header_for(chs_region_code: &str) -> Option<&'static str> {
    match chs_region_code.trim().to_ascii_uppercase().as_str() {
        "PAC" => Some("PACIF"),
        "CNA" => Some("CTRAR"),
        "QUE" => Some("QUE"),
        "ATL" => Some("ATLAN"),
        _ => None,
    }
}

// -- Loose field shapes --

/// A port given either as a number or as text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortField {
    Number(i64),
    Text(String),
}

/// A list given either as an array or as a comma-separated string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ListField {
    List(Vec<String>),
    Csv(String),
}

impl ListField {
    fn into_vec(self) -> Vec<String> {
        match self {
            ListField::List(items) => items.into_iter().map(|s| s.trim().to_string()).collect(),
            ListField::Csv(text) if text.trim().is_empty() => Vec::new(),
            ListField::Csv(text) => text.split(',').map(|s| s.trim().to_string()).collect(),
        }
    }
}

/// A flag given either as a boolean or as `"True"`/`"False"` text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlagField {
    Bool(bool),
    Text(String),
}

impl FlagField {
    fn as_bool(&self) -> bool {
        match self {
            FlagField::Bool(b) => *b,
            FlagField::Text(s) => s.trim().eq_ignore_ascii_case("true"),
        }
    }
}

/// Station metadata as supplied by the metadata source, before validation.
///
/// Field aliases accept the key names used by the IWLS key/value store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StationRecord {
    pub code: Option<String>,
    pub id: Option<String>,
    #[serde(alias = "officialName")]
    pub official_name: Option<String>,
    #[serde(alias = "ip_address", alias = "ip")]
    pub host: Option<String>,
    pub port: Option<PortField>,
    #[serde(alias = "user_login")]
    pub username: Option<String>,
    #[serde(alias = "user_pass")]
    pub password: Option<String>,
    #[serde(alias = "xconnectlogfile")]
    pub log_name: Option<String>,
    #[serde(alias = "sutron_sensors")]
    pub logger_sensors: Option<ListField>,
    #[serde(alias = "iwls_sensors")]
    pub channels: Option<ListField>,
    pub region_header: Option<String>,
    #[serde(alias = "chsRegionCode")]
    pub chs_region_code: Option<String>,
    #[serde(alias = "ip_enabled")]
    pub enabled: Option<FlagField>,
    pub basic_file_name: Option<String>,
    pub time_series_id: Option<String>,
}

impl StationRecord {
    /// Best-effort label for error messages, usable before validation.
    pub fn label(&self) -> String {
        let code = self.code.as_deref().unwrap_or("?????");
        match self.official_name.as_deref() {
            Some(name) if !name.trim().is_empty() => format!("{} {}", name.trim(), code),
            _ => code.to_string(),
        }
    }
}

// -- Validated types --

/// Network address of a station's data logger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoggerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for LoggerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Logger login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Ordered pairing of logger sensor names with IWLS channel names.
///
/// # Example
/// ```
/// use gap_recovery::station::SensorMap;
///
/// let map = SensorMap::new(vec!["VR".into(), "SU".into()], vec!["WL1".into(), "WL2".into()]).unwrap();
/// assert_eq!(map.channel_for("SU"), Some("WL2"));
/// assert!(!map.contains("BAT"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorMap {
    pairs: Vec<(String, String)>,
}

/// Why a sensor map could not be built.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorMapError {
    #[error("sensor map is empty")]
    Empty,
    #[error("{sensors} logger sensors but {channels} channels")]
    LengthMismatch { sensors: usize, channels: usize },
}

impl SensorMap {
    pub fn new(sensors: Vec<String>, channels: Vec<String>) -> Result<Self, SensorMapError> {
        if sensors.len() != channels.len() {
            return Err(SensorMapError::LengthMismatch {
                sensors: sensors.len(),
                channels: channels.len(),
            });
        }
        let pairs: Vec<_> = sensors
            .into_iter()
            .zip(channels)
            .filter(|(s, c)| !s.is_empty() && !c.is_empty())
            .collect();
        if pairs.is_empty() {
            return Err(SensorMapError::Empty);
        }
        Ok(Self { pairs })
    }

    pub fn contains(&self, sensor: &str) -> bool {
        self.pairs.iter().any(|(s, _)| s == sensor)
    }

    pub fn channel_for(&self, sensor: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(s, _)| s == sensor)
            .map(|(_, c)| c.as_str())
    }

    /// `(logger sensor, channel)` pairs in configured order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(s, c)| (s.as_str(), c.as_str()))
    }

    pub fn sensors(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(s, _)| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// A validated station, immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Station {
    /// Five-digit station code (e.g. "07120")
    pub code: String,
    /// IWLS internal station id
    pub id: String,
    /// Official name used in status messages
    pub name: String,
    pub address: LoggerAddress,
    pub credentials: Option<Credentials>,
    /// Logger log file for `/F`, when the logger keeps more than one
    pub log_name: Option<String>,
    pub sensor_map: SensorMap,
    /// Ingestion region tag (PACIF, ATLAN, ...)
    pub region_header: String,
    pub enabled: bool,
    /// Push script on the logger's flash disk that declares the sensor map
    pub basic_file_name: Option<String>,
    /// IWLS time series id, when known up front
    pub time_series_id: Option<String>,
}

impl Station {
    /// `"<official name> <code>"`, the tag used on every log line and status.
    pub fn label(&self) -> String {
        format!("{} {}", self.name, self.code)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl TryFrom<StationRecord> for Station {
    type Error = StationConfigError;

    fn try_from(record: StationRecord) -> Result<Self, Self::Error> {
        let station = record.label();
        let missing = |field| StationConfigError::MissingField {
            station: station.clone(),
            field,
        };

        let code = non_empty(record.code).ok_or_else(|| missing("code"))?;
        if code.len() != 5 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StationConfigError::InvalidCode {
                station: station.clone(),
                code,
            });
        }
        let id = non_empty(record.id).ok_or_else(|| missing("id"))?;
        let name = non_empty(record.official_name).unwrap_or_else(|| code.clone());
        let host = non_empty(record.host).ok_or_else(|| missing("ip_address"))?;

        let port = match record.port.ok_or_else(|| missing("port"))? {
            PortField::Number(n) => u16::try_from(n).ok().filter(|p| *p != 0).ok_or_else(|| {
                StationConfigError::InvalidPort {
                    station: station.clone(),
                    value: n.to_string(),
                }
            })?,
            PortField::Text(text) => text
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| StationConfigError::InvalidPort {
                    station: station.clone(),
                    value: text.clone(),
                })?,
        };

        let sensors = record.logger_sensors.map(ListField::into_vec).unwrap_or_default();
        let channels = record.channels.map(ListField::into_vec).unwrap_or_default();
        let sensor_map = SensorMap::new(sensors, channels).map_err(|e| match e {
            SensorMapError::Empty => StationConfigError::EmptySensorMap {
                station: station.clone(),
            },
            SensorMapError::LengthMismatch { sensors, channels } => {
                StationConfigError::SensorMapMismatch {
                    station: station.clone(),
                    sensors,
                    channels,
                }
            }
        })?;

        let region_header = non_empty(record.region_header)
            .or_else(|| {
                record
                    .chs_region_code
                    .as_deref()
                    .and_then(region_header_for)
                    .map(str::to_string)
            })
            .ok_or_else(|| missing("region_header"))?;
        let header_ok = (3..=5).contains(&region_header.len())
            && region_header.bytes().all(|b| b.is_ascii_uppercase());
        if !header_ok {
            return Err(StationConfigError::InvalidRegionHeader {
                station,
                value: region_header,
            });
        }

        let credentials = non_empty(record.username).map(|username| Credentials {
            username,
            password: record.password.unwrap_or_default(),
        });

        Ok(Station {
            code,
            id,
            name,
            address: LoggerAddress { host, port },
            credentials,
            log_name: non_empty(record.log_name),
            sensor_map,
            region_header,
            enabled: record.enabled.map(|f| f.as_bool()).unwrap_or(true),
            basic_file_name: non_empty(record.basic_file_name),
            time_series_id: non_empty(record.time_series_id),
        })
    }
}

// -- Station sources --

/// Where station records come from.
pub trait StationSource {
    fn load(&self) -> Result<Vec<StationRecord>, StationSourceError>;
}

/// Station list stored as `[[stations]]` tables in a TOML file.
#[derive(Debug, Clone)]
pub struct FileStationSource {
    path: PathBuf,
}

#[derive(Deserialize)]
struct StationFile {
    #[serde(default)]
    stations: Vec<StationRecord>,
}

impl FileStationSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl StationSource for FileStationSource {
    fn load(&self) -> Result<Vec<StationRecord>, StationSourceError> {
        let contents = fs::read_to_string(&self.path).map_err(|source| StationSourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        let file: StationFile =
            toml::from_str(&contents).map_err(|source| StationSourceError::Parse {
                path: self.path.clone(),
                source,
            })?;
        info!(
            path = %self.path.display(),
            count = file.stations.len(),
            "loaded station records"
        );
        Ok(file.stations)
    }
}

/// In-memory source, handy for tests and for callers that already hold records.
impl StationSource for Vec<StationRecord> {
    fn load(&self) -> Result<Vec<StationRecord>, StationSourceError> {
        Ok(self.clone())
    }
}

/// Lazily-populated station lookup with an explicit refresh.
pub struct StationDirectory<S> {
    source: S,
    records: Option<Vec<StationRecord>>,
}

impl<S: StationSource> StationDirectory<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            records: None,
        }
    }

    fn records(&mut self) -> Result<&[StationRecord], StationSourceError> {
        if self.records.is_none() {
            debug!("populating station directory");
            self.records = Some(self.source.load()?);
        }
        Ok(self.records.as_deref().unwrap_or_default())
    }

    /// Drop the cached records and load them again from the source.
    pub fn refresh(&mut self) -> Result<usize, StationSourceError> {
        self.records = None;
        Ok(self.records()?.len())
    }

    /// Look up and validate one station by code.
    pub fn get(&mut self, code: &str) -> Result<Station, DirectoryError> {
        let record = self
            .records()?
            .iter()
            .find(|r| r.code.as_deref().map(str::trim) == Some(code))
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(code.to_string()))?;
        Ok(Station::try_from(record)?)
    }

    /// Validate every record. Invalid ones come back as errors in place so the
    /// caller can report them per station.
    pub fn all(&mut self) -> Result<Vec<Result<Station, StationConfigError>>, StationSourceError> {
        Ok(self
            .records()?
            .iter()
            .cloned()
            .map(Station::try_from)
            .collect())
    }

    /// Valid, enabled stations. Invalid records are logged and skipped.
    pub fn enabled(&mut self) -> Result<Vec<Station>, StationSourceError> {
        let mut stations = Vec::new();
        for result in self.all()? {
            match result {
                Ok(station) if station.enabled => stations.push(station),
                Ok(station) => debug!(station = %station.label(), "station disabled, skipping"),
                Err(e) => warn!("skipping station: {e}"),
            }
        }
        Ok(stations)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Test helper: a complete record for Victoria Harbour
    pub(crate) fn victoria_record() -> StationRecord {
        StationRecord {
            code: Some("07120".into()),
            id: Some("5cebf1df3d0f4a073c4bbd1e".into()),
            official_name: Some("Victoria Harbour".into()),
            host: Some("127.0.0.1".into()),
            port: Some(PortField::Text("8081".into())),
            username: None,
            password: None,
            log_name: None,
            logger_sensors: Some(ListField::Csv("VR,SU,FTS81-1".into())),
            channels: Some(ListField::Csv("WL1,WL2,WL3".into())),
            region_header: None,
            chs_region_code: Some("PAC".into()),
            enabled: Some(FlagField::Text("True".into())),
            basic_file_name: None,
            time_series_id: None,
        }
    }

    /// A complete record validates.
    #[test]
    fn test_valid_record() {
        let station = Station::try_from(victoria_record()).unwrap();
        assert_eq!(station.code, "07120");
        assert_eq!(station.address.port, 8081);
        assert_eq!(station.region_header, "PACIF");
        assert_eq!(station.sensor_map.len(), 3);
        assert_eq!(station.sensor_map.channel_for("FTS81-1"), Some("WL3"));
        assert!(station.enabled);
        assert!(station.credentials.is_none());
        assert_eq!(station.label(), "Victoria Harbour 07120");
    }

    /// Validation errors name the station.
    #[test]
    fn test_missing_address_names_station() {
        let mut record = victoria_record();
        record.host = None;
        let err = Station::try_from(record).unwrap_err();
        assert_eq!(
            err,
            StationConfigError::MissingField {
                station: "Victoria Harbour 07120".into(),
                field: "ip_address"
            }
        );
        assert!(err.to_string().contains("Victoria Harbour 07120"));
    }

    /// Non-numeric and out-of-range ports are rejected.
    #[test]
    fn test_invalid_port() {
        let mut record = victoria_record();
        record.port = Some(PortField::Text("eighty".into()));
        assert!(matches!(
            Station::try_from(record),
            Err(StationConfigError::InvalidPort { .. })
        ));

        let mut record = victoria_record();
        record.port = Some(PortField::Number(70000));
        assert!(matches!(
            Station::try_from(record),
            Err(StationConfigError::InvalidPort { .. })
        ));
    }

    /// Sensor and channel lists must pair up.
    #[test]
    fn test_sensor_map_validation() {
        let mut record = victoria_record();
        record.channels = Some(ListField::Csv("WL1".into()));
        assert!(matches!(
            Station::try_from(record),
            Err(StationConfigError::SensorMapMismatch {
                sensors: 3,
                channels: 1,
                ..
            })
        ));

        let mut record = victoria_record();
        record.logger_sensors = Some(ListField::Csv(String::new()));
        record.channels = None;
        assert!(matches!(
            Station::try_from(record),
            Err(StationConfigError::EmptySensorMap { .. })
        ));
    }

    /// Bad station codes and region headers are rejected.
    #[test]
    fn test_bad_code_and_region() {
        let mut record = victoria_record();
        record.code = Some("7120".into());
        assert!(matches!(
            Station::try_from(record),
            Err(StationConfigError::InvalidCode { .. })
        ));

        let mut record = victoria_record();
        record.chs_region_code = Some("XYZ".into());
        assert!(matches!(
            Station::try_from(record),
            Err(StationConfigError::MissingField {
                field: "region_header",
                ..
            })
        ));
    }

    /// Loose credential and flag fields.
    #[test]
    fn test_credentials_and_flags() {
        let mut record = victoria_record();
        record.username = Some("tides".into());
        record.password = Some("secret".into());
        record.enabled = Some(FlagField::Bool(false));
        let station = Station::try_from(record).unwrap();
        let creds = station.credentials.unwrap();
        assert_eq!(creds.username, "tides");
        assert!(!format!("{creds:?}").contains("secret"));
        assert!(!station.enabled);
    }

    /// CHS region codes map to message region headers.
    #[test]
    fn test_region_header_lookup() {
        assert_eq!(region_header_for("PAC"), Some("PACIF"));
        assert_eq!(region_header_for("cna"), Some("CTRAR"));
        assert_eq!(region_header_for("ATL"), Some("ATLAN"));
        assert_eq!(region_header_for("ARC"), None);
    }

    /// Stations are read from [[stations]] tables.
    #[test]
    fn test_file_source_parses_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[stations]]
code = "07120"
id = "5cebf1df3d0f4a073c4bbd1e"
official_name = "Victoria Harbour"
ip_address = "184.151.32.86"
port = 8081
sutron_sensors = ["VR", "SU"]
iwls_sensors = ["WL1", "WL2"]
region_header = "PACIF"

[[stations]]
code = "08615"
id = "5cebf1de3d0f4a073c4bb94c"
ip_address = "10.0.0.2"
port = "8081"
sutron_sensors = "VEGA"
iwls_sensors = "WL1"
chs_region_code = "PAC"
ip_enabled = "False"
"#
        )
        .unwrap();

        let mut directory = StationDirectory::new(FileStationSource::new(file.path()));
        let station = directory.get("07120").unwrap();
        assert_eq!(station.address.host, "184.151.32.86");
        assert_eq!(station.sensor_map.channel_for("SU"), Some("WL2"));

        let enabled = directory.enabled().unwrap();
        assert_eq!(enabled.len(), 1);
        assert!(matches!(
            directory.get("99999"),
            Err(DirectoryError::NotFound(_))
        ));
    }

    struct CountingSource {
        loads: Cell<usize>,
    }

    impl StationSource for CountingSource {
        fn load(&self) -> Result<Vec<StationRecord>, StationSourceError> {
            self.loads.set(self.loads.get() + 1);
            Ok(vec![victoria_record()])
        }
    }

    /// The directory loads on first use and reloads on refresh.
    #[test]
    fn test_directory_loads_lazily_and_refreshes() {
        let mut directory = StationDirectory::new(CountingSource {
            loads: Cell::new(0),
        });
        assert_eq!(directory.source.loads.get(), 0);

        directory.get("07120").unwrap();
        directory.get("07120").unwrap();
        assert_eq!(directory.source.loads.get(), 1);

        assert_eq!(directory.refresh().unwrap(), 1);
        assert_eq!(directory.source.loads.get(), 2);
    }
}
