//! # IWLS REST Client
//!
//! The two HTTP legs of the pipeline:
//!
//! - **Gap lookup**: `GET {api_base}/stations/{id}/time-series/{ts}/find-data-gaps/`
//!   and the time-series listing used to resolve `{ts}` from a code such as `wlo`
//! - **Ingestion**: `POST {ingest_url}` with a framed [`WireMessage`] as the body
//!
//! Lookups are paced by a fixed delay so a full network sweep does not hammer
//! the API. Ingestion never retries; the status code is handed back to the
//! caller, which records it on the station report.

use crate::gaps::{parse_gap_response, GAP_TIME_FORMAT};
use crate::message::WireMessage;
use crate::Gap;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default timeout for any single HTTP request.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Observed water level series.
pub const DEFAULT_TIME_SERIES_CODE: &str = "wlo";

/// Status codes the ingestion endpoint uses for an accepted message.
pub const ACCEPTED_STATUSES: [u16; 3] = [200, 201, 202];

#[derive(Error, Debug)]
pub enum IwlsError {
    /// Request never got an HTTP answer
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("could not decode reply from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("station {station_id} has no '{code}' time series")]
    NoTimeSeries { station_id: String, code: String },

    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Outcome of one ingestion POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub status: u16,
    pub body: String,
}

impl Delivery {
    pub fn is_success(&self) -> bool {
        ACCEPTED_STATUSES.contains(&self.status)
    }
}

#[derive(Debug, Deserialize)]
struct TimeSeriesEntry {
    id: String,
    code: String,
}

/// Client for the IWLS private API.
#[derive(Debug, Clone)]
pub struct IwlsClient {
    http: Client,
    api_base: String,
    ingest_url: String,
    bearer_token: Option<String>,
    request_delay: Duration,
    time_series_code: String,
}

impl IwlsClient {
    pub fn new(api_base: &str, ingest_url: &str) -> Result<Self, IwlsError> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(IwlsError::Client)?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            ingest_url: ingest_url.to_string(),
            bearer_token: None,
            request_delay: Duration::ZERO,
            time_series_code: DEFAULT_TIME_SERIES_CODE.to_string(),
        })
    }

    /// Sent as `Authorization: Bearer ...` on every request.
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|t| !t.is_empty());
        self
    }

    /// Pause before every lookup request.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Time series searched for gaps when a station has no id configured.
    pub fn with_time_series_code(mut self, code: &str) -> Self {
        self.time_series_code = code.to_string();
        self
    }

    pub fn time_series_code(&self) -> &str {
        &self.time_series_code
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a GET and return the status with the raw body, whatever the status.
    async fn fetch(&self, url: &str, query: &[(&str, String)]) -> Result<(StatusCode, String), IwlsError> {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        debug!(%url, "GET");

        let request = self
            .http
            .get(url)
            .header(ACCEPT, "application/json,*/*")
            .query(query);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|source| IwlsError::Http {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| IwlsError::Http {
            url: url.to_string(),
            source,
        })?;
        Ok((status, body))
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, IwlsError> {
        let (status, body) = self.fetch(url, query).await?;
        if !status.is_success() {
            return Err(IwlsError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|source| IwlsError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Missing-data windows of one time series between `from` and `to`.
    ///
    /// An error object in place of the gap list (stations without an expected
    /// productivity, for instance) means no gap information, not a failure,
    /// even when it comes with an error status. Only a reply that is not JSON
    /// at all is an [`IwlsError::Status`].
    pub async fn find_data_gaps(
        &self,
        station_id: &str,
        time_series_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Gap>, IwlsError> {
        let url = format!(
            "{}/stations/{}/time-series/{}/find-data-gaps/",
            self.api_base, station_id, time_series_id
        );
        let query = [
            ("from", from.format(GAP_TIME_FORMAT).to_string()),
            ("to", to.format(GAP_TIME_FORMAT).to_string()),
        ];
        let (status, body) = self.fetch(&url, &query).await?;
        let reply: Value = match serde_json::from_str(&body) {
            Ok(reply) => reply,
            Err(source) if status.is_success() => return Err(IwlsError::Decode { url, source }),
            Err(_) => {
                return Err(IwlsError::Status {
                    url,
                    status: status.as_u16(),
                    body,
                })
            }
        };
        if !status.is_success() {
            warn!(station_id, status = status.as_u16(), "gap lookup answered with an error status");
        }
        let gaps = parse_gap_response(&reply);
        debug!(station_id, gaps = gaps.len(), "gap lookup complete");
        Ok(gaps)
    }

    /// Resolve the id of the time series with the given code (`wlo`, ...).
    pub async fn timeseries_id(&self, station_id: &str, code: &str) -> Result<String, IwlsError> {
        let url = format!("{}/stations/{}/time-series/", self.api_base, station_id);
        let reply = self.get_json(&url, &[]).await?;
        let entries: Vec<TimeSeriesEntry> =
            serde_json::from_value(reply).map_err(|source| IwlsError::Decode {
                url: url.clone(),
                source,
            })?;

        entries
            .into_iter()
            .find(|entry| entry.code == code)
            .map(|entry| entry.id)
            .ok_or_else(|| IwlsError::NoTimeSeries {
                station_id: station_id.to_string(),
                code: code.to_string(),
            })
    }

    /// Post one message to the ingestion endpoint.
    ///
    /// Any HTTP answer is returned as a [`Delivery`]; only transport failures
    /// are errors.
    pub async fn send_message(&self, message: &WireMessage) -> Result<Delivery, IwlsError> {
        let request = self
            .http
            .post(&self.ingest_url)
            .header(CONTENT_TYPE, "application/json")
            .body(message.render());
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|source| IwlsError::Http {
                url: self.ingest_url.clone(),
                source,
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let delivery = Delivery { status, body };
        if delivery.is_success() {
            info!(status, rows = message.rows(), "message accepted");
        } else {
            warn!(status, body = %delivery.body, "message rejected");
        }
        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fake_http::FakeHttp;
    use chrono::TimeZone;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2022, 1, 16, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2022, 1, 17, 0, 0, 0).unwrap(),
        )
    }

    /// Only 200, 201 and 202 count as accepted.
    #[test]
    fn test_delivery_success_codes() {
        for status in [200, 201, 202] {
            assert!(Delivery { status, body: String::new() }.is_success());
        }
        for status in [204, 400, 401, 500] {
            assert!(!Delivery { status, body: String::new() }.is_success());
        }
    }

    /// Gap lookup URL, query window and bearer header.
    #[tokio::test]
    async fn test_find_data_gaps_request_and_parse() {
        let server = FakeHttp::fixed(
            200,
            r#"[{"start":"2022-01-16T18:10:00Z","end":"2022-01-16T22:32:00Z","numberOfMissingData":263}]"#,
        );
        let requests = server.requests();
        let (base, _handle) = server.spawn().await;

        let client = IwlsClient::new(&format!("{base}/api/v1"), "unused")
            .unwrap()
            .with_bearer_token(Some("abc".into()));
        let (from, to) = window();
        let gaps = client
            .find_data_gaps("5cebf1df3d0f4a073c4bbd1e", "ts1", from, to)
            .await
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].missing_samples, 263);

        let seen = requests.lock().unwrap();
        assert_eq!(seen[0].method, "GET");
        assert!(seen[0]
            .target
            .starts_with("/api/v1/stations/5cebf1df3d0f4a073c4bbd1e/time-series/ts1/find-data-gaps/?"));
        assert!(seen[0].target.contains("from=2022-01-16T00%3A00%3A00Z"));
        assert!(seen[0].target.contains("to=2022-01-17T00%3A00%3A00Z"));
        assert_eq!(seen[0].headers.get("authorization").map(String::as_str), Some("Bearer abc"));
    }

    /// An error object with a 200 means no gaps.
    #[tokio::test]
    async fn test_error_object_means_no_gaps() {
        let server = FakeHttp::fixed(
            200,
            r#"{"message":"frequency per hour is null","code":"EMPTY_STATION_EXPECTED_PRODUCTIVITY"}"#,
        );
        let (base, _handle) = server.spawn().await;
        let client = IwlsClient::new(&base, "unused").unwrap();
        let (from, to) = window();
        let gaps = client.find_data_gaps("s", "t", from, to).await.unwrap();
        assert!(gaps.is_empty());
    }

    /// An error object under a 404 still means no gap information.
    #[tokio::test]
    async fn test_error_status_with_json_body_means_no_gaps() {
        let (base, _handle) = FakeHttp::fixed(404, r#"{"code":"NOT_FOUND","message":"x"}"#)
            .spawn()
            .await;
        let client = IwlsClient::new(&base, "unused").unwrap();
        let (from, to) = window();
        let gaps = client.find_data_gaps("s", "t", from, to).await.unwrap();
        assert!(gaps.is_empty());
    }

    /// A non-JSON error page is a lookup failure.
    #[tokio::test]
    async fn test_http_status_failure() {
        let (base, _handle) = FakeHttp::fixed(503, "busy").spawn().await;
        let client = IwlsClient::new(&base, "unused").unwrap();
        let (from, to) = window();
        let err = client.find_data_gaps("s", "t", from, to).await.unwrap_err();
        assert!(matches!(err, IwlsError::Status { status: 503, .. }));
    }

    /// Time series ids are resolved by code.
    #[tokio::test]
    async fn test_timeseries_id_by_code() {
        let server = FakeHttp::fixed(
            200,
            r#"[{"id":"a1","code":"wlp"},{"id":"b2","code":"wlo","nameEn":"Observed"}]"#,
        );
        let (base, _handle) = server.spawn().await;
        let client = IwlsClient::new(&base, "unused").unwrap();

        assert_eq!(client.timeseries_id("s", "wlo").await.unwrap(), "b2");
        assert!(matches!(
            client.timeseries_id("s", "wlf").await,
            Err(IwlsError::NoTimeSeries { .. })
        ));
    }

    /// The wire string is posted as a JSON body.
    #[tokio::test]
    async fn test_send_message_posts_wire_string() {
        let server = FakeHttp::fixed(202, "");
        let requests = server.requests();
        let (base, _handle) = server.spawn().await;
        let client = IwlsClient::new(&base, &format!("{base}/rest/stations/integrateRawObservations")).unwrap();

        let message = WireMessage::new("PACIF,07120,WL1;211222,160100,5.017,m,G");
        let delivery = client.send_message(&message).await.unwrap();
        assert!(delivery.is_success());

        let seen = requests.lock().unwrap();
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].target, "/rest/stations/integrateRawObservations");
        assert_eq!(
            seen[0].headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(seen[0].body, "[\"$PACIF,07120,WL1;211222,160100,5.017,m,G*3C7C\"]\r\n");
    }

    /// A rejected message comes back as a delivery, not an error.
    #[tokio::test]
    async fn test_rejected_message_is_not_an_error() {
        let (base, _handle) = FakeHttp::fixed(400, "bad checksum").spawn().await;
        let client = IwlsClient::new(&base, &base).unwrap();
        let delivery = client
            .send_message(&WireMessage::new("PACIF,07120,WL1"))
            .await
            .unwrap();
        assert_eq!(delivery.status, 400);
        assert_eq!(delivery.body, "bad checksum");
        assert!(!delivery.is_success());
    }
}
