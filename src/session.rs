//! # Data Logger Session
//!
//! Drives the line-oriented command interface of a station's data logger over
//! a raw socket. The logger is half-duplex: it accepts one command, writes its
//! reply, and signals readiness with the `Flash Disk>` prompt. There are no
//! sequence numbers or unsolicited messages, so every transition below is
//! gated either on writing one complete command or on seeing one complete
//! prompt.
//!
//! ```text
//! Connecting ──(username configured)──▶ Authenticating
//!     │                                      │
//!     └──────────── "Flash Disk>" ◀──────────┘
//!                        │
//!                        ▼
//!   Closed ◀── close ── Idle ── write query ──▶ AwaitingReply
//!                        ▲                          │
//!                        └──── "Flash Disk>" ───────┘
//!
//! any timeout or transport error ──▶ Failed
//! ```
//!
//! ## Timeouts
//! - **Prompt wait** (default 10 s): connect, login prompt, initial ready prompt
//! - **Query reply** (default 25 s): one `get` command's full reply
//!
//! A query timeout fails the whole session; remaining queries for the station
//! are skipped. Timeouts and transport failures are reported as distinct
//! [`SessionError`] variants so callers can tell a stalled logger from an
//! unreachable one.
//!
//! The session owns its stream, so the socket is released on every exit
//! path: explicit [`LoggerSession::close`], an error return, or a drop.

use crate::query::Query;
use crate::station::Station;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Prompt sent by loggers that require a login.
pub const LOGIN_PROMPT: &[u8] = b"Login user: ";

/// Ready prompt closing the banner and every reply.
pub const READY_PROMPT: &[u8] = b"Flash Disk>";

/// Any byte stream a session can run over.
pub trait LoggerIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LoggerIo for T {}

/// Lifecycle of one logger connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Idle,
    AwaitingReply,
    Failed,
    Closed,
}

/// What the session was waiting for when it gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStage {
    LoginPrompt,
    ReadyPrompt,
    QueryReply,
    CommandReply,
}

impl fmt::Display for WaitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            WaitStage::LoginPrompt => "Login User",
            WaitStage::ReadyPrompt => "Waiting for Initial Flash Disk prompt",
            WaitStage::QueryReply => "Sending query to station",
            WaitStage::CommandReply => "Sending command to station",
        };
        f.write_str(text)
    }
}

/// Session failures, each tagged with the station label.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The logger stopped answering
    #[error("{station}: Socket Timeout - {stage}")]
    Timeout { station: String, stage: WaitStage },

    /// Connect, read or write failed at the transport level
    #[error("{station}: could not establish connection to {address}: {source}")]
    Connection {
        station: String,
        address: String,
        #[source]
        source: io::Error,
    },

    /// The logger answered, but not with what the station configuration expects
    #[error("{station}: {reason}")]
    Configuration { station: String, reason: String },

    #[error("{station}: cannot {action} while session is {state:?}")]
    InvalidState {
        station: String,
        state: SessionState,
        action: &'static str,
    },
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, SessionError::Connection { .. })
    }
}

/// Wait limits for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Connect, login prompt and initial ready prompt
    pub prompt: Duration,
    /// Complete reply to one query
    pub query: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            prompt: Duration::from_secs(10),
            query: Duration::from_secs(25),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split a decoded reply into lines the way the logger terminates them.
pub fn reply_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split("\r\n")
        .map(str::to_string)
        .collect()
}

/// One open connection to a data logger.
pub struct LoggerSession {
    io: Box<dyn LoggerIo>,
    buffer: Vec<u8>,
    state: SessionState,
    station: String,
    address: String,
    timeouts: SessionTimeouts,
}

impl fmt::Debug for LoggerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerSession")
            .field("station", &self.station)
            .field("address", &self.address)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl LoggerSession {
    /// Open a TCP connection to the station's logger and bring the session to
    /// `Idle`.
    pub async fn connect(station: &Station, timeouts: SessionTimeouts) -> Result<Self, SessionError> {
        let address = station.address.to_string();
        debug!(station = %station.label(), %address, "connecting to logger");

        let target = (station.address.host.as_str(), station.address.port);
        let stream = match timeout(timeouts.prompt, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(SessionError::Connection {
                    station: station.label(),
                    address,
                    source,
                })
            }
            Err(_) => {
                return Err(SessionError::Connection {
                    station: station.label(),
                    address,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };

        Self::open(stream, station, timeouts).await
    }

    /// Run the login exchange over an already-connected stream.
    pub async fn open<S>(io: S, station: &Station, timeouts: SessionTimeouts) -> Result<Self, SessionError>
    where
        S: LoggerIo + 'static,
    {
        let mut session = Self {
            io: Box::new(io),
            buffer: Vec::with_capacity(4096),
            state: SessionState::Connecting,
            station: station.label(),
            address: station.address.to_string(),
            timeouts,
        };

        if let Some(credentials) = &station.credentials {
            session.state = SessionState::Authenticating;
            session
                .read_until(LOGIN_PROMPT, timeouts.prompt, WaitStage::LoginPrompt)
                .await?;
            session
                .write(format!("{}\r", credentials.username).as_bytes())
                .await?;
            session
                .write(format!("{}\r", credentials.password).as_bytes())
                .await?;
            debug!(station = %session.station, "credentials sent");
        }

        session
            .read_until(READY_PROMPT, timeouts.prompt, WaitStage::ReadyPrompt)
            .await?;
        session.state = SessionState::Idle;
        info!(station = %session.station, address = %session.address, "logger session ready");
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `"<official name> <code>"` of the station this session talks to.
    pub fn station(&self) -> &str {
        &self.station
    }

    /// Send one query and return its reply split into lines.
    ///
    /// The reply is not validated here; see [`crate::validator`].
    pub async fn execute(&mut self, query: &Query) -> Result<Vec<String>, SessionError> {
        debug!(station = %self.station, query = %query.text().trim(), "sending query");
        self.exchange(query.as_bytes(), self.timeouts.query, WaitStage::QueryReply)
            .await
    }

    /// Send an arbitrary command line (terminator added) and return its reply.
    pub async fn command(&mut self, line: &str) -> Result<Vec<String>, SessionError> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.trim_end().as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.exchange(&bytes, self.timeouts.prompt, WaitStage::CommandReply)
            .await
    }

    /// Release the socket.
    pub async fn close(mut self) {
        if let Err(e) = self.io.shutdown().await {
            debug!(station = %self.station, "socket shutdown: {e}");
        }
        self.state = SessionState::Closed;
        debug!(station = %self.station, "logger session closed");
    }

    async fn exchange(
        &mut self,
        bytes: &[u8],
        limit: Duration,
        stage: WaitStage,
    ) -> Result<Vec<String>, SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                station: self.station.clone(),
                state: self.state,
                action: "send a command",
            });
        }

        self.write(bytes).await?;
        self.state = SessionState::AwaitingReply;
        let raw = self.read_until(READY_PROMPT, limit, stage).await?;
        self.state = SessionState::Idle;

        let lines = reply_lines(&raw);
        debug!(station = %self.station, lines = lines.len(), "reply received");
        Ok(lines)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if let Err(source) = self.io.write_all(bytes).await {
            return Err(self.transport_failure(source));
        }
        if let Err(source) = self.io.flush().await {
            return Err(self.transport_failure(source));
        }
        Ok(())
    }

    /// Read until `marker` has been seen, returning everything up to and
    /// including it. Bytes after the marker stay buffered for the next read.
    async fn read_until(
        &mut self,
        marker: &[u8],
        limit: Duration,
        stage: WaitStage,
    ) -> Result<Vec<u8>, SessionError> {
        let deadline = Instant::now() + limit;
        let mut chunk = [0u8; 4096];

        loop {
            if let Some(pos) = find(&self.buffer, marker) {
                let end = pos + marker.len();
                return Ok(self.buffer.drain(..end).collect());
            }

            match timeout_at(deadline, self.io.read(&mut chunk)).await {
                Err(_) => {
                    self.state = SessionState::Failed;
                    warn!(station = %self.station, %stage, "logger timed out");
                    return Err(SessionError::Timeout {
                        station: self.station.clone(),
                        stage,
                    });
                }
                Ok(Ok(0)) => {
                    return Err(self.transport_failure(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("connection closed by logger ({stage})"),
                    )))
                }
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(source)) => return Err(self.transport_failure(source)),
            }
        }
    }

    fn transport_failure(&mut self, source: io::Error) -> SessionError {
        self.state = SessionState::Failed;
        warn!(station = %self.station, "logger transport error: {source}");
        SessionError::Connection {
            station: self.station.clone(),
            address: self.address.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::encode_query;
    use crate::station::tests::victoria_record;
    use crate::station::Credentials;
    use crate::tests::fake_logger::{FakeLogger, Reply};
    use crate::DateRange;
    use chrono::NaiveDate;

    fn station() -> Station {
        Station::try_from(victoria_record()).unwrap()
    }

    fn quick() -> SessionTimeouts {
        SessionTimeouts {
            prompt: Duration::from_millis(200),
            query: Duration::from_millis(300),
        }
    }

    fn query() -> Query {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        encode_query(
            DateRange::new(day.and_hms_opt(0, 0, 0).unwrap(), day.and_hms_opt(0, 1, 0).unwrap()),
            None,
        )
    }

    /// Locate the ready prompt in a partial buffer.
    #[test]
    fn test_find_marker() {
        assert_eq!(find(b"abc\\Flash Disk>", READY_PROMPT), Some(4));
        assert_eq!(find(b"Flash Dis", READY_PROMPT), None);
    }

    /// Replies split on CRLF and decode lossily.
    #[test]
    fn test_reply_lines_split() {
        let lines = reply_lines(b"get x\r\n01/01/2024,00:00:00,VR,1,m,G\r\n\\Flash Disk>");
        assert_eq!(lines, vec!["get x", "01/01/2024,00:00:00,VR,1,m,G", "\\Flash Disk>"]);
    }

    /// Open straight to the prompt and run one query.
    #[tokio::test]
    async fn test_open_and_query_without_login() {
        let logger = FakeLogger::new(|_| Reply::Data(vec!["01/01/2024,00:00:00,VR,5.017,m,G".into()]));
        let received = logger.received();
        let (stream, server) = logger.spawn_duplex();

        let mut session = LoggerSession::open(stream, &station(), quick()).await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);

        let lines = session.execute(&query()).await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(
            lines,
            vec![
                "get /S 01-01-2024 00:00 /E 01-01-2024 00:01 /ny /c /csv",
                "01/01/2024,00:00:00,VR,5.017,m,G",
                "\\Flash Disk>",
            ]
        );

        session.close().await;
        server.await.unwrap();
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    /// Logging in with the configured credentials reaches the ready prompt.
    #[tokio::test]
    async fn test_login_exchange() {
        let mut station = station();
        station.credentials = Some(Credentials {
            username: "tides".into(),
            password: "secret".into(),
        });
        let logger = FakeLogger::new(|_| Reply::Data(vec![])).with_login("tides", "secret");
        let (stream, server) = logger.spawn_duplex();

        let session = LoggerSession::open(stream, &station, quick()).await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        session.close().await;
        server.await.unwrap();
    }

    /// No login prompt is a login-stage timeout.
    #[tokio::test]
    async fn test_missing_login_prompt_times_out() {
        let mut station = station();
        station.credentials = Some(Credentials {
            username: "tides".into(),
            password: "secret".into(),
        });
        // Logger goes straight to the ready prompt, never asks for a login.
        let logger = FakeLogger::new(|_| Reply::Data(vec![]));
        let (stream, _server) = logger.spawn_duplex();

        let err = LoggerSession::open(stream, &station, quick()).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("Victoria Harbour 07120"));
        assert!(err.to_string().contains("Login User"));
    }

    /// A silent logger times out the query and fails the session.
    #[tokio::test]
    async fn test_silent_logger_times_out_query() {
        let logger = FakeLogger::new(|_| Reply::Silent);
        let (stream, _server) = logger.spawn_duplex();

        let mut session = LoggerSession::open(stream, &station(), quick()).await.unwrap();
        let err = session.execute(&query()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Timeout {
                stage: WaitStage::QueryReply,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Failed);

        // A failed session refuses further commands.
        let again = session.execute(&query()).await.unwrap_err();
        assert!(matches!(again, SessionError::InvalidState { .. }));
    }

    /// A dropped connection is a connection failure, not a timeout.
    #[tokio::test]
    async fn test_hangup_is_connection_failure() {
        let logger = FakeLogger::new(|_| Reply::Hangup);
        let (stream, _server) = logger.spawn_duplex();

        let mut session = LoggerSession::open(stream, &station(), quick()).await.unwrap();
        let err = session.execute(&query()).await.unwrap_err();
        assert!(err.is_connection());
        assert!(!err.is_timeout());
        assert_eq!(session.state(), SessionState::Failed);
    }

    /// Connect to a loopback logger over TCP.
    #[tokio::test]
    async fn test_connect_over_tcp() {
        let logger = FakeLogger::new(|_| Reply::Data(vec!["a,b,c,d,e,f".into()]));
        let (addr, _server) = logger.spawn_tcp().await;
        let mut station = station();
        station.address.host = addr.ip().to_string();
        station.address.port = addr.port();

        let mut session = LoggerSession::connect(&station, quick()).await.unwrap();
        let lines = session.execute(&query()).await.unwrap();
        assert_eq!(lines.len(), 3);
        session.close().await;
    }

    /// A refused connection is a connection failure.
    #[tokio::test]
    async fn test_connection_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut station = station();
        station.address.host = addr.ip().to_string();
        station.address.port = addr.port();

        let err = LoggerSession::connect(&station, quick()).await.unwrap_err();
        assert!(err.is_connection());
        assert!(err.to_string().contains("could not establish connection"));
    }
}
