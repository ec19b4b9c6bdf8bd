//! # Reply Validation
//!
//! The logger is half-duplex and has no sequence numbers, so the only proof
//! that a reply belongs to the query just sent is the echo: the logger repeats
//! the command as the first line, and finishes with its ready prompt. Replies
//! failing either check are dropped and the session moves on to the next
//! query.

use tracing::{debug, info};

/// The prompt line that closes every complete reply.
pub const READY_PROMPT_LINE: &str = "\\Flash Disk>";

/// Longest excerpt of an offending line written to the log.
const EXCERPT_LEN: usize = 30;

fn excerpt(line: &str) -> &str {
    match line.char_indices().nth(EXCERPT_LEN) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Why a reply was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    EchoMismatch { echoed: String },
    MissingPrompt { last: String },
}

/// Check a reply against the query that produced it.
///
/// On success returns the payload lines, with the echoed query and the
/// trailing prompt removed.
pub fn check_reply(query: &str, mut lines: Vec<String>) -> Result<Vec<String>, Rejection> {
    let Some(first) = lines.first() else {
        return Err(Rejection::Empty);
    };

    if first.trim() != query.trim() {
        return Err(Rejection::EchoMismatch {
            echoed: excerpt(first.trim()).to_string(),
        });
    }

    match lines.last() {
        Some(last) if lines.len() > 1 && last == READY_PROMPT_LINE => {}
        last => {
            return Err(Rejection::MissingPrompt {
                last: last.map(|l| excerpt(l).to_string()).unwrap_or_default(),
            })
        }
    }

    lines.pop();
    lines.remove(0);
    Ok(lines)
}

/// [`check_reply`] with the rejection logged against the station.
///
/// Returns `None` for a rejected reply.
pub fn validate_reply(query: &str, lines: Vec<String>, station: &str) -> Option<Vec<String>> {
    match check_reply(query, lines) {
        Ok(payload) => {
            debug!(station, lines = payload.len(), "reply accepted");
            Some(payload)
        }
        Err(Rejection::Empty) => {
            info!(station, query = query.trim(), "reply was empty");
            None
        }
        Err(Rejection::EchoMismatch { echoed }) => {
            info!(
                station,
                sent = query.trim(),
                echoed = %echoed,
                "reply did not echo the query sent"
            );
            None
        }
        Err(Rejection::MissingPrompt { last }) => {
            info!(station, last = %last, "reply did not end with the Flash Disk prompt");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY: &str = "get /S 01-01-2024 00:00 /E 01-01-2024 00:01 /ny /c /csv\r\n";

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// A valid reply yields its payload lines.
    #[test]
    fn test_valid_reply_yields_payload() {
        let reply = lines(&[
            "get /S 01-01-2024 00:00 /E 01-01-2024 00:01 /ny /c /csv",
            "01/01/2024,00:00:00,VR,5.017,m,G",
            READY_PROMPT_LINE,
        ]);
        let payload = validate_reply(QUERY, reply, "Victoria Harbour 07120").unwrap();
        assert_eq!(payload, vec!["01/01/2024,00:00:00,VR,5.017,m,G"]);
    }

    /// A wrong echo is rejected even with a good prompt.
    #[test]
    fn test_echo_mismatch_rejected_regardless_of_prompt() {
        for first in [
            "get /S 01-01-2024 00:00 /E 01-01-2024 00:02 /ny /c /csv",
            "GET /S 01-01-2024 00:00 /E 01-01-2024 00:01 /ny /c /csv",
            "get /S 01-01-2024 00:00  /E 01-01-2024 00:01 /ny /c /csv",
        ] {
            let reply = lines(&[first, "data", READY_PROMPT_LINE]);
            assert!(matches!(
                check_reply(QUERY, reply),
                Err(Rejection::EchoMismatch { .. })
            ));
        }
    }

    /// Whitespace around the echo does not matter.
    #[test]
    fn test_surrounding_whitespace_is_ignored() {
        let reply = lines(&[
            "  get /S 01-01-2024 00:00 /E 01-01-2024 00:01 /ny /c /csv \r",
            READY_PROMPT_LINE,
        ]);
        assert_eq!(check_reply(QUERY, reply), Ok(vec![]));
    }

    /// Replies must end on the directory prompt.
    #[test]
    fn test_missing_prompt_rejected() {
        let reply = lines(&[
            "get /S 01-01-2024 00:00 /E 01-01-2024 00:01 /ny /c /csv",
            "01/01/2024,00:00:00,VR,5.017,m,G",
        ]);
        assert!(matches!(
            check_reply(QUERY, reply),
            Err(Rejection::MissingPrompt { .. })
        ));

        let echo_only = lines(&["get /S 01-01-2024 00:00 /E 01-01-2024 00:01 /ny /c /csv"]);
        assert!(validate_reply(QUERY, echo_only, "test").is_none());
    }

    #[test]
    fn test_empty_reply_rejected() {
        assert_eq!(check_reply(QUERY, Vec::new()), Err(Rejection::Empty));
    }

    /// Logged excerpts are capped at 30 characters.
    #[test]
    fn test_excerpt_is_bounded() {
        let long = "x".repeat(500);
        let reply = lines(&[&long, READY_PROMPT_LINE]);
        match check_reply(QUERY, reply) {
            Err(Rejection::EchoMismatch { echoed }) => assert_eq!(echoed.len(), EXCERPT_LEN),
            other => panic!("unexpected {other:?}"),
        }
    }
}
