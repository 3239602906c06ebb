use std::time::Duration;
use thiserror::Error;

/// Failures reported by a browser session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The session is gone (browser closed, authentication lost). No further
    /// page loads are possible.
    #[error("browser session lost: {0}")]
    Fatal(String),

    /// A single navigation action failed: stale element, broken link,
    /// blocked redirect.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// Reading page state (source, screenshot, network log) failed.
    #[error("page capture failed: {0}")]
    Capture(String),
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Fatal(_))
    }
}

/// Failures talking to a text or vision model.
///
/// Every oracle consumer recovers from these locally; they never abort a scrape.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("model backend unreachable: {0}")]
    Unreachable(String),

    #[error("model backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model response could not be parsed: {0}")]
    Malformed(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OracleError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            OracleError::Malformed(err.to_string())
        } else {
            OracleError::Unreachable(err.to_string())
        }
    }
}

/// The only failure `run_scrape` surfaces to its caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScrapeError {
    #[error("scrape aborted, session is unusable: {0}")]
    SessionFatal(String),
}

impl From<SessionError> for ScrapeError {
    fn from(err: SessionError) -> Self {
        ScrapeError::SessionFatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fatal_is_fatal() {
        assert!(SessionError::Fatal("invalid session id".into()).is_fatal());
        assert!(!SessionError::Navigation("stale element".into()).is_fatal());
        assert!(!SessionError::Capture("screenshot".into()).is_fatal());
    }

    #[test]
    fn test_scrape_error_message() {
        let err: ScrapeError = SessionError::Fatal("no such window".into()).into();
        assert_eq!(
            err.to_string(),
            "scrape aborted, session is unusable: browser session lost: no such window"
        );
    }
}
