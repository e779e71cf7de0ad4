use std::time::Duration;

use thiserror::Error;

/// Failure of a single telemetry call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The call did not finish within its budget.
    #[error("{target} timed out after {elapsed:?}")]
    Timeout {
        /// What was being fetched.
        target: String,
        /// Budget that was exceeded.
        elapsed: Duration,
    },
    /// The upstream has no record of the requested item.
    #[error("{0} not found")]
    NotFound(String),
    /// Network or HTTP-level failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Response body did not match the expected shape.
    #[error("decode failure: {0}")]
    Decode(String),
}

impl FeedError {
    /// Classifies a `reqwest` failure for `target`.
    pub(crate) fn from_reqwest(target: &str, timeout: Duration, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                target: target.to_string(),
                elapsed: timeout,
            }
        } else if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            Self::NotFound(target.to_string())
        } else if err.is_decode() {
            Self::Decode(format!("{target}: {err}"))
        } else {
            Self::Transport(format!("{target}: {err}"))
        }
    }

    /// Whether the failure was a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
