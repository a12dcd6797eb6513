//! Error types for coefficient source operations.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while fetching from the supplies API.
///
/// `Clone` so that every waiter on a shared in-flight fetch receives the
/// same failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("Credential rejected: {0}")]
    Auth(String),

    #[error("Transient source failure: {0}")]
    Transient(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::MalformedResponse(err.to_string())
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::MalformedResponse(err.to_string())
        } else {
            SourceError::Transient(err.to_string())
        }
    }
}

impl SourceError {
    /// Returns true if this error is transient and likely to succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Transient(_) | SourceError::RateLimited { .. }
        )
    }

    /// Returns a suggested retry delay for this error type, if applicable.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => Some(*retry_after),
            SourceError::Transient(_) => Some(Duration::from_secs(2)),
            SourceError::Auth(_) | SourceError::MalformedResponse(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SourceError::Transient("timeout".into()).is_transient());
        assert!(SourceError::RateLimited {
            retry_after: Duration::from_secs(10)
        }
        .is_transient());
        assert!(!SourceError::Auth("401".into()).is_transient());
        assert!(!SourceError::MalformedResponse("eof".into()).is_transient());
    }

    #[test]
    fn test_suggested_retry_delay() {
        let limited = SourceError::RateLimited {
            retry_after: Duration::from_secs(30),
        };
        assert_eq!(limited.suggested_retry_delay(), Some(Duration::from_secs(30)));
        assert_eq!(SourceError::Auth("401".into()).suggested_retry_delay(), None);
    }

    #[test]
    fn test_serde_error_is_malformed() {
        let err: SourceError = serde_json::from_str::<Vec<u32>>("{").unwrap_err().into();
        assert!(matches!(err, SourceError::MalformedResponse(_)));
    }
}
