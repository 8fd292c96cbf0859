//! Error types for breaker-guarded calls and configuration.

use std::time::Duration;
use thiserror::Error;

/// Result type for breaker-guarded operations.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Error type for breaker-guarded operations.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the call was rejected without running.
    #[error("circuit breaker '{endpoint}' is open, retry in {}ms", .retry_after.as_millis())]
    Open {
        /// Endpoint the breaker guards.
        endpoint: String,
        /// Time left until a probe is allowed.
        retry_after: Duration,
    },

    /// The circuit is half-open and its single probe is already running.
    #[error("circuit breaker '{endpoint}' is probing for recovery, call rejected")]
    ProbeInFlight {
        /// Endpoint the breaker guards.
        endpoint: String,
    },

    /// The operation did not finish in time. Counted as a failure.
    #[error("call to '{endpoint}' timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Endpoint the breaker guards.
        endpoint: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The underlying operation failed.
    #[error(transparent)]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// True for rejections issued by the breaker itself.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BreakerError::Open { .. } | BreakerError::ProbeInFlight { .. }
        )
    }

    /// Whether a retry loop may attempt the call again.
    ///
    /// Rejections signal the caller to back off at a higher level and are
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        !self.is_rejection()
    }

    /// Remaining wait reported by an open circuit.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BreakerError::Open { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns the operation error, if this is one.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value the breaker cannot work with.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("upstream returned {0}")]
    struct Upstream(u16);

    #[test]
    fn open_is_not_retryable() {
        let err: BreakerError<Upstream> = BreakerError::Open {
            endpoint: "item-fetch".into(),
            retry_after: Duration::from_millis(500),
        };
        assert!(err.is_rejection());
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(500)));
        assert_eq!(
            err.to_string(),
            "circuit breaker 'item-fetch' is open, retry in 500ms"
        );
    }

    #[test]
    fn operation_error_is_transparent() {
        let err = BreakerError::Operation(Upstream(502));
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "upstream returned 502");
        assert_eq!(err.into_operation(), Some(Upstream(502)));
    }

    #[test]
    fn timeout_counts_as_retryable() {
        let err: BreakerError<Upstream> = BreakerError::Timeout {
            endpoint: "proxy-service-1".into(),
            timeout: Duration::from_secs(2),
        };
        assert!(err.is_retryable());
        assert!(err.retry_after().is_none());
    }
}
