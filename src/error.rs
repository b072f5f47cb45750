//! Error types across the publishing pipeline.
//!
//! Every failure a caller can react to is a typed variant; nothing in
//! this crate requires string matching on error text. Retryability is
//! decided by [`crate::classify::classify`], never ad hoc.

use crate::format::FormatError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Classification of a publish failure, driving retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Worth retrying under the backoff policy.
    Transient,
    /// Retrying cannot help; route to the dead-letter store.
    Permanent,
    /// Unclassified. Retried like transient, surfaced distinctly in
    /// metrics.
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorClass::Transient),
            "permanent" => Ok(ErrorClass::Permanent),
            "unknown" => Ok(ErrorClass::Unknown),
            _ => Err(()),
        }
    }
}

/// Failure mode of the transport below HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    ConnectionRefused,
    ConnectionReset,
    Timeout,
    Dns,
    Other,
}

/// A single publish attempt against one endpoint failed.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Input shape invalid (missing required field). Never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The formatter could not render a payload. Never retried.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Credentials missing or rejected before the wire. Never retried.
    #[error("missing or rejected credentials: {0}")]
    Auth(String),

    /// The endpoint answered with a non-2xx status.
    #[error("endpoint returned status {status}: {body_prefix}")]
    Http {
        status: u16,
        /// First bytes of the response body, for diagnostics.
        body_prefix: String,
        /// `Retry-After` hint, honored by the retry loop.
        retry_after: Option<Duration>,
    },

    /// The request never produced an HTTP response.
    #[error("transport failure ({kind:?}): {message}")]
    Transport { kind: TransportKind, message: String },

    /// The attempt deadline elapsed.
    #[error("attempt timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// A local rate limiter refused the attempt within its deadline.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The rendered payload exceeds the configured limit.
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
}

impl PublishError {
    /// `Retry-After` hint carried by the failure, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PublishError::Http { retry_after, .. } => *retry_after,
            PublishError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status code, when the endpoint answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            PublishError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Synchronous dispatch-layer refusals returned by `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The priority buffer is full. The job was not added.
    #[error("publishing queue is full")]
    QueueFull,
    /// The queue is no longer accepting submissions.
    #[error("publishing queue is shutting down")]
    ShuttingDown,
}

/// Aggregate outcomes of a fan-out that produced no success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FanoutError {
    #[error("no enabled targets to publish to")]
    NoEnabledTargets,
    #[error("no healthy targets after filtering")]
    NoHealthyTargets,
    #[error("all {attempted} attempted targets failed")]
    AllTargetsFailed { attempted: usize },
}

/// Dead-letter store failures.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("dead-letter entry {0} not found")]
    NotFound(Uuid),
    #[error("dead-letter entry {0} was already replayed")]
    AlreadyReplayed(Uuid),
    #[error("dead-letter entry {0} could not be re-enqueued: {1}")]
    Resubmit(Uuid, SubmitError),
    #[error("dead-letter storage failure: {0}")]
    Storage(String),
    #[error("dead-letter serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_surfaces_from_http() {
        let err = PublishError::Http {
            status: 429,
            body_prefix: "slow down".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn retry_after_absent_elsewhere() {
        let err = PublishError::Auth("no routing key".into());
        assert_eq!(err.retry_after(), None);
        assert_eq!(err.status(), None);
    }

    #[test]
    fn class_round_trips_as_str() {
        for class in [ErrorClass::Transient, ErrorClass::Permanent, ErrorClass::Unknown] {
            assert_eq!(class.as_str().parse::<ErrorClass>().unwrap(), class);
        }
    }

    #[test]
    fn permanent_is_not_retryable() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::Unknown.is_retryable());
        assert!(!ErrorClass::Permanent.is_retryable());
    }

    #[test]
    fn http_display_carries_status_and_prefix() {
        let err = PublishError::Http {
            status: 500,
            body_prefix: "internal".into(),
            retry_after: None,
        };
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("internal"));
    }
}
