//! Error classification: map a publish failure to retry semantics.
//!
//! Pure function, no side effects. The `Retry-After` hint is preserved
//! on the error itself ([`PublishError::retry_after`]); classification
//! only decides whether the retry loop runs at all.

use crate::error::{ErrorClass, PublishError, TransportKind};

/// HTTP statuses retried under the backoff policy.
const TRANSIENT_STATUSES: [u16; 5] = [408, 429, 502, 503, 504];

/// HTTP statuses that cannot succeed on retry.
const PERMANENT_STATUSES: [u16; 8] = [400, 401, 403, 404, 405, 409, 410, 422];

/// Classify a publish failure as transient, permanent, or unknown.
pub fn classify(err: &PublishError) -> ErrorClass {
    match err {
        PublishError::Validation(_) | PublishError::Format(_) | PublishError::Auth(_) => {
            ErrorClass::Permanent
        }
        PublishError::PayloadTooLarge { .. } => ErrorClass::Permanent,
        PublishError::Http { status, .. } => classify_status(*status),
        PublishError::Transport { kind, .. } => match kind {
            TransportKind::ConnectionRefused
            | TransportKind::ConnectionReset
            | TransportKind::Timeout
            | TransportKind::Dns => ErrorClass::Transient,
            TransportKind::Other => ErrorClass::Unknown,
        },
        PublishError::Timeout { .. } => ErrorClass::Transient,
        PublishError::RateLimited { .. } => ErrorClass::Transient,
    }
}

fn classify_status(status: u16) -> ErrorClass {
    if TRANSIENT_STATUSES.contains(&status) {
        return ErrorClass::Transient;
    }
    if PERMANENT_STATUSES.contains(&status) {
        return ErrorClass::Permanent;
    }
    // Remaining 5xx are not worth retrying against the same endpoint.
    if (500..600).contains(&status) {
        return ErrorClass::Permanent;
    }
    ErrorClass::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn http(status: u16) -> PublishError {
        PublishError::Http { status, body_prefix: String::new(), retry_after: None }
    }

    fn transport(kind: TransportKind) -> PublishError {
        PublishError::Transport { kind, message: "boom".into() }
    }

    #[test]
    fn retriable_statuses_are_transient() {
        for status in [408, 429, 502, 503, 504] {
            assert_eq!(classify(&http(status)), ErrorClass::Transient, "status {status}");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 405, 409, 410, 422] {
            assert_eq!(classify(&http(status)), ErrorClass::Permanent, "status {status}");
        }
    }

    #[test]
    fn unlisted_5xx_is_permanent() {
        for status in [500, 501, 505, 599] {
            assert_eq!(classify(&http(status)), ErrorClass::Permanent, "status {status}");
        }
    }

    #[test]
    fn oddball_statuses_are_unknown() {
        for status in [302, 418, 451] {
            assert_eq!(classify(&http(status)), ErrorClass::Unknown, "status {status}");
        }
    }

    #[test]
    fn network_conditions_are_transient() {
        for kind in [
            TransportKind::ConnectionRefused,
            TransportKind::ConnectionReset,
            TransportKind::Timeout,
            TransportKind::Dns,
        ] {
            assert_eq!(classify(&transport(kind)), ErrorClass::Transient, "{kind:?}");
        }
        assert_eq!(classify(&transport(TransportKind::Other)), ErrorClass::Unknown);
    }

    #[test]
    fn local_failures_are_permanent() {
        assert_eq!(classify(&PublishError::Validation("x".into())), ErrorClass::Permanent);
        assert_eq!(classify(&PublishError::Auth("x".into())), ErrorClass::Permanent);
        assert_eq!(
            classify(&PublishError::PayloadTooLarge { size: 2, limit: 1 }),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn timeouts_and_rate_limits_are_transient() {
        assert_eq!(
            classify(&PublishError::Timeout { elapsed: Duration::from_secs(10) }),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&PublishError::RateLimited { retry_after: Some(Duration::from_secs(1)) }),
            ErrorClass::Transient
        );
    }

    #[test]
    fn retry_after_survives_classification() {
        let err = http(429);
        let _ = classify(&err);
        // Classification must not consume or alter the hint.
        let err = PublishError::Http {
            status: 429,
            body_prefix: String::new(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(classify(&err), ErrorClass::Transient);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }
}
