//! Error taxonomy for store-originated failures.
//!
//! Every fallible store operation returns `Result<T, ErrorKind>` so callers
//! can tell a caller bug (`InvalidArgument`) from a retryable transport
//! condition (`Unavailable`, `Aborted`) without parsing message strings.
//!
//! Each kind maps to a fixed user-facing notice; the severe kinds get a
//! longer display duration.

use std::time::Duration;

/// Canonical failure kinds surfaced by the document store and the
/// components built on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FailedPrecondition,
    PermissionDenied,
    NotFound,
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    AlreadyExists,
    ResourceExhausted,
    Unauthenticated,
    Unavailable,
    Aborted,
    OutOfRange,
    DataLoss,
    Unknown,
}

impl ErrorKind {
    /// Fixed user-facing notice text for this kind.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::FailedPrecondition => "The operation can't run in the current state.",
            ErrorKind::PermissionDenied => "You don't have permission to do that.",
            ErrorKind::NotFound => "The requested item no longer exists.",
            ErrorKind::Cancelled => "The operation was cancelled.",
            ErrorKind::InvalidArgument => "That input isn't valid.",
            ErrorKind::DeadlineExceeded => "The operation timed out. Try again.",
            ErrorKind::AlreadyExists => "That item already exists.",
            ErrorKind::ResourceExhausted => "Too many requests. Please slow down.",
            ErrorKind::Unauthenticated => "Please sign in and try again.",
            ErrorKind::Unavailable => "Service is temporarily unavailable.",
            ErrorKind::Aborted => "The operation conflicted with another change. Try again.",
            ErrorKind::OutOfRange => "The request was outside the valid range.",
            ErrorKind::DataLoss => "Some data could not be recovered.",
            ErrorKind::Unknown => "Something went wrong. Please try again.",
        }
    }

    /// How long the notice should stay visible. Severe kinds linger.
    pub fn notice_duration(self) -> Duration {
        match self {
            ErrorKind::Unknown | ErrorKind::ResourceExhausted | ErrorKind::DataLoss => {
                Duration::from_secs(9)
            }
            _ => Duration::from_secs(5),
        }
    }

    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Unavailable
                | ErrorKind::Aborted
                | ErrorKind::DeadlineExceeded
                | ErrorKind::ResourceExhausted
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::FailedPrecondition => "failed-precondition",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::DeadlineExceeded => "deadline-exceeded",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::ResourceExhausted => "resource-exhausted",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Aborted => "aborted",
            ErrorKind::OutOfRange => "out-of-range",
            ErrorKind::DataLoss => "data-loss",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

impl std::error::Error for ErrorKind {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severe_kinds_get_longer_notice() {
        assert_eq!(ErrorKind::Unknown.notice_duration(), Duration::from_secs(9));
        assert_eq!(
            ErrorKind::ResourceExhausted.notice_duration(),
            Duration::from_secs(9)
        );
        assert_eq!(ErrorKind::DataLoss.notice_duration(), Duration::from_secs(9));
        assert_eq!(ErrorKind::NotFound.notice_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(ErrorKind::Aborted.is_retryable());
        assert!(!ErrorKind::InvalidArgument.is_retryable());
        assert!(!ErrorKind::PermissionDenied.is_retryable());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ErrorKind::InvalidArgument.to_string(), "invalid-argument");
        assert_eq!(ErrorKind::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_every_kind_has_a_message() {
        let kinds = [
            ErrorKind::FailedPrecondition,
            ErrorKind::PermissionDenied,
            ErrorKind::NotFound,
            ErrorKind::Cancelled,
            ErrorKind::InvalidArgument,
            ErrorKind::DeadlineExceeded,
            ErrorKind::AlreadyExists,
            ErrorKind::ResourceExhausted,
            ErrorKind::Unauthenticated,
            ErrorKind::Unavailable,
            ErrorKind::Aborted,
            ErrorKind::OutOfRange,
            ErrorKind::DataLoss,
            ErrorKind::Unknown,
        ];
        for kind in kinds {
            assert!(!kind.user_message().is_empty());
        }
    }
}
