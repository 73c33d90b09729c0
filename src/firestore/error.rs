use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
        }
    }

    /// Maps a numeric gRPC status code onto the error taxonomy. Unrecognised
    /// values (including `OK`, which is never an error) map to `Unknown`.
    pub fn from_grpc_code(code: i32) -> Self {
        match code {
            1 => FirestoreErrorCode::Cancelled,
            2 => FirestoreErrorCode::Unknown,
            3 => FirestoreErrorCode::InvalidArgument,
            4 => FirestoreErrorCode::DeadlineExceeded,
            5 => FirestoreErrorCode::NotFound,
            6 => FirestoreErrorCode::AlreadyExists,
            7 => FirestoreErrorCode::PermissionDenied,
            8 => FirestoreErrorCode::ResourceExhausted,
            9 => FirestoreErrorCode::FailedPrecondition,
            10 => FirestoreErrorCode::Aborted,
            11 => FirestoreErrorCode::OutOfRange,
            12 => FirestoreErrorCode::Unimplemented,
            13 => FirestoreErrorCode::Internal,
            14 => FirestoreErrorCode::Unavailable,
            15 => FirestoreErrorCode::DataLoss,
            16 => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Unknown,
        }
    }
}

/// Returns `true` when an error with this code must not be retried by the
/// owning stream and is instead surfaced to the target or batch that caused it.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Unavailable
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::Cancelled => false,
        FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        | FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::Unauthenticated
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// Write-specific classification: `Aborted` is retried even for commits.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        is_permanent_error(self.code)
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_are_retryable() {
        for code in [
            FirestoreErrorCode::Unavailable,
            FirestoreErrorCode::DeadlineExceeded,
            FirestoreErrorCode::ResourceExhausted,
            FirestoreErrorCode::Aborted,
            FirestoreErrorCode::Internal,
            FirestoreErrorCode::Unknown,
            FirestoreErrorCode::Cancelled,
        ] {
            assert!(!is_permanent_error(code), "{code:?} should be transient");
        }
    }

    #[test]
    fn terminal_codes_are_not_retried() {
        for code in [
            FirestoreErrorCode::PermissionDenied,
            FirestoreErrorCode::FailedPrecondition,
            FirestoreErrorCode::InvalidArgument,
            FirestoreErrorCode::NotFound,
            FirestoreErrorCode::AlreadyExists,
            FirestoreErrorCode::Unauthenticated,
        ] {
            assert!(is_permanent_error(code), "{code:?} should be terminal");
            assert!(is_permanent_write_error(code));
        }
        assert!(!is_permanent_write_error(FirestoreErrorCode::Aborted));
    }

    #[test]
    fn grpc_codes_map_onto_taxonomy() {
        assert_eq!(
            FirestoreErrorCode::from_grpc_code(7),
            FirestoreErrorCode::PermissionDenied
        );
        assert_eq!(
            FirestoreErrorCode::from_grpc_code(14),
            FirestoreErrorCode::Unavailable
        );
        assert_eq!(
            FirestoreErrorCode::from_grpc_code(0),
            FirestoreErrorCode::Unknown
        );
    }

    #[test]
    fn display_includes_code() {
        let err = permission_denied("Missing or insufficient permissions.");
        assert_eq!(
            err.to_string(),
            "Missing or insufficient permissions. (firestore/permission-denied)"
        );
    }
}
