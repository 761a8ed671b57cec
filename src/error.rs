use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
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
    /// A local storage transaction failed; the operation may succeed when retried.
    StorageTransaction,
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
            FirestoreErrorCode::StorageTransaction => "firestore/storage-transaction",
        }
    }

    /// Whether an RPC that failed with this code can never succeed when retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            FirestoreErrorCode::Cancelled
            | FirestoreErrorCode::Unknown
            | FirestoreErrorCode::DeadlineExceeded
            | FirestoreErrorCode::ResourceExhausted
            | FirestoreErrorCode::Internal
            | FirestoreErrorCode::Unavailable
            | FirestoreErrorCode::Unauthenticated
            | FirestoreErrorCode::StorageTransaction => false,
            FirestoreErrorCode::InvalidArgument
            | FirestoreErrorCode::NotFound
            | FirestoreErrorCode::AlreadyExists
            | FirestoreErrorCode::PermissionDenied
            | FirestoreErrorCode::FailedPrecondition
            | FirestoreErrorCode::Aborted
            | FirestoreErrorCode::OutOfRange
            | FirestoreErrorCode::Unimplemented
            | FirestoreErrorCode::DataLoss => true,
        }
    }

    /// Writes are retried on `Aborted`, every other permanent code rejects the batch.
    pub fn is_permanent_write_error(&self) -> bool {
        self.is_permanent() && *self != FirestoreErrorCode::Aborted
    }
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

    pub fn is_storage_transaction_error(&self) -> bool {
        self.code == FirestoreErrorCode::StorageTransaction
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
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

pub fn storage_transaction_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::StorageTransaction, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_is_permanent_but_retried_for_writes() {
        assert!(FirestoreErrorCode::Aborted.is_permanent());
        assert!(!FirestoreErrorCode::Aborted.is_permanent_write_error());
        assert!(FirestoreErrorCode::PermissionDenied.is_permanent_write_error());
    }

    #[test]
    fn transient_codes_are_not_permanent() {
        for code in [
            FirestoreErrorCode::Unavailable,
            FirestoreErrorCode::Unauthenticated,
            FirestoreErrorCode::ResourceExhausted,
            FirestoreErrorCode::StorageTransaction,
        ] {
            assert!(!code.is_permanent(), "{code:?}");
        }
    }

    #[test]
    fn display_includes_code() {
        let err = unavailable("backend unreachable");
        assert_eq!(err.to_string(), "backend unreachable (firestore/unavailable)");
        assert_eq!(err.message(), "backend unreachable");
    }
}
