use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FirestoreErrorCode {
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    Internal,
    Aborted,
    Unavailable,
    ResourceExhausted,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
        }
    }
}

#[derive(Clone, Debug)]
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

    /// Whether the failure came from the storage layer and the operation may
    /// simply be retried later. Background maintenance (the LRU collector)
    /// skips its pass on these instead of failing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            FirestoreErrorCode::Aborted | FirestoreErrorCode::Unavailable
        )
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

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes() {
        assert!(aborted("txn aborted").is_transient());
        assert!(unavailable("store busy").is_transient());
        assert!(!invalid_argument("bad filter").is_transient());
        assert!(!internal_error("dangling reference").is_transient());
    }

    #[test]
    fn formats_code_string() {
        let err = failed_precondition("acknowledged out of order");
        assert_eq!(err.code_str(), "firestore/failed-precondition");
        assert!(err.to_string().contains("out of order"));
    }
}
