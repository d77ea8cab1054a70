//! Internal failure types. None of these cross the wire; the orchestrator
//! absorbs them or maps them onto `QaError`.

use manual_shared::QaError;
use thiserror::Error;

/// Failure of a stage or of an external capability it calls.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("stage deadline exceeded")]
    Timeout,

    #[error("generation backend error: {0}")]
    Generation(String),

    #[error("malformed backend response: {0}")]
    InvalidResponse(String),

    #[error("manual document error: {0}")]
    Document(String),
}

/// Map a storage failure onto the user-facing taxonomy.
pub fn storage_error(err: impl std::fmt::Display) -> QaError {
    QaError::Storage(err.to_string())
}

impl From<StageError> for QaError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Timeout => QaError::Timeout,
            other => QaError::Generation(other.to_string()),
        }
    }
}
