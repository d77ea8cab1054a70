//! User-facing error taxonomy.
//!
//! Every variant maps to a machine code and an HTTP status. Internal causes
//! are kept out of the rendered message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::ViolationType;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QaError {
    #[error("Sign in to ask questions about this product.")]
    Unauthenticated,

    #[error("Questions are paused for your account. Try again in {}.", remaining_text(.remaining_secs))]
    Blocked {
        restricted_until: DateTime<Utc>,
        remaining_secs: i64,
        violation_count: u32,
    },

    #[error("This question can't be answered here: {reason}")]
    InvalidQuestion {
        violation_type: Option<ViolationType>,
        reason: String,
    },

    #[error("You have reached the question limit for your plan.")]
    TierLimitExceeded,

    #[error("Another question is still being answered in this conversation.")]
    SessionBusy,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("The answer took too long. Please try again.")]
    Timeout,

    #[error("Storage error")]
    Storage(String),

    #[error("Answer generation failed")]
    Generation(String),

    #[error("Internal error")]
    Internal(String),
}

impl QaError {
    /// Machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            QaError::Unauthenticated => "UNAUTHENTICATED",
            QaError::Blocked { .. } => "QA_BLOCKED",
            QaError::InvalidQuestion { .. } => "INVALID_QUESTION",
            QaError::TierLimitExceeded => "TIER_LIMIT_EXCEEDED",
            QaError::SessionBusy => "SESSION_BUSY",
            QaError::NotFound(_) => "NOT_FOUND",
            QaError::Timeout => "REQUEST_TIMEOUT",
            QaError::Storage(_) | QaError::Generation(_) | QaError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            QaError::Unauthenticated => 401,
            QaError::Blocked { .. } | QaError::TierLimitExceeded => 403,
            QaError::InvalidQuestion { .. } => 400,
            QaError::SessionBusy => 409,
            QaError::NotFound(_) => 404,
            QaError::Timeout => 504,
            QaError::Storage(_) | QaError::Generation(_) | QaError::Internal(_) => 500,
        }
    }

    /// True for failures caused by the service rather than the request.
    pub fn is_internal(&self) -> bool {
        self.http_status() >= 500
    }

    /// Wire body for this error.
    pub fn to_body(&self) -> ErrorBody {
        let mut body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            restricted_until: None,
            remaining_secs: None,
            violation_count: None,
            violation_type: None,
            reason: None,
        };
        match self {
            QaError::Blocked {
                restricted_until,
                remaining_secs,
                violation_count,
            } => {
                body.restricted_until = Some(*restricted_until);
                body.remaining_secs = Some(*remaining_secs);
                body.violation_count = Some(*violation_count);
            }
            QaError::InvalidQuestion {
                violation_type,
                reason,
            } => {
                body.violation_type = *violation_type;
                body.reason = Some(reason.clone());
            }
            _ => {}
        }
        body
    }
}

/// JSON error body returned for rejected requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation_type: Option<ViolationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn remaining_text(secs: &i64) -> String {
    format_remaining(*secs)
}

/// Human form of a remaining duration ("3h 12m", "45s").
pub fn format_remaining(secs: i64) -> String {
    let secs = secs.max(0);
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", secs)
    }
}
