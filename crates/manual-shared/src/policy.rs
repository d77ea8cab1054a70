//! Usage-policy records and the restriction tier function.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Kind of policy violation detected in a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    OffTopic,
    Inappropriate,
    Adversarial,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OffTopic => "off_topic",
            Self::Inappropriate => "inappropriate",
            Self::Adversarial => "adversarial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off_topic" | "offtopic" | "off-topic" => Some(Self::OffTopic),
            "inappropriate" => Some(Self::Inappropriate),
            "adversarial" => Some(Self::Adversarial),
            _ => None,
        }
    }
}

impl std::fmt::Display for ViolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which validation phase flagged the question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Rule,
    Model,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Model => "model",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rule" => Some(Self::Rule),
            "model" => Some(Self::Model),
            _ => None,
        }
    }
}

/// Immutable record of one violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub user_id: String,
    pub question: String,
    pub violation_type: ViolationType,
    pub detection_method: DetectionMethod,
    pub created_at: DateTime<Utc>,
}

/// Per-user restriction counters.
///
/// `violation_count` never decreases. `restricted_until` is always
/// `written_at + tier_duration(violation_count)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictionState {
    pub user_id: String,
    pub violation_count: u32,
    pub restricted_until: Option<DateTime<Utc>>,
}

impl RestrictionState {
    pub fn clean(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            violation_count: 0,
            restricted_until: None,
        }
    }

    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        self.restricted_until.map_or(false, |until| until > now)
    }

    /// Status view of this state at `now`.
    pub fn status_at(&self, now: DateTime<Utc>) -> RestrictionStatus {
        if self.is_blocked_at(now) {
            RestrictionStatus {
                blocked: true,
                restricted_until: self.restricted_until,
                remaining_secs: self
                    .restricted_until
                    .map(|until| (until - now).num_seconds().max(0)),
                violation_count: Some(self.violation_count),
            }
        } else {
            RestrictionStatus {
                blocked: false,
                restricted_until: None,
                remaining_secs: None,
                violation_count: (self.violation_count > 0).then_some(self.violation_count),
            }
        }
    }
}

/// Restriction length for a violation count.
///
/// 1 → warning only, 2 → 1h, 3 → 24h, 4+ → 7d.
pub fn tier_duration(violation_count: u32) -> Duration {
    match violation_count {
        0 | 1 => Duration::zero(),
        2 => Duration::hours(1),
        3 => Duration::hours(24),
        _ => Duration::days(7),
    }
}

/// Result of `check_restriction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictionStatus {
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation_count: Option<u32>,
}

/// Result of `validate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation_type: Option<ViolationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationVerdict {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            violation_type: None,
            reason: None,
        }
    }

    pub fn violation(violation_type: ViolationType, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            violation_type: Some(violation_type),
            reason: Some(reason.into()),
        }
    }
}
