//! Conversation sessions and their append-only messages.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Sessions idle longer than this are never resumed.
pub const DEFAULT_IDLE_WINDOW_HOURS: i64 = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub product_id: String,
    pub is_active: bool,
    pub summary_title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// Whether this session may be resumed at `now`.
    pub fn is_resumable(&self, now: DateTime<Utc>, idle_window: Duration) -> bool {
        self.is_active && now - self.last_activity_at <= idle_window
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Precomputed question/answer snapshot
    Qa,
    /// Cached plain-text extraction of the manual
    TextCache,
    /// Full-document analysis
    Pdf,
    /// No manual content backed the answer
    GeneralKnowledge,
    None,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qa => "qa",
            Self::TextCache => "text_cache",
            Self::Pdf => "pdf",
            Self::GeneralKnowledge => "general_knowledge",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "qa" => Some(Self::Qa),
            "text_cache" => Some(Self::TextCache),
            "pdf" => Some(Self::Pdf),
            "general_knowledge" => Some(Self::GeneralKnowledge),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Tag stored on a message. General-knowledge answers are stored as
    /// `none` with `used_general_knowledge` set.
    pub fn message_tag(&self) -> Source {
        match self {
            Self::GeneralKnowledge => Self::None,
            other => *other,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Answer metadata attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub source: Source,
    pub reference: Option<String>,
    pub self_check_score: Option<f32>,
    pub needs_verification: bool,
    pub used_general_knowledge: bool,
}

impl MessageMeta {
    /// Metadata for a user turn.
    pub fn user() -> Self {
        Self {
            source: Source::None,
            reference: None,
            self_check_score: None,
            needs_verification: false,
            used_general_knowledge: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    /// Per-session sequence number, strictly increasing.
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub source: Source,
    pub reference: Option<String>,
    pub self_check_score: Option<f32>,
    pub needs_verification: bool,
    pub used_general_knowledge: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(last_activity: DateTime<Utc>, active: bool) -> Session {
        Session {
            id: "s1".into(),
            user_id: "u1".into(),
            product_id: "p1".into(),
            is_active: active,
            summary_title: None,
            created_at: last_activity,
            last_activity_at: last_activity,
        }
    }

    #[test]
    fn test_resumable_within_window() {
        let now = Utc::now();
        let window = Duration::hours(DEFAULT_IDLE_WINDOW_HOURS);
        assert!(session(now - Duration::hours(5), true).is_resumable(now, window));
        assert!(session(now - Duration::hours(6), true).is_resumable(now, window));
        assert!(!session(now - Duration::hours(6) - Duration::seconds(1), true)
            .is_resumable(now, window));
        assert!(!session(now, false).is_resumable(now, window));
    }

    #[test]
    fn test_general_knowledge_message_tag() {
        assert_eq!(Source::GeneralKnowledge.message_tag(), Source::None);
        assert_eq!(Source::Pdf.message_tag(), Source::Pdf);
        assert_eq!(Source::parse("text_cache"), Some(Source::TextCache));
    }
}
