//! Progress events streamed to the caller while a question is answered.
//!
//! One JSON object per event, emitted strictly in execution order.

use serde::{Deserialize, Serialize};

use crate::error::QaError;
use crate::session::Source;

/// Retrieval step of the answering pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    QaSnapshot,
    TextCache,
    PdfAnalysis,
    GeneralKnowledge,
}

impl Step {
    pub fn number(&self) -> u8 {
        match self {
            Self::QaSnapshot => 1,
            Self::TextCache => 2,
            Self::PdfAnalysis => 3,
            Self::GeneralKnowledge => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::QaSnapshot => "qa_snapshot",
            Self::TextCache => "text_cache",
            Self::PdfAnalysis => "pdf_analysis",
            Self::GeneralKnowledge => "general_knowledge",
        }
    }

    /// Source tag reported for answers produced by this step.
    pub fn source(&self) -> Source {
        match self {
            Self::QaSnapshot => Source::Qa,
            Self::TextCache => Source::TextCache,
            Self::PdfAnalysis => Source::Pdf,
            Self::GeneralKnowledge => Source::GeneralKnowledge,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StepStart,
    StepComplete,
    StepTimeout,
    Answer,
    Error,
}

/// Wire event. Absent fields are omitted from the JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event: Option<EventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_check_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_verification: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_general_knowledge: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Final answer payload carried by an `answer` event.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerPayload {
    pub answer: String,
    pub source: Source,
    pub reference: Option<String>,
    pub session_id: String,
    pub self_check_score: Option<f32>,
    pub needs_verification: bool,
    pub used_general_knowledge: bool,
}

impl StreamEvent {
    fn step_event(kind: EventKind, step: Step) -> Self {
        Self {
            event: Some(kind),
            step: Some(step.number()),
            step_name: Some(step.name().to_string()),
            ..Default::default()
        }
    }

    pub fn step_start(step: Step) -> Self {
        Self::step_event(EventKind::StepStart, step)
    }

    pub fn step_complete(step: Step) -> Self {
        Self::step_event(EventKind::StepComplete, step)
    }

    pub fn step_timeout(step: Step) -> Self {
        Self::step_event(EventKind::StepTimeout, step)
    }

    pub fn answer(payload: AnswerPayload) -> Self {
        Self {
            event: Some(EventKind::Answer),
            answer: Some(payload.answer),
            source: Some(payload.source),
            reference: payload.reference,
            session_id: Some(payload.session_id),
            self_check_score: payload.self_check_score,
            needs_verification: Some(payload.needs_verification),
            used_general_knowledge: Some(payload.used_general_knowledge),
            ..Default::default()
        }
    }

    /// Error event. Only the user-facing message and code are exposed.
    pub fn error(err: &QaError, session_id: Option<String>) -> Self {
        Self {
            event: Some(EventKind::Error),
            session_id,
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.event
    }

    /// True for events after which nothing else is emitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event, Some(EventKind::Answer) | Some(EventKind::Error))
    }

    /// Newline-terminated JSON line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }

    /// Format for debug display
    pub fn format_debug(&self) -> String {
        let step = self.step_name.as_deref().unwrap_or("-");
        match self.event {
            Some(EventKind::StepStart) => format!("[manual->{}] starting", step),
            Some(EventKind::StepComplete) => format!("[manual] {} complete", step),
            Some(EventKind::StepTimeout) => format!("[manual] {} TIMEOUT", step),
            Some(EventKind::Answer) => format!(
                "[manual] answer source={} score={}",
                self.source.map(|s| s.as_str()).unwrap_or("-"),
                self.self_check_score
                    .map(|s| format!("{:.2}", s))
                    .unwrap_or_else(|| "-".to_string())
            ),
            Some(EventKind::Error) => format!(
                "[manual] error {}",
                self.code.as_deref().unwrap_or("INTERNAL_ERROR")
            ),
            None => "[manual] (empty event)".to_string(),
        }
    }
}
