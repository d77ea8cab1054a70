//! Text-generation / classification capability.
//!
//! Production code uses `OllamaClient` (see `ollama.rs`). Tests use
//! `FakeGenerator` with scripted replies, so no network is needed.

use async_trait::async_trait;
use manual_shared::ViolationType;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::StageError;

/// Sentinel the backend returns when the supplied context has no answer.
pub const NO_ANSWER: &str = "NO_ANSWER";

/// What a generation call is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Answer from cached-text passages
    TextCacheAnswer,
    /// Answer from one document section
    SectionAnswer,
    /// Answer without manual content
    GeneralKnowledge,
    /// Short session title
    Title,
}

#[derive(Debug, Clone)]
pub struct Prompt {
    pub purpose: Purpose,
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(purpose: Purpose, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            purpose,
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Structured verdict of the model-based question classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierVerdict {
    /// Question is about the product or its use
    pub relevant: bool,
    /// Question is free of abuse and manipulation attempts
    pub safe: bool,
    #[serde(default)]
    pub violation_type: Option<ViolationType>,
    #[serde(default)]
    pub reason: String,
}

impl ClassifierVerdict {
    pub fn allow() -> Self {
        Self {
            relevant: true,
            safe: true,
            violation_type: None,
            reason: String::new(),
        }
    }

    pub fn reject(violation_type: ViolationType, reason: &str) -> Self {
        Self {
            relevant: violation_type != ViolationType::OffTopic,
            safe: violation_type == ViolationType::OffTopic,
            violation_type: Some(violation_type),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Free-text completion. May return `NO_ANSWER`.
    async fn generate(&self, prompt: &Prompt) -> Result<String, StageError>;

    /// Classify a question for topical relevance and safety.
    async fn classify(
        &self,
        question: &str,
        product_id: &str,
    ) -> Result<ClassifierVerdict, StageError>;

    /// Score how well `answer` addresses `question` given `evidence`, 0..1.
    async fn self_check(
        &self,
        question: &str,
        answer: &str,
        evidence: &str,
    ) -> Result<f32, StageError>;
}

/// True if a backend reply signals "no answer in this context".
pub fn is_no_answer(reply: &str) -> bool {
    let trimmed = reply.trim();
    trimmed.is_empty() || trimmed.to_uppercase().starts_with(NO_ANSWER)
}

// ============================================================================
// Fake Generator (Testing)
// ============================================================================

/// Scripted reply of the fake generator
#[derive(Debug, Clone)]
pub enum FakeReply {
    Text(String),
    Error(String),
    /// Reply after sleeping (exercises stage timeouts)
    Delayed(Duration, Box<FakeReply>),
}

#[derive(Debug, Clone)]
struct FakeRule {
    purpose: Option<Purpose>,
    contains: Option<String>,
    system_contains: Option<String>,
    reply: FakeReply,
}

impl FakeRule {
    fn new(purpose: Purpose, reply: FakeReply) -> Self {
        Self {
            purpose: Some(purpose),
            contains: None,
            system_contains: None,
            reply,
        }
    }

    fn matches(&self, prompt: &Prompt) -> bool {
        self.purpose.map_or(true, |p| p == prompt.purpose)
            && self
                .contains
                .as_ref()
                .map_or(true, |needle| prompt.user.contains(needle.as_str()))
            && self
                .system_contains
                .as_ref()
                .map_or(true, |needle| prompt.system.contains(needle.as_str()))
    }
}

/// Counters of calls made to the fake
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakeCalls {
    pub generate: usize,
    pub classify: usize,
    pub self_check: usize,
    pub purposes: Vec<Purpose>,
}

impl FakeCalls {
    pub fn total(&self) -> usize {
        self.generate + self.classify + self.self_check
    }

    pub fn count(&self, purpose: Purpose) -> usize {
        self.purposes.iter().filter(|p| **p == purpose).count()
    }
}

/// Deterministic generator for tests
pub struct FakeGenerator {
    rules: Vec<FakeRule>,
    verdict: Result<ClassifierVerdict, StageError>,
    scores: Mutex<VecDeque<f32>>,
    default_score: f32,
    calls: Mutex<FakeCalls>,
}

impl FakeGenerator {
    pub fn builder() -> FakeGeneratorBuilder {
        FakeGeneratorBuilder::default()
    }

    pub fn calls(&self) -> FakeCalls {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, f: impl FnOnce(&mut FakeCalls)) {
        f(&mut self.calls.lock().unwrap_or_else(|e| e.into_inner()));
    }

    async fn play(reply: FakeReply) -> Result<String, StageError> {
        let mut reply = reply;
        loop {
            match reply {
                FakeReply::Text(text) => return Ok(text),
                FakeReply::Error(msg) => return Err(StageError::Generation(msg)),
                FakeReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, prompt: &Prompt) -> Result<String, StageError> {
        self.record(|c| {
            c.generate += 1;
            c.purposes.push(prompt.purpose);
        });
        let reply = self
            .rules
            .iter()
            .find(|r| r.matches(prompt))
            .map(|r| r.reply.clone())
            .unwrap_or_else(|| FakeReply::Text(NO_ANSWER.to_string()));
        Self::play(reply).await
    }

    async fn classify(
        &self,
        _question: &str,
        _product_id: &str,
    ) -> Result<ClassifierVerdict, StageError> {
        self.record(|c| c.classify += 1);
        self.verdict.clone()
    }

    async fn self_check(
        &self,
        _question: &str,
        _answer: &str,
        _evidence: &str,
    ) -> Result<f32, StageError> {
        self.record(|c| c.self_check += 1);
        let next = self
            .scores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(next.unwrap_or(self.default_score))
    }
}

/// Builder for `FakeGenerator`
pub struct FakeGeneratorBuilder {
    rules: Vec<FakeRule>,
    verdict: Result<ClassifierVerdict, StageError>,
    scores: VecDeque<f32>,
    default_score: f32,
}

impl Default for FakeGeneratorBuilder {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            verdict: Ok(ClassifierVerdict::allow()),
            scores: VecDeque::new(),
            default_score: 0.9,
        }
    }
}

impl FakeGeneratorBuilder {
    /// Reply for every prompt of `purpose`.
    pub fn reply(mut self, purpose: Purpose, text: &str) -> Self {
        self.rules
            .push(FakeRule::new(purpose, FakeReply::Text(text.to_string())));
        self
    }

    /// Reply for prompts of `purpose` whose user text contains `needle`.
    /// Rules are checked in insertion order.
    pub fn reply_when(mut self, purpose: Purpose, needle: &str, reply: FakeReply) -> Self {
        self.rules.push(FakeRule {
            contains: Some(needle.to_string()),
            ..FakeRule::new(purpose, reply)
        });
        self
    }

    /// Reply for prompts of `purpose` whose system text contains `needle`
    /// (e.g. the regeneration hint).
    pub fn reply_when_system(mut self, purpose: Purpose, needle: &str, reply: FakeReply) -> Self {
        self.rules.push(FakeRule {
            system_contains: Some(needle.to_string()),
            ..FakeRule::new(purpose, reply)
        });
        self
    }

    pub fn reply_with(mut self, purpose: Purpose, reply: FakeReply) -> Self {
        self.rules.push(FakeRule::new(purpose, reply));
        self
    }

    pub fn verdict(mut self, verdict: ClassifierVerdict) -> Self {
        self.verdict = Ok(verdict);
        self
    }

    pub fn classify_error(mut self, msg: &str) -> Self {
        self.verdict = Err(StageError::Generation(msg.to_string()));
        self
    }

    /// Self-check scores returned in order, then the default.
    pub fn scores(mut self, scores: &[f32]) -> Self {
        self.scores = scores.iter().copied().collect();
        self
    }

    pub fn default_score(mut self, score: f32) -> Self {
        self.default_score = score;
        self
    }

    pub fn build(self) -> FakeGenerator {
        FakeGenerator {
            rules: self.rules,
            verdict: self.verdict,
            scores: Mutex::new(self.scores),
            default_score: self.default_score,
            calls: Mutex::new(FakeCalls::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_no_answer() {
        assert!(is_no_answer("NO_ANSWER"));
        assert!(is_no_answer("  no_answer."));
        assert!(is_no_answer(""));
        assert!(!is_no_answer("Press the power button."));
    }

    #[tokio::test]
    async fn test_fake_rules_in_order() {
        let fake = FakeGenerator::builder()
            .reply_when(
                Purpose::SectionAnswer,
                "Filter",
                FakeReply::Text("Rinse the filter.".into()),
            )
            .reply(Purpose::SectionAnswer, NO_ANSWER)
            .build();

        let hit = Prompt::new(Purpose::SectionAnswer, "", "Section: Filter care");
        let miss = Prompt::new(Purpose::SectionAnswer, "", "Section: Warranty");
        assert_eq!(fake.generate(&hit).await.unwrap(), "Rinse the filter.");
        assert_eq!(fake.generate(&miss).await.unwrap(), NO_ANSWER);
        assert_eq!(fake.calls().count(Purpose::SectionAnswer), 2);
    }

    #[tokio::test]
    async fn test_fake_matches_system_text() {
        let fake = FakeGenerator::builder()
            .reply_when_system(Purpose::SectionAnswer, "again", FakeReply::Text("Second.".into()))
            .reply(Purpose::SectionAnswer, "First.")
            .build();

        let first = Prompt::new(Purpose::SectionAnswer, "Answer.", "q");
        let second = Prompt::new(Purpose::SectionAnswer, "Answer again.", "q");
        assert_eq!(fake.generate(&first).await.unwrap(), "First.");
        assert_eq!(fake.generate(&second).await.unwrap(), "Second.");
    }

    #[tokio::test]
    async fn test_fake_scores_then_default() {
        let fake = FakeGenerator::builder().scores(&[0.2]).default_score(0.8).build();
        assert_eq!(fake.self_check("q", "a", "e").await.unwrap(), 0.2);
        assert_eq!(fake.self_check("q", "a", "e").await.unwrap(), 0.8);
        assert_eq!(fake.calls().self_check, 2);
    }

    #[tokio::test]
    async fn test_fake_error_reply() {
        let fake = FakeGenerator::builder()
            .reply_with(Purpose::GeneralKnowledge, FakeReply::Error("down".into()))
            .build();
        let prompt = Prompt::new(Purpose::GeneralKnowledge, "", "q");
        assert!(matches!(
            fake.generate(&prompt).await,
            Err(StageError::Generation(_))
        ));
    }
}
