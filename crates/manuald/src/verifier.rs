//! Answer verification.
//!
//! The generator's self-check supplies the score. If it is unavailable the
//! verifier falls back to a deterministic score from concrete signals:
//! overlap with the evidence and the amount of hedging in the answer.

use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::generator::Generator;
use crate::text::{keyword_set, keywords};

/// Hedging that suggests the answer was not taken from the manual
const HEDGING_INDICATORS: &[&str] = &[
    "i don't have access",
    "i cannot determine",
    "i'm not sure",
    "typically",
    "usually",
    "generally",
    "might be",
    "could be",
    "probably",
    "i assume",
    "i believe",
    "it's likely",
    "most likely",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub score: f32,
    pub needs_verification: bool,
}

pub struct AnswerVerifier {
    generator: Arc<dyn Generator>,
    threshold: f32,
}

impl AnswerVerifier {
    pub fn new(generator: Arc<dyn Generator>, threshold: f32) -> Self {
        Self {
            generator,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Score `answer` against `evidence`. Never fails.
    pub async fn verify(&self, question: &str, answer: &str, evidence: &str) -> Verification {
        let score = match self.generator.self_check(question, answer, evidence).await {
            Ok(score) => score.clamp(0.0, 1.0),
            Err(e) => {
                warn!("Self-check unavailable, using heuristic score: {}", e);
                heuristic_score(answer, evidence)
            }
        };
        debug!("Self-check score {:.2} (threshold {:.2})", score, self.threshold);
        self.judge(score)
    }

    /// `verify` bounded by `until`. `None` if the self-check did not finish
    /// in time.
    pub async fn verify_until(
        &self,
        question: &str,
        answer: &str,
        evidence: &str,
        until: Instant,
    ) -> Option<Verification> {
        timeout_at(until, self.verify(question, answer, evidence))
            .await
            .ok()
    }

    /// Score without calling the generator.
    pub fn heuristic(&self, answer: &str, evidence: &str) -> Verification {
        self.judge(heuristic_score(answer, evidence))
    }

    pub fn judge(&self, score: f32) -> Verification {
        Verification {
            score,
            needs_verification: score < self.threshold,
        }
    }
}

/// Share of the answer's content words that appear in the evidence.
pub fn evidence_overlap(answer: &str, evidence: &str) -> f32 {
    let answer_words = keywords(answer);
    if answer_words.is_empty() {
        return 0.0;
    }
    let evidence_words = keyword_set(evidence);
    let grounded = answer_words
        .iter()
        .filter(|w| evidence_words.contains(*w))
        .count();
    grounded as f32 / answer_words.len() as f32
}

/// Count hedging phrases in the answer.
pub fn hedging_count(answer: &str) -> usize {
    let answer_lower = answer.to_lowercase();
    HEDGING_INDICATORS
        .iter()
        .filter(|ind| answer_lower.contains(*ind))
        .count()
}

/// Deterministic fallback score in 0..1.
pub fn heuristic_score(answer: &str, evidence: &str) -> f32 {
    if answer.trim().is_empty() {
        return 0.0;
    }
    let grounded = if evidence.trim().is_empty() {
        // Nothing to ground against (general knowledge)
        0.5
    } else {
        evidence_overlap(answer, evidence)
    };
    // Allow one hedging word, but penalize more
    let hedging_penalty = (hedging_count(answer).saturating_sub(1) as f32 * 0.15).min(0.45);
    (0.2 + 0.8 * grounded - hedging_penalty).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::FakeGenerator;

    #[test]
    fn test_overlap() {
        let evidence = "Hold the reset button for 10 seconds until the light blinks.";
        assert_eq!(evidence_overlap("Hold reset button 10 seconds", evidence), 1.0);
        assert_eq!(evidence_overlap("Call support", evidence), 0.0);
    }

    #[test]
    fn test_hedging_penalized() {
        let evidence = "Hold the reset button for 10 seconds.";
        let clean = heuristic_score("Hold the reset button for 10 seconds.", evidence);
        let hedged = heuristic_score(
            "It's probably the reset button, typically held, most likely 10 seconds.",
            evidence,
        );
        assert!(clean > 0.9);
        assert!(hedged < clean);
    }

    #[test]
    fn test_empty_answer_scores_zero() {
        assert_eq!(heuristic_score("  ", "anything"), 0.0);
    }

    #[tokio::test]
    async fn test_verify_uses_self_check() {
        let verifier = AnswerVerifier::new(
            Arc::new(FakeGenerator::builder().scores(&[0.4]).build()),
            0.6,
        );
        let v = verifier.verify("q", "a", "e").await;
        assert_eq!(v.score, 0.4);
        assert!(v.needs_verification);

        // Queue exhausted: default score 0.9
        let v = verifier.verify("q", "a", "e").await;
        assert!(!v.needs_verification);
    }
}
