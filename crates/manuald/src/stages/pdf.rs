//! Stage 3: full-document analysis.
//!
//! Candidate sections are ranked by keyword overlap, then each one is sent
//! to the generator together with the recent conversation. Sub-queries run
//! concurrently under a semaphore; the highest-ranked section that yields an
//! answer wins.

use async_trait::async_trait;
use manual_shared::Step;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{render_history, Candidate, RetrievalStage, StageContext, StageOutcome, REGENERATE_HINT};
use crate::error::StageError;
use crate::generator::{is_no_answer, Generator, Prompt, Purpose};
use crate::manuals::{ManualStore, Section};
use crate::text::{keyword_score, keyword_set};

const SYSTEM_PROMPT: &str = "You are a product support assistant reading one section of the \
product manual. Answer the user's question using only this section and the conversation so \
far. If the section does not answer the question, reply with exactly NO_ANSWER.";

pub struct PdfStage {
    store: Arc<dyn ManualStore>,
    generator: Arc<dyn Generator>,
    concurrency: usize,
    max_sections: usize,
    timeout: Duration,
}

impl PdfStage {
    pub fn new(
        store: Arc<dyn ManualStore>,
        generator: Arc<dyn Generator>,
        concurrency: usize,
        max_sections: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            generator,
            concurrency: concurrency.max(1),
            max_sections: max_sections.max(1),
            timeout,
        }
    }

    /// Sections most likely to hold the answer, best first. Falls back to
    /// document order when no section shares a keyword with the question.
    fn candidates(&self, question: &str, sections: Vec<Section>) -> Vec<Section> {
        let query = keyword_set(question);
        let mut scored: Vec<(f32, usize, Section)> = sections
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                let text = format!("{}\n{}", s.title, s.text);
                (keyword_score(&query, &text), i, s)
            })
            .collect();

        if scored.iter().any(|(score, _, _)| *score > 0.0) {
            scored.retain(|(score, _, _)| *score > 0.0);
            scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        }
        scored
            .into_iter()
            .take(self.max_sections)
            .map(|(_, _, s)| s)
            .collect()
    }

    fn prompt(&self, ctx: &StageContext, section: &Section) -> Prompt {
        let system = if ctx.regenerate {
            format!("{} {}", SYSTEM_PROMPT, REGENERATE_HINT)
        } else {
            SYSTEM_PROMPT.to_string()
        };
        let mut user = String::new();
        if !ctx.history.is_empty() {
            user.push_str("Conversation so far:\n");
            user.push_str(&render_history(&ctx.history));
            user.push_str("\n\n");
        }
        user.push_str(&format!(
            "Manual section: {}\n{}\n\nQuestion: {}",
            section.reference(),
            section.text,
            ctx.question
        ));
        Prompt::new(Purpose::SectionAnswer, system, user)
    }
}

#[async_trait]
impl RetrievalStage for PdfStage {
    fn step(&self) -> Step {
        Step::PdfAnalysis
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &StageContext) -> Result<StageOutcome, StageError> {
        let sections = self.store.sections(&ctx.product_id).await?;
        let candidates = self.candidates(&ctx.question, sections);
        if candidates.is_empty() {
            debug!("No document sections for {}", ctx.product_id);
            return Ok(StageOutcome::Miss);
        }

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (rank, section) in candidates.iter().enumerate() {
            let prompt = self.prompt(ctx, section);
            let generator = Arc::clone(&self.generator);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| StageError::Generation(e.to_string()))?;
                generator.generate(&prompt).await.map(|reply| (rank, reply))
            });
        }

        let mut answers: Vec<(usize, String)> = Vec::new();
        let mut last_error = None;
        let mut answered = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((rank, reply))) => {
                    answered += 1;
                    if !is_no_answer(&reply) {
                        answers.push((rank, reply));
                    }
                }
                Ok(Err(e)) => {
                    warn!("Section sub-query failed: {}", e);
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!("Section sub-query panicked: {}", e);
                    last_error = Some(StageError::Generation(e.to_string()));
                }
            }
        }

        // Every sub-query failed: surface the failure rather than a miss
        if answered == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        let Some((rank, reply)) = answers.into_iter().min_by_key(|(rank, _)| *rank) else {
            return Ok(StageOutcome::Miss);
        };
        let section = &candidates[rank];
        debug!("Answer from section '{}' (rank {})", section.title, rank);
        Ok(StageOutcome::Hit(Candidate {
            answer: reply.trim().to_string(),
            reference: Some(section.reference()),
            evidence: format!("{}\n{}", section.title, section.text),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{FakeGenerator, FakeReply};
    use crate::manuals::{ManualFixture, MemoryManualStore};
    use manual_shared::{Message, Role, Source};
    use tokio::time::Instant;

    fn section(title: &str, page: u32, text: &str) -> Section {
        Section {
            title: title.into(),
            page: Some(page),
            text: text.into(),
        }
    }

    fn store() -> Arc<MemoryManualStore> {
        Arc::new(MemoryManualStore::new().with_product(
            "router",
            ManualFixture {
                sections: vec![
                    section("Safety", 2, "Keep away from water."),
                    section("Factory reset", 14, "Hold the reset button for 10 seconds."),
                    section("Wireless setup", 8, "Use the reset button only as a last resort."),
                ],
                ..Default::default()
            },
        ))
    }

    fn ctx(question: &str) -> StageContext {
        StageContext {
            question: question.into(),
            product_id: "router".into(),
            history: vec![],
            deadline: Instant::now() + Duration::from_secs(25),
            regenerate: false,
        }
    }

    #[test]
    fn test_candidates_ranked_by_overlap() {
        let stage = PdfStage::new(store(), Arc::new(FakeGenerator::builder().build()), 3, 6, Duration::from_secs(1));
        let sections = vec![
            section("Safety", 2, "Keep away from water."),
            section("Factory reset", 14, "Hold the reset button for 10 seconds to reset."),
        ];
        let ranked = stage.candidates("How do I factory reset?", sections);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].title, "Factory reset");
    }

    #[tokio::test]
    async fn test_highest_ranked_answer_wins() {
        let generator = Arc::new(
            FakeGenerator::builder()
                .reply_when(
                    Purpose::SectionAnswer,
                    "Hold the reset button",
                    FakeReply::Text("Hold reset for 10 seconds.".into()),
                )
                .reply_when(
                    Purpose::SectionAnswer,
                    "last resort",
                    FakeReply::Text("Only reset as a last resort.".into()),
                )
                .build(),
        );
        let stage = PdfStage::new(store(), generator.clone(), 2, 6, Duration::from_secs(25));
        match stage.attempt(&ctx("How do I factory reset the router?")).await.unwrap() {
            StageOutcome::Hit(c) => {
                assert_eq!(c.answer, "Hold reset for 10 seconds.");
                assert_eq!(c.reference.as_deref(), Some("p. 14 (Factory reset)"));
            }
            other => panic!("expected hit, got {:?}", other),
        }
        // Safety shares no keyword and is never queried
        assert_eq!(generator.calls().count(Purpose::SectionAnswer), 2);
    }

    #[tokio::test]
    async fn test_all_no_answer_is_miss() {
        let stage = PdfStage::new(
            store(),
            Arc::new(FakeGenerator::builder().build()),
            3,
            6,
            Duration::from_secs(25),
        );
        assert_eq!(
            stage.attempt(&ctx("reset button")).await.unwrap(),
            StageOutcome::Miss
        );
    }

    #[tokio::test]
    async fn test_all_errors_surface() {
        let generator = Arc::new(
            FakeGenerator::builder()
                .reply_with(Purpose::SectionAnswer, FakeReply::Error("backend down".into()))
                .build(),
        );
        let stage = PdfStage::new(store(), generator, 3, 6, Duration::from_secs(25));
        assert!(matches!(
            stage.attempt(&ctx("reset button")).await,
            Err(StageError::Generation(_))
        ));
    }

    #[tokio::test]
    async fn test_history_included_in_prompt() {
        let generator = Arc::new(
            FakeGenerator::builder()
                .reply_when(
                    Purpose::SectionAnswer,
                    "user: my lights are red",
                    FakeReply::Text("Red lights mean no uplink.".into()),
                )
                .build(),
        );
        let stage = PdfStage::new(store(), generator, 3, 6, Duration::from_secs(25));
        let mut context = ctx("What should I reset?");
        context.history = vec![Message {
            id: "m1".into(),
            session_id: "s1".into(),
            seq: 1,
            role: Role::User,
            content: "my lights are red".into(),
            source: Source::None,
            reference: None,
            self_check_score: None,
            needs_verification: false,
            used_general_knowledge: false,
            created_at: chrono::Utc::now(),
        }];
        assert!(matches!(
            stage.attempt(&context).await.unwrap(),
            StageOutcome::Hit(_)
        ));
    }
}
