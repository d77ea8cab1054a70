//! General-knowledge fallback, used only after every manual stage missed.

use async_trait::async_trait;
use manual_shared::Step;
use std::sync::Arc;
use std::time::Duration;

use super::{render_history, Candidate, RetrievalStage, StageContext, StageOutcome, REGENERATE_HINT};
use crate::error::StageError;
use crate::generator::{is_no_answer, Generator, Prompt, Purpose};

const SYSTEM_PROMPT: &str = "The product manual does not cover this question. Answer from \
general knowledge about products of this kind, say briefly that the manual did not cover it, \
and recommend contacting the manufacturer for anything safety related. If you cannot give a \
useful answer, reply with exactly NO_ANSWER.";

pub struct GeneralKnowledgeStage {
    generator: Arc<dyn Generator>,
    timeout: Duration,
}

impl GeneralKnowledgeStage {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }
}

#[async_trait]
impl RetrievalStage for GeneralKnowledgeStage {
    fn step(&self) -> Step {
        Step::GeneralKnowledge
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &StageContext) -> Result<StageOutcome, StageError> {
        let system = if ctx.regenerate {
            format!("{} {}", SYSTEM_PROMPT, REGENERATE_HINT)
        } else {
            SYSTEM_PROMPT.to_string()
        };
        let mut user = format!("Product: {}\n", ctx.product_id);
        if !ctx.history.is_empty() {
            user.push_str(&format!("Conversation so far:\n{}\n", render_history(&ctx.history)));
        }
        user.push_str(&format!("Question: {}", ctx.question));

        let reply = self
            .generator
            .generate(&Prompt::new(Purpose::GeneralKnowledge, system, user))
            .await?;
        if is_no_answer(&reply) {
            return Ok(StageOutcome::Miss);
        }
        Ok(StageOutcome::Hit(Candidate {
            answer: reply.trim().to_string(),
            reference: None,
            evidence: String::new(),
        }))
    }
}
