//! Retrieval stages.
//!
//! Every stage implements one `attempt` capability; the orchestrator walks
//! an ordered list of them and never branches on the concrete type.

use async_trait::async_trait;
use manual_shared::{Message, Step};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::StageError;

pub mod general;
pub mod pdf;
pub mod snapshot;
pub mod text_cache;

pub use general::GeneralKnowledgeStage;
pub use pdf::PdfStage;
pub use snapshot::{SnapshotIndex, SnapshotStage};
pub use text_cache::TextCacheStage;

/// Everything a stage gets to see for one attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub question: String,
    pub product_id: String,
    /// Prior turns, oldest first
    pub history: Vec<Message>,
    /// Latest instant the attempt may run until
    pub deadline: Instant,
    /// Second attempt after a low self-check score
    pub regenerate: bool,
}

/// A candidate answer produced by a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub answer: String,
    pub reference: Option<String>,
    /// Context the answer was derived from, handed to the verifier
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Hit(Candidate),
    Miss,
}

#[async_trait]
pub trait RetrievalStage: Send + Sync {
    fn step(&self) -> Step;

    /// Own budget of this stage.
    fn timeout(&self) -> Duration;

    async fn attempt(&self, ctx: &StageContext) -> Result<StageOutcome, StageError>;
}

/// Extra instruction used on the second attempt.
pub(crate) const REGENERATE_HINT: &str = "A previous answer to this question was judged \
incomplete. Answer again, strictly from the provided content, covering every step the \
user needs. Quote exact settings, button names and values.";

/// Render prior turns for inclusion in a prompt.
pub(crate) fn render_history(history: &[Message]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
