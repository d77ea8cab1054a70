//! Fallback retrieval orchestrator.
//!
//! ```text
//! ABUSE_CHECK -> STAGE1 -> STAGE2 -> STAGE3 -> GENERAL_KNOWLEDGE -> VERIFY -> DONE
//!      |            \________\________\_______________/              ^
//!      v                         hit ---------------------------------'
//!   REJECTED                  FAILED (terminal stage error, request deadline)
//! ```
//!
//! The abuse check runs during admission (see `service.rs`); this module
//! takes over once a question has been admitted.

use manual_shared::{
    AnswerPayload, MessageMeta, QaError, Role, Session, Source, Step, StreamEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::progress::ProgressStreamer;
use crate::sessions::SessionManager;
use crate::stages::{Candidate, RetrievalStage, StageContext, StageOutcome};
use crate::text::preview;
use crate::verifier::AnswerVerifier;

/// Reply used when nothing could answer the question.
pub const NO_ANSWER_TEXT: &str = "I couldn't find this in the manual for your product. \
Try rephrasing the question, or contact the manufacturer's support.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    AbuseCheck,
    Stage1,
    Stage2,
    Stage3,
    GeneralKnowledge,
    Verify,
    Done,
    Failed,
    Rejected,
}

impl PipelineState {
    pub fn for_step(step: Step) -> Self {
        match step {
            Step::QaSnapshot => Self::Stage1,
            Step::TextCache => Self::Stage2,
            Step::PdfAnalysis => Self::Stage3,
            Step::GeneralKnowledge => Self::GeneralKnowledge,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Rejected)
    }
}

fn advance(state: &mut PipelineState, next: PipelineState) {
    debug!("Pipeline {:?} -> {:?}", state, next);
    *state = next;
}

/// An admitted question.
#[derive(Debug, Clone)]
pub struct Turn {
    pub user_id: String,
    pub product_id: String,
    pub question: String,
    pub session: Session,
}

/// The answer the pipeline settled on.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub answer: String,
    pub source: Source,
    pub reference: Option<String>,
    pub self_check_score: Option<f32>,
    pub needs_verification: bool,
    pub used_general_knowledge: bool,
}

impl Resolved {
    fn no_answer() -> Self {
        Self {
            answer: NO_ANSWER_TEXT.to_string(),
            source: Source::None,
            reference: None,
            self_check_score: None,
            needs_verification: false,
            used_general_knowledge: false,
        }
    }

    fn meta(&self) -> MessageMeta {
        MessageMeta {
            source: self.source,
            reference: self.reference.clone(),
            self_check_score: self.self_check_score,
            needs_verification: self.needs_verification,
            used_general_knowledge: self.used_general_knowledge,
        }
    }

    fn payload(self, session_id: &str) -> AnswerPayload {
        AnswerPayload {
            answer: self.answer,
            source: self.source,
            reference: self.reference,
            session_id: session_id.to_string(),
            self_check_score: self.self_check_score,
            needs_verification: self.needs_verification,
            used_general_knowledge: self.used_general_knowledge,
        }
    }
}

/// Longest a first self-check may run past the request deadline
const SELF_CHECK_GRACE: Duration = Duration::from_secs(2);

/// Regeneration is skipped with less than this left before the deadline
const MIN_REGENERATE_BUDGET: Duration = Duration::from_secs(1);

/// Kept back from the regeneration budget for its self-check
const RESCORE_RESERVE: Duration = Duration::from_millis(250);

/// What the stage walk settled on, before verification
enum Found {
    Hit(Arc<dyn RetrievalStage>, Candidate),
    NoAnswer,
}

/// Result of one bounded stage attempt
enum Attempt {
    Hit(Candidate),
    Miss,
    Failed(StageError),
    TimedOut,
}

pub struct Orchestrator {
    stages: Vec<Arc<dyn RetrievalStage>>,
    general: Option<Arc<dyn RetrievalStage>>,
    verifier: AnswerVerifier,
    sessions: Arc<SessionManager>,
    history_turns: usize,
    request_timeout: Duration,
}

impl Orchestrator {
    /// `stages` run in order; `general` is the optional fallback after all of
    /// them missed.
    pub fn new(
        stages: Vec<Arc<dyn RetrievalStage>>,
        general: Option<Arc<dyn RetrievalStage>>,
        verifier: AnswerVerifier,
        sessions: Arc<SessionManager>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            stages,
            general,
            verifier,
            sessions,
            history_turns: config.history_turns,
            request_timeout: config.request_timeout(),
        }
    }

    /// Answer an admitted question, streaming progress. Returns the final
    /// pipeline state.
    pub async fn run(&self, turn: Turn, mut progress: ProgressStreamer) -> PipelineState {
        let deadline = Instant::now() + self.request_timeout;
        let session_id = turn.session.id.clone();
        info!(
            "[{}] Answering '{}' for {}",
            turn.product_id,
            preview(&turn.question, 60),
            turn.user_id
        );

        let history = match self.sessions.history(&session_id, self.history_turns).await {
            Ok(history) => history,
            Err(e) => {
                warn!("History unavailable for {}: {}", session_id, e);
                Vec::new()
            }
        };
        let first_turn = history.is_empty();
        let ctx = StageContext {
            question: turn.question.clone(),
            product_id: turn.product_id.clone(),
            history,
            deadline,
            regenerate: false,
        };

        let mut state = PipelineState::AbuseCheck;
        let walk = timeout_at(deadline, self.resolve(&ctx, &mut state, &mut progress)).await;

        // Verification runs outside the deadline scope; the retry is bounded
        // by whatever is left of it.
        let resolved = match walk {
            Ok(Ok(Some(Found::Hit(stage, candidate)))) => {
                advance(&mut state, PipelineState::Verify);
                Some(self.verify(&stage, &ctx, candidate, &progress).await)
            }
            Ok(Ok(Some(Found::NoAnswer))) => Some(Resolved::no_answer()),
            Ok(Ok(None)) => {
                info!("Client disconnected from {}, stopping", session_id);
                None
            }
            Ok(Err(e)) => {
                error!("Pipeline failed for {}: {:?}", session_id, e);
                progress
                    .emit(StreamEvent::error(&e, Some(session_id.clone())))
                    .await;
                None
            }
            Err(_) => {
                warn!(
                    "Request deadline of {:?} exceeded in {:?}",
                    self.request_timeout, state
                );
                progress
                    .emit(StreamEvent::error(&QaError::Timeout, Some(session_id.clone())))
                    .await;
                None
            }
        };

        match resolved {
            Some(resolved) => {
                self.persist(&turn, first_turn, &resolved).await;
                progress
                    .emit(StreamEvent::answer(resolved.payload(&session_id)))
                    .await;
                advance(&mut state, PipelineState::Done);
            }
            None => advance(&mut state, PipelineState::Failed),
        }
        info!("Pipeline finished in {}ms: {:?}", progress.elapsed_ms(), state);
        state
    }

    /// Walk the stages. `Ok(None)` means the client went away before an
    /// answer was produced.
    async fn resolve(
        &self,
        ctx: &StageContext,
        state: &mut PipelineState,
        progress: &mut ProgressStreamer,
    ) -> Result<Option<Found>, QaError> {
        let last = self.stages.len().saturating_sub(1);

        for (i, stage) in self.stages.iter().enumerate() {
            if progress.is_closed() {
                return Ok(None);
            }
            let step = stage.step();
            advance(state, PipelineState::for_step(step));

            match self.attempt(stage, ctx, progress).await {
                Attempt::Hit(candidate) => return Ok(Some(Found::Hit(stage.clone(), candidate))),
                Attempt::Miss | Attempt::TimedOut => {}
                Attempt::Failed(e) if i == last => {
                    error!("{} failed: {}", step.name(), e);
                    return Err(e.into());
                }
                Attempt::Failed(e) => {
                    warn!("{} failed, falling through: {}", step.name(), e);
                }
            }
        }

        let Some(general) = &self.general else {
            info!("Manual stages missed, general knowledge disabled");
            return Ok(Some(Found::NoAnswer));
        };
        if progress.is_closed() {
            return Ok(None);
        }
        advance(state, PipelineState::GeneralKnowledge);

        match self.attempt(general, ctx, progress).await {
            Attempt::Hit(candidate) => Ok(Some(Found::Hit(general.clone(), candidate))),
            Attempt::Miss | Attempt::TimedOut => Ok(Some(Found::NoAnswer)),
            Attempt::Failed(e) => {
                error!("General knowledge failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Run one stage under its own timeout and report progress.
    async fn attempt(
        &self,
        stage: &Arc<dyn RetrievalStage>,
        ctx: &StageContext,
        progress: &mut ProgressStreamer,
    ) -> Attempt {
        let step = stage.step();
        progress.step_start(step).await;

        match self.bounded_attempt(stage, ctx, stage.timeout()).await {
            Attempt::Hit(candidate) => {
                progress.step_complete(step).await;
                Attempt::Hit(candidate)
            }
            Attempt::TimedOut => {
                warn!("{} timed out after {:?}", step.name(), stage.timeout());
                progress.step_timeout(step).await;
                Attempt::TimedOut
            }
            Attempt::Miss => {
                debug!("{} miss", step.name());
                Attempt::Miss
            }
            failed => failed,
        }
    }

    async fn bounded_attempt(
        &self,
        stage: &Arc<dyn RetrievalStage>,
        ctx: &StageContext,
        budget: Duration,
    ) -> Attempt {
        let mut stage_ctx = ctx.clone();
        stage_ctx.deadline = ctx.deadline.min(Instant::now() + budget);

        match timeout(budget, stage.attempt(&stage_ctx)).await {
            Ok(Ok(StageOutcome::Hit(candidate))) => Attempt::Hit(candidate),
            Ok(Ok(StageOutcome::Miss)) => Attempt::Miss,
            Ok(Err(StageError::Timeout)) | Err(_) => Attempt::TimedOut,
            Ok(Err(e)) => Attempt::Failed(e),
        }
    }

    /// Score the candidate and regenerate once if it falls short. The better
    /// of the two is returned; an answer is never withheld. The retry only
    /// gets the time left before the request deadline.
    async fn verify(
        &self,
        stage: &Arc<dyn RetrievalStage>,
        ctx: &StageContext,
        candidate: Candidate,
        progress: &ProgressStreamer,
    ) -> Resolved {
        let step = stage.step();
        let check_until = ctx.deadline.max(Instant::now() + SELF_CHECK_GRACE);
        let first = match self
            .verifier
            .verify_until(&ctx.question, &candidate.answer, &candidate.evidence, check_until)
            .await
        {
            Some(first) => first,
            None => {
                warn!("Self-check timed out, using heuristic score");
                self.verifier.heuristic(&candidate.answer, &candidate.evidence)
            }
        };

        let remaining = ctx.deadline.saturating_duration_since(Instant::now());
        let (best, verification) = if !first.needs_verification || progress.is_closed() {
            (candidate, first)
        } else if remaining < MIN_REGENERATE_BUDGET {
            info!(
                "{} answer scored {:.2}, no time left to regenerate ({:?})",
                step.name(),
                first.score,
                remaining
            );
            (candidate, first)
        } else {
            info!(
                "{} answer scored {:.2} < {:.2}, regenerating once",
                step.name(),
                first.score,
                self.verifier.threshold()
            );
            let budget = stage.timeout().min(remaining - RESCORE_RESERVE);
            let mut retry = ctx.clone();
            retry.regenerate = true;
            match self.bounded_attempt(stage, &retry, budget).await {
                Attempt::Hit(second) => {
                    let rescored = self
                        .verifier
                        .verify_until(&ctx.question, &second.answer, &second.evidence, ctx.deadline)
                        .await;
                    match rescored {
                        Some(rescored) if rescored.score > first.score => (second, rescored),
                        Some(_) => (candidate, first),
                        None => {
                            warn!("Self-check of regenerated answer timed out, keeping original");
                            (candidate, first)
                        }
                    }
                }
                Attempt::Miss => {
                    debug!("Regeneration produced no answer, keeping original");
                    (candidate, first)
                }
                Attempt::TimedOut => {
                    warn!("Regeneration timed out after {:?}, keeping original", budget);
                    (candidate, first)
                }
                Attempt::Failed(e) => {
                    warn!("Regeneration failed, keeping original: {}", e);
                    (candidate, first)
                }
            }
        };

        if verification.needs_verification {
            info!("Returning answer flagged for verification ({:.2})", verification.score);
        }
        let source = step.source();
        Resolved {
            answer: best.answer,
            source,
            reference: best.reference,
            self_check_score: Some(verification.score),
            needs_verification: verification.needs_verification,
            used_general_knowledge: source == Source::GeneralKnowledge,
        }
    }

    /// Store the question and the answer. Failures are logged; the answer is
    /// still delivered.
    async fn persist(&self, turn: &Turn, first_turn: bool, resolved: &Resolved) {
        let session_id = &turn.session.id;
        if let Err(e) = self
            .sessions
            .append_message(session_id, Role::User, &turn.question, &MessageMeta::user())
            .await
        {
            error!("Failed to persist question in {}: {}", session_id, e);
            return;
        }
        if let Err(e) = self
            .sessions
            .append_message(session_id, Role::Assistant, &resolved.answer, &resolved.meta())
            .await
        {
            error!("Failed to persist answer in {}: {}", session_id, e);
            return;
        }

        if first_turn && turn.session.summary_title.is_none() {
            // Detached; title failures never reach the caller
            let _ = self
                .sessions
                .spawn_title(session_id, &turn.question, &resolved.answer);
        }
    }
}
