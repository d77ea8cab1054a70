//! Question-answering service: admission and wiring of the pipeline.
//!
//! Admission order: identity, quota, restriction, validation, session,
//! single-flight. Everything that can reject a question runs before the
//! event stream opens, so a rejected question never reaches a stage.

use manual_shared::api::{AskRequest, FeedbackRequest, FeedbackResponse, HistoryResponse};
use manual_shared::{QaError, RestrictionStatus, Session, StreamEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::Config;
use crate::feedback::FeedbackService;
use crate::generator::Generator;
use crate::governor::Governor;
use crate::manuals::{is_valid_product_id, ManualStore};
use crate::orchestrator::{Orchestrator, PipelineState, Turn};
use crate::progress;
use crate::quota::QuotaGate;
use crate::sessions::SessionManager;
use crate::stages::{
    GeneralKnowledgeStage, PdfStage, RetrievalStage, SnapshotStage, TextCacheStage,
};
use crate::storage::Store;
use crate::verifier::AnswerVerifier;

/// Default page size of the history endpoint
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// External collaborators the service is built from.
pub struct Collaborators {
    pub store: Store,
    pub generator: Arc<dyn Generator>,
    pub manuals: Arc<dyn ManualStore>,
    pub quota: Arc<dyn QuotaGate>,
    pub clock: Arc<dyn Clock>,
}

pub struct QaService {
    governor: Governor,
    sessions: Arc<SessionManager>,
    orchestrator: Arc<Orchestrator>,
    feedback: FeedbackService,
    quota: Arc<dyn QuotaGate>,
}

impl QaService {
    pub fn new(config: &Config, deps: Collaborators) -> Self {
        let pipeline = &config.pipeline;
        let ms = Duration::from_millis;

        let governor = Governor::new(
            Arc::new(deps.store.clone()),
            Arc::clone(&deps.generator),
            Arc::clone(&deps.clock),
            config.governor.clone(),
        );
        let sessions = Arc::new(SessionManager::new(
            deps.store.clone(),
            Arc::clone(&deps.generator),
            Arc::clone(&deps.clock),
            config.session.idle_window_hours,
        ));

        let snapshot = Arc::new(SnapshotStage::new(
            Arc::clone(&deps.manuals),
            pipeline.snapshot_cache_capacity,
            pipeline.snapshot_fuzzy_threshold,
            ms(pipeline.snapshot_timeout_ms),
        ));
        let stages: Vec<Arc<dyn RetrievalStage>> = vec![
            snapshot.clone(),
            Arc::new(TextCacheStage::new(
                Arc::clone(&deps.manuals),
                Arc::clone(&deps.generator),
                pipeline.text_cache_passages,
                ms(pipeline.text_cache_timeout_ms),
            )),
            Arc::new(PdfStage::new(
                Arc::clone(&deps.manuals),
                Arc::clone(&deps.generator),
                pipeline.pdf_concurrency,
                pipeline.pdf_max_sections,
                ms(pipeline.pdf_timeout_ms),
            )),
        ];
        let general: Option<Arc<dyn RetrievalStage>> = if pipeline.general_knowledge_enabled {
            Some(Arc::new(GeneralKnowledgeStage::new(
                Arc::clone(&deps.generator),
                ms(pipeline.general_knowledge_timeout_ms),
            )))
        } else {
            None
        };

        let orchestrator = Arc::new(Orchestrator::new(
            stages,
            general,
            AnswerVerifier::new(Arc::clone(&deps.generator), pipeline.verify_threshold),
            Arc::clone(&sessions),
            pipeline,
        ));
        let feedback = FeedbackService::new(
            deps.store,
            deps.manuals,
            snapshot,
            deps.clock,
            config.feedback.retire_threshold,
        );

        Self {
            governor,
            sessions,
            orchestrator,
            feedback,
            quota: deps.quota,
        }
    }

    /// Admit a question and start answering it. Rejections come back as
    /// `Err` before any stream exists; afterwards everything arrives on the
    /// returned receiver, ending with an `answer` or `error` event.
    pub async fn ask(
        &self,
        user_id: &str,
        product_id: &str,
        req: AskRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, QaError> {
        let turn = match self.admit(user_id, product_id, req).await {
            Ok(turn) => turn,
            Err(e) => {
                info!(
                    "{:?} -> {:?}: {} ({})",
                    PipelineState::AbuseCheck,
                    PipelineState::Rejected,
                    e.code(),
                    user_id
                );
                return Err(e);
            }
        };
        let guard = self.sessions.try_begin(&turn.session.id)?;

        let (streamer, rx) = progress::channel();
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            let state = orchestrator.run(turn, streamer).await;
            debug!("Released {} in {:?}", guard.session_id(), state);
            drop(guard);
        });
        Ok(rx)
    }

    async fn admit(
        &self,
        user_id: &str,
        product_id: &str,
        req: AskRequest,
    ) -> Result<Turn, QaError> {
        require_identity(user_id)?;
        require_product(product_id)?;
        self.quota.check(user_id).await?;
        self.governor.ensure_not_blocked(user_id).await?;

        let verdict = self
            .governor
            .validate(user_id, product_id, &req.question)
            .await?;
        if !verdict.allowed {
            return Err(QaError::InvalidQuestion {
                violation_type: verdict.violation_type,
                reason: verdict
                    .reason
                    .unwrap_or_else(|| "This question can't be answered.".to_string()),
            });
        }

        let (session, resumed) = self
            .sessions
            .get_or_create(user_id, product_id, req.session_id.as_deref())
            .await?;
        debug!("Admitted question into {} (resumed={})", session.id, resumed);

        Ok(Turn {
            user_id: user_id.to_string(),
            product_id: product_id.to_string(),
            question: req.question.trim().to_string(),
            session,
        })
    }

    pub async fn record_feedback(
        &self,
        user_id: &str,
        product_id: &str,
        req: FeedbackRequest,
    ) -> Result<FeedbackResponse, QaError> {
        require_identity(user_id)?;
        require_product(product_id)?;
        self.feedback.record(user_id, product_id, req).await
    }

    pub async fn reset_session(&self, user_id: &str, product_id: &str) -> Result<Session, QaError> {
        require_identity(user_id)?;
        require_product(product_id)?;
        self.sessions.reset(user_id, product_id).await
    }

    pub async fn history(
        &self,
        user_id: &str,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<HistoryResponse, QaError> {
        require_identity(user_id)?;
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 500);
        let messages = self.sessions.history_for(user_id, session_id, limit).await?;
        Ok(HistoryResponse {
            session_id: session_id.to_string(),
            messages,
        })
    }

    pub async fn restriction(&self, user_id: &str) -> Result<RestrictionStatus, QaError> {
        require_identity(user_id)?;
        self.governor.check_restriction(user_id).await
    }
}

fn require_identity(user_id: &str) -> Result<(), QaError> {
    if user_id.trim().is_empty() {
        return Err(QaError::Unauthenticated);
    }
    Ok(())
}

fn require_product(product_id: &str) -> Result<(), QaError> {
    if !is_valid_product_id(product_id) {
        return Err(QaError::NotFound(format!("product {}", product_id)));
    }
    Ok(())
}
