//! Answer ratings and snapshot curation.

use manual_shared::api::{FeedbackRequest, FeedbackResponse};
use manual_shared::QaError;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::manuals::ManualStore;
use crate::stages::SnapshotStage;
use crate::storage::{NewRating, Store};
use crate::text::normalize;

pub struct FeedbackService {
    store: Store,
    manuals: Arc<dyn ManualStore>,
    snapshot: Arc<SnapshotStage>,
    clock: Arc<dyn Clock>,
    retire_threshold: u32,
}

impl FeedbackService {
    pub fn new(
        store: Store,
        manuals: Arc<dyn ManualStore>,
        snapshot: Arc<SnapshotStage>,
        clock: Arc<dyn Clock>,
        retire_threshold: u32,
    ) -> Self {
        Self {
            store,
            manuals,
            snapshot,
            clock,
            retire_threshold: retire_threshold.max(1),
        }
    }

    /// Persist a rating. Enough negative ratings for the same question retire
    /// the matching snapshot entry.
    pub async fn record(
        &self,
        user_id: &str,
        product_id: &str,
        req: FeedbackRequest,
    ) -> Result<FeedbackResponse, QaError> {
        let question_key = normalize(&req.question);
        if question_key.is_empty() || req.answer.trim().is_empty() {
            return Err(QaError::InvalidQuestion {
                violation_type: None,
                reason: "Feedback needs the question and the answer it rates.".into(),
            });
        }

        let is_helpful = req.is_helpful;
        let negatives = self
            .store
            .insert_rating(NewRating {
                user_id: user_id.to_string(),
                product_id: product_id.to_string(),
                question_key,
                question: req.question.clone(),
                answer: req.answer,
                is_helpful,
                correction: req.correction,
                created_at: self.clock.now(),
            })
            .await?;
        info!(
            "Rating from {} on {}: helpful={} negatives={}",
            user_id, product_id, is_helpful, negatives
        );

        let mut retired = false;
        if !is_helpful && negatives >= self.retire_threshold {
            match self
                .manuals
                .retire_snapshot_entry(product_id, &req.question)
                .await
            {
                Ok(true) => {
                    self.snapshot.invalidate(product_id).await;
                    info!("Retired snapshot entry after {} negative ratings", negatives);
                    retired = true;
                }
                Ok(false) => {}
                Err(e) => warn!("Could not retire snapshot entry: {}", e),
            }
        }

        Ok(FeedbackResponse {
            recorded: true,
            retired,
        })
    }
}
