//! Stage 1: precomputed question/answer snapshot lookup.

use async_trait::async_trait;
use lru::LruCache;
use manual_shared::Step;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Candidate, RetrievalStage, StageContext, StageOutcome};
use crate::error::StageError;
use crate::manuals::{ManualStore, QaEntry};
use crate::text::{jaccard, keyword_set, normalize};

/// Snapshot entries indexed by normalized question, with keyword sets for
/// fuzzy matching.
#[derive(Debug)]
pub struct SnapshotIndex {
    exact: HashMap<String, usize>,
    entries: Vec<(QaEntry, HashSet<String>)>,
}

impl SnapshotIndex {
    pub fn build(entries: Vec<QaEntry>) -> Self {
        let mut exact = HashMap::new();
        let mut indexed = Vec::with_capacity(entries.len());
        for entry in entries {
            // First entry wins on duplicate questions
            exact.entry(normalize(&entry.question)).or_insert(indexed.len());
            let keys = keyword_set(&entry.question);
            indexed.push((entry, keys));
        }
        Self {
            exact,
            entries: indexed,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries matching `question`, best first. An exact match scores 1.0;
    /// fuzzy matches need at least `threshold` keyword similarity.
    pub fn lookup(&self, question: &str, threshold: f32) -> Vec<(f32, &QaEntry)> {
        let exact = self.exact.get(&normalize(question)).copied();
        let query = keyword_set(question);

        let mut matches: Vec<(f32, usize)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, (_, keys))| {
                if Some(i) == exact {
                    return Some((1.0, i));
                }
                let score = jaccard(&query, keys);
                (score >= threshold).then_some((score, i))
            })
            .collect();
        matches.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        matches
            .into_iter()
            .map(|(score, i)| (score, &self.entries[i].0))
            .collect()
    }
}

pub struct SnapshotStage {
    store: Arc<dyn ManualStore>,
    cache: Mutex<LruCache<String, Arc<SnapshotIndex>>>,
    fuzzy_threshold: f32,
    timeout: Duration,
}

impl SnapshotStage {
    pub fn new(
        store: Arc<dyn ManualStore>,
        capacity: usize,
        fuzzy_threshold: f32,
        timeout: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
            fuzzy_threshold,
            timeout,
        }
    }

    /// Index for a product, built on first use.
    pub async fn index(&self, product_id: &str) -> Result<Arc<SnapshotIndex>, StageError> {
        if let Some(index) = self.cache.lock().await.get(product_id) {
            return Ok(Arc::clone(index));
        }
        let entries = self.store.snapshot(product_id).await?;
        let index = Arc::new(SnapshotIndex::build(entries));
        debug!("Built snapshot index for {} ({} entries)", product_id, index.len());
        self.cache
            .lock()
            .await
            .put(product_id.to_string(), Arc::clone(&index));
        Ok(index)
    }

    /// Drop a product's cached index so the next lookup rebuilds it.
    pub async fn invalidate(&self, product_id: &str) {
        if self.cache.lock().await.pop(product_id).is_some() {
            debug!("Invalidated snapshot index for {}", product_id);
        }
    }
}

#[async_trait]
impl RetrievalStage for SnapshotStage {
    fn step(&self) -> Step {
        Step::QaSnapshot
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &StageContext) -> Result<StageOutcome, StageError> {
        let index = self.index(&ctx.product_id).await?;
        let matches = index.lookup(&ctx.question, self.fuzzy_threshold);

        // A second attempt offers the runner-up match, if any
        let pick = if ctx.regenerate {
            matches.get(1)
        } else {
            matches.first()
        };

        Ok(match pick {
            Some((score, entry)) => {
                debug!("Snapshot match score={:.2}", score);
                StageOutcome::Hit(Candidate {
                    answer: entry.answer.clone(),
                    reference: entry.reference.clone(),
                    evidence: format!("Q: {}\nA: {}", entry.question, entry.answer),
                })
            }
            None => StageOutcome::Miss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manuals::{ManualFixture, MemoryManualStore};
    use tokio::time::Instant;

    fn entry(q: &str, a: &str) -> QaEntry {
        QaEntry {
            question: q.into(),
            answer: a.into(),
            reference: Some("p. 4".into()),
        }
    }

    fn ctx(question: &str) -> StageContext {
        StageContext {
            question: question.into(),
            product_id: "kettle".into(),
            history: vec![],
            deadline: Instant::now() + Duration::from_secs(2),
            regenerate: false,
        }
    }

    fn stage() -> (SnapshotStage, Arc<MemoryManualStore>) {
        let store = Arc::new(MemoryManualStore::new().with_product(
            "kettle",
            ManualFixture {
                snapshot: vec![
                    entry("How do I descale the kettle?", "Use citric acid."),
                    entry("What is the kettle capacity?", "1.7 litres."),
                ],
                ..Default::default()
            },
        ));
        let stage = SnapshotStage::new(store.clone(), 8, 0.75, Duration::from_secs(2));
        (stage, store)
    }

    #[test]
    fn test_exact_match_ignores_case_and_punctuation() {
        let index = SnapshotIndex::build(vec![entry("How do I descale the kettle?", "a")]);
        let matches = index.lookup("how do i DESCALE the kettle", 0.75);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, 1.0);
    }

    #[test]
    fn test_fuzzy_threshold() {
        let index = SnapshotIndex::build(vec![entry("How do I descale the kettle?", "a")]);
        // Same keywords, different phrasing
        assert_eq!(index.lookup("descale kettle how", 0.75).len(), 1);
        assert!(index.lookup("descale the coffee machine", 0.75).is_empty());
    }

    #[tokio::test]
    async fn test_hit_and_miss() {
        let (stage, _) = stage();
        match stage.attempt(&ctx("How do I descale the kettle")).await.unwrap() {
            StageOutcome::Hit(c) => {
                assert_eq!(c.answer, "Use citric acid.");
                assert_eq!(c.reference.as_deref(), Some("p. 4"));
            }
            other => panic!("expected hit, got {:?}", other),
        }
        assert_eq!(
            stage.attempt(&ctx("Does it have a timer?")).await.unwrap(),
            StageOutcome::Miss
        );
    }

    #[tokio::test]
    async fn test_invalidate_rebuilds_after_retirement() {
        let (stage, store) = stage();
        let question = "What is the kettle capacity?";
        assert!(matches!(
            stage.attempt(&ctx(question)).await.unwrap(),
            StageOutcome::Hit(_)
        ));

        store.retire_snapshot_entry("kettle", question).await.unwrap();
        // Cached index still serves the retired entry until invalidated
        assert!(matches!(
            stage.attempt(&ctx(question)).await.unwrap(),
            StageOutcome::Hit(_)
        ));
        stage.invalidate("kettle").await;
        assert_eq!(stage.attempt(&ctx(question)).await.unwrap(), StageOutcome::Miss);
    }
}
