//! Manual-document store capability.
//!
//! Each product has three ordered data sources: a precomputed Q&A
//! snapshot, a cached plain-text extraction, and the sectioned document
//! used for full analysis.
//!
//! On-disk layout of `FsManualStore`:
//!
//! ```text
//! <manuals_dir>/<product>/qa_snapshot.json   [{question, answer, reference?}]
//! <manuals_dir>/<product>/manual.txt         cached text extraction
//! <manuals_dir>/<product>/sections.json      [{title, page?, text}]
//! <manuals_dir>/<product>/retired.json       [normalized question]
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::StageError;
use crate::text::normalize;

/// One precomputed question/answer pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaEntry {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub reference: Option<String>,
}

/// One section of the manual document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    #[serde(default)]
    pub page: Option<u32>,
    pub text: String,
}

impl Section {
    /// Reference pointer shown to the user.
    pub fn reference(&self) -> String {
        match self.page {
            Some(page) => format!("p. {} ({})", page, self.title),
            None => self.title.clone(),
        }
    }
}

/// Product ids come from request paths and name directories.
pub fn is_valid_product_id(product_id: &str) -> bool {
    !product_id.is_empty()
        && product_id.len() <= 128
        && product_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
pub trait ManualStore: Send + Sync {
    /// Live snapshot entries (retired entries excluded).
    async fn snapshot(&self, product_id: &str) -> Result<Vec<QaEntry>, StageError>;

    async fn cached_text(&self, product_id: &str) -> Result<Option<String>, StageError>;

    async fn sections(&self, product_id: &str) -> Result<Vec<Section>, StageError>;

    /// Retire the snapshot entry matching `question`. Returns false if no
    /// live entry matched.
    async fn retire_snapshot_entry(
        &self,
        product_id: &str,
        question: &str,
    ) -> Result<bool, StageError>;
}

// ============================================================================
// Filesystem store (Production)
// ============================================================================

pub struct FsManualStore {
    root: PathBuf,
    /// Serializes read-modify-write of `retired.json`
    retire_lock: Mutex<()>,
}

impl FsManualStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retire_lock: Mutex::new(()),
        }
    }

    fn product_dir(&self, product_id: &str) -> Result<PathBuf, StageError> {
        if !is_valid_product_id(product_id) {
            return Err(StageError::Document(format!(
                "invalid product id '{}'",
                product_id
            )));
        }
        Ok(self.root.join(product_id))
    }

    async fn read_optional(path: &Path) -> Result<Option<String>, StageError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StageError::Document(format!("{}: {}", path.display(), e))),
        }
    }

    async fn read_json<T: for<'de> Deserialize<'de> + Default>(
        path: &Path,
    ) -> Result<T, StageError> {
        match Self::read_optional(path).await? {
            Some(content) => serde_json::from_str(&content)
                .map_err(|e| StageError::Document(format!("{}: {}", path.display(), e))),
            None => Ok(T::default()),
        }
    }

    async fn retired(&self, dir: &Path) -> Result<HashSet<String>, StageError> {
        let list: Vec<String> = Self::read_json(&dir.join("retired.json")).await?;
        Ok(list.into_iter().collect())
    }

    /// Replace `path` via a sibling temp file so readers never see a
    /// partial write.
    async fn write_atomic(path: &Path, content: &str) -> Result<(), StageError> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| StageError::Document(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StageError::Document(format!("{}: {}", path.display(), e)))
    }
}

#[async_trait]
impl ManualStore for FsManualStore {
    async fn snapshot(&self, product_id: &str) -> Result<Vec<QaEntry>, StageError> {
        let dir = self.product_dir(product_id)?;
        let entries: Vec<QaEntry> = Self::read_json(&dir.join("qa_snapshot.json")).await?;
        let retired = self.retired(&dir).await?;
        Ok(entries
            .into_iter()
            .filter(|e| !retired.contains(&normalize(&e.question)))
            .collect())
    }

    async fn cached_text(&self, product_id: &str) -> Result<Option<String>, StageError> {
        let dir = self.product_dir(product_id)?;
        Self::read_optional(&dir.join("manual.txt")).await
    }

    async fn sections(&self, product_id: &str) -> Result<Vec<Section>, StageError> {
        let dir = self.product_dir(product_id)?;
        Self::read_json(&dir.join("sections.json")).await
    }

    async fn retire_snapshot_entry(
        &self,
        product_id: &str,
        question: &str,
    ) -> Result<bool, StageError> {
        let key = normalize(question);
        let _guard = self.retire_lock.lock().await;
        let live = self.snapshot(product_id).await?;
        if !live.iter().any(|e| normalize(&e.question) == key) {
            return Ok(false);
        }

        let dir = self.product_dir(product_id)?;
        let mut retired = self.retired(&dir).await?;
        retired.insert(key);
        let mut retired: Vec<String> = retired.into_iter().collect();
        retired.sort();
        let content = serde_json::to_string_pretty(&retired)
            .map_err(|e| StageError::Document(e.to_string()))?;
        Self::write_atomic(&dir.join("retired.json"), &content).await?;
        info!("Retired snapshot entry for product {}", product_id);
        Ok(true)
    }
}

// ============================================================================
// In-memory store (Testing)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ManualFixture {
    pub snapshot: Vec<QaEntry>,
    pub text: Option<String>,
    pub sections: Vec<Section>,
}

/// In-memory store with fixtures per product
#[derive(Default)]
pub struct MemoryManualStore {
    products: RwLock<HashMap<String, ManualFixture>>,
    retired: RwLock<HashSet<(String, String)>>,
}

impl MemoryManualStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(self, product_id: &str, fixture: ManualFixture) -> Self {
        self.products
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(product_id.to_string(), fixture);
        self
    }

    fn fixture(&self, product_id: &str) -> ManualFixture {
        self.products
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(product_id)
            .cloned()
            .unwrap_or_default()
    }

    fn is_retired(&self, product_id: &str, question: &str) -> bool {
        self.retired
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(product_id.to_string(), normalize(question)))
    }
}

#[async_trait]
impl ManualStore for MemoryManualStore {
    async fn snapshot(&self, product_id: &str) -> Result<Vec<QaEntry>, StageError> {
        Ok(self
            .fixture(product_id)
            .snapshot
            .into_iter()
            .filter(|e| !self.is_retired(product_id, &e.question))
            .collect())
    }

    async fn cached_text(&self, product_id: &str) -> Result<Option<String>, StageError> {
        Ok(self.fixture(product_id).text)
    }

    async fn sections(&self, product_id: &str) -> Result<Vec<Section>, StageError> {
        Ok(self.fixture(product_id).sections)
    }

    async fn retire_snapshot_entry(
        &self,
        product_id: &str,
        question: &str,
    ) -> Result<bool, StageError> {
        let key = normalize(question);
        let exists = self
            .fixture(product_id)
            .snapshot
            .iter()
            .any(|e| normalize(&e.question) == key);
        if !exists {
            warn!("No snapshot entry to retire for product {}", product_id);
            return Ok(false);
        }
        Ok(self
            .retired
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((product_id.to_string(), key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_product(root: &Path) {
        let dir = root.join("kettle-2000");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("qa_snapshot.json"),
            r#"[{"question": "How do I descale the kettle?", "answer": "Use citric acid.", "reference": "p. 9"},
                {"question": "What is the capacity?", "answer": "1.7 litres."}]"#,
        )
        .unwrap();
        std::fs::write(dir.join("manual.txt"), "Descaling\nUse citric acid monthly.").unwrap();
        std::fs::write(
            dir.join("sections.json"),
            r#"[{"title": "Cleaning", "page": 9, "text": "Use citric acid."}]"#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_fs_store_reads_all_sources() {
        let dir = tempfile::tempdir().unwrap();
        write_product(dir.path());
        let store = FsManualStore::new(dir.path());

        let snapshot = store.snapshot("kettle-2000").await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].reference.as_deref(), Some("p. 9"));
        assert!(store.cached_text("kettle-2000").await.unwrap().is_some());
        let sections = store.sections("kettle-2000").await.unwrap();
        assert_eq!(sections[0].reference(), "p. 9 (Cleaning)");
    }

    #[tokio::test]
    async fn test_fs_store_missing_product_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsManualStore::new(dir.path());
        assert!(store.snapshot("unknown").await.unwrap().is_empty());
        assert!(store.cached_text("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsManualStore::new(dir.path());
        assert!(matches!(
            store.snapshot("../etc").await,
            Err(StageError::Document(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_store_retire_entry() {
        let dir = tempfile::tempdir().unwrap();
        write_product(dir.path());
        let store = FsManualStore::new(dir.path());

        assert!(store
            .retire_snapshot_entry("kettle-2000", "how do I descale the kettle")
            .await
            .unwrap());
        let snapshot = store.snapshot("kettle-2000").await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].question, "What is the capacity?");
        assert!(!store
            .retire_snapshot_entry("kettle-2000", "How do I descale the kettle?")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fs_store_concurrent_retirements_both_stick() {
        let dir = tempfile::tempdir().unwrap();
        write_product(dir.path());
        let store = std::sync::Arc::new(FsManualStore::new(dir.path()));

        let a = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .retire_snapshot_entry("kettle-2000", "How do I descale the kettle?")
                    .await
            }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .retire_snapshot_entry("kettle-2000", "What is the capacity?")
                    .await
            }
        });
        assert!(a.await.unwrap().unwrap());
        assert!(b.await.unwrap().unwrap());

        assert!(store.snapshot("kettle-2000").await.unwrap().is_empty());
        let retired: Vec<String> = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("kettle-2000/retired.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(retired.len(), 2);
        assert!(!dir.path().join("kettle-2000/retired.json.tmp").exists());
    }
}
