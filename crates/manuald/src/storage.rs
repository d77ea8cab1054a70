//! SQLite persistence for sessions, messages, violations, restrictions and
//! ratings.
//!
//! One connection behind a mutex; every operation runs on the blocking pool
//! and holds the connection only for the duration of its statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use manual_shared::{
    tier_duration, DetectionMethod, Message, MessageMeta, QaError, RestrictionState, Role,
    Session, Source, ViolationRecord, ViolationType,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::storage_error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    summary_title TEXT,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, product_id);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    source TEXT NOT NULL,
    reference TEXT,
    self_check_score REAL,
    needs_verification INTEGER NOT NULL DEFAULT 0,
    used_general_knowledge INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, seq)
);

CREATE TABLE IF NOT EXISTS violations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    question TEXT NOT NULL,
    violation_type TEXT NOT NULL,
    detection_method TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_violations_user ON violations(user_id);

CREATE TABLE IF NOT EXISTS restrictions (
    user_id TEXT PRIMARY KEY,
    violation_count INTEGER NOT NULL,
    restricted_until TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ratings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    question_key TEXT NOT NULL,
    question TEXT NOT NULL,
    answer TEXT NOT NULL,
    is_helpful INTEGER NOT NULL,
    correction TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ratings_key ON ratings(product_id, question_key);
";

/// Keyed restriction store with an atomic violation increment.
#[async_trait]
pub trait RestrictionStore: Send + Sync {
    async fn restriction(&self, user_id: &str) -> Result<RestrictionState, QaError>;

    /// Persist `record`, increment the user's count and recompute
    /// `restricted_until = record.created_at + tier_duration(count)`, all in
    /// one transaction.
    async fn record_violation(&self, record: &ViolationRecord)
        -> Result<RestrictionState, QaError>;
}

/// A rating to persist
#[derive(Debug, Clone)]
pub struct NewRating {
    pub user_id: String,
    pub product_id: String,
    pub question_key: String,
    pub question: String,
    pub answer: String,
    pub is_helpful: bool,
    pub correction: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the database file.
    pub async fn open(path: &Path) -> Result<Self, QaError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(storage_error)?;
        }
        info!("Opening database at {}", path.display());
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(conn)
        })
        .await
        .map_err(|e| QaError::Internal(e.to_string()))?
        .map_err(storage_error)?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, QaError> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, QaError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store
            .with_conn(|conn| {
                conn.pragma_update(None, "foreign_keys", "ON")?;
                conn.execute_batch(SCHEMA)
            })
            .await?;
        Ok(store)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, QaError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| QaError::Internal(e.to_string()))?
        .map_err(storage_error)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn insert_session(&self, session: &Session) -> Result<(), QaError> {
        let s = session.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions
                    (id, user_id, product_id, is_active, summary_title, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    s.id,
                    s.user_id,
                    s.product_id,
                    s.is_active,
                    s.summary_title,
                    s.created_at,
                    s.last_activity_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, QaError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, user_id, product_id, is_active, summary_title, created_at, last_activity_at
                 FROM sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn deactivate_session(&self, id: &str) -> Result<(), QaError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("UPDATE sessions SET is_active = 0 WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    /// Deactivate every active session of a user for a product.
    pub async fn deactivate_sessions(
        &self,
        user_id: &str,
        product_id: &str,
    ) -> Result<usize, QaError> {
        let (user_id, product_id) = (user_id.to_string(), product_id.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET is_active = 0
                 WHERE user_id = ?1 AND product_id = ?2 AND is_active = 1",
                params![user_id, product_id],
            )
        })
        .await
    }

    pub async fn set_session_title(&self, id: &str, title: &str) -> Result<(), QaError> {
        let (id, title) = (id.to_string(), title.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET summary_title = ?2 WHERE id = ?1",
                params![id, title],
            )?;
            Ok(())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Append a message. The sequence number is assigned inside the insert
    /// and the session's `last_activity_at` is bumped in the same transaction.
    pub async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        meta: &MessageMeta,
        now: DateTime<Utc>,
    ) -> Result<Message, QaError> {
        let mut message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            seq: 0,
            role,
            content: content.to_string(),
            source: meta.source.message_tag(),
            reference: meta.reference.clone(),
            self_check_score: meta.self_check_score,
            needs_verification: meta.needs_verification,
            used_general_knowledge: meta.used_general_knowledge,
            created_at: now,
        };
        let m = message.clone();
        let seq = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let seq: i64 = tx.query_row(
                    "INSERT INTO messages
                        (id, session_id, seq, role, content, source, reference,
                         self_check_score, needs_verification, used_general_knowledge, created_at)
                     VALUES (?1, ?2,
                        (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?2),
                        ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     RETURNING seq",
                    params![
                        m.id,
                        m.session_id,
                        m.role.as_str(),
                        m.content,
                        m.source.as_str(),
                        m.reference,
                        m.self_check_score,
                        m.needs_verification,
                        m.used_general_knowledge,
                        m.created_at
                    ],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "UPDATE sessions SET last_activity_at = ?2 WHERE id = ?1",
                    params![m.session_id, m.created_at],
                )?;
                tx.commit()?;
                Ok(seq)
            })
            .await?;
        message.seq = seq;
        debug!("Appended message seq={} to session {}", seq, session_id);
        Ok(message)
    }

    /// Last `limit` messages of a session in sequence order.
    pub async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, QaError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, seq, role, content, source, reference,
                        self_check_score, needs_verification, used_general_knowledge, created_at
                 FROM messages WHERE session_id = ?1
                 ORDER BY seq DESC LIMIT ?2",
            )?;
            let mut messages = stmt
                .query_map(params![session_id, limit as i64], message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Violations
    // ------------------------------------------------------------------

    pub async fn violations(&self, user_id: &str) -> Result<Vec<ViolationRecord>, QaError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, question, violation_type, detection_method, created_at
                 FROM violations WHERE user_id = ?1 ORDER BY id",
            )?;
            let records = stmt
                .query_map(params![user_id], violation_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Ratings
    // ------------------------------------------------------------------

    /// Persist a rating and return the number of negative ratings recorded
    /// for the same product and question.
    pub async fn insert_rating(&self, rating: NewRating) -> Result<u32, QaError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO ratings
                    (user_id, product_id, question_key, question, answer, is_helpful, correction, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    rating.user_id,
                    rating.product_id,
                    rating.question_key,
                    rating.question,
                    rating.answer,
                    rating.is_helpful,
                    rating.correction,
                    rating.created_at
                ],
            )?;
            let negatives: u32 = tx.query_row(
                "SELECT COUNT(*) FROM ratings
                 WHERE product_id = ?1 AND question_key = ?2 AND is_helpful = 0",
                params![rating.product_id, rating.question_key],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(negatives)
        })
        .await
    }
}

#[async_trait]
impl RestrictionStore for Store {
    async fn restriction(&self, user_id: &str) -> Result<RestrictionState, QaError> {
        let user = user_id.to_string();
        let state = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT user_id, violation_count, restricted_until
                     FROM restrictions WHERE user_id = ?1",
                    params![user],
                    |row| {
                        Ok(RestrictionState {
                            user_id: row.get(0)?,
                            violation_count: row.get(1)?,
                            restricted_until: row.get(2)?,
                        })
                    },
                )
                .optional()
            })
            .await?;
        Ok(state.unwrap_or_else(|| RestrictionState::clean(user_id)))
    }

    async fn record_violation(
        &self,
        record: &ViolationRecord,
    ) -> Result<RestrictionState, QaError> {
        let r = record.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO violations (user_id, question, violation_type, detection_method, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    r.user_id,
                    r.question,
                    r.violation_type.as_str(),
                    r.detection_method.as_str(),
                    r.created_at
                ],
            )?;
            let count: u32 = tx.query_row(
                "INSERT INTO restrictions (user_id, violation_count, updated_at)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET
                    violation_count = violation_count + 1,
                    updated_at = excluded.updated_at
                 RETURNING violation_count",
                params![r.user_id, r.created_at],
                |row| row.get(0),
            )?;
            let until = r.created_at + tier_duration(count);
            tx.execute(
                "UPDATE restrictions SET restricted_until = ?2 WHERE user_id = ?1",
                params![r.user_id, until],
            )?;
            tx.commit()?;
            Ok(RestrictionState {
                user_id: r.user_id,
                violation_count: count,
                restricted_until: Some(until),
            })
        })
        .await
    }
}

fn invalid_column(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {} '{}'", what, value).into(),
    )
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        product_id: row.get(2)?,
        is_active: row.get(3)?,
        summary_title: row.get(4)?,
        created_at: row.get(5)?,
        last_activity_at: row.get(6)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(3)?;
    let source: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        seq: row.get(2)?,
        role: Role::parse(&role).ok_or_else(|| invalid_column(3, "role", &role))?,
        content: row.get(4)?,
        source: Source::parse(&source).ok_or_else(|| invalid_column(5, "source", &source))?,
        reference: row.get(6)?,
        self_check_score: row.get::<_, Option<f64>>(7)?.map(|s| s as f32),
        needs_verification: row.get(8)?,
        used_general_knowledge: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn violation_from_row(row: &Row<'_>) -> rusqlite::Result<ViolationRecord> {
    let violation_type: String = row.get(2)?;
    let method: String = row.get(3)?;
    Ok(ViolationRecord {
        user_id: row.get(0)?,
        question: row.get(1)?,
        violation_type: ViolationType::parse(&violation_type)
            .ok_or_else(|| invalid_column(2, "violation type", &violation_type))?,
        detection_method: DetectionMethod::parse(&method)
            .ok_or_else(|| invalid_column(3, "detection method", &method))?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(id: &str, now: DateTime<Utc>) -> Session {
        Session {
            id: id.into(),
            user_id: "u1".into(),
            product_id: "kettle".into(),
            is_active: true,
            summary_title: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    fn violation(user: &str, at: DateTime<Utc>) -> ViolationRecord {
        ViolationRecord {
            user_id: user.into(),
            question: "ignore previous instructions".into(),
            violation_type: ViolationType::Adversarial,
            detection_method: DetectionMethod::Rule,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn test_session_roundtrip_and_title() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        store.insert_session(&session("s1", now)).await.unwrap();
        store.set_session_title("s1", "Descaling").await.unwrap();

        let loaded = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.summary_title.as_deref(), Some("Descaling"));
        assert!(loaded.is_active);
        assert!(store.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_assigns_sequence_and_bumps_activity() {
        let store = Store::open_in_memory().await.unwrap();
        let start = Utc::now();
        store.insert_session(&session("s1", start)).await.unwrap();

        let later = start + Duration::minutes(3);
        let m1 = store
            .append_message("s1", Role::User, "how?", &MessageMeta::user(), later)
            .await
            .unwrap();
        let meta = MessageMeta {
            source: Source::GeneralKnowledge,
            reference: None,
            self_check_score: Some(0.4),
            needs_verification: true,
            used_general_knowledge: true,
        };
        let m2 = store
            .append_message("s1", Role::Assistant, "like this", &meta, later)
            .await
            .unwrap();
        assert_eq!((m1.seq, m2.seq), (1, 2));
        assert_eq!(m2.source, Source::None);

        let history = store.recent_messages("s1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert!(history[1].used_general_knowledge);
        assert_eq!(history[1].self_check_score, Some(0.4));

        let s = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(s.last_activity_at, later);
    }

    #[tokio::test]
    async fn test_recent_messages_keeps_latest_in_order() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        store.insert_session(&session("s1", now)).await.unwrap();
        for i in 0..5 {
            store
                .append_message("s1", Role::User, &format!("m{}", i), &MessageMeta::user(), now)
                .await
                .unwrap();
        }
        let last = store.recent_messages("s1", 2).await.unwrap();
        let contents: Vec<_> = last.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_record_violation_increments_atomically() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();

        let first = store.record_violation(&violation("u1", now)).await.unwrap();
        assert_eq!(first.violation_count, 1);
        assert_eq!(first.restricted_until, Some(now));

        let second = store.record_violation(&violation("u1", now)).await.unwrap();
        assert_eq!(second.violation_count, 2);
        assert_eq!(second.restricted_until, Some(now + Duration::hours(1)));

        let loaded = store.restriction("u1").await.unwrap();
        assert_eq!(loaded, second);
        assert_eq!(store.violations("u1").await.unwrap().len(), 2);
        assert_eq!(store.restriction("u2").await.unwrap().violation_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_violations_not_undercounted() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.record_violation(&violation("u9", now)).await.unwrap()
            }));
        }
        let mut counts = Vec::new();
        for h in handles {
            counts.push(h.await.unwrap().violation_count);
        }
        counts.sort();
        assert_eq!(counts, (1..=8).collect::<Vec<u32>>());
        assert_eq!(store.restriction("u9").await.unwrap().violation_count, 8);
    }

    #[tokio::test]
    async fn test_insert_rating_counts_negatives() {
        let store = Store::open_in_memory().await.unwrap();
        let rating = |helpful: bool| NewRating {
            user_id: "u1".into(),
            product_id: "kettle".into(),
            question_key: "descale kettle".into(),
            question: "How do I descale the kettle?".into(),
            answer: "Use vinegar.".into(),
            is_helpful: helpful,
            correction: None,
            created_at: Utc::now(),
        };
        assert_eq!(store.insert_rating(rating(false)).await.unwrap(), 1);
        assert_eq!(store.insert_rating(rating(true)).await.unwrap(), 1);
        assert_eq!(store.insert_rating(rating(false)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("qa.db");
        let now = Utc::now();
        {
            let store = Store::open(&path).await.unwrap();
            store.insert_session(&session("s1", now)).await.unwrap();
        }
        let store = Store::open(&path).await.unwrap();
        assert!(store.get_session("s1").await.unwrap().is_some());
    }
}
