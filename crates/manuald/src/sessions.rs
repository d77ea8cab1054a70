//! Session manager: session lifecycle, turn history and the per-session
//! in-flight registry.

use chrono::Duration;
use manual_shared::{Message, MessageMeta, QaError, Role, Session};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::generator::{is_no_answer, Generator, Prompt, Purpose};
use crate::storage::Store;
use crate::text::preview;

const TITLE_SYSTEM_PROMPT: &str = "Write a short title (at most six words) for a support \
conversation that starts with the exchange below. Reply with the title only.";

const MAX_TITLE_CHARS: usize = 60;

pub struct SessionManager {
    store: Store,
    generator: Arc<dyn Generator>,
    clock: Arc<dyn Clock>,
    idle_window: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Marks a session as busy until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    session_id: String,
    registry: Arc<Mutex<HashSet<String>>>,
}

impl InFlightGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.session_id);
        debug!("Session {} released", self.session_id);
    }
}

impl SessionManager {
    pub fn new(
        store: Store,
        generator: Arc<dyn Generator>,
        clock: Arc<dyn Clock>,
        idle_window_hours: i64,
    ) -> Self {
        Self {
            store,
            generator,
            clock,
            idle_window: Duration::hours(idle_window_hours),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Resume `session_id` if it is an active session of this user and
    /// product inside the idle window, otherwise start a new one.
    ///
    /// Returns the session and whether it was resumed.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        product_id: &str,
        session_id: Option<&str>,
    ) -> Result<(Session, bool), QaError> {
        let now = self.clock.now();

        if let Some(id) = session_id {
            match self.store.get_session(id).await? {
                Some(session) if session.user_id != user_id || session.product_id != product_id => {
                    warn!("Session {} not owned by caller, starting new session", id);
                }
                Some(session) if session.is_resumable(now, self.idle_window) => {
                    debug!("Resuming session {}", session.id);
                    return Ok((session, true));
                }
                Some(session) => {
                    if session.is_active {
                        info!(
                            "Session {} idle since {}, expiring",
                            session.id, session.last_activity_at
                        );
                        self.store.deactivate_session(&session.id).await?;
                    }
                }
                None => debug!("Unknown session {}, starting new session", id),
            }
        }

        let session = self.create(user_id, product_id).await?;
        Ok((session, false))
    }

    /// Explicit reset: deactivate the user's sessions for this product and
    /// start a fresh one.
    pub async fn reset(&self, user_id: &str, product_id: &str) -> Result<Session, QaError> {
        let closed = self.store.deactivate_sessions(user_id, product_id).await?;
        if closed > 0 {
            info!("Reset closed {} session(s) for {}", closed, user_id);
        }
        self.create(user_id, product_id).await
    }

    async fn create(&self, user_id: &str, product_id: &str) -> Result<Session, QaError> {
        let now = self.clock.now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            product_id: product_id.to_string(),
            is_active: true,
            summary_title: None,
            created_at: now,
            last_activity_at: now,
        };
        self.store.insert_session(&session).await?;
        info!("Created session {} for {}/{}", session.id, user_id, product_id);
        Ok(session)
    }

    pub async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        meta: &MessageMeta,
    ) -> Result<Message, QaError> {
        self.store
            .append_message(session_id, role, content, meta, self.clock.now())
            .await
    }

    /// The last `max_turns` question/answer pairs, oldest first.
    pub async fn history(&self, session_id: &str, max_turns: usize) -> Result<Vec<Message>, QaError> {
        self.store.recent_messages(session_id, max_turns * 2).await
    }

    /// History for the owning user only; anyone else gets `NotFound`.
    pub async fn history_for(
        &self,
        user_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, QaError> {
        match self.store.get_session(session_id).await? {
            Some(session) if session.user_id == user_id => {
                self.store.recent_messages(session_id, limit).await
            }
            _ => Err(QaError::NotFound(format!("session {}", session_id))),
        }
    }

    /// Admit one question for `session_id`, or `SessionBusy` if another is
    /// still being answered.
    pub fn try_begin(&self, session_id: &str) -> Result<InFlightGuard, QaError> {
        let mut registry = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !registry.insert(session_id.to_string()) {
            warn!("Session {} already has a question in flight", session_id);
            return Err(QaError::SessionBusy);
        }
        Ok(InFlightGuard {
            session_id: session_id.to_string(),
            registry: Arc::clone(&self.in_flight),
        })
    }

    /// Generate and store a session title in the background. Failures are
    /// logged and otherwise ignored.
    pub fn spawn_title(&self, session_id: &str, question: &str, answer: &str) -> JoinHandle<()> {
        let store = self.store.clone();
        let generator = Arc::clone(&self.generator);
        let session_id = session_id.to_string();
        let prompt = Prompt::new(
            Purpose::Title,
            TITLE_SYSTEM_PROMPT,
            format!("User: {}\nAssistant: {}", question, preview(answer, 400)),
        );

        tokio::spawn(async move {
            let reply = match generator.generate(&prompt).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Title generation failed for {}: {}", session_id, e);
                    return;
                }
            };
            if is_no_answer(&reply) {
                debug!("No title produced for {}", session_id);
                return;
            }
            let title = clean_title(&reply);
            if let Err(e) = store.set_session_title(&session_id, &title).await {
                warn!("Could not store title for {}: {}", session_id, e);
            } else {
                debug!("Session {} titled '{}'", session_id, title);
            }
        })
    }
}

fn clean_title(raw: &str) -> String {
    let line = raw.lines().next().unwrap_or_default();
    let trimmed = line
        .trim()
        .trim_start_matches("Title:")
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '.');
    trimmed.chars().take(MAX_TITLE_CHARS).collect()
}
