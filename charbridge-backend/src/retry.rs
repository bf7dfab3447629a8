// ABOUTME: RemoteClient wraps a ChatBackend with the transient-failure retry policy.
// ABOUTME: Malformed responses are retried forever with a fixed backoff; other errors propagate.

use crate::{BackendError, ChatBackend, NewSession, Rating, Turn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Backoff between attempts after an undecodable upstream response
pub const DEFAULT_MALFORMED_BACKOFF: Duration = Duration::from_secs(30);

/// Retry boundary around every call to the remote backend for one character.
///
/// Callers get either eventual success or a non-transient error, never a
/// [`BackendError::Malformed`].
#[derive(Clone)]
pub struct RemoteClient {
    backend: Arc<dyn ChatBackend>,
    character_id: String,
    backoff: Duration,
}

impl RemoteClient {
    pub fn new(backend: Arc<dyn ChatBackend>, character_id: impl Into<String>) -> Self {
        Self {
            backend,
            character_id: character_id.into(),
            backoff: DEFAULT_MALFORMED_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn character_id(&self) -> &str {
        &self.character_id
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut retries: u64 = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() => {
                    retries += 1;
                    metrics::counter!("charbridge_backend_retries_total", "op" => op).increment(1);
                    tracing::warn!(
                        op,
                        retries,
                        backoff_secs = self.backoff.as_secs_f64(),
                        error = %e,
                        "Could not decode backend response, backing off"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                result => return result,
            }
        }
    }

    pub async fn create_session(&self, with_greeting: bool) -> Result<NewSession, BackendError> {
        let backend = &self.backend;
        let character = self.character_id.as_str();
        self.with_retry("create_session", move || {
            backend.create_session(character, with_greeting)
        })
        .await
    }

    pub async fn send(&self, session_id: &str, text: &str) -> Result<Turn, BackendError> {
        let backend = &self.backend;
        let character = self.character_id.as_str();
        self.with_retry("send", move || backend.send(character, session_id, text))
            .await
    }

    pub async fn edit(
        &self,
        session_id: &str,
        turn_id: &str,
        text: &str,
    ) -> Result<Turn, BackendError> {
        let backend = &self.backend;
        self.with_retry("edit", move || backend.edit(session_id, turn_id, text))
            .await
    }

    /// Edit the most recent AI-authored turn. Returns None when the session
    /// has no AI turns yet.
    pub async fn edit_last_ai_turn(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<Option<Turn>, BackendError> {
        let history = self.fetch_history(session_id).await?;
        let Some(turn) = history.iter().find(|t| !t.author_is_human) else {
            return Ok(None);
        };
        self.edit(session_id, &turn.turn_id, text).await.map(Some)
    }

    pub async fn delete(&self, session_id: &str, turn_ids: &[String]) -> Result<(), BackendError> {
        if turn_ids.is_empty() {
            return Ok(());
        }
        let backend = &self.backend;
        self.with_retry("delete", move || backend.delete(session_id, turn_ids))
            .await
    }

    /// Delete the newest `amount` turns. Returns how many were removed.
    pub async fn delete_latest(&self, session_id: &str, amount: usize) -> Result<usize, BackendError> {
        let history = self.fetch_history(session_id).await?;
        let ids: Vec<String> = history
            .into_iter()
            .take(amount)
            .map(|t| t.turn_id)
            .collect();
        self.delete(session_id, &ids).await?;
        Ok(ids.len())
    }

    pub async fn rate(
        &self,
        session_id: &str,
        turn_id: &str,
        candidate_id: &str,
        rating: Rating,
    ) -> Result<(), BackendError> {
        let backend = &self.backend;
        let value = rating.value();
        self.with_retry("rate", move || {
            backend.rate(session_id, turn_id, candidate_id, value)
        })
        .await
    }

    /// Rate the first candidate of the newest turn. Returns false for an
    /// empty session.
    pub async fn rate_latest(&self, session_id: &str, rating: Rating) -> Result<bool, BackendError> {
        let history = self.fetch_history(session_id).await?;
        let Some(turn) = history.first() else {
            return Ok(false);
        };
        let Some(candidate) = turn.primary() else {
            return Ok(false);
        };
        self.rate(session_id, &turn.turn_id, &candidate.candidate_id, rating)
            .await?;
        Ok(true)
    }

    pub async fn fetch_history(&self, session_id: &str) -> Result<Vec<Turn>, BackendError> {
        let backend = &self.backend;
        self.with_retry("fetch_history", move || backend.fetch_history(session_id))
            .await
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("backend", &self.backend.name())
            .field("character_id", &self.character_id)
            .field("backoff", &self.backoff)
            .finish()
    }
}
