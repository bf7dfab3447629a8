// ABOUTME: Core ChatBackend trait that all remote backends implement.
// ABOUTME: Mirrors the character-chat RPC surface: sessions, turns, edits, ratings, history.

use crate::{BackendError, NewSession, Turn};
use async_trait::async_trait;

/// Remote character-chat backend.
///
/// Implementations do no retrying of their own; retry policy lives in
/// [`RemoteClient`](crate::RemoteClient).
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Create a session with a character, optionally asking for its greeting
    async fn create_session(
        &self,
        character_id: &str,
        with_greeting: bool,
    ) -> Result<NewSession, BackendError>;

    /// Send a human turn and return the AI's reply turn
    async fn send(
        &self,
        character_id: &str,
        session_id: &str,
        text: &str,
    ) -> Result<Turn, BackendError>;

    /// Replace the text of an existing turn
    async fn edit(&self, session_id: &str, turn_id: &str, text: &str)
        -> Result<Turn, BackendError>;

    /// Remove turns from a session
    async fn delete(&self, session_id: &str, turn_ids: &[String]) -> Result<(), BackendError>;

    /// Rate a candidate of a turn (0..=3)
    async fn rate(
        &self,
        session_id: &str,
        turn_id: &str,
        candidate_id: &str,
        rating: u8,
    ) -> Result<(), BackendError>;

    /// Every turn of a session, newest first
    async fn fetch_history(&self, session_id: &str) -> Result<Vec<Turn>, BackendError>;
}
