// ABOUTME: Mock backend for testing - keeps sessions in memory and records every call.
// ABOUTME: Failures and replies can be scripted so retry and dispatch policy are deterministic.
//!
//! # Example
//!
//! ```no_run
//! use charbridge_backend::backends::mock::{MockBackend, MockOp};
//! use charbridge_backend::{BackendError, RemoteClient};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let mock = Arc::new(MockBackend::new());
//! mock.fail_next(MockOp::Send, BackendError::Malformed("<html>".into()));
//! mock.reply_next("Hi there!");
//!
//! let client = RemoteClient::new(mock.clone(), "char-1");
//! let session = client.create_session(false).await.unwrap();
//! let turn = client.send(&session.session_id, "hello").await.unwrap();
//! assert_eq!(turn.candidates[0].text, "Hi there!");
//! assert_eq!(mock.sends().len(), 2);
//! # }
//! ```

use crate::{BackendError, Candidate, ChatBackend, NewSession, Turn};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Operation selector for scripted failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    CreateSession,
    Send,
    Edit,
    Delete,
    Rate,
    FetchHistory,
}

/// A call observed by the mock, recorded before any scripted failure applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    CreateSession {
        character_id: String,
        with_greeting: bool,
    },
    Send {
        session_id: String,
        text: String,
    },
    Edit {
        session_id: String,
        turn_id: String,
        text: String,
    },
    Delete {
        session_id: String,
        turn_ids: Vec<String>,
    },
    Rate {
        session_id: String,
        turn_id: String,
        candidate_id: String,
        rating: u8,
    },
    FetchHistory {
        session_id: String,
    },
}

enum ScriptedReply {
    Text(String),
    Filtered,
}

#[derive(Default)]
struct MockState {
    /// Turns per session, oldest first
    sessions: HashMap<String, Vec<Turn>>,
    session_counter: u64,
    turn_counter: u64,
    failures: VecDeque<(MockOp, BackendError)>,
    replies: VecDeque<ScriptedReply>,
    calls: Vec<BackendCall>,
}

impl MockState {
    fn next_turn_id(&mut self) -> String {
        self.turn_counter += 1;
        format!("turn-{}", self.turn_counter)
    }

    fn take_failure(&mut self, op: MockOp) -> Option<BackendError> {
        let idx = self.failures.iter().position(|(o, _)| *o == op)?;
        self.failures.remove(idx).map(|(_, e)| e)
    }

    fn session_mut(&mut self, session_id: &str) -> Result<&mut Vec<Turn>, BackendError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| BackendError::SessionNotFound(session_id.to_string()))
    }
}

/// In-memory backend with scripted behavior
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    latency: Option<Duration>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every send by `latency` (uses tokio time, so paused tests stay instant)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next call of `op` with `error`. Multiple failures queue up.
    pub fn fail_next(&self, op: MockOp, error: BackendError) {
        self.lock().failures.push_back((op, error));
    }

    /// Use `text` for the next AI reply instead of the default echo
    pub fn reply_next(&self, text: impl Into<String>) {
        self.lock()
            .replies
            .push_back(ScriptedReply::Text(text.into()));
    }

    /// Make the next AI reply a moderation-filtered candidate
    pub fn filter_next(&self) {
        self.lock().replies.push_back(ScriptedReply::Filtered);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// (session_id, text) of every send attempt, in call order
    pub fn sends(&self) -> Vec<(String, String)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Send { session_id, text } => Some((session_id.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    /// Turns of a session, oldest first
    pub fn history(&self, session_id: &str) -> Vec<Turn> {
        self.lock()
            .sessions
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_session(
        &self,
        character_id: &str,
        with_greeting: bool,
    ) -> Result<NewSession, BackendError> {
        let mut state = self.lock();
        state.calls.push(BackendCall::CreateSession {
            character_id: character_id.to_string(),
            with_greeting,
        });
        if let Some(e) = state.take_failure(MockOp::CreateSession) {
            return Err(e);
        }

        state.session_counter += 1;
        let session_id = format!("mock-session-{}", state.session_counter);
        let mut turns = Vec::new();
        let greeting = if with_greeting {
            let turn_id = state.next_turn_id();
            let turn = Turn {
                candidates: vec![Candidate::new(
                    format!("{}-c0", turn_id),
                    format!("Hello from {}!", character_id),
                )],
                turn_id,
                author_is_human: false,
            };
            turns.push(turn.clone());
            Some(turn)
        } else {
            None
        };
        state.sessions.insert(session_id.clone(), turns);

        Ok(NewSession {
            session_id,
            greeting,
        })
    }

    async fn send(
        &self,
        _character_id: &str,
        session_id: &str,
        text: &str,
    ) -> Result<Turn, BackendError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.calls.push(BackendCall::Send {
            session_id: session_id.to_string(),
            text: text.to_string(),
        });
        if let Some(e) = state.take_failure(MockOp::Send) {
            return Err(e);
        }
        state.session_mut(session_id)?;

        let human_id = state.next_turn_id();
        let ai_id = state.next_turn_id();
        let candidate = match state.replies.pop_front() {
            Some(ScriptedReply::Text(reply)) => Candidate::new(format!("{}-c0", ai_id), reply),
            Some(ScriptedReply::Filtered) => Candidate::filtered(format!("{}-c0", ai_id)),
            None => Candidate::new(format!("{}-c0", ai_id), format!("Reply to: {}", text)),
        };
        let human = Turn {
            candidates: vec![Candidate::new(format!("{}-c0", human_id), text)],
            turn_id: human_id,
            author_is_human: true,
        };
        let ai = Turn {
            turn_id: ai_id,
            author_is_human: false,
            candidates: vec![candidate],
        };

        let turns = state.session_mut(session_id)?;
        turns.push(human);
        turns.push(ai.clone());
        Ok(ai)
    }

    async fn edit(
        &self,
        session_id: &str,
        turn_id: &str,
        text: &str,
    ) -> Result<Turn, BackendError> {
        let mut state = self.lock();
        state.calls.push(BackendCall::Edit {
            session_id: session_id.to_string(),
            turn_id: turn_id.to_string(),
            text: text.to_string(),
        });
        if let Some(e) = state.take_failure(MockOp::Edit) {
            return Err(e);
        }

        let turns = state.session_mut(session_id)?;
        let turn = turns
            .iter_mut()
            .find(|t| t.turn_id == turn_id)
            .ok_or_else(|| BackendError::Other(anyhow::anyhow!("Turn not found: {}", turn_id)))?;
        let candidate_id = format!("{}-edit", turn.turn_id);
        turn.candidates = vec![Candidate::new(candidate_id, text)];
        Ok(turn.clone())
    }

    async fn delete(&self, session_id: &str, turn_ids: &[String]) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.calls.push(BackendCall::Delete {
            session_id: session_id.to_string(),
            turn_ids: turn_ids.to_vec(),
        });
        if let Some(e) = state.take_failure(MockOp::Delete) {
            return Err(e);
        }

        let turns = state.session_mut(session_id)?;
        turns.retain(|t| !turn_ids.contains(&t.turn_id));
        Ok(())
    }

    async fn rate(
        &self,
        session_id: &str,
        turn_id: &str,
        candidate_id: &str,
        rating: u8,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.calls.push(BackendCall::Rate {
            session_id: session_id.to_string(),
            turn_id: turn_id.to_string(),
            candidate_id: candidate_id.to_string(),
            rating,
        });
        if let Some(e) = state.take_failure(MockOp::Rate) {
            return Err(e);
        }
        state.session_mut(session_id)?;
        Ok(())
    }

    async fn fetch_history(&self, session_id: &str) -> Result<Vec<Turn>, BackendError> {
        let mut state = self.lock();
        state.calls.push(BackendCall::FetchHistory {
            session_id: session_id.to_string(),
        });
        if let Some(e) = state.take_failure(MockOp::FetchHistory) {
            return Err(e);
        }

        let turns = state.session_mut(session_id)?;
        Ok(turns.iter().rev().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_appends_human_and_ai_turns() {
        let mock = MockBackend::new();
        let session = mock.create_session("char", false).await.unwrap();
        let reply = mock.send("char", &session.session_id, "hello").await.unwrap();

        assert!(!reply.author_is_human);
        assert_eq!(reply.candidates[0].text, "Reply to: hello");

        let history = mock.history(&session.session_id);
        assert_eq!(history.len(), 2);
        assert!(history[0].author_is_human);
    }

    #[tokio::test]
    async fn test_greeting_turn_is_created_on_request() {
        let mock = MockBackend::new();
        let session = mock.create_session("alice", true).await.unwrap();
        let greeting = session.greeting.expect("greeting requested");
        assert_eq!(greeting.candidates[0].text, "Hello from alice!");
    }

    #[tokio::test]
    async fn test_scripted_failure_applies_once() {
        let mock = MockBackend::new();
        let session = mock.create_session("char", false).await.unwrap();
        mock.fail_next(MockOp::Send, BackendError::AuthExpired("expired".into()));

        let first = mock.send("char", &session.session_id, "a").await;
        assert!(matches!(first, Err(BackendError::AuthExpired(_))));
        assert!(mock.send("char", &session.session_id, "a").await.is_ok());
        assert_eq!(mock.sends().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_history_is_newest_first() {
        let mock = MockBackend::new();
        let session = mock.create_session("char", false).await.unwrap();
        mock.send("char", &session.session_id, "one").await.unwrap();

        let history = mock.fetch_history(&session.session_id).await.unwrap();
        assert!(!history[0].author_is_human);
        assert!(history[1].author_is_human);
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected() {
        let mock = MockBackend::new();
        let result = mock.send("char", "nope", "hi").await;
        assert!(matches!(result, Err(BackendError::SessionNotFound(_))));
    }
}
