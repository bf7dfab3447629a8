// ABOUTME: Classified errors returned by remote backend calls.
// ABOUTME: Separates transient decode failures from auth, moderation, and fatal errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The upstream returned a payload that could not be decoded. Usually an
    /// edge proxy error page; safe to retry the identical call.
    #[error("Malformed backend response: {0}")]
    Malformed(String),

    #[error("Backend authentication expired: {0}")]
    AuthExpired(String),

    /// Moderation or a backend rule refused the action
    #[error("Backend rejected action: {0}")]
    ActionRejected(String),

    /// Session creation was explicitly refused
    #[error("Cannot create a new chat: {0}")]
    CreateRejected(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    /// Failures the RemoteClient absorbs by backing off and retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::AuthExpired(_) => "auth_expired",
            Self::ActionRejected(_) => "action_rejected",
            Self::CreateRejected(_) => "create_rejected",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Other(_) => "other",
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Malformed(e.to_string())
    }
}
