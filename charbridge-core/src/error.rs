// ABOUTME: Error types for the platform gateway, session registry, and dispatch worker
// ABOUTME: Disposition maps each failure onto the worker's retry/abandon/report policy

use charbridge_backend::BackendError;
use thiserror::Error;

/// Failures reported by the chat platform gateway
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Missing permissions: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures resolving or replacing a surface's session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session creation failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Session store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Anything that can go wrong while the worker handles a job
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Dispatch worker is not running")]
    WorkerStopped,
}

/// What the worker does with a failed delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Log and try again while attempts remain
    RetryAuth,
    /// Moderation refused it; log and drop
    Rejected,
    /// The platform won't let us post there; drop quietly
    Forbidden,
    /// Drop and post a diagnostic in the origin channel
    Report,
}

impl DispatchError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Backend(BackendError::AuthExpired(_))
            | Self::Session(SessionError::Backend(BackendError::AuthExpired(_))) => {
                Disposition::RetryAuth
            }
            Self::Backend(BackendError::ActionRejected(_)) => Disposition::Rejected,
            Self::Platform(PlatformError::PermissionDenied(_) | PlatformError::NotFound(_)) => {
                Disposition::Forbidden
            }
            _ => Disposition::Report,
        }
    }
}
