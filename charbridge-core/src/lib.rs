// ABOUTME: Per-bot dispatch engine bridging chat platforms to character-chat backends
// ABOUTME: Session registry, serialized dispatch worker, lingering controller, last-exchange cache

pub mod bridge;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod exchange;
pub mod format;
pub mod linger;
pub mod metrics;
pub mod session;
pub mod traits;

pub use bridge::{Bridge, SubmitOutcome};
pub use context::AppContext;
pub use error::{DispatchError, Disposition, PlatformError, SessionError};

// Re-export core traits and data types
pub use traits::{
    AllowedMentions, ChatPlatform, ChatUser, IncomingMessage, MentionPolicy, MessageHandle,
    OutboundMessage, SharedPlatform, Surface, SurfaceKind,
};

// Re-export backend types for convenience
pub use charbridge_backend::{BackendError, ChatBackend, Rating, RemoteClient, Turn};
