// ABOUTME: Remote character-chat backend abstraction for charbridge.
// ABOUTME: Provides the ChatBackend trait, classified errors, and the retrying RemoteClient.

pub mod error;
pub mod retry;
pub mod traits;
pub mod types;

pub mod backends;

pub use error::BackendError;
pub use retry::{RemoteClient, DEFAULT_MALFORMED_BACKOFF};
pub use traits::ChatBackend;
pub use types::{Candidate, NewSession, Rating, Turn};
