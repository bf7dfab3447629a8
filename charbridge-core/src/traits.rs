// ABOUTME: Chat platform gateway trait and the message types crossing it
// ABOUTME: Surfaces, users, inbound messages, outbound replies, and mention policy

use crate::error::PlatformError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Conversation Surfaces
// =============================================================================

/// Whether a surface is shared by many people or a one-to-one conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    Guild,
    Private,
}

/// One addressable conversation context. A whole guild shares a single
/// surface; a private channel is its own surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Surface {
    pub kind: SurfaceKind,
    pub id: String,
}

impl Surface {
    pub fn guild(id: impl Into<String>) -> Self {
        Self {
            kind: SurfaceKind::Guild,
            id: id.into(),
        }
    }

    pub fn private(id: impl Into<String>) -> Self {
        Self {
            kind: SurfaceKind::Private,
            id: id.into(),
        }
    }

    /// Multi-party surfaces get lingering; private ones don't
    pub fn is_multi_party(&self) -> bool {
        self.kind == SurfaceKind::Guild
    }

    /// Stable textual key used for persistence and per-surface maps
    pub fn key(&self) -> String {
        match self.kind {
            SurfaceKind::Guild => format!("server-{}", self.id),
            SurfaceKind::Private => format!("private-{}", self.id),
        }
    }

    /// Inverse of [`Surface::key`]
    pub fn parse_key(key: &str) -> Option<Self> {
        if let Some(id) = key.strip_prefix("server-") {
            return (!id.is_empty()).then(|| Self::guild(id));
        }
        if let Some(id) = key.strip_prefix("private-") {
            return (!id.is_empty()).then(|| Self::private(id));
        }
        None
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// =============================================================================
// Users and Messages
// =============================================================================

/// Author of a chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    pub id: String,
    /// Account name (or the alias the caller resolved for it)
    pub name: String,
    pub display_name: Option<String>,
    pub global_name: Option<String>,
    pub is_bot: bool,
    /// Whether replies may ping everyone/users/roles on this author's behalf.
    /// Platforms set this for authors outside a guild too.
    pub can_mention_everyone: bool,
}

impl ChatUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            display_name: None,
            global_name: None,
            is_bot: false,
            can_mention_everyone: false,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn bot(mut self) -> Self {
        self.is_bot = true;
        self
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn global_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.name)
    }
}

/// Inbound message as delivered by the platform gateway
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Platform message ID
    pub id: String,
    pub surface: Surface,
    /// Channel the message was posted in (replies go here)
    pub channel_id: String,
    pub author: ChatUser,
    /// Message text, with mentions already rendered as plain names
    pub content: String,
    /// Whether the message explicitly mentions the bot
    pub mentions_bot: bool,
    pub created_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(
        id: impl Into<String>,
        surface: Surface,
        channel_id: impl Into<String>,
        author: ChatUser,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            surface,
            channel_id: channel_id.into(),
            author,
            content: content.into(),
            mentions_bot: false,
            created_at: Utc::now(),
        }
    }

    pub fn mentioning_bot(mut self) -> Self {
        self.mentions_bot = true;
        self
    }
}

/// Reference to a message the bot posted
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub channel_id: String,
    pub message_id: String,
}

// =============================================================================
// Outbound Messages
// =============================================================================

/// Which mention kinds a reply may trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllowedMentions {
    pub everyone: bool,
    pub users: bool,
    pub roles: bool,
}

impl AllowedMentions {
    pub fn all() -> Self {
        Self {
            everyone: true,
            users: true,
            roles: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// Mention behavior captured with an exchange and reused for resends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MentionPolicy {
    /// Ping the author of the message being replied to
    pub mention_author: bool,
    pub allowed: AllowedMentions,
}

/// A message to post on the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    /// Message ID to reply to, if any
    pub reply_to: Option<String>,
    pub mentions: MentionPolicy,
}

impl OutboundMessage {
    pub fn new(text: impl Into<String>, mentions: MentionPolicy) -> Self {
        Self {
            text: text.into(),
            reply_to: None,
            mentions,
        }
    }

    pub fn reply(text: impl Into<String>, reply_to: impl Into<String>, mentions: MentionPolicy) -> Self {
        Self {
            text: text.into(),
            reply_to: Some(reply_to.into()),
            mentions,
        }
    }
}

// =============================================================================
// Platform Gateway
// =============================================================================

/// Chat platform operations the engine needs. Event delivery stays with the
/// host: it feeds inbound messages to [`Bridge`](crate::Bridge).
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Bot's user ID on this platform
    fn bot_user_id(&self) -> &str;

    /// Check if a user ID is the bot itself
    fn is_self(&self, user_id: &str) -> bool {
        user_id == self.bot_user_id()
    }

    async fn send(
        &self,
        channel_id: &str,
        message: OutboundMessage,
    ) -> Result<MessageHandle, PlatformError>;

    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), PlatformError>;

    async fn delete(&self, handle: &MessageHandle) -> Result<(), PlatformError>;

    /// Show or clear the typing indicator in a channel
    async fn set_typing(&self, _channel_id: &str, _typing: bool) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Shared handle to a platform gateway
pub type SharedPlatform = Arc<dyn ChatPlatform>;
