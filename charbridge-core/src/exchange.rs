// ABOUTME: Last-exchange cache - the latest request/response pair per surface.
// ABOUTME: Drives retry (regenerate the last reply) and edit (rewrite it) for each surface.

use crate::error::{DispatchError, PlatformError};
use crate::format::ReplyStyle;
use crate::traits::{MentionPolicy, MessageHandle, OutboundMessage, SharedPlatform, Surface};
use charbridge_backend::RemoteClient;
use std::collections::HashMap;
use std::sync::Mutex;

/// What was sent to the backend for an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub surface: Surface,
    /// Channel the request came from; fallback posts go here
    pub channel_id: String,
    /// Formatted text that was sent to the backend
    pub text: String,
    pub session_id: String,
    /// Message the reply answered, if it still exists
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastExchange {
    /// Posted reply. None once the platform reports it deleted.
    pub response: Option<MessageHandle>,
    pub request: RequestContext,
    pub mentions: MentionPolicy,
    /// Whether the request and its reply are still the newest two turns of
    /// the remote session. Cleared once a retry deleted them.
    pub in_history: bool,
}

impl LastExchange {
    pub fn new(response: MessageHandle, request: RequestContext, mentions: MentionPolicy) -> Self {
        Self {
            response: Some(response),
            request,
            mentions,
            in_history: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// A new reply was generated and shown at this handle
    Retried(MessageHandle),
    /// The backend produced a blank reply; nothing was posted
    Blank,
    NothingToRetry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// Posted reply and remote turn were both updated
    Edited,
    /// Posted reply was gone; the new text went to the origin channel
    Resent(MessageHandle),
    /// Remote turn updated, but the fallback post failed
    RemoteOnly,
    NothingToEdit,
}

// =============================================================================
// Outbound Path
// =============================================================================

/// Everything needed to talk to both sides for one bot
#[derive(Clone)]
pub struct Outbound {
    pub client: RemoteClient,
    pub platform: SharedPlatform,
    pub style: ReplyStyle,
    pub retry_placeholder: String,
}

impl Outbound {
    /// Post `text`, replying to `reply_to` when given. If that message is
    /// gone, post plainly into the channel instead.
    pub async fn post(
        &self,
        channel_id: &str,
        text: &str,
        reply_to: Option<&str>,
        mentions: MentionPolicy,
    ) -> Result<MessageHandle, PlatformError> {
        let Some(reply_to) = reply_to else {
            return self
                .platform
                .send(channel_id, OutboundMessage::new(text, mentions))
                .await;
        };

        match self
            .platform
            .send(channel_id, OutboundMessage::reply(text, reply_to, mentions))
            .await
        {
            Err(PlatformError::NotFound(reason)) => {
                tracing::debug!(channel = %channel_id, reply_to, %reason, "Reply target gone, posting plainly");
                self.platform
                    .send(channel_id, OutboundMessage::new(text, mentions))
                    .await
            }
            result => result,
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Default)]
struct ExchangeState {
    entries: HashMap<String, LastExchange>,
    /// Unformatted text of the latest reply per surface
    raw: HashMap<String, String>,
}

/// Per-bot cache keyed by surface
#[derive(Default)]
pub struct ExchangeCache {
    state: Mutex<ExchangeState>,
}

impl ExchangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite the surface's entry
    pub fn record(&self, surface: &Surface, exchange: LastExchange) {
        self.lock().entries.insert(surface.key(), exchange);
    }

    pub fn get(&self, surface: &Surface) -> Option<LastExchange> {
        self.lock().entries.get(&surface.key()).cloned()
    }

    pub fn forget(&self, surface: &Surface) {
        self.lock().entries.remove(&surface.key());
    }

    pub fn raw_text(&self, surface: &Surface) -> Option<String> {
        self.lock().raw.get(&surface.key()).cloned()
    }

    pub fn set_raw(&self, surface: &Surface, raw: impl Into<String>) {
        self.lock().raw.insert(surface.key(), raw.into());
    }

    /// Null the handle of whichever entry points at `handle`. The entry
    /// itself stays so edit and retry keep working.
    pub fn response_deleted(&self, handle: &MessageHandle) -> bool {
        let mut state = self.lock();
        let mut found = false;
        for entry in state.entries.values_mut() {
            if entry.response.as_ref() == Some(handle) {
                entry.response = None;
                found = true;
            }
        }
        found
    }

    /// Regenerate the surface's last reply: drop the last human and AI
    /// turns remotely, resend the same text, and show the new reply where
    /// the old one was. On failure the posted reply gets its text back.
    pub async fn retry(
        &self,
        surface: &Surface,
        out: &Outbound,
    ) -> Result<RetryOutcome, DispatchError> {
        let Some(mut entry) = self.get(surface) else {
            return Ok(RetryOutcome::NothingToRetry);
        };

        if let Some(handle) = &entry.response {
            if let Err(e) = out.platform.edit(handle, &out.retry_placeholder).await {
                tracing::debug!(surface = %surface, error = %e, "Could not show retry placeholder");
            }
        }

        match self.regenerate(surface, &mut entry, out).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.restore(surface, &entry, out).await;
                Err(e)
            }
        }
    }

    async fn regenerate(
        &self,
        surface: &Surface,
        entry: &mut LastExchange,
        out: &Outbound,
    ) -> Result<RetryOutcome, DispatchError> {
        let session_id = entry.request.session_id.clone();

        // Skipped when a failed earlier retry already removed this pair
        if entry.in_history {
            out.client.delete_latest(&session_id, 2).await?;
            entry.in_history = false;
            self.record(surface, entry.clone());
        }

        let turn = out.client.send(&session_id, &entry.request.text).await?;
        entry.in_history = true;
        self.record(surface, entry.clone());

        let reply = out.style.render(&turn);
        if reply.is_blank() {
            tracing::info!(surface = %surface, "Retry produced a blank reply");
            return Ok(RetryOutcome::Blank);
        }
        self.set_raw(surface, reply.raw.clone());

        let handle = self.show(entry, &reply.text, out).await?;
        self.record(surface, entry.clone());
        Ok(RetryOutcome::Retried(handle))
    }

    /// Put the latest raw text back over the retry placeholder
    async fn restore(&self, surface: &Surface, entry: &LastExchange, out: &Outbound) {
        let (Some(handle), Some(raw)) = (&entry.response, self.raw_text(surface)) else {
            return;
        };
        if let Err(e) = out.platform.edit(handle, &out.style.shape(&raw)).await {
            tracing::debug!(surface = %surface, error = %e, "Could not restore reply after failed retry");
        }
    }

    /// Replace the surface's last reply with `new_text`, both in the posted
    /// message and in the remote session.
    pub async fn edit(
        &self,
        surface: &Surface,
        new_text: &str,
        out: &Outbound,
    ) -> Result<EditOutcome, DispatchError> {
        let Some(mut entry) = self.get(surface) else {
            return Ok(EditOutcome::NothingToEdit);
        };

        if entry.in_history {
            let edited = out
                .client
                .edit_last_ai_turn(&entry.request.session_id, new_text)
                .await?;
            if edited.is_none() {
                tracing::warn!(surface = %surface, "Session has no AI turn to edit");
            }
        } else {
            // The newest AI turn belongs to an older exchange
            tracing::warn!(surface = %surface, "Reply is no longer in the session, editing locally only");
        }
        self.set_raw(surface, new_text);

        let text = out.style.shape(new_text);
        if let Some(handle) = &entry.response {
            match out.platform.edit(handle, &text).await {
                Ok(()) => return Ok(EditOutcome::Edited),
                Err(PlatformError::NotFound(_)) => {
                    tracing::debug!(surface = %surface, "Reply vanished before edit, resending");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let request = &entry.request;
        match out
            .post(&request.channel_id, &text, None, entry.mentions)
            .await
        {
            Ok(handle) => {
                entry.response = Some(handle.clone());
                self.record(surface, entry);
                Ok(EditOutcome::Resent(handle))
            }
            Err(e) => {
                tracing::warn!(surface = %surface, error = %e, "Edited text could not be posted");
                Ok(EditOutcome::RemoteOnly)
            }
        }
    }

    /// Put `text` into the entry's reply, posting a new one if needed
    async fn show(
        &self,
        entry: &mut LastExchange,
        text: &str,
        out: &Outbound,
    ) -> Result<MessageHandle, DispatchError> {
        if let Some(handle) = &entry.response {
            match out.platform.edit(handle, text).await {
                Ok(()) => return Ok(handle.clone()),
                Err(PlatformError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let request = &entry.request;
        let handle = out
            .post(
                &request.channel_id,
                text,
                request.reply_to.as_deref(),
                entry.mentions,
            )
            .await?;
        entry.response = Some(handle.clone());
        Ok(handle)
    }
}
