// ABOUTME: Dispatch queue and the single worker that owns every outbound backend call of a bot.
// ABOUTME: Deliveries are deduplicated while pending; failures follow the Disposition policy.

use crate::error::{DispatchError, Disposition, SessionError};
use crate::exchange::{EditOutcome, ExchangeCache, LastExchange, Outbound, RequestContext, RetryOutcome};
use crate::format::{format_diagnostic, MessageTemplate};
use crate::linger::{LingerController, LingerCurve, LingerScope, LingerWindow};
use crate::session::{Session, SessionRegistry};
use crate::traits::{AllowedMentions, IncomingMessage, MentionPolicy, MessageHandle, Surface, SurfaceKind};
use charbridge_backend::Rating;
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Queue Items and Jobs
// =============================================================================

/// One pending outbound request
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub source_message_id: String,
    pub session_id: String,
    /// Formatted text for the backend
    pub text: String,
    /// Message being answered; replies and diagnostics go to its channel
    pub origin: IncomingMessage,
}

impl QueueItem {
    pub fn new(origin: IncomingMessage, session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_message_id: origin.id.clone(),
            session_id: session_id.into(),
            text: text.into(),
            origin,
        }
    }

    /// Dedup key while the item is queued or being delivered
    pub fn key(&self) -> (String, String) {
        (self.source_message_id.clone(), self.session_id.clone())
    }
}

/// Result of a new chat request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChat {
    pub session_id: String,
    /// Greeting text when one was requested and produced
    pub greeting: Option<String>,
}

pub type Reply<T> = oneshot::Sender<Result<T, DispatchError>>;

/// Work for the dispatch worker. Everything that calls the backend is a job
/// so the worker's FIFO order covers it.
pub enum Job {
    Deliver(QueueItem),
    Resolve {
        surface: Surface,
        reply: oneshot::Sender<Result<Session, SessionError>>,
    },
    Retry {
        surface: Surface,
        reply: Reply<RetryOutcome>,
    },
    Edit {
        surface: Surface,
        text: String,
        reply: Reply<EditOutcome>,
    },
    Rate {
        surface: Surface,
        rating: Rating,
        reply: Reply<bool>,
    },
    DeleteTurns {
        surface: Surface,
        amount: usize,
        reply: Reply<usize>,
    },
    NewChat {
        surface: Surface,
        with_greeting: bool,
        reply: Reply<NewChat>,
    },
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Deliver(_) => "deliver",
            Job::Resolve { .. } => "resolve",
            Job::Retry { .. } => "retry",
            Job::Edit { .. } => "edit",
            Job::Rate { .. } => "rate",
            Job::DeleteTurns { .. } => "delete_turns",
            Job::NewChat { .. } => "new_chat",
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Same (message, session) pair is already queued or in progress
    Duplicate,
    /// The worker is gone
    Closed,
}

type PendingSet = Arc<Mutex<HashSet<(String, String)>>>;

/// Unbounded FIFO feeding one worker. Cloning gives another producer.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Job>,
    pending: PendingSet,
}

/// Consumer half, owned by the worker
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<Job>,
}

fn lock_pending(pending: &PendingSet) -> std::sync::MutexGuard<'_, HashSet<(String, String)>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

impl DispatchQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: PendingSet::default(),
            },
            JobReceiver { rx },
        )
    }

    /// Never blocks. The duplicate check and the send happen under one lock.
    pub fn enqueue(&self, item: QueueItem) -> EnqueueOutcome {
        let key = item.key();
        let mut pending = lock_pending(&self.pending);
        if pending.contains(&key) {
            tracing::debug!(message_id = %key.0, session_id = %key.1, "Dropping duplicate queue item");
            return EnqueueOutcome::Duplicate;
        }
        if self.tx.send(Job::Deliver(item)).is_err() {
            return EnqueueOutcome::Closed;
        }
        pending.insert(key);
        EnqueueOutcome::Queued
    }

    /// Release a delivery's dedup key once the worker is done with it
    pub fn complete(&self, key: &(String, String)) {
        lock_pending(&self.pending).remove(key);
    }

    pub fn submit(&self, job: Job) -> Result<(), DispatchError> {
        self.tx.send(job).map_err(|_| DispatchError::WorkerStopped)
    }

    /// Deliveries queued or in progress
    pub fn pending_len(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl JobReceiver {
    pub async fn recv(&mut self) -> Option<Job> {
        self.rx.recv().await
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Static per-bot delivery settings
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_attempts: u32,
    pub typing_delay_secs: [f64; 2],
    pub mention_author: bool,
    pub diagnostic_title: String,
    pub max_reply_chars: usize,
    /// None disables lingering
    pub lingering: Option<LingerCurve>,
}

/// Surfaces where bot authors are mentioned like humans. Mutable at runtime.
pub type RespondToBots = Arc<RwLock<HashSet<String>>>;

/// The single consumer of a bot's dispatch queue
pub struct Worker {
    pub bot_name: String,
    pub outbound: Outbound,
    pub registry: Arc<SessionRegistry>,
    pub exchanges: Arc<ExchangeCache>,
    pub queue: DispatchQueue,
    pub events: broadcast::Sender<IncomingMessage>,
    pub template: MessageTemplate,
    pub settings: WorkerSettings,
    pub respond_to_bots: RespondToBots,
    pub linger: LingerScope,
}

impl Worker {
    /// Process jobs in order until the queue closes or `shutdown` fires
    pub async fn run(self, mut jobs: JobReceiver, shutdown: CancellationToken) {
        tracing::info!(bot = %self.bot_name, "Dispatch worker started");

        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let name = job.name();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!(bot = %self.bot_name, job = name, "Abandoning job for shutdown");
                    break;
                }
                _ = self.handle(job) => {}
            }
        }

        self.linger.cancel_all();
        tracing::info!(
            bot = %self.bot_name,
            dropped = self.queue.pending_len(),
            "Dispatch worker stopped"
        );
    }

    async fn handle(&self, job: Job) {
        match job {
            Job::Deliver(item) => {
                let key = item.key();
                self.deliver(item).await;
                self.queue.complete(&key);
            }
            Job::Resolve { surface, reply } => {
                let _ = reply.send(self.registry.resolve(&surface).await);
            }
            Job::Retry { surface, reply } => {
                let result = self.exchanges.retry(&surface, &self.outbound).await;
                let _ = reply.send(result);
            }
            Job::Edit {
                surface,
                text,
                reply,
            } => {
                let result = self.exchanges.edit(&surface, &text, &self.outbound).await;
                let _ = reply.send(result);
            }
            Job::Rate {
                surface,
                rating,
                reply,
            } => {
                let _ = reply.send(self.rate(&surface, rating).await);
            }
            Job::DeleteTurns {
                surface,
                amount,
                reply,
            } => {
                let _ = reply.send(self.delete_turns(&surface, amount).await);
            }
            Job::NewChat {
                surface,
                with_greeting,
                reply,
            } => {
                let _ = reply.send(self.new_chat(&surface, with_greeting).await);
            }
        }
    }

    async fn deliver(&self, item: QueueItem) {
        let started = Instant::now();
        let channel_id = item.origin.channel_id.clone();
        let surface = item.origin.surface.clone();

        let [min_delay, max_delay] = self.settings.typing_delay_secs;
        let delay = {
            let mut rng = rand::thread_rng();
            rng.gen_range(min_delay..=max_delay)
        };
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;

        self.typing(&channel_id, true).await;
        let outcome = self.attempt_all(&item).await;
        self.typing(&channel_id, false).await;

        match outcome {
            Some(Ok(Some(_))) => {
                crate::metrics::record_dispatch("delivered");
                crate::metrics::record_delivery_latency(started.elapsed().as_secs_f64());
                tracing::debug!(bot = %self.bot_name, surface = %surface, "Reply delivered");
                self.start_lingering(&item);
            }
            Some(Ok(None)) => {
                crate::metrics::record_dispatch("empty");
                tracing::debug!(bot = %self.bot_name, surface = %surface, "Backend reply was blank");
            }
            Some(Err(e)) => self.abandon(&item, e).await,
            None => {
                crate::metrics::record_dispatch("auth_exhausted");
                tracing::warn!(
                    bot = %self.bot_name,
                    surface = %surface,
                    attempts = self.settings.max_attempts,
                    "Giving up after repeated authentication failures"
                );
            }
        }
    }

    /// Attempts until success or a terminal failure. None when every attempt
    /// hit expired auth.
    async fn attempt_all(
        &self,
        item: &QueueItem,
    ) -> Option<Result<Option<MessageHandle>, DispatchError>> {
        for attempt in 1..=self.settings.max_attempts {
            match self.attempt(item).await {
                Err(e) if e.disposition() == Disposition::RetryAuth => {
                    tracing::info!(bot = %self.bot_name, attempt, error = %e, "Backend auth failed");
                }
                result => return Some(result),
            }
        }
        None
    }

    /// One backend call and, if the reply isn't blank, one post
    async fn attempt(&self, item: &QueueItem) -> Result<Option<MessageHandle>, DispatchError> {
        let turn = self.outbound.client.send(&item.session_id, &item.text).await?;
        let reply = self.outbound.style.render(&turn);
        if reply.is_blank() {
            return Ok(None);
        }

        let origin = &item.origin;
        let mentions = self.mention_policy(origin);
        let handle = self
            .outbound
            .post(&origin.channel_id, &reply.text, Some(&origin.id), mentions)
            .await?;

        let request = RequestContext {
            surface: origin.surface.clone(),
            channel_id: origin.channel_id.clone(),
            text: item.text.clone(),
            session_id: item.session_id.clone(),
            reply_to: Some(origin.id.clone()),
        };
        self.exchanges.set_raw(&origin.surface, reply.raw);
        self.exchanges
            .record(&origin.surface, LastExchange::new(handle.clone(), request, mentions));
        Ok(Some(handle))
    }

    async fn abandon(&self, item: &QueueItem, error: DispatchError) {
        let surface = &item.origin.surface;
        match error.disposition() {
            Disposition::Rejected => {
                crate::metrics::record_dispatch("rejected");
                tracing::warn!(bot = %self.bot_name, surface = %surface, error = %error, "Backend rejected message");
            }
            Disposition::Forbidden => {
                crate::metrics::record_dispatch("forbidden");
                tracing::debug!(bot = %self.bot_name, surface = %surface, error = %error, "Not allowed to post, dropping");
            }
            Disposition::RetryAuth | Disposition::Report => {
                crate::metrics::record_dispatch("reported");
                tracing::error!(bot = %self.bot_name, surface = %surface, error = %error, "Failed to deliver message");
                let text = format_diagnostic(
                    &self.settings.diagnostic_title,
                    &error,
                    self.settings.max_reply_chars,
                );
                if let Err(e) = self
                    .outbound
                    .post(
                        &item.origin.channel_id,
                        &text,
                        Some(&item.origin.id),
                        MentionPolicy::default(),
                    )
                    .await
                {
                    tracing::warn!(bot = %self.bot_name, error = %e, "Could not post diagnostic");
                }
            }
        }
    }

    fn mention_policy(&self, origin: &IncomingMessage) -> MentionPolicy {
        let bot_allowed = !origin.author.is_bot
            || self
                .respond_to_bots
                .read()
                .map(|set| set.contains(&origin.surface.key()))
                .unwrap_or(false);
        let allowed = if origin.author.can_mention_everyone {
            AllowedMentions::all()
        } else {
            AllowedMentions::none()
        };
        MentionPolicy {
            mention_author: self.settings.mention_author
                && origin.surface.kind == SurfaceKind::Guild
                && bot_allowed,
            allowed,
        }
    }

    async fn typing(&self, channel_id: &str, typing: bool) {
        if let Err(e) = self.outbound.platform.set_typing(channel_id, typing).await {
            tracing::debug!(channel = %channel_id, typing, error = %e, "Typing indicator failed");
        }
    }

    fn start_lingering(&self, item: &QueueItem) {
        let Some(curve) = self.settings.lingering else {
            return;
        };
        if !item.origin.surface.is_multi_party() {
            return;
        }

        let window = LingerWindow::open(&item.origin, item.session_id.clone(), curve);
        let token = self.linger.arm(&window.channel_id, &window.author_id);
        let controller = LingerController::new(
            window,
            self.events.subscribe(),
            self.queue.clone(),
            self.template.clone(),
        );
        tokio::spawn(controller.run(token));
    }

    async fn rate(&self, surface: &Surface, rating: Rating) -> Result<bool, DispatchError> {
        let Some(session) = self.registry.lookup(surface).await? else {
            return Ok(false);
        };
        Ok(self
            .outbound
            .client
            .rate_latest(&session.session_id, rating)
            .await?)
    }

    async fn delete_turns(&self, surface: &Surface, amount: usize) -> Result<usize, DispatchError> {
        let Some(session) = self.registry.lookup(surface).await? else {
            return Ok(0);
        };
        Ok(self
            .outbound
            .client
            .delete_latest(&session.session_id, amount)
            .await?)
    }

    async fn new_chat(&self, surface: &Surface, with_greeting: bool) -> Result<NewChat, DispatchError> {
        let (session, greeting) = self.registry.new_session(surface, with_greeting).await?;
        self.exchanges.forget(surface);

        let greeting = greeting
            .map(|turn| self.outbound.style.render(&turn))
            .filter(|reply| !reply.is_blank())
            .map(|reply| {
                self.exchanges.set_raw(surface, reply.raw);
                reply.text
            });
        Ok(NewChat {
            session_id: session.session_id,
            greeting,
        })
    }
}
