// ABOUTME: Per-bot facade wiring registry, queue, worker, cache, and lingering together
// ABOUTME: The host feeds it classified platform events and operator actions

use crate::context::AppContext;
use crate::dispatch::{
    DispatchQueue, EnqueueOutcome, Job, NewChat, QueueItem, Reply, RespondToBots, Worker,
    WorkerSettings,
};
use crate::error::{DispatchError, SessionError};
use crate::exchange::{EditOutcome, ExchangeCache, Outbound, RetryOutcome};
use crate::format::{MessageTemplate, ReplyStyle};
use crate::linger::{LingerCurve, LingerScope};
use crate::session::{Session, SessionBinding, SessionRegistry, SessionStore};
use crate::traits::{IncomingMessage, MessageHandle, SharedPlatform, Surface};
use anyhow::Result;
use charbridge_backend::{ChatBackend, Rating, RemoteClient};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Buffered platform events per lingering observer
const EVENT_BUFFER: usize = 256;

/// What happened to a submitted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued { session_id: String },
    /// The same message is already waiting for this session
    Duplicate,
    /// The bot or the whole process is switched off
    Disabled,
    /// Own message or no text
    Ignored,
}

/// One bot identity: its own registry, queue, worker, and cache
pub struct Bridge {
    bot_name: String,
    ctx: AppContext,
    platform: SharedPlatform,
    registry: Arc<SessionRegistry>,
    exchanges: Arc<ExchangeCache>,
    queue: DispatchQueue,
    events: broadcast::Sender<IncomingMessage>,
    template: MessageTemplate,
    respond_to_bots: RespondToBots,
    linger: LingerScope,
    enabled: AtomicBool,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Build the bot's components and spawn its worker. Must run inside a
    /// tokio runtime.
    pub fn start(
        ctx: &AppContext,
        bot_name: &str,
        platform: SharedPlatform,
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let config = ctx.config();
        let bot = ctx
            .bot(bot_name)
            .ok_or_else(|| anyhow::anyhow!("No bot named '{}' in config", bot_name))?;

        let client = RemoteClient::new(backend, bot.character_id.clone())
            .with_backoff(config.backend.malformed_backoff());
        let registry = Arc::new(SessionRegistry::new(
            client.clone(),
            store,
            bot.greeting_on_new_session,
        ));
        let exchanges = Arc::new(ExchangeCache::new());
        let (queue, jobs) = DispatchQueue::new();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let template = MessageTemplate::from_config(&config.templates);
        let respond_to_bots: RespondToBots =
            Arc::new(RwLock::new(bot.respond_to_bots.iter().cloned().collect()));
        let shutdown = ctx.shutdown_token().child_token();
        let linger = LingerScope::new(shutdown.clone());

        let settings = WorkerSettings {
            max_attempts: config.dispatch.max_attempts,
            typing_delay_secs: config.dispatch.typing_delay_secs,
            mention_author: config.dispatch.mention_author,
            diagnostic_title: config.dispatch.diagnostic_title.clone(),
            max_reply_chars: config.dispatch.max_reply_chars,
            lingering: config
                .lingering
                .enabled
                .then(|| LingerCurve::from_config(&config.lingering)),
        };

        let worker = Worker {
            bot_name: bot.name.clone(),
            outbound: Outbound {
                client,
                platform: platform.clone(),
                style: ReplyStyle::from_config(&config.dispatch),
                retry_placeholder: config.dispatch.retry_placeholder.clone(),
            },
            registry: registry.clone(),
            exchanges: exchanges.clone(),
            queue: queue.clone(),
            events: events.clone(),
            template: template.clone(),
            settings,
            respond_to_bots: respond_to_bots.clone(),
            linger: linger.clone(),
        };
        let handle = tokio::spawn(worker.run(jobs, shutdown.clone()));

        tracing::info!(bot = %bot.name, character = %bot.character_id, "Bridge started");

        Ok(Self {
            bot_name: bot.name.clone(),
            ctx: ctx.clone(),
            platform,
            registry,
            exchanges,
            queue,
            events,
            template,
            respond_to_bots,
            linger,
            enabled: AtomicBool::new(true),
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.bot_name
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Show a platform message to lingering observers. Call for every
    /// message the bot can see, whether or not it is also submitted.
    pub fn observe(&self, msg: &IncomingMessage) {
        if self.platform.is_self(&msg.author.id) {
            return;
        }
        // No receivers just means no window is open
        let _ = self.events.send(msg.clone());
    }

    /// Queue a message the host decided the bot should answer
    pub async fn submit(&self, msg: IncomingMessage) -> Result<SubmitOutcome, DispatchError> {
        if !self.is_active() {
            return Ok(SubmitOutcome::Disabled);
        }
        if self.platform.is_self(&msg.author.id) || msg.content.trim().is_empty() {
            return Ok(SubmitOutcome::Ignored);
        }

        let session = self.session_for(&msg.surface).await?;
        let text = self
            .template
            .render(msg.surface.kind, &msg.author, &msg.content);
        let item = QueueItem::new(msg, session.session_id.clone(), text);

        match self.queue.enqueue(item) {
            EnqueueOutcome::Queued => Ok(SubmitOutcome::Queued {
                session_id: session.session_id,
            }),
            EnqueueOutcome::Duplicate => Ok(SubmitOutcome::Duplicate),
            EnqueueOutcome::Closed => Err(DispatchError::WorkerStopped),
        }
    }

    /// Platform reported a message deleted. Returns true if it was a
    /// recorded reply.
    pub fn message_deleted(&self, handle: &MessageHandle) -> bool {
        self.exchanges.response_deleted(handle)
    }

    /// Bound session, created through the worker on first use
    async fn session_for(&self, surface: &Surface) -> Result<Session, DispatchError> {
        if let Some(session) = self.registry.lookup(surface).await? {
            return Ok(session);
        }
        let (reply, rx) = oneshot::channel();
        self.queue.submit(Job::Resolve {
            surface: surface.clone(),
            reply,
        })?;
        let session = rx.await.map_err(|_| DispatchError::WorkerStopped)??;
        Ok(session)
    }

    // =========================================================================
    // Operator Actions
    // =========================================================================

    async fn request<T>(&self, job: impl FnOnce(Reply<T>) -> Job) -> Result<T, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.queue.submit(job(reply))?;
        rx.await.map_err(|_| DispatchError::WorkerStopped)?
    }

    /// Regenerate the surface's last reply
    pub async fn retry(&self, surface: &Surface) -> Result<RetryOutcome, DispatchError> {
        let surface = surface.clone();
        self.request(|reply| Job::Retry { surface, reply }).await
    }

    /// Rewrite the surface's last reply
    pub async fn edit(&self, surface: &Surface, text: &str) -> Result<EditOutcome, DispatchError> {
        let surface = surface.clone();
        let text = text.to_string();
        self.request(|reply| Job::Edit {
            surface,
            text,
            reply,
        })
        .await
    }

    /// Rate the newest turn. False when the surface has no session or turns.
    pub async fn rate(&self, surface: &Surface, rating: Rating) -> Result<bool, DispatchError> {
        let surface = surface.clone();
        self.request(|reply| Job::Rate {
            surface,
            rating,
            reply,
        })
        .await
    }

    /// Remove the newest `amount` turns from the surface's session
    pub async fn delete_turns(&self, surface: &Surface, amount: usize) -> Result<usize, DispatchError> {
        let surface = surface.clone();
        self.request(|reply| Job::DeleteTurns {
            surface,
            amount,
            reply,
        })
        .await
    }

    /// Start a fresh session for the surface
    pub async fn new_chat(&self, surface: &Surface, with_greeting: bool) -> Result<NewChat, DispatchError> {
        let surface = surface.clone();
        self.request(|reply| Job::NewChat {
            surface,
            with_greeting,
            reply,
        })
        .await
    }

    /// Bind the surface to an existing session
    pub async fn override_session(
        &self,
        surface: &Surface,
        session_id: &str,
    ) -> Result<Session, SessionError> {
        let session = self.registry.override_session(surface, session_id).await?;
        self.exchanges.forget(surface);
        Ok(session)
    }

    pub async fn current_session(&self, surface: &Surface) -> Result<Option<Session>, SessionError> {
        self.registry.lookup(surface).await
    }

    pub fn sessions(&self) -> Result<Vec<SessionBinding>> {
        self.registry.list()
    }

    /// Unformatted text of the surface's last reply
    pub fn raw_text(&self, surface: &Surface) -> Option<String> {
        self.exchanges.raw_text(surface)
    }

    /// Mention bot authors in this surface as if they were people
    pub fn set_respond_to_bots(&self, surface: &Surface, respond: bool) {
        let mut set = match self.respond_to_bots.write() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        if respond {
            set.insert(surface.key());
        } else {
            set.remove(&surface.key());
        }
    }

    pub fn responds_to_bots(&self) -> HashSet<String> {
        self.respond_to_bots
            .read()
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!(bot = %self.bot_name, "Bot enabled");
    }

    /// Stop accepting submissions and end any lingering windows
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.linger.cancel_all();
        tracing::info!(bot = %self.bot_name, "Bot disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enabled here and globally
    pub fn is_active(&self) -> bool {
        self.ctx.is_enabled() && self.is_enabled()
    }

    /// Deliveries queued or in progress
    pub fn pending(&self) -> usize {
        self.queue.pending_len()
    }

    pub fn lingering_windows(&self) -> usize {
        self.linger.active()
    }

    /// Stop the worker and every lingering window, then wait for the worker
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(bot = %self.bot_name, error = %e, "Dispatch worker panicked");
            }
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
