// ABOUTME: Lingering controller - keeps a multi-party conversation going after a reply.
// ABOUTME: Follow-ups from the same author are captured under a decaying acceptance chance.

use crate::config::LingeringConfig;
use crate::dispatch::{DispatchQueue, EnqueueOutcome, QueueItem};
use crate::format::MessageTemplate;
use crate::traits::IncomingMessage;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Continuation chance must be strictly above this (0-100 scale)
pub const ACCEPT_THRESHOLD: f64 = 30.0;

// =============================================================================
// Acceptance Curve
// =============================================================================

/// Shape of the chance decay over the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dropoff {
    /// Straight line from base to zero
    Linear,
    /// Stays high, then falls off sharply near the timeout
    #[default]
    Plateau,
    /// Falls off quickly, then tails toward zero
    Slide,
}

impl FromStr for Dropoff {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "plateau" => Ok(Self::Plateau),
            "slide" => Ok(Self::Slide),
            _ => anyhow::bail!("Unknown dropoff '{}', expected linear, plateau or slide", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LingerCurve {
    pub base: f64,
    pub timeout_secs: f64,
    pub exponent: f64,
    pub dropoff: Dropoff,
}

impl LingerCurve {
    pub fn from_config(config: &LingeringConfig) -> Self {
        Self {
            base: config.chance,
            timeout_secs: config.timeout_secs,
            exponent: config.exponent_curve,
            dropoff: config.dropoff,
        }
    }

    /// Continuation chance `elapsed_secs` after the triggering message.
    /// Zero from the timeout on.
    pub fn chance(&self, elapsed_secs: f64) -> f64 {
        let t = elapsed_secs.max(0.0);
        if self.timeout_secs <= 0.0 || t >= self.timeout_secs {
            return 0.0;
        }
        let progress = t / self.timeout_secs;
        match self.dropoff {
            Dropoff::Linear => self.base - self.base / self.timeout_secs * t,
            Dropoff::Plateau => self.base * (1.0 - progress.powf(self.exponent)),
            Dropoff::Slide => self.base * (1.0 - progress).powf(self.exponent),
        }
    }

    pub fn accepts(&self, elapsed_secs: f64) -> bool {
        self.chance(elapsed_secs) > ACCEPT_THRESHOLD
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

// =============================================================================
// Window
// =============================================================================

/// Continuation state for one delivered exchange
#[derive(Debug, Clone)]
pub struct LingerWindow {
    pub author_id: String,
    pub channel_id: String,
    pub session_id: String,
    anchor: Instant,
    curve: LingerCurve,
}

impl LingerWindow {
    /// Window anchored at the moment `trigger` was posted
    pub fn open(trigger: &IncomingMessage, session_id: impl Into<String>, curve: LingerCurve) -> Self {
        let now = Instant::now();
        let age = (Utc::now() - trigger.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Self {
            author_id: trigger.author.id.clone(),
            channel_id: trigger.channel_id.clone(),
            session_id: session_id.into(),
            anchor: now.checked_sub(age).unwrap_or(now),
            curve,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.anchor.elapsed()
    }

    /// Time left before the window expires. None once the budget is used up.
    pub fn residual(&self) -> Option<Duration> {
        let residual = self.curve.timeout().checked_sub(self.elapsed())?;
        (!residual.is_zero()).then_some(residual)
    }

    /// Whether `msg` continues the conversation right now
    pub fn qualifies(&self, msg: &IncomingMessage) -> bool {
        msg.author.id == self.author_id
            && msg.channel_id == self.channel_id
            && !msg.content.trim().is_empty()
            && !msg.mentions_bot
            && self.curve.accepts(self.elapsed().as_secs_f64())
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Self-terminating task state for one window. Never fails outward.
pub struct LingerController {
    window: LingerWindow,
    events: broadcast::Receiver<IncomingMessage>,
    queue: DispatchQueue,
    template: MessageTemplate,
}

impl LingerController {
    pub fn new(
        window: LingerWindow,
        events: broadcast::Receiver<IncomingMessage>,
        queue: DispatchQueue,
        template: MessageTemplate,
    ) -> Self {
        Self {
            window,
            events,
            queue,
            template,
        }
    }

    /// Capture follow-ups until the window expires or `cancel` fires.
    /// Returns the number of messages enqueued.
    pub async fn run(mut self, cancel: CancellationToken) -> usize {
        let mut captured = 0;

        loop {
            let Some(residual) = self.window.residual() else {
                tracing::debug!(channel = %self.window.channel_id, captured, "Lingering window expired");
                break;
            };

            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(channel = %self.window.channel_id, "Lingering cancelled");
                    break;
                }
                next = tokio::time::timeout(residual, next_qualifying(&mut self.events, &self.window)) => next,
            };

            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(channel = %self.window.channel_id, captured, "Lingering window expired");
                    break;
                }
            };

            let text = self.template.render(msg.surface.kind, &msg.author, &msg.content);
            let item = QueueItem::new(msg, self.window.session_id.clone(), text);
            let message_id = item.source_message_id.clone();
            match self.queue.enqueue(item) {
                EnqueueOutcome::Queued => {
                    captured += 1;
                    crate::metrics::record_linger_capture();
                    tracing::info!(
                        channel = %self.window.channel_id,
                        message_id = %message_id,
                        elapsed_secs = self.window.elapsed().as_secs_f64(),
                        "Captured lingering follow-up"
                    );
                }
                EnqueueOutcome::Duplicate => {}
                EnqueueOutcome::Closed => break,
            }
        }

        cancel.cancel();
        captured
    }
}

async fn next_qualifying(
    events: &mut broadcast::Receiver<IncomingMessage>,
    window: &LingerWindow,
) -> Option<IncomingMessage> {
    loop {
        match events.recv().await {
            Ok(msg) if window.qualifies(&msg) => return Some(msg),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Lingering observer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

// =============================================================================
// Scope
// =============================================================================

struct ScopeState {
    token: CancellationToken,
    /// Latest window per (channel, author)
    windows: HashMap<(String, String), CancellationToken>,
}

/// Cancellation scope for a bot's lingering controllers. A newer window for
/// the same author and channel replaces the older one.
#[derive(Clone)]
pub struct LingerScope {
    parent: CancellationToken,
    state: Arc<Mutex<ScopeState>>,
}

impl LingerScope {
    pub fn new(parent: CancellationToken) -> Self {
        let token = parent.child_token();
        Self {
            parent,
            state: Arc::new(Mutex::new(ScopeState {
                token,
                windows: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Token for a new window, cancelling any live one for the same pair
    pub fn arm(&self, channel_id: &str, author_id: &str) -> CancellationToken {
        let mut state = self.lock();
        state.windows.retain(|_, t| !t.is_cancelled());
        let token = state.token.child_token();
        if let Some(previous) = state
            .windows
            .insert((channel_id.to_string(), author_id.to_string()), token.clone())
        {
            previous.cancel();
        }
        token
    }

    /// Cancel every outstanding controller. Later windows arm normally.
    pub fn cancel_all(&self) {
        let mut state = self.lock();
        state.token.cancel();
        state.token = self.parent.child_token();
        state.windows.clear();
    }

    /// Number of windows still running
    pub fn active(&self) -> usize {
        self.lock()
            .windows
            .values()
            .filter(|t| !t.is_cancelled())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ChatUser, Surface};

    fn plateau() -> LingerCurve {
        LingerCurve {
            base: 100.0,
            timeout_secs: 10.0,
            exponent: 2.25,
            dropoff: Dropoff::Plateau,
        }
    }

    #[test]
    fn test_plateau_curve_endpoints() {
        let curve = plateau();
        assert_eq!(curve.chance(0.0), 100.0);
        assert!(curve.chance(10.0) <= 0.0);
        assert!(curve.chance(25.0) <= 0.0);
    }

    #[test]
    fn test_plateau_accepts_at_five_rejects_near_timeout() {
        let curve = plateau();
        let at_five = curve.chance(5.0);
        assert!((at_five - 78.98).abs() < 0.05, "got {}", at_five);
        assert!(curve.accepts(5.0));
        assert!(curve.chance(9.5) <= ACCEPT_THRESHOLD);
        assert!(!curve.accepts(9.5));
    }

    #[test]
    fn test_all_curves_are_non_increasing() {
        for dropoff in [Dropoff::Linear, Dropoff::Plateau, Dropoff::Slide] {
            let curve = LingerCurve {
                dropoff,
                ..plateau()
            };
            let mut previous = curve.chance(0.0);
            assert_eq!(previous, 100.0);
            for step in 1..=120 {
                let chance = curve.chance(step as f64 * 0.1);
                assert!(chance <= previous, "{:?} increased at step {}", dropoff, step);
                previous = chance;
            }
            assert!(curve.chance(10.0) <= 0.0);
        }
    }

    #[test]
    fn test_linear_and_slide_midpoints() {
        let linear = LingerCurve {
            dropoff: Dropoff::Linear,
            ..plateau()
        };
        assert!((linear.chance(5.0) - 50.0).abs() < 1e-9);

        let slide = LingerCurve {
            dropoff: Dropoff::Slide,
            exponent: 2.0,
            ..plateau()
        };
        assert!((slide.chance(5.0) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_dropoff_parsing() {
        assert_eq!("Slide".parse::<Dropoff>().unwrap(), Dropoff::Slide);
        assert!("cliff".parse::<Dropoff>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_qualification() {
        let author = ChatUser::new("u1", "alice");
        let trigger = IncomingMessage::new("m1", Surface::guild("g"), "c1", author.clone(), "hi");
        let window = LingerWindow::open(&trigger, "s1", plateau());

        let follow_up = IncomingMessage::new("m2", Surface::guild("g"), "c1", author.clone(), "more");
        assert!(window.qualifies(&follow_up));

        let other_author = IncomingMessage::new("m3", Surface::guild("g"), "c1", ChatUser::new("u2", "bob"), "more");
        assert!(!window.qualifies(&other_author));

        let other_channel = IncomingMessage::new("m4", Surface::guild("g"), "c2", author.clone(), "more");
        assert!(!window.qualifies(&other_channel));

        let blank = IncomingMessage::new("m5", Surface::guild("g"), "c1", author.clone(), "   ");
        assert!(!window.qualifies(&blank));

        let mention = IncomingMessage::new("m6", Surface::guild("g"), "c1", author, "hey bot").mentioning_bot();
        assert!(!window.qualifies(&mention));
    }

    #[tokio::test(start_paused = true)]
    async fn test_residual_runs_out() {
        let trigger = IncomingMessage::new("m1", Surface::guild("g"), "c1", ChatUser::new("u1", "a"), "hi");
        let window = LingerWindow::open(&trigger, "s1", plateau());
        assert!(window.residual().is_some());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(window.residual().is_none());
    }

    #[tokio::test]
    async fn test_scope_replaces_and_cancels_windows() {
        let shutdown = CancellationToken::new();
        let scope = LingerScope::new(shutdown.clone());

        let first = scope.arm("c1", "u1");
        let second = scope.arm("c1", "u1");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        let other = scope.arm("c1", "u2");
        assert_eq!(scope.active(), 2);

        scope.cancel_all();
        assert!(second.is_cancelled());
        assert!(other.is_cancelled());

        let fresh = scope.arm("c1", "u1");
        assert!(!fresh.is_cancelled());

        shutdown.cancel();
        assert!(fresh.is_cancelled());
    }
}
