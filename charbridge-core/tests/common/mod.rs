// ABOUTME: Shared fixtures for charbridge-core integration tests
// ABOUTME: MockPlatform records posts, edits and typing; helpers build configs and bridges
#![allow(dead_code)]

use async_trait::async_trait;
use charbridge_backend::backends::mock::MockBackend;
use charbridge_core::config::{BotConfig, Config};
use charbridge_core::session::{MemorySessionStore, SessionStore};
use charbridge_core::{
    AppContext, Bridge, ChatPlatform, ChatUser, IncomingMessage, MessageHandle, OutboundMessage,
    PlatformError, Surface,
};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BOT_ID: &str = "bot-1";

/// A message the mock accepted
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub handle: MessageHandle,
    pub message: OutboundMessage,
}

#[derive(Default)]
struct PlatformState {
    next_id: u64,
    send_attempts: usize,
    sent: Vec<SentMessage>,
    edits: Vec<(MessageHandle, String)>,
    deleted: HashSet<String>,
    typing: Vec<(String, bool)>,
    send_failures: VecDeque<PlatformError>,
}

/// Chat platform double that keeps everything in memory
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<PlatformState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_send(&self, error: PlatformError) {
        self.state.lock().unwrap().send_failures.push_back(error);
    }

    /// Make later edits of this message fail with NotFound
    pub fn mark_deleted(&self, handle: &MessageHandle) {
        self.state
            .lock()
            .unwrap()
            .deleted
            .insert(handle.message_id.clone());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.message.text).collect()
    }

    pub fn send_attempts(&self) -> usize {
        self.state.lock().unwrap().send_attempts
    }

    pub fn edits(&self) -> Vec<(MessageHandle, String)> {
        self.state.lock().unwrap().edits.clone()
    }

    pub fn typing(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().typing.clone()
    }

    /// Wait (in tokio time) until at least `count` messages were posted
    pub async fn wait_for_sent(&self, count: usize) -> Vec<SentMessage> {
        wait_until(|| self.sent().len() >= count).await;
        self.sent()
    }
}

#[async_trait]
impl ChatPlatform for MockPlatform {
    fn bot_user_id(&self) -> &str {
        BOT_ID
    }

    async fn send(
        &self,
        channel_id: &str,
        message: OutboundMessage,
    ) -> Result<MessageHandle, PlatformError> {
        let mut state = self.state.lock().unwrap();
        state.send_attempts += 1;
        if let Some(e) = state.send_failures.pop_front() {
            return Err(e);
        }
        state.next_id += 1;
        let handle = MessageHandle {
            channel_id: channel_id.to_string(),
            message_id: format!("reply-{}", state.next_id),
        };
        state.sent.push(SentMessage {
            handle: handle.clone(),
            message,
        });
        Ok(handle)
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.deleted.contains(&handle.message_id) {
            return Err(PlatformError::NotFound(handle.message_id.clone()));
        }
        state.edits.push((handle.clone(), text.to_string()));
        Ok(())
    }

    async fn delete(&self, handle: &MessageHandle) -> Result<(), PlatformError> {
        self.state
            .lock()
            .unwrap()
            .deleted
            .insert(handle.message_id.clone());
        Ok(())
    }

    async fn set_typing(&self, channel_id: &str, typing: bool) -> Result<(), PlatformError> {
        self.state
            .lock()
            .unwrap()
            .typing
            .push((channel_id.to_string(), typing));
        Ok(())
    }
}

/// Poll `check` in tokio time, panicking after five virtual minutes
pub async fn wait_until(check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(300), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met in time");
}

/// Let queued work settle without expecting anything specific
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

pub fn test_config() -> Config {
    let mut config = Config::new(vec![BotConfig::new("alfred", "char-1")]);
    config.dispatch.typing_delay_secs = [0.0, 0.0];
    config
}

pub struct Harness {
    pub ctx: AppContext,
    pub platform: Arc<MockPlatform>,
    pub backend: Arc<MockBackend>,
    pub bridge: Bridge,
}

pub fn start(config: Config) -> Harness {
    start_with(config, Arc::new(MockBackend::new()), Arc::new(MemorySessionStore::new()))
}

pub fn start_with(config: Config, backend: Arc<MockBackend>, store: Arc<dyn SessionStore>) -> Harness {
    let ctx = AppContext::new(config);
    let platform = Arc::new(MockPlatform::new());
    let bridge = Bridge::start(&ctx, "alfred", platform.clone(), backend.clone(), store)
        .expect("bridge starts");
    Harness {
        ctx,
        platform,
        backend,
        bridge,
    }
}

pub fn alice() -> ChatUser {
    ChatUser::new("u-alice", "alice")
}

pub fn guild_msg(id: &str, author: ChatUser, content: &str) -> IncomingMessage {
    IncomingMessage::new(id, Surface::guild("g1"), "c1", author, content)
}

pub fn dm_msg(id: &str, author: ChatUser, content: &str) -> IncomingMessage {
    IncomingMessage::new(id, Surface::private("dm-1"), "dm-1", author, content)
}
