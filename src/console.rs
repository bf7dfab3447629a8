// ABOUTME: Offline console that runs one bot against the in-memory backend from stdin
// ABOUTME: Lines become chat messages; slash commands drive retry, edit, rate and new chat

use anyhow::{Context, Result};
use async_trait::async_trait;
use charbridge_backend::backends::mock::MockBackend;
use charbridge_core::config::Config;
use charbridge_core::exchange::{EditOutcome, RetryOutcome};
use charbridge_core::session::MemorySessionStore;
use charbridge_core::{
    AppContext, Bridge, ChatPlatform, ChatUser, IncomingMessage, MessageHandle, OutboundMessage,
    PlatformError, Rating, SubmitOutcome, Surface,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};

const CONSOLE_BOT_ID: &str = "console-bot";
const CONSOLE_CHANNEL: &str = "console";

// =============================================================================
// Console Platform
// =============================================================================

/// Platform gateway that prints to stdout and keeps a transcript
#[derive(Default)]
pub struct ConsolePlatform {
    next_id: AtomicU64,
    transcript: Mutex<Vec<String>>,
}

impl ConsolePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self) -> Vec<String> {
        match self.transcript.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn emit(&self, line: String) {
        println!("{}", line);
        match self.transcript.lock() {
            Ok(mut lines) => lines.push(line),
            Err(poisoned) => poisoned.into_inner().push(line),
        }
    }
}

#[async_trait]
impl ChatPlatform for ConsolePlatform {
    fn bot_user_id(&self) -> &str {
        CONSOLE_BOT_ID
    }

    async fn send(
        &self,
        channel_id: &str,
        message: OutboundMessage,
    ) -> Result<MessageHandle, PlatformError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let prefix = match &message.reply_to {
            Some(target) => format!("#{} (re {})", id, target),
            None => format!("#{}", id),
        };
        self.emit(format!("{} {}", prefix, message.text));
        Ok(MessageHandle {
            channel_id: channel_id.to_string(),
            message_id: id.to_string(),
        })
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), PlatformError> {
        self.emit(format!("#{} (edited) {}", handle.message_id, text));
        Ok(())
    }

    async fn delete(&self, handle: &MessageHandle) -> Result<(), PlatformError> {
        self.emit(format!("#{} (deleted)", handle.message_id));
        Ok(())
    }
}

// =============================================================================
// Commands
// =============================================================================

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Plain chat; `addressed` means it is submitted, not just observed
    Say { text: String, addressed: bool },
    Retry,
    Edit(String),
    Rate(Rating),
    New,
    Raw,
    Delete(usize),
    Quit,
    Help,
}

impl ConsoleCommand {
    /// Parse a line. In a private console every line is addressed to the bot;
    /// otherwise only lines starting with `@bot` are.
    pub fn parse(line: &str, private: bool) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let Some(rest) = line.strip_prefix('/') else {
            if let Some(text) = line.strip_prefix("@bot") {
                return Ok(Some(Self::Say {
                    text: text.trim().to_string(),
                    addressed: true,
                }));
            }
            return Ok(Some(Self::Say {
                text: line.to_string(),
                addressed: private,
            }));
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        let command = match name {
            "retry" => Self::Retry,
            "edit" if !arg.is_empty() => Self::Edit(arg.to_string()),
            "edit" => anyhow::bail!("usage: /edit <text>"),
            "rate" => Self::Rate(arg.parse()?),
            "new" => Self::New,
            "raw" => Self::Raw,
            "delete" => Self::Delete(
                arg.parse()
                    .with_context(|| format!("usage: /delete <count>, got '{}'", arg))?,
            ),
            "quit" | "exit" => Self::Quit,
            "help" => Self::Help,
            other => anyhow::bail!("Unknown command: /{}", other),
        };
        Ok(Some(command))
    }
}

const HELP: &str = "\
@bot <text>      address the bot (every line in --private mode)
/retry           regenerate the last reply
/edit <text>     rewrite the last reply
/rate <rating>   terrible, bad, good or fantastic
/new             start a fresh session
/raw             show the unformatted last reply
/delete <n>      remove the newest n turns
/quit            leave";

// =============================================================================
// Session Loop
// =============================================================================

/// Run `bot_name` against the in-memory backend until stdin closes or /quit
pub async fn run(config: Config, bot_name: &str, private: bool) -> Result<()> {
    let ctx = AppContext::new(config);
    let platform = Arc::new(ConsolePlatform::new());
    let bridge = Bridge::start(
        &ctx,
        bot_name,
        platform.clone(),
        Arc::new(MockBackend::new()),
        Arc::new(MemorySessionStore::new()),
    )?;

    let surface = if private {
        Surface::private(CONSOLE_CHANNEL)
    } else {
        Surface::guild(CONSOLE_CHANNEL)
    };
    let user = ChatUser::new("console-user", whoami());

    println!("Talking to {} ({}). /help for commands.", bridge.name(), surface);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let command = match ConsoleCommand::parse(&line, private) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("! {}", e);
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        if let Err(e) = execute(&bridge, &surface, &user, command).await {
            println!("! {}", e);
        }
    }

    bridge.shutdown().await;
    Ok(())
}

async fn execute(
    bridge: &Bridge,
    surface: &Surface,
    user: &ChatUser,
    command: ConsoleCommand,
) -> Result<()> {
    match command {
        ConsoleCommand::Say { text, addressed } => {
            let mut msg = IncomingMessage::new(
                uuid::Uuid::new_v4().to_string(),
                surface.clone(),
                CONSOLE_CHANNEL,
                user.clone(),
                text,
            );
            bridge.observe(&msg);
            if addressed {
                msg = msg.mentioning_bot();
                match bridge.submit(msg).await? {
                    SubmitOutcome::Queued { .. } | SubmitOutcome::Ignored => {}
                    SubmitOutcome::Duplicate => println!("(already queued)"),
                    SubmitOutcome::Disabled => println!("(bot is disabled)"),
                }
            }
        }
        ConsoleCommand::Retry => match bridge.retry(surface).await? {
            RetryOutcome::Retried(_) => {}
            RetryOutcome::Blank => println!("(retry produced nothing)"),
            RetryOutcome::NothingToRetry => println!("(nothing to retry)"),
        },
        ConsoleCommand::Edit(text) => match bridge.edit(surface, &text).await? {
            EditOutcome::Edited | EditOutcome::Resent(_) => {}
            EditOutcome::RemoteOnly => println!("(edited remotely, could not repost)"),
            EditOutcome::NothingToEdit => println!("(nothing to edit)"),
        },
        ConsoleCommand::Rate(rating) => {
            if !bridge.rate(surface, rating).await? {
                println!("(nothing to rate)");
            }
        }
        ConsoleCommand::New => {
            let chat = bridge.new_chat(surface, true).await?;
            println!("(new session {})", chat.session_id);
            if let Some(greeting) = chat.greeting {
                println!("{}", greeting);
            }
        }
        ConsoleCommand::Raw => match bridge.raw_text(surface) {
            Some(raw) => println!("{}", raw),
            None => println!("(no reply yet)"),
        },
        ConsoleCommand::Delete(amount) => {
            let removed = bridge.delete_turns(surface, amount).await?;
            println!("(removed {} turn(s))", removed);
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}
