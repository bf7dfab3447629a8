// ABOUTME: Text shaping on both sides of the backend: inbound message templates and reply rendering
// ABOUTME: Also builds the diagnostic message posted when a delivery fails unexpectedly

use crate::config::{DispatchConfig, TemplateConfig};
use crate::traits::{ChatUser, SurfaceKind};
use charbridge_backend::Turn;

/// Placeholder templates applied to inbound text before it reaches the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    pub guild: String,
    pub private: String,
}

impl MessageTemplate {
    pub fn from_config(config: &TemplateConfig) -> Self {
        Self {
            guild: config.message_format.clone(),
            private: config.dm_message_format.clone(),
        }
    }

    /// Fill in `{name}`, `{display_name}`, `{global_name}` and `{message}`.
    /// The message is substituted last so placeholders typed by the author
    /// stay literal.
    pub fn render(&self, kind: SurfaceKind, author: &ChatUser, content: &str) -> String {
        let template = match kind {
            SurfaceKind::Guild => &self.guild,
            SurfaceKind::Private => &self.private,
        };
        template
            .replace("{display_name}", author.display_name())
            .replace("{global_name}", author.global_name())
            .replace("{name}", &author.name)
            .replace("{message}", content)
    }
}

impl Default for MessageTemplate {
    fn default() -> Self {
        Self::from_config(&TemplateConfig::default())
    }
}

/// A reply ready for the platform, plus the raw text kept for `raw`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedReply {
    pub raw: String,
    pub text: String,
}

impl RenderedReply {
    /// Whitespace-only replies are neither posted nor recorded
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyStyle {
    pub filtered_message: String,
    pub max_chars: usize,
}

impl ReplyStyle {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            filtered_message: config.filtered_message.clone(),
            max_chars: config.max_reply_chars,
        }
    }

    pub fn render(&self, turn: &Turn) -> RenderedReply {
        match turn.primary() {
            Some(candidate) if candidate.is_filtered => RenderedReply {
                raw: self.filtered_message.clone(),
                text: self.filtered_message.clone(),
            },
            Some(candidate) => RenderedReply {
                raw: candidate.text.clone(),
                text: self.shape(&candidate.text),
            },
            None => RenderedReply {
                raw: String::new(),
                text: String::new(),
            },
        }
    }

    /// Collapse blank-line pairs and cap the length
    pub fn shape(&self, text: &str) -> String {
        truncate_chars(&text.replace("\n\n", "\n"), self.max_chars)
    }
}

impl Default for ReplyStyle {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Diagnostic reply for an unclassified failure
pub fn format_diagnostic(title: &str, error: &dyn std::fmt::Display, max_chars: usize) -> String {
    let body = format!("**{}**\n```\n{}\n```", title, error);
    if body.chars().count() <= max_chars {
        return body;
    }
    // Keep the code fence closed when the error text is long
    let overhead = title.chars().count() + 13;
    let detail = truncate_chars(&error.to_string(), max_chars.saturating_sub(overhead));
    format!("**{}**\n```\n{}\n```", title, detail)
}
