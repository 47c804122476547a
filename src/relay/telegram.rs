//! Outgoing messages, delivered through teloxide.

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::warn;

/// Telegram rejects messages over 4096 characters; stay below it in bytes.
const MAX_MESSAGE_BYTES: usize = 4000;

/// Delivers text to a user's private chat.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), String>;
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Outbox for TelegramClient {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), String> {
        // Private chats share the user's id.
        let chat_id = ChatId(user_id);
        for chunk in split_message(text, MAX_MESSAGE_BYTES) {
            // Plain text: model output is not valid HTML or Markdown in general.
            self.bot.send_message(chat_id, chunk).await.map_err(|e| {
                let msg = format!("Failed to send to {user_id}: {e}");
                warn!("{}", msg);
                msg
            })?;
        }
        Ok(())
    }
}

/// Split text into pieces of at most `max_len` bytes, preferring newline and
/// then space boundaries.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut boundary = max_len;
        while boundary > 0 && !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }

        // Drop the separator itself; whitespace after it belongs to the next chunk.
        let head = &remaining[..boundary];
        let (split_at, skip) = match head.rfind('\n').or_else(|| head.rfind(' ')) {
            Some(pos) if pos > 0 => (pos, 1),
            _ => (boundary, 0),
        };

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at + skip..];
    }

    chunks
}
