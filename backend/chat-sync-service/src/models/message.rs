use super::{ChatId, MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Pointer into media storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub key: String,
    pub media_type: String,
}

/// A message as held in the chat log.
///
/// Only `content`/`edited_at` (edit) and `read_by` (union) change after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub media: Option<MediaRef>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Message {
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    /// Readers other than the sender
    pub fn read_count(&self) -> usize {
        self.read_by
            .iter()
            .filter(|reader| **reader != self.sender_id)
            .count()
    }

    /// Short text for chat list previews
    pub fn preview(&self) -> String {
        const MAX_PREVIEW_CHARS: usize = 100;
        match (&self.content, &self.media) {
            (Some(text), _) if !text.is_empty() => {
                if text.chars().count() > MAX_PREVIEW_CHARS {
                    let cut: String = text.chars().take(MAX_PREVIEW_CHARS).collect();
                    format!("{cut}…")
                } else {
                    text.clone()
                }
            }
            (_, Some(media)) => format!("[{}]", media.media_type),
            _ => String::new(),
        }
    }
}

/// Message as rendered for a particular viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub has_media: bool,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub read_by: BTreeSet<UserId>,
    pub read_count: usize,
    pub is_own: bool,
}

impl MessageView {
    pub fn render(message: &Message, viewer: UserId, media_url: impl Fn(&MediaRef) -> String) -> Self {
        Self {
            id: message.id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            has_media: message.has_media(),
            media_type: message.media.as_ref().map(|m| m.media_type.clone()),
            media_url: message.media.as_ref().map(media_url),
            timestamp: message.created_at,
            edited_at: message.edited_at,
            is_edited: message.edited_at.is_some(),
            read_by: message.read_by.clone(),
            read_count: message.read_count(),
            is_own: message.sender_id == viewer,
        }
    }
}
