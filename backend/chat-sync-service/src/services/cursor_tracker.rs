//! Per-(user, chat) delivery cursor and change-feed watermark.
//!
//! Both values only move forward. They live in memory; after a restart the
//! delivery cursor is seeded from each user's read watermark.

use crate::models::{ChatId, MessageId, UserId};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CursorState {
    delivered: MessageId,
    changes: u64,
}

#[derive(Default)]
pub struct CursorTracker {
    cursors: DashMap<(UserId, ChatId), CursorState>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last delivered message id, 0 when the user never synced this chat
    pub fn get_cursor(&self, user_id: UserId, chat_id: ChatId) -> MessageId {
        self.cursors
            .get(&(user_id, chat_id))
            .map(|state| state.delivered)
            .unwrap_or(0)
    }

    /// `max(current, message_id)`; returns the stored value
    pub fn advance_cursor(&self, user_id: UserId, chat_id: ChatId, message_id: MessageId) -> MessageId {
        let mut state = self.cursors.entry((user_id, chat_id)).or_default();
        state.delivered = state.delivered.max(message_id);
        state.delivered
    }

    pub fn get_change_watermark(&self, user_id: UserId, chat_id: ChatId) -> u64 {
        self.cursors
            .get(&(user_id, chat_id))
            .map(|state| state.changes)
            .unwrap_or(0)
    }

    pub fn advance_change_watermark(&self, user_id: UserId, chat_id: ChatId, seq: u64) -> u64 {
        let mut state = self.cursors.entry((user_id, chat_id)).or_default();
        state.changes = state.changes.max(seq);
        state.changes
    }

    pub fn forget_chat(&self, chat_id: ChatId) {
        self.cursors.retain(|(_, chat), _| *chat != chat_id);
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
