use super::{ChatId, MediaRef, Message, MessageId, MessageView, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Receipt state change for a message the syncing user authored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceiptUpdate {
    pub message_id: MessageId,
    pub read_by: BTreeSet<UserId>,
}

/// Everything a client needs to move from its cursor to the current state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub chat_id: ChatId,
    /// Messages with id above the request cursor, ascending
    pub messages: Vec<Message>,
    /// Ordered by message id
    pub read_receipt_updates: Vec<ReadReceiptUpdate>,
    /// Already-delivered messages whose content changed
    pub edited_messages: Vec<Message>,
    /// Authoritative cursor for the next request
    pub new_cursor: MessageId,
    /// Change-feed position covered by this result
    pub change_cursor: u64,
    /// A full page was returned; request again from `new_cursor`
    pub has_more: bool,
    /// The request cursor was ahead of the chat and the result starts from 0
    pub resynced: bool,
}

impl SyncResult {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.read_receipt_updates.is_empty()
            && self.edited_messages.is_empty()
    }
}

/// [`SyncResult`] rendered for one viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncView {
    pub chat_id: ChatId,
    pub messages: Vec<MessageView>,
    pub read_receipt_updates: Vec<ReadReceiptUpdate>,
    pub edited_messages: Vec<MessageView>,
    pub new_cursor: MessageId,
    pub change_cursor: u64,
    pub has_more: bool,
    pub resynced: bool,
}

impl SyncView {
    pub fn render(result: SyncResult, viewer: UserId, media_url: impl Fn(&MediaRef) -> String) -> Self {
        let render = |m: &Message| MessageView::render(m, viewer, &media_url);
        Self {
            chat_id: result.chat_id,
            messages: result.messages.iter().map(render).collect(),
            read_receipt_updates: result.read_receipt_updates,
            edited_messages: result.edited_messages.iter().map(render).collect(),
            new_cursor: result.new_cursor,
            change_cursor: result.change_cursor,
            has_more: result.has_more,
            resynced: result.resynced,
        }
    }
}
