//! Per-user chat list with a denormalized head (last message pointer) per chat.

use crate::error::{AppError, AppResult};
use crate::models::{Chat, ChatId, ChatKind, ChatSummary, Message, MessageId, UserId};
use crate::services::cursor_tracker::CursorTracker;
use crate::services::message_store::MessageStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatHead {
    pub last_message_id: MessageId,
    pub last_message_time: DateTime<Utc>,
    pub preview: String,
}

#[derive(Debug, Clone)]
struct IndexedChat {
    chat: Chat,
    head: Option<ChatHead>,
}

#[derive(Default)]
pub struct ChatIndex {
    memberships: DashMap<UserId, BTreeSet<ChatId>>,
    chats: DashMap<ChatId, IndexedChat>,
    /// Display names reported by the identity layer
    names: DashMap<UserId, String>,
}

impl ChatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_chat(&self, chat: &Chat) {
        for user_id in &chat.participant_ids {
            self.memberships
                .entry(*user_id)
                .or_default()
                .insert(chat.id);
        }
        self.chats.insert(
            chat.id,
            IndexedChat {
                chat: chat.clone(),
                head: None,
            },
        );
    }

    pub fn remove_chat(&self, chat: &Chat) {
        self.chats.remove(&chat.id);
        for user_id in &chat.participant_ids {
            if let Some(mut chats) = self.memberships.get_mut(user_id) {
                chats.remove(&chat.id);
            }
        }
        self.memberships.retain(|_, chats| !chats.is_empty());
    }

    /// Move the head forward; older or equal ids are ignored.
    pub fn record_message(&self, message: &Message) {
        if let Some(mut entry) = self.chats.get_mut(&message.chat_id) {
            let behind = entry
                .head
                .as_ref()
                .map_or(true, |head| head.last_message_id < message.id);
            if behind {
                entry.head = Some(ChatHead {
                    last_message_id: message.id,
                    last_message_time: message.created_at,
                    preview: message.preview(),
                });
            }
        }
    }

    /// Refresh the preview when the head message itself was edited.
    pub fn record_edit(&self, message: &Message) {
        if let Some(mut entry) = self.chats.get_mut(&message.chat_id) {
            if let Some(head) = entry.head.as_mut() {
                if head.last_message_id == message.id {
                    head.preview = message.preview();
                }
            }
        }
    }

    pub fn head(&self, chat_id: ChatId) -> Option<ChatHead> {
        self.chats.get(&chat_id).and_then(|entry| entry.head.clone())
    }

    pub fn chat_ids_for(&self, user_id: UserId) -> Vec<ChatId> {
        self.memberships
            .get(&user_id)
            .map(|chats| chats.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn remember_name(&self, user_id: UserId, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        if self.names.get(&user_id).map(|n| n.as_str() != name).unwrap_or(true) {
            self.names.insert(user_id, name.to_string());
        }
    }

    pub fn display_name(&self, user_id: UserId) -> String {
        self.names
            .get(&user_id)
            .map(|n| n.clone())
            .unwrap_or_else(|| format!("user {user_id}"))
    }

    /// Title of a chat as seen by `viewer`
    pub fn title(&self, chat: &Chat, viewer: UserId) -> String {
        match chat.kind {
            ChatKind::Group => chat
                .name
                .clone()
                .unwrap_or_else(|| format!("Group {}", chat.id)),
            ChatKind::Dialog => chat
                .peer_of(viewer)
                .map(|peer| self.display_name(peer))
                .unwrap_or_else(|| format!("Dialog {}", chat.id)),
        }
    }

    pub async fn unread_count(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        store: &MessageStore,
        cursors: &CursorTracker,
    ) -> AppResult<usize> {
        let cursor = cursors.get_cursor(user_id, chat_id);
        store
            .read_as(chat_id, user_id, |log| log.unread_for(user_id, cursor))
            .await
    }

    /// The user's chats, most recent activity first. Chats without messages
    /// come last; ties go to the higher chat id.
    pub async fn list_chats(
        &self,
        user_id: UserId,
        store: &MessageStore,
        cursors: &CursorTracker,
    ) -> AppResult<Vec<ChatSummary>> {
        let mut summaries = Vec::new();

        for chat_id in self.chat_ids_for(user_id) {
            let Some(indexed) = self.chats.get(&chat_id).map(|entry| entry.clone()) else {
                continue;
            };
            let unread_count = match self.unread_count(user_id, chat_id, store, cursors).await {
                Ok(count) => count,
                // Deleted while listing
                Err(AppError::ChatNotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            summaries.push(ChatSummary {
                chat_id,
                kind: indexed.chat.kind,
                name: self.title(&indexed.chat, user_id),
                last_message_id: indexed.head.as_ref().map(|h| h.last_message_id),
                last_message_preview: indexed.head.as_ref().map(|h| h.preview.clone()),
                last_message_time: indexed.head.as_ref().map(|h| h.last_message_time),
                unread_count,
            });
        }

        summaries.sort_by(|a, b| {
            b.last_message_time
                .cmp(&a.last_message_time)
                .then_with(|| b.chat_id.cmp(&a.chat_id))
        });
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn chat(id: ChatId, kind: ChatKind, members: &[UserId]) -> Chat {
        Chat {
            id,
            kind,
            name: None,
            owner_id: members[0],
            participant_ids: members.iter().copied().collect(),
            created_at: Utc::now(),
        }
    }

    fn message(chat_id: ChatId, id: MessageId, body: &str) -> Message {
        Message {
            id,
            chat_id,
            sender_id: 1,
            content: Some(body.to_string()),
            media: None,
            created_at: Utc::now(),
            edited_at: None,
            read_by: BTreeSet::new(),
            idempotency_key: None,
        }
    }

    #[test]
    fn test_head_never_moves_backward() {
        let index = ChatIndex::new();
        index.register_chat(&chat(1, ChatKind::Dialog, &[1, 2]));

        index.record_message(&message(1, 2, "second"));
        index.record_message(&message(1, 1, "first"));

        let head = index.head(1).unwrap();
        assert_eq!(head.last_message_id, 2);
        assert_eq!(head.preview, "second");
    }

    #[test]
    fn test_edit_refreshes_head_preview_only_for_head() {
        let index = ChatIndex::new();
        index.register_chat(&chat(1, ChatKind::Dialog, &[1, 2]));
        index.record_message(&message(1, 1, "one"));
        index.record_message(&message(1, 2, "two"));

        index.record_edit(&message(1, 1, "one!"));
        assert_eq!(index.head(1).unwrap().preview, "two");

        index.record_edit(&message(1, 2, "two!"));
        assert_eq!(index.head(1).unwrap().preview, "two!");
    }

    #[test]
    fn test_remove_chat_drops_memberships() {
        let index = ChatIndex::new();
        let dialog = chat(4, ChatKind::Dialog, &[1, 2]);
        index.register_chat(&dialog);
        assert_eq!(index.chat_ids_for(2), vec![4]);

        index.remove_chat(&dialog);
        assert!(index.chat_ids_for(2).is_empty());
        assert!(index.head(4).is_none());
    }

    #[test]
    fn test_dialog_title_uses_peer_name() {
        let index = ChatIndex::new();
        let dialog = chat(1, ChatKind::Dialog, &[1, 2]);
        assert_eq!(index.title(&dialog, 1), "user 2");

        index.remember_name(2, "Bea");
        assert_eq!(index.title(&dialog, 1), "Bea");

        let mut group = chat(2, ChatKind::Group, &[1, 2, 3]);
        assert_eq!(index.title(&group, 1), "Group 2");
        group.name = Some("Ops".into());
        assert_eq!(index.title(&group, 1), "Ops");
    }
}
