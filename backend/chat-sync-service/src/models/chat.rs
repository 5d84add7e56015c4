use super::{ChatId, MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    /// Two participants
    Dialog,
    Group,
}

impl fmt::Display for ChatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatKind::Dialog => write!(f, "dialog"),
            ChatKind::Group => write!(f, "group"),
        }
    }
}

/// Chat metadata. Participants are fixed at creation; membership
/// administration is owned by another service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    pub name: Option<String>,
    pub owner_id: UserId,
    pub participant_ids: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participant_ids.contains(&user_id)
    }

    /// The other side of a dialog
    pub fn peer_of(&self, user_id: UserId) -> Option<UserId> {
        if self.kind != ChatKind::Dialog {
            return None;
        }
        self.participant_ids
            .iter()
            .copied()
            .find(|id| *id != user_id)
    }

    /// Dialog participants normalised as (low, high)
    pub fn dialog_key(a: UserId, b: UserId) -> (UserId, UserId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

/// One row of a user's chat list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub kind: ChatKind,
    pub name: String,
    pub last_message_id: Option<MessageId>,
    pub last_message_preview: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_of_dialog() {
        let chat = Chat {
            id: 1,
            kind: ChatKind::Dialog,
            name: None,
            owner_id: 3,
            participant_ids: [3, 5].into_iter().collect(),
            created_at: Utc::now(),
        };
        assert_eq!(chat.peer_of(3), Some(5));
        assert_eq!(chat.peer_of(5), Some(3));
        assert!(chat.is_participant(5));
        assert!(!chat.is_participant(4));
    }

    #[test]
    fn test_dialog_key_is_order_independent() {
        assert_eq!(Chat::dialog_key(9, 2), Chat::dialog_key(2, 9));
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ChatKind::Group).unwrap(), "\"group\"");
        assert_eq!(ChatKind::Dialog.to_string(), "dialog");
    }
}
