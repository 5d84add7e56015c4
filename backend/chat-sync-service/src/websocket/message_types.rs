use crate::models::{ChatId, MessageId, SyncView};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCursor {
    pub chat_id: ChatId,
    pub cursor: MessageId,
}

/// Inbound WebSocket events from client to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsInboundEvent {
    /// Start receiving deltas for these chats. `cursors` overrides the
    /// stored cursor per chat (e.g. what the client already has on screen).
    Subscribe {
        chat_ids: Vec<ChatId>,
        #[serde(default)]
        cursors: Vec<ChatCursor>,
    },
    Unsubscribe {
        chat_ids: Vec<ChatId>,
    },
    /// Client has durably received everything up to `cursor`
    Ack {
        chat_id: ChatId,
        cursor: MessageId,
    },
    Ping,
}

/// Outbound WebSocket events from server to client
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutboundEvent {
    Subscribed {
        chat_ids: Vec<ChatId>,
        rejected: Vec<ChatId>,
    },
    Delta(SyncView),
    ChatDeleted {
        chat_id: ChatId,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}

impl WsOutboundEvent {
    pub fn to_frame(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode websocket frame");
                None
            }
        }
    }
}
