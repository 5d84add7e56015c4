pub mod chat;
pub mod message;
pub mod sync;

pub use chat::{Chat, ChatKind, ChatSummary};
pub use message::{MediaRef, Message, MessageView};
pub use sync::{ReadReceiptUpdate, SyncResult, SyncView};

/// Process-wide chat identifier
pub type ChatId = u64;
/// Per-chat message identifier, starting at 1
pub type MessageId = u64;
pub type UserId = u64;
