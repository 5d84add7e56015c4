pub mod chat_index;
pub mod cursor_tracker;
pub mod journal;
pub mod media;
pub mod message_store;
pub mod sync_engine;

// Re-export key types for convenience
pub use chat_index::ChatIndex;
pub use cursor_tracker::CursorTracker;
pub use journal::{FileJournal, Journal, JournalRecord, MemoryJournal};
pub use media::{LocalMediaStore, MediaStore};
pub use message_store::{MessageStore, NewMessage};
pub use sync_engine::SyncEngine;
