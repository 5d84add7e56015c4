//! # Journal
//!
//! Append-only record of every state change applied by [`MessageStore`].
//! A record is written before the change becomes visible in memory, so a
//! restart that replays the journal never loses an acknowledged write.
//!
//! Two backends exist:
//! - [`MemoryJournal`]: no durability, used when `JOURNAL_PATH` is unset and in tests
//! - [`FileJournal`]: JSON lines appended to a single file
//!
//! [`MessageStore`]: crate::services::message_store::MessageStore

use crate::models::{Chat, ChatId, Message, MessageId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalRecord {
    ChatCreated {
        chat: Chat,
    },
    ChatDeleted {
        chat_id: ChatId,
    },
    MessageAppended {
        message: Message,
    },
    MessageEdited {
        chat_id: ChatId,
        message_id: MessageId,
        content: String,
        edited_at: DateTime<Utc>,
    },
    ReadMarked {
        chat_id: ChatId,
        user_id: UserId,
        up_to: MessageId,
    },
}

impl JournalRecord {
    pub fn chat_id(&self) -> ChatId {
        match self {
            JournalRecord::ChatCreated { chat } => chat.id,
            JournalRecord::ChatDeleted { chat_id }
            | JournalRecord::MessageEdited { chat_id, .. }
            | JournalRecord::ReadMarked { chat_id, .. } => *chat_id,
            JournalRecord::MessageAppended { message } => message.chat_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JournalRecord::ChatCreated { .. } => "chat_created",
            JournalRecord::ChatDeleted { .. } => "chat_deleted",
            JournalRecord::MessageAppended { .. } => "message_appended",
            JournalRecord::MessageEdited { .. } => "message_edited",
            JournalRecord::ReadMarked { .. } => "read_marked",
        }
    }
}

#[async_trait]
pub trait Journal: Send + Sync {
    /// Durably append one record
    async fn write(&self, record: &JournalRecord) -> io::Result<()>;

    /// Every readable record, oldest first
    async fn load(&self) -> io::Result<Vec<JournalRecord>>;
}

/// Journal that keeps nothing
#[derive(Debug, Default)]
pub struct MemoryJournal;

#[async_trait]
impl Journal for MemoryJournal {
    async fn write(&self, _record: &JournalRecord) -> io::Result<()> {
        Ok(())
    }

    async fn load(&self) -> io::Result<Vec<JournalRecord>> {
        Ok(Vec::new())
    }
}

pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
    /// Set when a write failed part way; the next write starts on a fresh line
    torn: AtomicBool,
}

impl FileJournal {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let torn = ends_mid_line(&path).await?;
        if torn {
            tracing::warn!(path = %path.display(), "journal ends mid-record, next write starts a new line");
        }
        tracing::info!(path = %path.display(), "journal opened");

        Ok(Self {
            path,
            file: Mutex::new(file),
            torn: AtomicBool::new(torn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse a journal file without opening it for writing.
    pub async fn read_records(path: impl AsRef<Path>) -> io::Result<Vec<JournalRecord>> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "skipping unreadable journal line"
                    );
                }
            }
        }
        Ok(records)
    }
}

async fn ends_mid_line(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path).await?;
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    Ok(file.read_u8().await? != b'\n')
}

#[async_trait]
impl Journal for FileJournal {
    async fn write(&self, record: &JournalRecord) -> io::Result<()> {
        let mut line = Vec::with_capacity(256);
        if self.torn.load(Ordering::Acquire) {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, record)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        let result = async {
            file.write_all(&line).await?;
            file.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                self.torn.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.torn.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn load(&self) -> io::Result<Vec<JournalRecord>> {
        Self::read_records(&self.path).await
    }
}
