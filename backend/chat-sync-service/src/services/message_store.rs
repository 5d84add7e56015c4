//! # Message Store
//!
//! Single source of truth for chats and their message logs.
//!
//! Each chat owns a [`ChatLog`] behind its own `tokio::sync::RwLock`; the
//! chats live in a `DashMap`, so two chats never contend on the same lock.
//! Mutations (append, edit, mark_read, delete) hold the chat's write lock
//! across the journal write and the in-memory apply, which keeps ids,
//! timestamps and the chat index head in lockstep.
//!
//! Message ids are dense per chat: id `n` lives at index `n - 1`.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{Chat, ChatId, ChatKind, MediaRef, Message, MessageId, UserId};
use crate::services::chat_index::ChatIndex;
use crate::services::journal::{Journal, JournalRecord};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use resilience::{with_retry, with_timeout, Attempt, RetryConfig};
use std::collections::{BTreeSet, HashMap};
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
const MAX_GROUP_NAME_CHARS: usize = 100;

/// Entry of a chat's change feed. The feed position of an entry is its
/// 1-based index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// `reader` newly read every message in `from..=to`
    Read {
        reader: UserId,
        from: MessageId,
        to: MessageId,
    },
    Edited { message_id: MessageId },
}

#[derive(Debug)]
pub struct ChatLog {
    chat_id: ChatId,
    messages: Vec<Message>,
    idempotency: HashMap<(UserId, String), MessageId>,
    read_upto: HashMap<UserId, MessageId>,
    changes: Vec<Change>,
    deleted: bool,
}

impl ChatLog {
    fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            messages: Vec::new(),
            idempotency: HashMap::new(),
            read_upto: HashMap::new(),
            changes: Vec::new(),
            deleted: false,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    /// Highest message id, 0 when empty
    pub fn latest_id(&self) -> MessageId {
        self.messages.len() as MessageId
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        if id == 0 {
            return None;
        }
        self.messages.get((id - 1) as usize)
    }

    fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        if id == 0 {
            return None;
        }
        self.messages.get_mut((id - 1) as usize)
    }

    /// Up to `limit` messages with id > `after`, ascending
    pub fn messages_after(&self, after: MessageId, limit: usize) -> &[Message] {
        let start = (after as usize).min(self.messages.len());
        let end = start.saturating_add(limit).min(self.messages.len());
        &self.messages[start..end]
    }

    /// The newest `limit` messages with id < `before` (all when `None`), ascending
    pub fn messages_before(&self, before: Option<MessageId>, limit: usize) -> &[Message] {
        let upper = match before {
            Some(before) => (before.saturating_sub(1) as usize).min(self.messages.len()),
            None => self.messages.len(),
        };
        let lower = upper.saturating_sub(limit);
        &self.messages[lower..upper]
    }

    /// Messages with `after < id < before`, at most `limit`
    pub fn messages_between(&self, after: MessageId, before: MessageId, limit: usize) -> &[Message] {
        let upper = (before.saturating_sub(1) as usize).min(self.messages.len());
        let start = (after as usize).min(upper);
        let end = start.saturating_add(limit).min(upper);
        &self.messages[start..end]
    }

    /// Messages with id in `from..=to`
    pub fn span(&self, from: MessageId, to: MessageId) -> &[Message] {
        let start = (from.max(1) - 1) as usize;
        let end = (to as usize).min(self.messages.len());
        if start >= end {
            return &[];
        }
        &self.messages[start..end]
    }

    /// Offset paging from the newest end: skip `offset` newest, return the
    /// next `limit` older ones ascending, plus whether older ones remain.
    pub fn page(&self, offset: usize, limit: usize) -> (&[Message], bool) {
        let end = self.messages.len().saturating_sub(offset);
        let start = end.saturating_sub(limit);
        (&self.messages[start..end], start > 0)
    }

    /// Current change-feed sequence
    pub fn change_seq(&self) -> u64 {
        self.changes.len() as u64
    }

    /// Entries with sequence above `seq`
    pub fn changes_since(&self, seq: u64) -> &[Change] {
        let start = (seq as usize).min(self.changes.len());
        &self.changes[start..]
    }

    pub fn read_upto(&self, user_id: UserId) -> MessageId {
        self.read_upto.get(&user_id).copied().unwrap_or(0)
    }

    /// Messages above `cursor` sent by someone other than `user_id`
    pub fn unread_for(&self, user_id: UserId, cursor: MessageId) -> usize {
        self.messages_after(cursor, usize::MAX)
            .iter()
            .filter(|m| m.sender_id != user_id)
            .count()
    }

    pub fn read_watermarks(&self) -> impl Iterator<Item = (UserId, MessageId)> + '_ {
        self.read_upto.iter().map(|(user, up_to)| (*user, *up_to))
    }

    fn find_idempotent(&self, sender_id: UserId, key: &str) -> Option<&Message> {
        self.idempotency
            .get(&(sender_id, key.to_string()))
            .and_then(|id| self.message(*id))
    }

    /// Returns false for anything but the next id (replayed duplicates).
    fn push(&mut self, message: Message) -> bool {
        if message.id != self.latest_id() + 1 {
            return false;
        }
        if let Some(key) = &message.idempotency_key {
            self.idempotency
                .insert((message.sender_id, key.clone()), message.id);
        }
        self.messages.push(message);
        true
    }

    /// Ids whose `read_by` gained `reader`
    fn apply_read(&mut self, reader: UserId, up_to: MessageId) -> Vec<MessageId> {
        let previous = self.read_upto(reader);
        let target = up_to.min(self.latest_id());
        if target <= previous {
            return Vec::new();
        }

        let start = previous as usize;
        let end = target as usize;
        for message in &mut self.messages[start..end] {
            message.read_by.insert(reader);
        }
        self.read_upto.insert(reader, target);
        self.changes.push(Change::Read {
            reader,
            from: previous + 1,
            to: target,
        });
        (previous + 1..=target).collect()
    }

    fn apply_edit(&mut self, message_id: MessageId, content: String, edited_at: DateTime<Utc>) -> bool {
        let Some(message) = self.message_mut(message_id) else {
            return false;
        };
        message.content = Some(content);
        message.edited_at = Some(edited_at);
        self.changes.push(Change::Edited { message_id });
        true
    }
}

struct ChatSlot {
    chat: Chat,
    log: RwLock<ChatLog>,
}

impl ChatSlot {
    fn ensure_participant(&self, user_id: UserId) -> AppResult<()> {
        if self.chat.is_participant(user_id) {
            Ok(())
        } else {
            Err(AppError::NotAParticipant {
                chat_id: self.chat.id,
                user_id,
            })
        }
    }
}

/// Input to [`MessageStore::append`]
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub media: Option<MediaRef>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    /// The idempotency key matched an existing message; nothing was appended
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Effective watermark after clamping to the chat's latest id
    pub up_to: MessageId,
    pub updated: Vec<MessageId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub records: usize,
    pub chats: usize,
    pub messages: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub retry: RetryConfig,
    pub write_timeout: Duration,
    pub max_message_length: usize,
}

impl StoreOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.storage.retry_config(),
            write_timeout: config.storage.write_timeout,
            max_message_length: config.max_message_length,
        }
    }
}

pub struct MessageStore {
    chats: DashMap<ChatId, Arc<ChatSlot>>,
    dialogs: DashMap<(UserId, UserId), ChatId>,
    /// Serializes chat creation and deletion
    lifecycle: Mutex<()>,
    next_chat_id: AtomicU64,
    journal: Arc<dyn Journal>,
    index: Arc<ChatIndex>,
    options: StoreOptions,
}

fn classify_io(e: &io::Error) -> Attempt {
    match e.kind() {
        ErrorKind::InvalidData | ErrorKind::InvalidInput => Attempt::Permanent,
        _ => Attempt::Transient,
    }
}

impl MessageStore {
    pub fn new(journal: Arc<dyn Journal>, index: Arc<ChatIndex>, options: StoreOptions) -> Self {
        Self {
            chats: DashMap::new(),
            dialogs: DashMap::new(),
            lifecycle: Mutex::new(()),
            next_chat_id: AtomicU64::new(1),
            journal,
            index,
            options,
        }
    }

    pub fn index(&self) -> &Arc<ChatIndex> {
        &self.index
    }

    async fn persist(&self, record: &JournalRecord) -> AppResult<()> {
        let journal = &self.journal;
        let timeout = self.options.write_timeout;

        with_retry(self.options.retry.clone(), classify_io, || async move {
            match with_timeout(timeout, journal.write(record)).await {
                Ok(result) => result,
                Err(elapsed) => Err(io::Error::new(ErrorKind::TimedOut, elapsed)),
            }
        })
        .await
        .map_err(|e| {
            let cause = e.into_inner();
            tracing::error!(
                chat_id = record.chat_id(),
                record = record.kind(),
                error = %cause,
                "journal write failed"
            );
            AppError::StorageUnavailable(cause.to_string())
        })
    }

    fn slot(&self, chat_id: ChatId) -> AppResult<Arc<ChatSlot>> {
        self.chats
            .get(&chat_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(AppError::ChatNotFound(chat_id))
    }

    fn install(&self, chat: Chat) {
        if chat.kind == ChatKind::Dialog {
            let mut pair = chat.participant_ids.iter().copied();
            if let (Some(a), Some(b)) = (pair.next(), pair.next()) {
                self.dialogs.insert(Chat::dialog_key(a, b), chat.id);
            }
        }
        self.next_chat_id.fetch_max(chat.id + 1, Ordering::SeqCst);
        self.index.register_chat(&chat);
        self.chats.insert(
            chat.id,
            Arc::new(ChatSlot {
                log: RwLock::new(ChatLog::new(chat.id)),
                chat,
            }),
        );
    }

    pub fn chat(&self, chat_id: ChatId) -> AppResult<Chat> {
        Ok(self.slot(chat_id)?.chat.clone())
    }

    /// Chat metadata, provided `user_id` takes part in it
    pub fn chat_for(&self, chat_id: ChatId, user_id: UserId) -> AppResult<Chat> {
        let slot = self.slot(chat_id)?;
        slot.ensure_participant(user_id)?;
        Ok(slot.chat.clone())
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    /// Returns the chat and whether it was newly created.
    pub async fn create_dialog(&self, requester: UserId, peer: UserId) -> AppResult<(Chat, bool)> {
        if peer == 0 {
            return Err(AppError::BadRequest("user_id is required".into()));
        }
        if requester == peer {
            return Err(AppError::BadRequest("cannot open a dialog with yourself".into()));
        }

        let key = Chat::dialog_key(requester, peer);
        let _guard = self.lifecycle.lock().await;

        if let Some(chat_id) = self.dialogs.get(&key).map(|entry| *entry.value()) {
            if let Ok(chat) = self.chat(chat_id) {
                return Ok((chat, false));
            }
        }

        let chat = Chat {
            id: self.next_chat_id.fetch_add(1, Ordering::SeqCst),
            kind: ChatKind::Dialog,
            name: None,
            owner_id: requester,
            participant_ids: [requester, peer].into_iter().collect(),
            created_at: Utc::now(),
        };
        self.persist(&JournalRecord::ChatCreated { chat: chat.clone() })
            .await?;
        self.install(chat.clone());

        tracing::info!(chat_id = chat.id, requester, peer, "dialog created");
        Ok((chat, true))
    }

    pub async fn create_group(
        &self,
        owner: UserId,
        name: &str,
        member_ids: &[UserId],
    ) -> AppResult<Chat> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("group name is required".into()));
        }
        if name.chars().count() > MAX_GROUP_NAME_CHARS {
            return Err(AppError::BadRequest(format!(
                "group name exceeds {MAX_GROUP_NAME_CHARS} characters"
            )));
        }

        let participant_ids: BTreeSet<UserId> = member_ids
            .iter()
            .copied()
            .filter(|id| *id != 0)
            .chain(std::iter::once(owner))
            .collect();
        if participant_ids.len() < 2 {
            return Err(AppError::BadRequest(
                "a group needs at least one member besides the owner".into(),
            ));
        }

        let _guard = self.lifecycle.lock().await;
        let chat = Chat {
            id: self.next_chat_id.fetch_add(1, Ordering::SeqCst),
            kind: ChatKind::Group,
            name: Some(name.to_string()),
            owner_id: owner,
            participant_ids,
            created_at: Utc::now(),
        };
        self.persist(&JournalRecord::ChatCreated { chat: chat.clone() })
            .await?;
        self.install(chat.clone());

        tracing::info!(
            chat_id = chat.id,
            owner,
            members = chat.participant_ids.len(),
            "group created"
        );
        Ok(chat)
    }

    /// Remove a chat with its log and index entry. Cursor cleanup is up to the caller.
    pub async fn delete_chat(&self, requester: UserId, chat_id: ChatId) -> AppResult<Chat> {
        let _guard = self.lifecycle.lock().await;
        let slot = self.slot(chat_id)?;
        slot.ensure_participant(requester)?;
        if slot.chat.kind == ChatKind::Group && slot.chat.owner_id != requester {
            return Err(AppError::Forbidden);
        }

        // Waits for in-flight writers of this chat
        let mut log = slot.log.write().await;
        if log.deleted {
            return Err(AppError::ChatNotFound(chat_id));
        }
        self.persist(&JournalRecord::ChatDeleted { chat_id }).await?;
        log.deleted = true;
        drop(log);

        self.forget(&slot.chat);
        tracing::info!(chat_id, requester, "chat deleted");
        Ok(slot.chat.clone())
    }

    fn forget(&self, chat: &Chat) {
        self.chats.remove(&chat.id);
        if chat.kind == ChatKind::Dialog {
            self.dialogs.retain(|_, id| *id != chat.id);
        }
        self.index.remove_chat(chat);
    }

    fn validate_content(&self, content: &str) -> AppResult<()> {
        let length = content.chars().count();
        if length > self.options.max_message_length {
            return Err(AppError::BadRequest(format!(
                "message exceeds {} characters",
                self.options.max_message_length
            )));
        }
        Ok(())
    }

    pub async fn append(&self, draft: NewMessage) -> AppResult<Appended> {
        let content = draft.content.filter(|c| !c.trim().is_empty());
        if content.is_none() && draft.media.is_none() {
            return Err(AppError::BadRequest("message has neither content nor media".into()));
        }
        if let Some(text) = &content {
            self.validate_content(text)?;
        }
        let idempotency_key = draft.idempotency_key.filter(|k| !k.is_empty());
        if let Some(key) = &idempotency_key {
            if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(AppError::BadRequest(format!(
                    "idempotency_key exceeds {MAX_IDEMPOTENCY_KEY_LEN} bytes"
                )));
            }
        }

        let slot = self.slot(draft.chat_id)?;
        slot.ensure_participant(draft.sender_id)?;

        let mut log = slot.log.write().await;
        if log.deleted {
            return Err(AppError::ChatNotFound(draft.chat_id));
        }

        if let Some(key) = &idempotency_key {
            if let Some(existing) = log.find_idempotent(draft.sender_id, key) {
                tracing::debug!(
                    chat_id = draft.chat_id,
                    message_id = existing.id,
                    "idempotency key matched, returning existing message"
                );
                return Ok(Appended {
                    message: existing.clone(),
                    duplicate: true,
                });
            }
        }

        let now = Utc::now();
        let created_at = log
            .last_message()
            .map(|last| last.created_at.max(now))
            .unwrap_or(now);
        let message = Message {
            id: log.latest_id() + 1,
            chat_id: draft.chat_id,
            sender_id: draft.sender_id,
            content,
            media: draft.media,
            created_at,
            edited_at: None,
            read_by: BTreeSet::new(),
            idempotency_key,
        };

        self.persist(&JournalRecord::MessageAppended {
            message: message.clone(),
        })
        .await?;
        log.push(message.clone());
        self.index.record_message(&message);

        tracing::debug!(
            chat_id = message.chat_id,
            message_id = message.id,
            sender_id = message.sender_id,
            "message appended"
        );
        Ok(Appended {
            message,
            duplicate: false,
        })
    }

    pub async fn edit(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        editor: UserId,
        content: &str,
    ) -> AppResult<Message> {
        if content.trim().is_empty() {
            return Err(AppError::BadRequest("content is required".into()));
        }
        self.validate_content(content)?;

        let slot = self.slot(chat_id)?;
        slot.ensure_participant(editor)?;

        let mut log = slot.log.write().await;
        if log.deleted {
            return Err(AppError::ChatNotFound(chat_id));
        }
        let target = log
            .message(message_id)
            .ok_or(AppError::MessageNotFound {
                chat_id,
                message_id,
            })?;
        if target.sender_id != editor {
            return Err(AppError::Forbidden);
        }

        let edited_at = Utc::now();
        self.persist(&JournalRecord::MessageEdited {
            chat_id,
            message_id,
            content: content.to_string(),
            edited_at,
        })
        .await?;
        log.apply_edit(message_id, content.to_string(), edited_at);

        let message = log
            .message(message_id)
            .cloned()
            .ok_or(AppError::Internal)?;
        self.index.record_edit(&message);
        Ok(message)
    }

    /// "Read up to `up_to`" for `user_id`; ids above the latest are clamped.
    pub async fn mark_read(
        &self,
        chat_id: ChatId,
        up_to: MessageId,
        user_id: UserId,
    ) -> AppResult<ReadOutcome> {
        let slot = self.slot(chat_id)?;
        slot.ensure_participant(user_id)?;

        let mut log = slot.log.write().await;
        if log.deleted {
            return Err(AppError::ChatNotFound(chat_id));
        }
        let target = up_to.min(log.latest_id());
        if target <= log.read_upto(user_id) {
            return Ok(ReadOutcome {
                up_to: target,
                updated: Vec::new(),
            });
        }

        self.persist(&JournalRecord::ReadMarked {
            chat_id,
            user_id,
            up_to: target,
        })
        .await?;
        let updated = log.apply_read(user_id, target);

        tracing::debug!(chat_id, user_id, up_to = target, updated = updated.len(), "read marked");
        Ok(ReadOutcome {
            up_to: target,
            updated,
        })
    }

    /// Run `f` on a consistent snapshot of the chat's log.
    pub async fn read<R>(&self, chat_id: ChatId, f: impl FnOnce(&ChatLog) -> R) -> AppResult<R> {
        let slot = self.slot(chat_id)?;
        let log = slot.log.read().await;
        if log.deleted {
            return Err(AppError::ChatNotFound(chat_id));
        }
        Ok(f(&log))
    }

    /// Like [`read`](Self::read), restricted to participants.
    pub async fn read_as<R>(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        f: impl FnOnce(&ChatLog) -> R,
    ) -> AppResult<R> {
        let slot = self.slot(chat_id)?;
        slot.ensure_participant(user_id)?;
        let log = slot.log.read().await;
        if log.deleted {
            return Err(AppError::ChatNotFound(chat_id));
        }
        Ok(f(&log))
    }

    /// Ids in `(after_id, before_id)`, ascending, at most `limit`. Without
    /// `after_id` the page is taken from the newest end.
    pub async fn get_range(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        after_id: Option<MessageId>,
        before_id: Option<MessageId>,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        self.read_as(chat_id, user_id, |log| match (after_id, before_id) {
            (Some(after), Some(before)) => log.messages_between(after, before, limit).to_vec(),
            (Some(after), None) => log.messages_after(after, limit).to_vec(),
            (None, before) => log.messages_before(before, limit).to_vec(),
        })
        .await
    }

    pub async fn get_page(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        offset: usize,
        limit: usize,
    ) -> AppResult<(Vec<Message>, bool)> {
        self.read_as(chat_id, user_id, |log| {
            let (messages, has_more) = log.page(offset, limit);
            (messages.to_vec(), has_more)
        })
        .await
    }

    /// Every `(chat, user, read_upto)` watermark, used to seed cursors after a restart.
    pub async fn read_watermarks(&self) -> Vec<(ChatId, UserId, MessageId)> {
        let slots: Vec<Arc<ChatSlot>> = self
            .chats
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut marks = Vec::new();
        for slot in slots {
            let log = slot.log.read().await;
            marks.extend(log.read_watermarks().map(|(user, up_to)| (slot.chat.id, user, up_to)));
        }
        marks
    }

    /// Rebuild state from journal records without writing them back.
    pub async fn restore(&self, records: Vec<JournalRecord>) -> RestoreStats {
        let mut stats = RestoreStats {
            records: records.len(),
            ..RestoreStats::default()
        };

        for record in records {
            let applied = match record {
                JournalRecord::ChatCreated { chat } => {
                    if self.chats.contains_key(&chat.id) {
                        false
                    } else {
                        self.install(chat);
                        stats.chats += 1;
                        true
                    }
                }
                JournalRecord::ChatDeleted { chat_id } => match self.slot(chat_id) {
                    Ok(slot) => {
                        slot.log.write().await.deleted = true;
                        self.forget(&slot.chat);
                        stats.chats = stats.chats.saturating_sub(1);
                        true
                    }
                    Err(_) => false,
                },
                JournalRecord::MessageAppended { message } => match self.slot(message.chat_id) {
                    Ok(slot) => {
                        let mut log = slot.log.write().await;
                        let pushed = log.push(message.clone());
                        if pushed {
                            self.index.record_message(&message);
                            stats.messages += 1;
                        }
                        pushed
                    }
                    Err(_) => false,
                },
                JournalRecord::MessageEdited {
                    chat_id,
                    message_id,
                    content,
                    edited_at,
                } => match self.slot(chat_id) {
                    Ok(slot) => {
                        let mut log = slot.log.write().await;
                        let already = log
                            .message(message_id)
                            .map(|m| m.edited_at == Some(edited_at))
                            .unwrap_or(true);
                        if already {
                            false
                        } else {
                            log.apply_edit(message_id, content, edited_at);
                            if let Some(message) = log.message(message_id) {
                                self.index.record_edit(message);
                            }
                            true
                        }
                    }
                    Err(_) => false,
                },
                JournalRecord::ReadMarked {
                    chat_id,
                    user_id,
                    up_to,
                } => match self.slot(chat_id) {
                    Ok(slot) => !slot.log.write().await.apply_read(user_id, up_to).is_empty(),
                    Err(_) => false,
                },
            };

            if !applied {
                stats.skipped += 1;
            }
        }

        tracing::info!(
            records = stats.records,
            chats = stats.chats,
            messages = stats.messages,
            skipped = stats.skipped,
            "journal replayed"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::journal::MemoryJournal;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn store_with(journal: Arc<dyn Journal>) -> MessageStore {
        MessageStore::new(
            journal,
            Arc::new(ChatIndex::new()),
            StoreOptions::from_config(&Config::test_defaults()),
        )
    }

    fn store() -> MessageStore {
        store_with(Arc::new(MemoryJournal))
    }

    fn text(chat_id: ChatId, sender_id: UserId, body: &str) -> NewMessage {
        NewMessage {
            chat_id,
            sender_id,
            content: Some(body.to_string()),
            ..NewMessage::default()
        }
    }

    /// Fails the first `failures` writes with a transient error
    struct FlakyJournal {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Journal for FlakyJournal {
        async fn write(&self, _record: &JournalRecord) -> io::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(io::Error::new(ErrorKind::Other, "disk busy"))
            } else {
                Ok(())
            }
        }

        async fn load(&self) -> io::Result<Vec<JournalRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_ids_are_dense_and_start_at_one() {
        let store = store();
        let (chat, _) = store.create_dialog(1, 2).await.unwrap();

        for n in 1..=3 {
            let appended = store.append(text(chat.id, 1, &format!("m{n}"))).await.unwrap();
            assert_eq!(appended.message.id, n);
            assert!(!appended.duplicate);
        }
        let latest = store.read(chat.id, |log| log.latest_id()).await.unwrap();
        assert_eq!(latest, 3);
    }

    #[tokio::test]
    async fn test_timestamps_follow_ids() {
        let store = store();
        let (chat, _) = store.create_dialog(1, 2).await.unwrap();
        for n in 0..20 {
            store.append(text(chat.id, 1 + n % 2, "x")).await.unwrap();
        }
        let messages = store.get_range(chat.id, 1, Some(0), None, 100).await.unwrap();
        assert!(messages.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_create_dialog_is_idempotent() {
        let store = store();
        let (first, created) = store.create_dialog(1, 2).await.unwrap();
        let (second, created_again) = store.create_dialog(2, 1).await.unwrap();
        assert!(created);
        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert!(matches!(
            store.create_dialog(3, 3).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_group_requires_name_and_members() {
        let store = store();
        assert!(matches!(
            store.create_group(1, "  ", &[2]).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            store.create_group(1, "solo", &[1]).await,
            Err(AppError::BadRequest(_))
        ));
        let chat = store.create_group(1, "team", &[2, 3]).await.unwrap();
        assert!(chat.is_participant(1));
        assert_eq!(chat.participant_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_append_validation() {
        let store = store();
        let (chat, _) = store.create_dialog(1, 2).await.unwrap();

        assert!(matches!(
            store.append(text(999, 1, "x")).await,
            Err(AppError::ChatNotFound(999))
        ));
        assert!(matches!(
            store.append(text(chat.id, 3, "x")).await,
            Err(AppError::NotAParticipant { .. })
        ));
        assert!(matches!(
            store.append(text(chat.id, 1, "   ")).await,
            Err(AppError::BadRequest(_))
        ));
        let too_long = "a".repeat(4097);
        assert!(matches!(
            store.append(text(chat.id, 1, &too_long)).await,
            Err(AppError::BadRequest(_))
        ));

        let media_only = NewMessage {
            chat_id: chat.id,
            sender_id: 2,
            media: Some(MediaRef {
                key: "abc.png".into(),
                media_type: "image/png".into(),
            }),
            ..NewMessage::default()
        };
        let appended = store.append(media_only).await.unwrap();
        assert!(appended.message.has_media());
        assert!(appended.message.content.is_none());
    }

    #[tokio::test]
    async fn test_idempotency_key_returns_original() {
        let store = store();
        let (chat, _) = store.create_dialog(1, 2).await.unwrap();
        let draft = NewMessage {
            idempotency_key: Some("k-1".into()),
            ..text(chat.id, 1, "hello")
        };

        let first = store.append(draft.clone()).await.unwrap();
        let second = store.append(draft).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(first.message.id, second.message.id);

        // Same key from another sender is a different message
        let other = NewMessage {
            idempotency_key: Some("k-1".into()),
            ..text(chat.id, 2, "hello")
        };
        let third = store.append(other).await.unwrap();
        assert!(!third.duplicate);
        assert_eq!(third.message.id, 2);
    }

    #[tokio::test]
    async fn test_get_range_bounds() {
        let store = store();
        let (chat, _) = store.create_dialog(1, 2).await.unwrap();
        for n in 1..=10 {
            store.append(text(chat.id, 1, &format!("m{n}"))).await.unwrap();
        }

        let ids = |messages: Vec<Message>| messages.iter().map(|m| m.id).collect::<Vec<_>>();

        assert_eq!(
            ids(store.get_range(chat.id, 1, Some(7), None, 100).await.unwrap()),
            vec![8, 9, 10]
        );
        assert_eq!(
            ids(store.get_range(chat.id, 1, None, Some(5), 2).await.unwrap()),
            vec![3, 4]
        );
        assert_eq!(
            ids(store.get_range(chat.id, 1, None, None, 3).await.unwrap()),
            vec![8, 9, 10]
        );
        assert_eq!(
            ids(store.get_range(chat.id, 1, Some(2), Some(6), 10).await.unwrap()),
            vec![3, 4, 5]
        );
        assert!(store
            .get_range(chat.id, 1, Some(10), None, 100)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .get_range(chat.id, 1, Some(50), None, 100)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_get_page_from_newest_end() {
        let store = store();
        let (chat, _) = store.create_dialog(1, 2).await.unwrap();
        for n in 1..=5 {
            store.append(text(chat.id, 2, &format!("m{n}"))).await.unwrap();
        }

        let (page, has_more) = store.get_page(chat.id, 1, 0, 2).await.unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![4, 5]);
        assert!(has_more);

        let (page, has_more) = store.get_page(chat.id, 1, 4, 2).await.unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1]);
        assert!(!has_more);
    }

    #[tokio::test]
    async fn test_mark_read_clamps_and_is_idempotent() {
        let store = store();
        let (chat, _) = store.create_dialog(1, 2).await.unwrap();
        for _ in 0..3 {
            store.append(text(chat.id, 1, "x")).await.unwrap();
        }

        let outcome = store.mark_read(chat.id, 99, 2).await.unwrap();
        assert_eq!(outcome.up_to, 3);
        assert_eq!(outcome.updated, vec![1, 2, 3]);

        let again = store.mark_read(chat.id, 3, 2).await.unwrap();
        assert!(again.updated.is_empty());

        let read_by = store
            .read(chat.id, |log| log.message(2).map(|m| m.read_by.clone()))
            .await
            .unwrap()
            .unwrap();
        assert!(read_by.contains(&2));

        assert!(matches!(
            store.mark_read(chat.id, 1, 5).await,
            Err(AppError::NotAParticipant { .. })
        ));
    }

    #[tokio::test]
    async fn test_edit_only_by_sender() {
        let store = store();
        let (chat, _) = store.create_dialog(1, 2).await.unwrap();
        store.append(text(chat.id, 1, "draft")).await.unwrap();

        assert!(matches!(
            store.edit(chat.id, 1, 2, "hijack").await,
            Err(AppError::Forbidden)
        ));
        assert!(matches!(
            store.edit(chat.id, 7, 1, "nope").await,
            Err(AppError::MessageNotFound { message_id: 7, .. })
        ));

        let edited = store.edit(chat.id, 1, 1, "final").await.unwrap();
        assert_eq!(edited.content.as_deref(), Some("final"));
        assert!(edited.edited_at.is_some());
        let seq = store.read(chat.id, |log| log.change_seq()).await.unwrap();
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let store = store();
        let group = store.create_group(1, "team", &[2, 3]).await.unwrap();
        assert!(matches!(
            store.delete_chat(2, group.id).await,
            Err(AppError::Forbidden)
        ));
        assert!(matches!(
            store.delete_chat(9, group.id).await,
            Err(AppError::NotAParticipant { .. })
        ));
        store.delete_chat(1, group.id).await.unwrap();
        assert!(matches!(
            store.append(text(group.id, 1, "x")).await,
            Err(AppError::ChatNotFound(_))
        ));

        let (dialog, _) = store.create_dialog(4, 5).await.unwrap();
        store.delete_chat(5, dialog.id).await.unwrap();
        let (fresh, created) = store.create_dialog(4, 5).await.unwrap();
        assert!(created);
        assert_ne!(fresh.id, dialog.id);
    }

    #[tokio::test]
    async fn test_transient_journal_failures_are_retried() {
        let journal = Arc::new(FlakyJournal {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let store = store_with(journal.clone());
        let (chat, _) = store.create_dialog(1, 2).await.unwrap();
        assert_eq!(chat.id, 1);
        assert_eq!(journal.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_storage_unavailable() {
        let journal = Arc::new(FlakyJournal {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let store = store_with(journal);
        let result = store.create_group(1, "team", &[2]).await;
        assert!(matches!(result, Err(AppError::StorageUnavailable(_))));
        assert_eq!(store.chat_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_skips_duplicates() {
        let store = store();
        let chat = Chat {
            id: 7,
            kind: ChatKind::Group,
            name: Some("ops".into()),
            owner_id: 1,
            participant_ids: [1, 2].into_iter().collect(),
            created_at: Utc::now(),
        };
        let message = Message {
            id: 1,
            chat_id: 7,
            sender_id: 1,
            content: Some("hi".into()),
            media: None,
            created_at: Utc::now(),
            edited_at: None,
            read_by: BTreeSet::new(),
            idempotency_key: None,
        };
        let records = vec![
            JournalRecord::ChatCreated { chat: chat.clone() },
            JournalRecord::MessageAppended {
                message: message.clone(),
            },
            JournalRecord::MessageAppended { message },
            JournalRecord::ReadMarked {
                chat_id: 7,
                user_id: 2,
                up_to: 1,
            },
            JournalRecord::ReadMarked {
                chat_id: 7,
                user_id: 2,
                up_to: 1,
            },
        ];

        let stats = store.restore(records).await;
        assert_eq!(stats.records, 5);
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.skipped, 2);

        // Chat ids continue after the restored ones
        let (dialog, _) = store.create_dialog(3, 4).await.unwrap();
        assert_eq!(dialog.id, 8);
        assert_eq!(store.read_watermarks().await, vec![(7, 2, 1)]);
    }
}
