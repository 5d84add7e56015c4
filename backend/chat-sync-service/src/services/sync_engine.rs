//! # Sync Engine
//!
//! Computes what a client is missing for one chat, given its delivery cursor
//! and change-feed watermark:
//!
//! - new messages after the cursor, bounded by the page size
//! - read receipts on the user's own messages up to the new cursor
//! - edits of already-delivered messages
//!
//! A cursor ahead of the chat (stale client state, chat recreated) is
//! answered with a snapshot from the beginning flagged `resynced`.

use crate::config::SyncConfig;
use crate::error::{AppError, AppResult};
use crate::models::{ChatId, MessageId, ReadReceiptUpdate, SyncResult, UserId};
use crate::services::cursor_tracker::CursorTracker;
use crate::services::message_store::{Change, ChatLog, MessageStore};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Delta for `user_id` against one chat log.
pub fn compute(
    log: &ChatLog,
    user_id: UserId,
    cursor: MessageId,
    changes_after: u64,
    page_size: usize,
) -> AppResult<SyncResult> {
    let latest = log.latest_id();
    if cursor > latest {
        return Err(AppError::InvalidCursor {
            chat_id: log.chat_id(),
            cursor,
            latest,
        });
    }

    let messages = log.messages_after(cursor, page_size).to_vec();
    let new_cursor = messages.last().map(|m| m.id).unwrap_or(cursor);
    let has_more = page_size > 0 && messages.len() == page_size;

    let change_seq = log.change_seq();
    // A watermark from another incarnation of the chat restarts the feed
    let changes_after = if changes_after > change_seq { 0 } else { changes_after };

    let mut receipts = BTreeSet::new();
    let mut edits = BTreeSet::new();
    for change in log.changes_since(changes_after) {
        match change {
            Change::Read { reader, from, to } => {
                if *reader == user_id {
                    continue;
                }
                receipts.extend(
                    log.span(*from, (*to).min(new_cursor))
                        .iter()
                        .filter(|m| m.sender_id == user_id)
                        .map(|m| m.id),
                );
            }
            Change::Edited { message_id } => {
                if *message_id <= cursor {
                    edits.insert(*message_id);
                }
            }
        }
    }

    let read_receipt_updates = receipts
        .into_iter()
        .filter_map(|id| log.message(id))
        .map(|m| ReadReceiptUpdate {
            message_id: m.id,
            read_by: m.read_by.clone(),
        })
        .collect();
    let edited_messages = edits
        .into_iter()
        .filter_map(|id| log.message(id).cloned())
        .collect();

    Ok(SyncResult {
        chat_id: log.chat_id(),
        messages,
        read_receipt_updates,
        edited_messages,
        new_cursor,
        change_cursor: change_seq,
        has_more,
        resynced: false,
    })
}

pub struct SyncEngine {
    store: Arc<MessageStore>,
    cursors: Arc<CursorTracker>,
    page_size: usize,
    limiter: DefaultKeyedRateLimiter<UserId>,
}

impl SyncEngine {
    pub fn new(store: Arc<MessageStore>, cursors: Arc<CursorTracker>, config: &SyncConfig) -> Self {
        let per_second = NonZeroU32::new(config.rate_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);

        Self {
            store,
            cursors,
            page_size: config.page_size,
            limiter: RateLimiter::keyed(quota),
        }
    }

    fn admit(&self, user_id: UserId, chat_id: ChatId) -> AppResult<()> {
        if self.limiter.check_key(&user_id).is_err() {
            tracing::warn!(user_id, chat_id, "sync rate limited");
            return Err(AppError::RateLimited);
        }
        Ok(())
    }

    /// New messages after `cursor` for history polling.
    ///
    /// Only the delivery cursor moves: receipts and edits stay pending for
    /// the next [`sync`](Self::sync) or push.
    pub async fn poll(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        cursor: MessageId,
    ) -> AppResult<SyncResult> {
        self.admit(user_id, chat_id)?;

        let changes_after = self.cursors.get_change_watermark(user_id, chat_id);
        let result = self
            .compute_delta(user_id, chat_id, cursor, changes_after)
            .await?;
        self.record_delivery(user_id, chat_id, result.new_cursor, None);
        Ok(result)
    }

    /// Advance the tracker for `(user_id, chat_id)` and return the stored cursor.
    ///
    /// A deletion that completed after the caller's read has already swept
    /// the tracker, so entries of a chat the store no longer has are dropped again.
    pub fn record_delivery(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        cursor: MessageId,
        changes: Option<u64>,
    ) -> MessageId {
        let stored = self.cursors.advance_cursor(user_id, chat_id, cursor);
        if let Some(seq) = changes {
            self.cursors.advance_change_watermark(user_id, chat_id, seq);
        }
        if self.store.chat(chat_id).is_err() {
            self.cursors.forget_chat(chat_id);
        }
        stored
    }

    /// Delta from `cursor`, recording delivery in the cursor tracker.
    ///
    /// Without `changes_after` the stored change watermark is used.
    pub async fn sync(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        cursor: MessageId,
        changes_after: Option<u64>,
    ) -> AppResult<SyncResult> {
        self.admit(user_id, chat_id)?;

        let changes_after =
            changes_after.unwrap_or_else(|| self.cursors.get_change_watermark(user_id, chat_id));
        let result = self
            .compute_delta(user_id, chat_id, cursor, changes_after)
            .await?;

        self.record_delivery(user_id, chat_id, result.new_cursor, Some(result.change_cursor));

        tracing::debug!(
            user_id,
            chat_id,
            cursor,
            new_cursor = result.new_cursor,
            messages = result.messages.len(),
            resynced = result.resynced,
            "sync served"
        );
        Ok(result)
    }

    /// Same computation as [`sync`](Self::sync) without touching the tracker.
    pub async fn compute_delta(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        cursor: MessageId,
        changes_after: u64,
    ) -> AppResult<SyncResult> {
        let page_size = self.page_size;
        let outcome = self
            .store
            .read_as(chat_id, user_id, |log| {
                compute(log, user_id, cursor, changes_after, page_size)
            })
            .await?;

        match outcome {
            Err(AppError::InvalidCursor { latest, .. }) => {
                tracing::warn!(user_id, chat_id, cursor, latest, "cursor ahead of chat, resyncing");
                let mut snapshot = self
                    .store
                    .read_as(chat_id, user_id, |log| compute(log, user_id, 0, 0, page_size))
                    .await??;
                snapshot.resynced = true;
                Ok(snapshot)
            }
            other => other,
        }
    }

    /// Client acknowledgement; clamped to the chat's latest id.
    pub async fn acknowledge(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        cursor: MessageId,
    ) -> AppResult<MessageId> {
        let latest = self
            .store
            .read_as(chat_id, user_id, |log| log.latest_id())
            .await?;
        Ok(self.record_delivery(user_id, chat_id, cursor.min(latest), None))
    }

    /// Drop limiter state for idle users.
    pub fn prune_limiter(&self) {
        self.limiter.retain_recent();
    }
}
