//! # Dispatcher
//!
//! Pushes deltas to connected clients so they do not have to poll.
//!
//! Every connection owns a bounded outbound queue. Notifications are
//! processed on spawned tasks, so appends never wait for delivery; a
//! connection whose queue is full is dropped and recovers by reconnecting
//! from its acknowledged cursor.
//!
//! Per connection and chat the dispatcher remembers the last *pushed*
//! cursor and change watermark, which can run ahead of the acknowledged
//! cursor kept by the [`CursorTracker`](crate::services::cursor_tracker::CursorTracker).

use super::message_types::{ChatCursor, WsOutboundEvent};
use crate::error::{AppError, AppResult};
use crate::models::{ChatId, MessageId, SyncView, UserId};
use crate::services::cursor_tracker::CursorTracker;
use crate::services::media::MediaStore;
use crate::services::message_store::MessageStore;
use crate::services::sync_engine::SyncEngine;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Unique identifier for a WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connected,
    Subscribed(BTreeSet<ChatId>),
}

#[derive(Debug, Clone, Copy)]
struct PushState {
    cursor: MessageId,
    changes: u64,
}

struct Connection {
    user_id: UserId,
    sender: mpsc::Sender<String>,
    /// Held across compute and send, which keeps pushes ordered per connection
    subscriptions: Mutex<HashMap<ChatId, PushState>>,
}

/// Result of a subscribe request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub accepted: Vec<ChatId>,
    pub rejected: Vec<ChatId>,
}

enum Delivery {
    Sent,
    Dropped,
}

pub struct Dispatcher {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    chat_subscribers: DashMap<ChatId, HashSet<ConnectionId>>,
    store: Arc<MessageStore>,
    engine: Arc<SyncEngine>,
    cursors: Arc<CursorTracker>,
    media: Arc<dyn MediaStore>,
    queue_capacity: usize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<MessageStore>,
        engine: Arc<SyncEngine>,
        cursors: Arc<CursorTracker>,
        media: Arc<dyn MediaStore>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            chat_subscribers: DashMap::new(),
            store,
            engine,
            cursors,
            media,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a connection; frames for it arrive on the returned receiver.
    pub fn connect(&self, user_id: UserId) -> (ConnectionId, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = ConnectionId::new();
        self.connections.insert(
            id,
            Arc::new(Connection {
                user_id,
                sender,
                subscriptions: Mutex::new(HashMap::new()),
            }),
        );
        tracing::info!(connection = %id, user_id, "connection registered");
        (id, receiver)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub async fn phase(&self, id: ConnectionId) -> ConnectionPhase {
        let Some(connection) = self.connection(id) else {
            return ConnectionPhase::Disconnected;
        };
        let subscriptions = connection.subscriptions.lock().await;
        if subscriptions.is_empty() {
            ConnectionPhase::Connected
        } else {
            ConnectionPhase::Subscribed(subscriptions.keys().copied().collect())
        }
    }

    /// Subscribe to chats and push what the client is missing for each.
    ///
    /// Chats the user does not take part in are rejected individually.
    pub async fn subscribe(
        &self,
        id: ConnectionId,
        chat_ids: &[ChatId],
        cursors: &[ChatCursor],
    ) -> AppResult<Subscription> {
        let connection = self.connection(id).ok_or(AppError::Unauthorized)?;
        let user_id = connection.user_id;
        let mut outcome = Subscription::default();

        {
            let mut subscriptions = connection.subscriptions.lock().await;
            for &chat_id in chat_ids {
                if self.store.chat_for(chat_id, user_id).is_err() {
                    outcome.rejected.push(chat_id);
                    continue;
                }
                let cursor = cursors
                    .iter()
                    .find(|c| c.chat_id == chat_id)
                    .map(|c| c.cursor)
                    .unwrap_or_else(|| self.cursors.get_cursor(user_id, chat_id));
                subscriptions.entry(chat_id).or_insert(PushState {
                    cursor,
                    changes: self.cursors.get_change_watermark(user_id, chat_id),
                });
                self.chat_subscribers.entry(chat_id).or_default().insert(id);
                outcome.accepted.push(chat_id);
            }
        }

        let ack = WsOutboundEvent::Subscribed {
            chat_ids: outcome.accepted.clone(),
            rejected: outcome.rejected.clone(),
        };
        if matches!(self.send(id, &connection, &ack), Delivery::Dropped) {
            return Ok(outcome);
        }

        for &chat_id in &outcome.accepted {
            if matches!(self.push_chat(id, &connection, chat_id).await, Delivery::Dropped) {
                break;
            }
        }

        tracing::debug!(
            connection = %id,
            user_id,
            accepted = ?outcome.accepted,
            rejected = ?outcome.rejected,
            "subscription updated"
        );
        Ok(outcome)
    }

    pub async fn unsubscribe(&self, id: ConnectionId, chat_ids: &[ChatId]) {
        let Some(connection) = self.connection(id) else {
            return;
        };
        let mut subscriptions = connection.subscriptions.lock().await;
        for chat_id in chat_ids {
            subscriptions.remove(chat_id);
            self.remove_subscriber(*chat_id, id);
        }
    }

    /// Client acknowledgement, stored in the cursor tracker.
    pub async fn acknowledge(
        &self,
        id: ConnectionId,
        chat_id: ChatId,
        cursor: MessageId,
    ) -> AppResult<MessageId> {
        let connection = self.connection(id).ok_or(AppError::Unauthorized)?;
        self.engine
            .acknowledge(connection.user_id, chat_id, cursor)
            .await
    }

    pub fn disconnect(&self, id: ConnectionId) {
        let Some((_, connection)) = self.connections.remove(&id) else {
            return;
        };
        // Subscriptions may be locked by an in-flight push; sweep the reverse map instead
        self.chat_subscribers.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
        tracing::info!(connection = %id, user_id = connection.user_id, "connection closed");
    }

    fn remove_subscriber(&self, chat_id: ChatId, id: ConnectionId) {
        if let Some(mut subscribers) = self.chat_subscribers.get_mut(&chat_id) {
            subscribers.remove(&id);
        }
        self.chat_subscribers
            .remove_if(&chat_id, |_, subscribers| subscribers.is_empty());
    }

    /// Queue an event for one connection.
    pub fn send_event(&self, id: ConnectionId, event: &WsOutboundEvent) {
        if let Some(connection) = self.connection(id) {
            self.send(id, &connection, event);
        }
    }

    fn send(&self, id: ConnectionId, connection: &Connection, event: &WsOutboundEvent) -> Delivery {
        let Some(frame) = event.to_frame() else {
            return Delivery::Sent;
        };
        match connection.sender.try_send(frame) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    connection = %id,
                    user_id = connection.user_id,
                    capacity = self.queue_capacity,
                    "push queue full, dropping slow connection"
                );
                self.disconnect(id);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.disconnect(id);
                Delivery::Dropped
            }
        }
    }

    /// Push pending deltas for `chat_id` to one connection until it is caught up.
    async fn push_chat(&self, id: ConnectionId, connection: &Connection, chat_id: ChatId) -> Delivery {
        let mut subscriptions = connection.subscriptions.lock().await;

        loop {
            let Some(state) = subscriptions.get(&chat_id).copied() else {
                return Delivery::Sent;
            };
            let delta = match self
                .engine
                .compute_delta(connection.user_id, chat_id, state.cursor, state.changes)
                .await
            {
                Ok(delta) => delta,
                Err(e) => {
                    tracing::debug!(connection = %id, chat_id, error = %e, "skipping push");
                    return Delivery::Sent;
                }
            };

            subscriptions.insert(
                chat_id,
                PushState {
                    cursor: if delta.resynced {
                        delta.new_cursor
                    } else {
                        state.cursor.max(delta.new_cursor)
                    },
                    changes: delta.change_cursor,
                },
            );
            if delta.is_empty() && !delta.resynced {
                return Delivery::Sent;
            }

            let has_more = delta.has_more;
            let view = SyncView::render(delta, connection.user_id, |m| self.media.url_for(m));
            if matches!(
                self.send(id, connection, &WsOutboundEvent::Delta(view)),
                Delivery::Dropped
            ) {
                return Delivery::Dropped;
            }
            if !has_more {
                return Delivery::Sent;
            }
        }
    }

    /// Deliver pending deltas of `chat_id` to every subscribed connection.
    pub async fn publish(&self, chat_id: ChatId) {
        let subscribers: Vec<ConnectionId> = self
            .chat_subscribers
            .get(&chat_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        for id in subscribers {
            if let Some(connection) = self.connection(id) {
                self.push_chat(id, &connection, chat_id).await;
            }
        }
    }

    /// Schedule [`publish`](Self::publish) without waiting for it.
    pub fn notify(self: &Arc<Self>, chat_id: ChatId) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.publish(chat_id).await;
        });
    }

    /// Tell subscribers a chat is gone and forget their subscriptions to it.
    pub async fn chat_deleted(&self, chat_id: ChatId) {
        let subscribers = self
            .chat_subscribers
            .remove(&chat_id)
            .map(|(_, s)| s)
            .unwrap_or_default();

        for id in subscribers {
            if let Some(connection) = self.connection(id) {
                connection.subscriptions.lock().await.remove(&chat_id);
                self.send(id, &connection, &WsOutboundEvent::ChatDeleted { chat_id });
            }
        }
    }

    pub fn notify_deleted(self: &Arc<Self>, chat_id: ChatId) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.chat_deleted(chat_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::chat_index::ChatIndex;
    use crate::services::journal::MemoryJournal;
    use crate::services::media::LocalMediaStore;
    use crate::services::message_store::{NewMessage, StoreOptions};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MessageStore>,
        cursors: Arc<CursorTracker>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(queue_capacity: usize) -> Fixture {
        let config = Config::test_defaults();
        let store = Arc::new(MessageStore::new(
            Arc::new(MemoryJournal),
            Arc::new(ChatIndex::new()),
            StoreOptions::from_config(&config),
        ));
        let cursors = Arc::new(CursorTracker::new());
        let engine = Arc::new(SyncEngine::new(store.clone(), cursors.clone(), &config.sync));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            engine,
            cursors.clone(),
            Arc::new(LocalMediaStore::new(&config.media)),
            queue_capacity,
        ));
        Fixture {
            store,
            cursors,
            dispatcher,
        }
    }

    async fn send(store: &MessageStore, chat_id: ChatId, sender_id: UserId, body: &str) {
        store
            .append(NewMessage {
                chat_id,
                sender_id,
                content: Some(body.to_string()),
                ..NewMessage::default()
            })
            .await
            .unwrap();
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("channel open");
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_phases() {
        let f = fixture(8);
        let (chat, _) = f.store.create_dialog(1, 2).await.unwrap();
        let (id, _rx) = f.dispatcher.connect(2);
        assert_eq!(f.dispatcher.phase(id).await, ConnectionPhase::Connected);

        f.dispatcher.subscribe(id, &[chat.id], &[]).await.unwrap();
        assert_eq!(
            f.dispatcher.phase(id).await,
            ConnectionPhase::Subscribed([chat.id].into_iter().collect())
        );

        f.dispatcher.unsubscribe(id, &[chat.id]).await;
        assert_eq!(f.dispatcher.phase(id).await, ConnectionPhase::Connected);

        f.dispatcher.disconnect(id);
        assert_eq!(f.dispatcher.phase(id).await, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_rejects_foreign_chats() {
        let f = fixture(8);
        let (mine, _) = f.store.create_dialog(1, 2).await.unwrap();
        let (theirs, _) = f.store.create_dialog(3, 4).await.unwrap();
        let (id, mut rx) = f.dispatcher.connect(1);

        let outcome = f
            .dispatcher
            .subscribe(id, &[mine.id, theirs.id, 999], &[])
            .await
            .unwrap();
        assert_eq!(outcome.accepted, vec![mine.id]);
        assert_eq!(outcome.rejected, vec![theirs.id, 999]);

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["type"], "subscribed");
        assert_eq!(frame["rejected"], serde_json::json!([theirs.id, 999]));
    }

    #[tokio::test]
    async fn test_subscribe_pushes_backlog_from_stored_cursor() {
        let f = fixture(8);
        let (chat, _) = f.store.create_dialog(1, 2).await.unwrap();
        for body in ["a", "b", "c"] {
            send(&f.store, chat.id, 1, body).await;
        }
        f.cursors.advance_cursor(2, chat.id, 2);

        let (id, mut rx) = f.dispatcher.connect(2);
        f.dispatcher.subscribe(id, &[chat.id], &[]).await.unwrap();

        assert_eq!(next_frame(&mut rx).await["type"], "subscribed");
        let delta = next_frame(&mut rx).await;
        assert_eq!(delta["type"], "delta");
        assert_eq!(delta["new_cursor"], 3);
        assert_eq!(delta["messages"].as_array().unwrap().len(), 1);
        assert_eq!(delta["messages"][0]["is_own"], false);
    }

    #[tokio::test]
    async fn test_publish_sends_each_message_once() {
        let f = fixture(8);
        let (chat, _) = f.store.create_dialog(1, 2).await.unwrap();
        let (id, mut rx) = f.dispatcher.connect(2);
        f.dispatcher.subscribe(id, &[chat.id], &[]).await.unwrap();
        next_frame(&mut rx).await;

        send(&f.store, chat.id, 1, "hello").await;
        f.dispatcher.publish(chat.id).await;
        f.dispatcher.publish(chat.id).await;

        let delta = next_frame(&mut rx).await;
        assert_eq!(delta["messages"][0]["content"], "hello");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_is_asynchronous() {
        let f = fixture(8);
        let (chat, _) = f.store.create_dialog(1, 2).await.unwrap();
        let (id, mut rx) = f.dispatcher.connect(2);
        f.dispatcher.subscribe(id, &[chat.id], &[]).await.unwrap();
        next_frame(&mut rx).await;

        send(&f.store, chat.id, 1, "ping").await;
        f.dispatcher.notify(chat.id);

        let delta = next_frame(&mut rx).await;
        assert_eq!(delta["new_cursor"], 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_connection() {
        let f = fixture(1);
        let (chat, _) = f.store.create_dialog(1, 2).await.unwrap();
        let (id, _rx) = f.dispatcher.connect(2);
        // The subscribed frame occupies the only slot
        f.dispatcher.subscribe(id, &[chat.id], &[]).await.unwrap();

        send(&f.store, chat.id, 1, "overflow").await;
        f.dispatcher.publish(chat.id).await;

        assert_eq!(f.dispatcher.phase(id).await, ConnectionPhase::Disconnected);
        assert_eq!(f.dispatcher.connection_count(), 0);

        // Appends keep working without the dropped client
        send(&f.store, chat.id, 1, "still fine").await;
        f.dispatcher.publish(chat.id).await;
    }

    #[tokio::test]
    async fn test_ack_advances_tracker() {
        let f = fixture(8);
        let (chat, _) = f.store.create_dialog(1, 2).await.unwrap();
        send(&f.store, chat.id, 1, "a").await;
        send(&f.store, chat.id, 1, "b").await;
        let (id, _rx) = f.dispatcher.connect(2);

        assert_eq!(f.dispatcher.acknowledge(id, chat.id, 2).await.unwrap(), 2);
        assert_eq!(f.cursors.get_cursor(2, chat.id), 2);
    }

    #[tokio::test]
    async fn test_chat_deleted_frame() {
        let f = fixture(8);
        let (chat, _) = f.store.create_dialog(1, 2).await.unwrap();
        let (id, mut rx) = f.dispatcher.connect(2);
        f.dispatcher.subscribe(id, &[chat.id], &[]).await.unwrap();
        next_frame(&mut rx).await;

        f.store.delete_chat(1, chat.id).await.unwrap();
        f.dispatcher.chat_deleted(chat.id).await;

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["type"], "chat_deleted");
        assert_eq!(f.dispatcher.phase(id).await, ConnectionPhase::Connected);
    }

    #[tokio::test]
    async fn test_read_receipt_pushed_to_author() {
        let f = fixture(8);
        let (chat, _) = f.store.create_dialog(1, 2).await.unwrap();
        send(&f.store, chat.id, 1, "seen?").await;

        let (id, mut rx) = f.dispatcher.connect(1);
        f.dispatcher.subscribe(id, &[chat.id], &[]).await.unwrap();
        assert_eq!(next_frame(&mut rx).await["type"], "subscribed");
        let backlog = next_frame(&mut rx).await;
        assert_eq!(backlog["messages"][0]["is_own"], true);

        f.store.mark_read(chat.id, 1, 2).await.unwrap();
        f.dispatcher.publish(chat.id).await;

        let delta = next_frame(&mut rx).await;
        assert_eq!(delta["type"], "delta");
        assert!(delta["messages"].as_array().unwrap().is_empty());
        assert_eq!(
            delta["read_receipt_updates"],
            serde_json::json!([{ "message_id": 1, "read_by": [2] }])
        );
    }

    #[tokio::test]
    async fn test_edit_pushed_to_peer() {
        let f = fixture(8);
        let (chat, _) = f.store.create_dialog(1, 2).await.unwrap();
        send(&f.store, chat.id, 1, "draft").await;

        let (id, mut rx) = f.dispatcher.connect(2);
        f.dispatcher.subscribe(id, &[chat.id], &[]).await.unwrap();
        next_frame(&mut rx).await;
        assert_eq!(next_frame(&mut rx).await["new_cursor"], 1);

        f.store.edit(chat.id, 1, 1, "final").await.unwrap();
        f.dispatcher.publish(chat.id).await;

        let delta = next_frame(&mut rx).await;
        assert!(delta["messages"].as_array().unwrap().is_empty());
        let edited = delta["edited_messages"].as_array().unwrap();
        assert_eq!(edited.len(), 1);
        assert_eq!(edited[0]["id"], 1);
        assert_eq!(edited[0]["content"], "final");
        assert_eq!(edited[0]["is_edited"], true);
    }
}
