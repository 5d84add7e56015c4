use crate::{
    config::Config,
    error::{AppError, AppResult},
    models::MediaRef,
    services::{
        chat_index::ChatIndex,
        cursor_tracker::CursorTracker,
        journal::{FileJournal, Journal, MemoryJournal},
        media::{LocalMediaStore, MediaStore},
        message_store::{MessageStore, StoreOptions},
        sync_engine::SyncEngine,
    },
    websocket::Dispatcher,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<MessageStore>,
    pub index: Arc<ChatIndex>,
    pub cursors: Arc<CursorTracker>,
    pub sync: Arc<SyncEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub media: Arc<dyn MediaStore>,
}

impl AppState {
    /// Open the configured journal and rebuild state from it.
    pub async fn build(config: Config) -> AppResult<Self> {
        let journal: Arc<dyn Journal> = match &config.storage.journal_path {
            Some(path) => Arc::new(
                FileJournal::open(path)
                    .await
                    .map_err(|e| AppError::StartServer(format!("journal {}: {e}", path.display())))?,
            ),
            None => {
                tracing::warn!("JOURNAL_PATH not set, chat state is kept in memory only");
                Arc::new(MemoryJournal)
            }
        };
        let media: Arc<dyn MediaStore> = Arc::new(LocalMediaStore::new(&config.media));
        Self::with_backends(config, journal, media).await
    }

    pub async fn with_backends(
        config: Config,
        journal: Arc<dyn Journal>,
        media: Arc<dyn MediaStore>,
    ) -> AppResult<Self> {
        let records = journal
            .load()
            .await
            .map_err(|e| AppError::StartServer(format!("journal replay: {e}")))?;

        let index = Arc::new(ChatIndex::new());
        let store = Arc::new(MessageStore::new(
            journal,
            index.clone(),
            StoreOptions::from_config(&config),
        ));
        store.restore(records).await;

        // Whatever a user has read was delivered to them
        let cursors = Arc::new(CursorTracker::new());
        for (chat_id, user_id, up_to) in store.read_watermarks().await {
            cursors.advance_cursor(user_id, chat_id, up_to);
        }

        let sync = Arc::new(SyncEngine::new(store.clone(), cursors.clone(), &config.sync));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            sync.clone(),
            cursors.clone(),
            media.clone(),
            config.push_queue_capacity,
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            index,
            cursors,
            sync,
            dispatcher,
            media,
        })
    }

    /// In-memory state for tests
    pub async fn for_tests(config: Config) -> AppResult<Self> {
        let media: Arc<dyn MediaStore> = Arc::new(LocalMediaStore::new(&config.media));
        Self::with_backends(config, Arc::new(MemoryJournal), media).await
    }

    pub fn media_url(&self, media: &MediaRef) -> String {
        self.media.url_for(media)
    }
}
