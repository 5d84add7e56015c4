//! Offline inspection of a chat journal file.
//!
//! Usage: `journal-inspect [PATH]` (defaults to `JOURNAL_PATH`). Prints a
//! per-record-type summary and replays the file into a scratch store to
//! report how many records would be applied on startup.

use anyhow::{bail, Context, Result};
use chat_sync_service::config::Config;
use chat_sync_service::services::{ChatIndex, FileJournal, MemoryJournal, MessageStore};
use chat_sync_service::services::message_store::StoreOptions;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    chat_sync_service::logging::init_tracing();

    let path = match std::env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => {
            dotenvy::dotenv().ok();
            match std::env::var("JOURNAL_PATH") {
                Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
                _ => bail!("no journal given: pass a path or set JOURNAL_PATH"),
            }
        }
    };
    if !path.exists() {
        bail!("journal {} does not exist", path.display());
    }

    let records = FileJournal::read_records(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let mut by_kind: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut chats = BTreeMap::new();
    for record in &records {
        *by_kind.entry(record.kind()).or_default() += 1;
        *chats.entry(record.chat_id()).or_insert(0usize) += 1;
    }

    println!("journal: {}", path.display());
    println!("records: {}", records.len());
    for (kind, count) in &by_kind {
        println!("  {kind:<18} {count}");
    }
    println!("chats referenced: {}", chats.len());

    // Replay into a store whose journal discards writes
    let store = MessageStore::new(
        Arc::new(MemoryJournal),
        Arc::new(ChatIndex::new()),
        StoreOptions::from_config(&Config::test_defaults()),
    );
    let stats = store.restore(records).await;
    println!(
        "replay: {} live chats, {} messages, {} records skipped",
        store.chat_count(),
        stats.messages,
        stats.skipped
    );
    Ok(())
}
