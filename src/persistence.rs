//! Bridges the in-memory document lifecycle to durable storage.
//!
//! Three operations, matching the three moments in a room's life:
//!
//! - [`PersistenceAdapter::bind`] — first attach: replay the latest
//!   snapshot and the appended update log into a fresh document. A failure
//!   here is fatal to the activation attempt.
//! - [`PersistenceAdapter::append`] — steady state: fire-and-forget append
//!   of each applied update. A failed append is logged and never blocks or
//!   fails the live edit path; the gap it leaves closes at the next flush.
//! - [`PersistenceAdapter::flush`] — last disconnect: synchronous
//!   full-state snapshot, superseding the update log.

use std::sync::Arc;

use crate::document::SharedDoc;
use crate::storage::{DocStorage, StoreError};

/// The single writer path into durable storage.
#[derive(Clone)]
pub struct PersistenceAdapter {
    storage: Arc<dyn DocStorage>,
}

impl PersistenceAdapter {
    pub fn new(storage: Arc<dyn DocStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn DocStorage> {
        &self.storage
    }

    /// Rebuild a room's document from durable state.
    ///
    /// A missing snapshot means a fresh room. A snapshot that fails to
    /// apply is corrupt and aborts the bind; an individual logged update
    /// that fails to apply is skipped with a warning — the log tail may be
    /// torn by a crash mid-append, and merge semantics make skipping safe.
    pub fn bind(&self, room_id: &str, doc: &SharedDoc) -> Result<(), StoreError> {
        if let Some(snapshot) = self.storage.load_snapshot(room_id)? {
            doc.apply_update(&snapshot).map_err(|e| {
                StoreError::Serialization(format!("snapshot for {room_id} did not apply: {e}"))
            })?;
        }

        let updates = self.storage.load_updates(room_id)?;
        let total = updates.len();
        let mut skipped = 0usize;
        for update in updates {
            if let Err(e) = doc.apply_update(&update) {
                skipped += 1;
                log::warn!("skipping unreadable logged update for room {room_id}: {e}");
            }
        }

        if skipped > 0 {
            log::warn!("room {room_id}: replayed {} of {total} logged updates", total - skipped);
        } else {
            log::debug!("room {room_id}: bound from storage ({total} logged updates)");
        }
        Ok(())
    }

    /// Append one update asynchronously. Errors are logged, not surfaced.
    pub fn append(&self, room_id: &str, update: Vec<u8>) {
        let storage = self.storage.clone();
        let room_id = room_id.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = storage.append_update(&room_id, &update) {
                log::error!("failed to persist update for room {room_id}: {e}");
            }
        });
    }

    /// Persist the full current state before the room leaves memory.
    pub fn flush(&self, room_id: &str, doc: &SharedDoc) -> Result<(), StoreError> {
        let snapshot = doc.encode_state_as_update();
        self.storage.save_snapshot(room_id, &snapshot)?;
        log::info!("flushed snapshot for room {room_id} ({} bytes)", snapshot.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn adapter() -> (Arc<MemoryStorage>, PersistenceAdapter) {
        let storage = Arc::new(MemoryStorage::new());
        let adapter = PersistenceAdapter::new(storage.clone());
        (storage, adapter)
    }

    #[test]
    fn test_bind_empty_room() {
        let (_storage, adapter) = adapter();
        let doc = SharedDoc::new(true);
        adapter.bind("r1", &doc).unwrap();
        assert!(doc.text_content("content").is_none());
    }

    #[test]
    fn test_flush_then_bind_roundtrip() {
        let (_storage, adapter) = adapter();

        let doc = SharedDoc::new(true);
        doc.insert_text("content", 0, "durable text");
        adapter.flush("r1", &doc).unwrap();

        // Discard the in-memory copy, rebind from storage.
        let restored = SharedDoc::new(true);
        adapter.bind("r1", &restored).unwrap();
        assert_eq!(restored.text_content("content").as_deref(), Some("durable text"));
        assert_eq!(restored.encode_state_vector(), doc.encode_state_vector());
    }

    #[test]
    fn test_bind_replays_appended_updates() {
        let (storage, adapter) = adapter();

        let doc = SharedDoc::new(true);
        let u1 = doc.insert_text("content", 0, "ab");
        let u2 = doc.insert_text("content", 2, "cd");
        storage.append_update("r1", &u1).unwrap();
        storage.append_update("r1", &u2).unwrap();

        let restored = SharedDoc::new(true);
        adapter.bind("r1", &restored).unwrap();
        assert_eq!(restored.text_content("content").as_deref(), Some("abcd"));
    }

    #[test]
    fn test_bind_skips_torn_log_entry() {
        let (storage, adapter) = adapter();

        let doc = SharedDoc::new(true);
        let good = doc.insert_text("content", 0, "kept");
        storage.append_update("r1", &good).unwrap();
        storage.append_update("r1", &[0xFF, 0xFF]).unwrap();

        let restored = SharedDoc::new(true);
        adapter.bind("r1", &restored).unwrap();
        assert_eq!(restored.text_content("content").as_deref(), Some("kept"));
    }

    #[test]
    fn test_corrupt_snapshot_aborts_bind() {
        let (storage, adapter) = adapter();
        storage.save_snapshot("r1", &[0xDE, 0xAD]).unwrap();

        let doc = SharedDoc::new(true);
        assert!(adapter.bind("r1", &doc).is_err());
    }

    #[tokio::test]
    async fn test_append_is_fire_and_forget() {
        let (storage, adapter) = adapter();

        let doc = SharedDoc::new(true);
        let update = doc.insert_text("content", 0, "async");
        adapter.append("r1", update);

        // The append lands without the caller waiting on it.
        for _ in 0..50 {
            if storage.update_count("r1") == 1 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("append never landed");
    }
}
