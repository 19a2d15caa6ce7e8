//! In-memory storage backend for tests and single-process embedding.
//!
//! Same trait, same semantics as the RocksDB backend, no durability across
//! process restarts. Useful wherever a test needs to observe or share the
//! persisted state of a server without touching disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{DocStorage, StoreError};

#[derive(Debug, Default)]
struct RoomSlot {
    snapshot: Option<Vec<u8>>,
    updates: Vec<Vec<u8>>,
}

/// HashMap-backed [`DocStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    rooms: RwLock<HashMap<String, RoomSlot>>,
    sequence: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of updates currently logged for a room.
    pub fn update_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        rooms.get(room_id).map_or(0, |slot| slot.updates.len())
    }

    /// Whether a snapshot has been flushed for a room.
    pub fn has_snapshot(&self, room_id: &str) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        rooms
            .get(room_id)
            .is_some_and(|slot| slot.snapshot.is_some())
    }
}

impl DocStorage for MemoryStorage {
    fn load_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        Ok(rooms.get(room_id).and_then(|slot| slot.snapshot.clone()))
    }

    fn load_updates(&self, room_id: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        Ok(rooms
            .get(room_id)
            .map(|slot| slot.updates.clone())
            .unwrap_or_default())
    }

    fn append_update(&self, room_id: &str, update: &[u8]) -> Result<u64, StoreError> {
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        rooms
            .entry(room_id.to_string())
            .or_default()
            .updates
            .push(update.to_vec());
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst))
    }

    fn save_snapshot(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        let slot = rooms.entry(room_id.to_string()).or_default();
        slot.snapshot = Some(snapshot.to_vec());
        slot.updates.clear();
        Ok(())
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<String> = rooms.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_room_loads_nothing() {
        let storage = MemoryStorage::new();
        assert!(storage.load_snapshot("r1").unwrap().is_none());
        assert!(storage.load_updates("r1").unwrap().is_empty());
    }

    #[test]
    fn test_append_preserves_order() {
        let storage = MemoryStorage::new();
        storage.append_update("r1", b"a").unwrap();
        storage.append_update("r1", b"b").unwrap();
        storage.append_update("r1", b"c").unwrap();

        let updates = storage.load_updates("r1").unwrap();
        assert_eq!(updates, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_snapshot_clears_log() {
        let storage = MemoryStorage::new();
        storage.append_update("r1", b"a").unwrap();
        storage.append_update("r1", b"b").unwrap();

        storage.save_snapshot("r1", b"state").unwrap();
        assert_eq!(storage.load_snapshot("r1").unwrap().unwrap(), b"state");
        assert!(storage.load_updates("r1").unwrap().is_empty());
    }

    #[test]
    fn test_rooms_are_isolated() {
        let storage = MemoryStorage::new();
        storage.append_update("r1", b"one").unwrap();
        storage.append_update("r2", b"two").unwrap();

        assert_eq!(storage.load_updates("r1").unwrap(), vec![b"one".to_vec()]);
        assert_eq!(storage.load_updates("r2").unwrap(), vec![b"two".to_vec()]);
        assert_eq!(storage.list_rooms().unwrap(), vec!["r1", "r2"]);
    }
}
