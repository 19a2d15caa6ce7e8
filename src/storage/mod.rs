//! Durable storage for collaborative documents.
//!
//! The engine never assumes a particular storage engine; it needs exactly
//! two semantics with in-process read-after-write consistency:
//!
//! ```text
//! ┌──────────────┐   append_update   ┌───────────────────────────┐
//! │ live room    │ ────────────────► │ update log (append-only)  │
//! │ (in memory)  │                   ├───────────────────────────┤
//! │              │   save_snapshot   │ latest snapshot           │
//! │              │ ────────────────► │ (replaces log)            │
//! └──────────────┘                   └───────────────────────────┘
//! ```
//!
//! Readers reconstruct a document by replaying the snapshot and then the
//! appended updates; CRDT merge makes the replay safe under any
//! interleaving of concurrent appends.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod memory;
pub mod rocks;

pub use memory::MemoryStorage;
pub use rocks::{RocksStorage, StorageConfig};

/// The persistence collaborator.
pub trait DocStorage: Send + Sync {
    /// Latest durable snapshot for a room, if one exists.
    fn load_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Updates appended since the latest snapshot, in append order.
    fn load_updates(&self, room_id: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Append one update to the room's log. Returns the sequence number.
    fn append_update(&self, room_id: &str, update: &[u8]) -> Result<u64, StoreError>;

    /// Persist a full snapshot and clear the update log it supersedes.
    fn save_snapshot(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError>;

    /// Room ids with any durable state, for recovery reporting.
    fn list_rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure.
    Database(String),
    /// Record encode/decode failed.
    Serialization(String),
    /// Compressed payload could not be restored.
    Compression(String),
    /// No record for the given room.
    NotFound(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::Serialization(e) => write!(f, "serialization error: {e}"),
            StoreError::Compression(e) => write!(f, "compression error: {e}"),
            StoreError::NotFound(id) => write!(f, "room not found: {id}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
