//! RocksDB-backed storage.
//!
//! Column families:
//! - `snapshots` — full document states, one per room (LZ4 compressed)
//! - `updates`   — append-only update log (LZ4 compressed, keyed `room/seq`)
//! - `rooms`     — room records written by the matching service (bincode)
//! - `metadata`  — per-room counters and timestamps (bincode)
//!
//! Snapshots and the update log together satisfy the durability invariant:
//! after a flush, replaying `snapshots[room]` plus `updates[room/*]`
//! reconstructs the document exactly. Appends are atomic single-key writes,
//! so interleaved writers cannot tear the log.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, log-structured storage)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use uuid::Uuid;

use super::{DocStorage, StoreError};
use crate::rooms::{RoomDirectory, RoomRecord};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_ROOMS: &str = "rooms";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_ROOMS, CF_METADATA];

/// Separator between room id and sequence number in update keys. Room ids
/// come from a path segment and can never contain it.
const KEY_SEPARATOR: u8 = b'/';

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pairpad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-room counters stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomDocMeta {
    pub room_id: String,
    /// Updates currently in the log (reset on snapshot).
    pub update_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl RoomDocMeta {
    fn new(room_id: &str) -> Self {
        let now = epoch_secs();
        Self {
            room_id: room_id.to_string(),
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed document store and room directory.
pub struct RocksStorage {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StorageConfig,
    /// Global sequence number for update-log keys
    sequence: AtomicU64,
}

impl RocksStorage {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StorageConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StorageConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed by us before the write; skip a second pass.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Large values, one per room, point-looked-up
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Many small writes, prefix-scanned by room id
                opts.set_max_write_buffer_number(4);
            }
            CF_ROOMS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Recover the next sequence number by scanning the update log.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_UPDATES) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut max_seq = None;
        for item in db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = match item {
                Ok(kv) => kv,
                Err(_) => continue,
            };
            if let Some(seq) = Self::seq_from_key(&key) {
                max_seq = Some(max_seq.map_or(seq, |m: u64| m.max(seq)));
            }
        }

        max_seq.map_or(0, |m| m + 1)
    }

    /// Build an update key: `room_id` + `/` + sequence (8 bytes big-endian).
    fn update_key(room_id: &str, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(room_id.len() + 9);
        key.extend_from_slice(room_id.as_bytes());
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn update_prefix(room_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(room_id.len() + 1);
        prefix.extend_from_slice(room_id.as_bytes());
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    fn seq_from_key(key: &[u8]) -> Option<u64> {
        if key.len() < 9 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[key.len() - 8..]);
        Some(u64::from_be_bytes(buf))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn load_meta(&self, room_id: &str) -> Result<RoomDocMeta, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => RoomDocMeta::decode(&bytes),
            None => Err(StoreError::NotFound(room_id.to_string())),
        }
    }

    /// Per-room counters, for diagnostics and tests.
    pub fn metadata(&self, room_id: &str) -> Result<RoomDocMeta, StoreError> {
        self.load_meta(room_id)
    }

    /// Next sequence number that would be assigned.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl DocStorage for RocksStorage {
    fn load_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(compressed) => {
                let snapshot = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn load_updates(&self, room_id: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = Self::update_prefix(room_id);

        let mut updates = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            updates.push(update);
        }

        Ok(updates)
    }

    fn append_update(&self, room_id: &str, update: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = Self::update_key(room_id, seq);
        let compressed = lz4_flex::compress_prepend_size(update);

        let mut meta = self
            .load_meta(room_id)
            .unwrap_or_else(|_| RoomDocMeta::new(room_id));
        meta.update_count += 1;
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, &key, &compressed);
        batch.put_cf(&cf_meta, room_id.as_bytes(), &meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(seq)
    }

    fn save_snapshot(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_meta(room_id)
            .unwrap_or_else(|_| RoomDocMeta::new(room_id));
        meta.update_count = 0;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = epoch_secs();

        // One atomic batch: the new snapshot replaces the log it supersedes.
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, room_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room_id.as_bytes(), &meta.encode()?);

        let prefix = Self::update_prefix(room_id);
        let iter = self.db.iterator_cf(
            &cf_updates,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_updates, &key);
        }

        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            match std::str::from_utf8(&key) {
                Ok(id) => rooms.push(id.to_string()),
                Err(_) => continue,
            }
        }
        Ok(rooms)
    }
}

impl RoomDirectory for RocksStorage {
    fn fetch(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => Ok(Some(RoomRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert(&self, record: RoomRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        self.db
            .put_cf_opt(&cf, record.room_id.as_bytes(), &record.encode()?, &self.write_opts())?;
        Ok(())
    }

    fn close_room(&self, room_id: &str) -> Result<(), StoreError> {
        let mut record = self
            .fetch(room_id)?
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))?;
        record.open = false;
        self.insert(record)
    }

    fn mark_forfeit(&self, room_id: &str, user_id: Uuid) -> Result<(), StoreError> {
        let mut record = self
            .fetch(room_id)?
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))?;
        for participant in record.participants.iter_mut() {
            if participant.user_id == user_id {
                participant.forfeited = true;
            }
        }
        self.insert(record)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
