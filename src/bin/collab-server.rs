//! Standalone synchronization server.
//!
//! Configuration comes from the environment:
//! - `PAIRPAD_BIND` — listen address (default `127.0.0.1:9090`)
//! - `PAIRPAD_DATA` — RocksDB directory (default `pairpad_data`)
//!
//! Room records are written into the same database by the matching
//! service; this process only reads them.

use std::sync::Arc;

use pairpad_collab::storage::DocStorage;
use pairpad_collab::{CollabServer, RocksStorage, ServerConfig, StorageConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr =
        std::env::var("PAIRPAD_BIND").unwrap_or_else(|_| "127.0.0.1:9090".to_string());
    let data_dir = std::env::var("PAIRPAD_DATA").unwrap_or_else(|_| "pairpad_data".to_string());

    let storage = Arc::new(RocksStorage::open(StorageConfig {
        path: data_dir.clone().into(),
        ..StorageConfig::default()
    })?);

    let surviving = storage.list_rooms()?;
    if !surviving.is_empty() {
        log::info!(
            "{} room(s) with durable state in {data_dir}",
            surviving.len()
        );
    }

    let config = ServerConfig {
        bind_addr,
        ..ServerConfig::default()
    };
    let server = CollabServer::new(config, storage.clone(), storage);
    server.run().await
}
