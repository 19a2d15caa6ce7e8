//! Persistence tests: a document survives process restarts and repeated
//! collaboration sessions.

use pairpad_collab::storage::DocStorage;
use pairpad_collab::{
    CollabClient, CollabServer, MemoryRoomDirectory, MemoryStorage, Participant,
    PersistenceAdapter, RocksStorage, RoomDirectory, RoomRecord, ServerConfig, SharedDoc,
    StorageConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::sleep;
use uuid::Uuid;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn seeded_room(room_id: &str) -> RoomRecord {
    RoomRecord::new(
        room_id,
        [
            Participant::new(Uuid::new_v4(), "alice"),
            Participant::new(Uuid::new_v4(), "bob"),
        ],
        Uuid::new_v4(),
    )
}

async fn start_test_server(
    storage: Arc<MemoryStorage>,
    directory: Arc<MemoryRoomDirectory>,
) -> (String, Arc<pairpad_collab::RoomRegistry>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = CollabServer::new(config, storage, directory);
    let registry = server.registry();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), registry)
}

async fn wait_for_drain(registry: &pairpad_collab::RoomRegistry) {
    for _ in 0..150 {
        if registry.room_count().await == 0 {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("room never drained");
}

// ─── Adapter round trips ─────────────────────────────────────────────────────

#[test]
fn test_flush_discard_rebind_reproduces_state() {
    let storage = Arc::new(MemoryStorage::new());
    let adapter = PersistenceAdapter::new(storage);

    let doc = SharedDoc::new(true);
    doc.insert_text("content", 0, "struct Foo;");
    doc.insert_text("content", 11, "\nstruct Bar;");
    let state_before = doc.encode_state_as_update();

    adapter.flush("r1", &doc).unwrap();
    drop(doc);

    let restored = SharedDoc::new(true);
    adapter.bind("r1", &restored).unwrap();
    assert_eq!(restored.encode_state_as_update(), state_before);
    assert_eq!(
        restored.text_content("content").as_deref(),
        Some("struct Foo;\nstruct Bar;")
    );
}

#[test]
fn test_rocks_round_trip_across_reopen() {
    let dir = tempdir().unwrap();
    let config = StorageConfig::for_testing(dir.path().join("db"));

    let doc = SharedDoc::new(true);
    doc.insert_text("content", 0, "survives the process");

    {
        let storage = Arc::new(RocksStorage::open(config.clone()).unwrap());
        let adapter = PersistenceAdapter::new(storage);
        adapter.flush("r1", &doc).unwrap();
    }

    // "Restart": fresh handle over the same directory.
    let storage = Arc::new(RocksStorage::open(config).unwrap());
    let adapter = PersistenceAdapter::new(storage);
    let restored = SharedDoc::new(true);
    adapter.bind("r1", &restored).unwrap();

    assert_eq!(
        restored.text_content("content").as_deref(),
        Some("survives the process")
    );
    assert_eq!(restored.encode_state_vector(), doc.encode_state_vector());
}

#[test]
fn test_rebind_merges_snapshot_with_logged_updates() {
    let storage = Arc::new(MemoryStorage::new());
    let adapter = PersistenceAdapter::new(storage.clone());

    let doc = SharedDoc::new(true);
    doc.insert_text("content", 0, "base");
    adapter.flush("r1", &doc).unwrap();

    // Updates appended after the snapshot, as the async path would.
    let tail = doc.insert_text("content", 4, " + tail");
    storage.append_update("r1", &tail).unwrap();

    let restored = SharedDoc::new(true);
    adapter.bind("r1", &restored).unwrap();
    assert_eq!(restored.text_content("content").as_deref(), Some("base + tail"));
}

// ─── Through the server stack ────────────────────────────────────────────────

#[tokio::test]
async fn test_session_updates_are_appended_async() {
    let storage = Arc::new(MemoryStorage::new());
    let directory = Arc::new(MemoryRoomDirectory::new());
    directory.insert(seeded_room("r1")).unwrap();
    let (url, _registry) = start_test_server(storage.clone(), directory).await;

    let mut alice = CollabClient::new(&url, "r1");
    alice.connect().await.unwrap();
    alice.insert_text("content", 0, "logged").await.unwrap();

    // The append is fire-and-forget; it lands shortly after the edit.
    for _ in 0..150 {
        if storage.update_count("r1") >= 1 {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("update never reached the log");
}

#[tokio::test]
async fn test_final_flush_compacts_log() {
    let storage = Arc::new(MemoryStorage::new());
    let directory = Arc::new(MemoryRoomDirectory::new());
    directory.insert(seeded_room("r1")).unwrap();
    let (url, registry) = start_test_server(storage.clone(), directory).await;

    let mut alice = CollabClient::new(&url, "r1");
    alice.connect().await.unwrap();
    alice.insert_text("content", 0, "one").await.unwrap();
    alice.insert_text("content", 3, " two").await.unwrap();
    sleep(Duration::from_millis(200)).await;

    alice.close().await;
    wait_for_drain(&registry).await;

    assert!(storage.has_snapshot("r1"));
    assert_eq!(storage.update_count("r1"), 0);
}

#[tokio::test]
async fn test_document_survives_server_restart() {
    let storage = Arc::new(MemoryStorage::new());
    let directory = Arc::new(MemoryRoomDirectory::new());
    directory.insert(seeded_room("r1")).unwrap();

    // First session.
    {
        let (url, registry) = start_test_server(storage.clone(), directory.clone()).await;
        let mut alice = CollabClient::new(&url, "r1");
        alice.connect().await.unwrap();
        alice
            .insert_text("content", 0, "written in session one")
            .await
            .unwrap();
        sleep(Duration::from_millis(200)).await;
        alice.close().await;
        wait_for_drain(&registry).await;
    }

    // "Restart": a new server over the same storage.
    let (url, _registry) = start_test_server(storage, directory).await;
    let mut bob = CollabClient::new(&url, "r1");
    bob.connect().await.unwrap();

    for _ in 0..150 {
        if bob.text_content("content").as_deref() == Some("written in session one") {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("restarted server never served the persisted document");
}

#[tokio::test]
async fn test_second_session_extends_first() {
    let storage = Arc::new(MemoryStorage::new());
    let directory = Arc::new(MemoryRoomDirectory::new());
    directory.insert(seeded_room("r1")).unwrap();
    let (url, registry) = start_test_server(storage, directory).await;

    {
        let mut alice = CollabClient::new(&url, "r1");
        alice.connect().await.unwrap();
        alice.insert_text("content", 0, "first").await.unwrap();
        sleep(Duration::from_millis(200)).await;
        alice.close().await;
        wait_for_drain(&registry).await;
    }

    let mut bob = CollabClient::new(&url, "r1");
    bob.connect().await.unwrap();
    for _ in 0..150 {
        if bob.text_content("content").as_deref() == Some("first") {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    bob.insert_text("content", 5, " second").await.unwrap();

    for _ in 0..150 {
        if bob.text_content("content").as_deref() == Some("first second") {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("second session failed to extend the document");
}
