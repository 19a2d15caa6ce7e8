//! Awareness tests: presence propagates while a connection lives, and its
//! removal is broadcast the moment the connection dies.

use pairpad_collab::{
    ClientEvent, CollabClient, CollabServer, MemoryRoomDirectory, MemoryStorage, Participant,
    RoomDirectory, RoomRecord, ServerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
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

async fn start_test_server(directory: Arc<MemoryRoomDirectory>) -> String {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = CollabServer::new(config, Arc::new(MemoryStorage::new()), directory);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

/// Wait for the next awareness event matching the predicate.
async fn wait_for_awareness<F>(
    events: &mut mpsc::Receiver<ClientEvent>,
    what: &str,
    mut predicate: F,
) -> (Vec<u64>, Vec<u64>, Vec<u64>)
where
    F: FnMut(&[u64], &[u64], &[u64]) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(ClientEvent::AwarenessChanged {
                    added,
                    updated,
                    removed,
                }) => {
                    if predicate(&added, &updated, &removed) {
                        return (added, updated, removed);
                    }
                }
                Some(_) => continue,
                None => panic!("event channel closed while waiting for {what}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

#[tokio::test]
async fn test_presence_propagates_between_peers() {
    let directory = Arc::new(MemoryRoomDirectory::new());
    directory.insert(seeded_room("r1")).unwrap();
    let url = start_test_server(directory).await;

    let mut alice = CollabClient::new(&url, "r1");
    alice.connect().await.unwrap();
    let mut bob = CollabClient::new(&url, "r1");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    let alice_id = alice.client_id();
    alice
        .set_awareness(r#"{"name":"alice","color":"pink"}"#)
        .await
        .unwrap();

    wait_for_awareness(&mut bob_events, "alice's presence", |added, _, _| {
        added.contains(&alice_id)
    })
    .await;

    assert_eq!(
        bob.awareness_state_of(alice_id).as_deref(),
        Some(r#"{"name":"alice","color":"pink"}"#)
    );
}

#[tokio::test]
async fn test_new_joiner_sees_existing_presence() {
    let directory = Arc::new(MemoryRoomDirectory::new());
    directory.insert(seeded_room("r1")).unwrap();
    let url = start_test_server(directory).await;

    let mut alice = CollabClient::new(&url, "r1");
    alice.connect().await.unwrap();
    alice.set_awareness(r#"{"name":"alice"}"#).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    // Bob joins afterwards; the server pushes the awareness snapshot.
    let mut bob = CollabClient::new(&url, "r1");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    let alice_id = alice.client_id();
    wait_for_awareness(&mut bob_events, "the presence snapshot", |added, _, _| {
        added.contains(&alice_id)
    })
    .await;
}

#[tokio::test]
async fn test_disconnect_removes_exactly_that_client() {
    let directory = Arc::new(MemoryRoomDirectory::new());
    directory.insert(seeded_room("r1")).unwrap();
    let url = start_test_server(directory).await;

    let mut alice = CollabClient::new(&url, "r1");
    alice.connect().await.unwrap();
    let mut bob = CollabClient::new(&url, "r1");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    let alice_id = alice.client_id();
    let bob_id = bob.client_id();

    alice.set_awareness(r#"{"name":"alice"}"#).await.unwrap();
    bob.set_awareness(r#"{"name":"bob"}"#).await.unwrap();

    wait_for_awareness(&mut bob_events, "alice's presence", |added, _, _| {
        added.contains(&alice_id)
    })
    .await;

    alice.close().await;

    // One broadcast reflecting the removal, alice's entries only.
    let (added, updated, removed) =
        wait_for_awareness(&mut bob_events, "alice's departure", |_, _, removed| {
            !removed.is_empty()
        })
        .await;
    assert_eq!(removed, vec![alice_id]);
    assert!(added.is_empty() && updated.is_empty());

    // Bob's view: alice gone, his own entry untouched.
    assert!(!bob.awareness_clients().contains(&alice_id));
    assert!(bob.awareness_clients().contains(&bob_id));
    assert_eq!(
        bob.awareness_state_of(bob_id).as_deref(),
        Some(r#"{"name":"bob"}"#)
    );
}

#[tokio::test]
async fn test_presence_updates_are_last_write_wins() {
    let directory = Arc::new(MemoryRoomDirectory::new());
    directory.insert(seeded_room("r1")).unwrap();
    let url = start_test_server(directory).await;

    let mut alice = CollabClient::new(&url, "r1");
    alice.connect().await.unwrap();
    let mut bob = CollabClient::new(&url, "r1");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    let alice_id = alice.client_id();
    alice.set_awareness(r#"{"cursor":1}"#).await.unwrap();
    alice.set_awareness(r#"{"cursor":2}"#).await.unwrap();
    alice.set_awareness(r#"{"cursor":3}"#).await.unwrap();

    wait_for_awareness(&mut bob_events, "the last cursor position", |a, u, _| {
        a.contains(&alice_id) || u.contains(&alice_id)
    })
    .await;

    for _ in 0..150 {
        if bob.awareness_state_of(alice_id).as_deref() == Some(r#"{"cursor":3}"#) {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("bob never converged on alice's latest presence");
}
