//! Headless protocol client.
//!
//! Owns a local replica of the room document plus a local view of the
//! room's awareness state, and speaks the same wire protocol as a browser
//! peer. Used by the integration suites as a real second replica, and
//! usable by any Rust process that wants to join a room.
//!
//! Connection lifecycle: [`CollabClient::connect`] dials
//! `ws://host/<room_id>`, sends sync step 1, and spawns reader/writer
//! tasks. Edits made while disconnected are not queued anywhere — the
//! state-vector handshake on the next connect replays exactly the missing
//! delta, which is the CRDT-native form of an offline queue.

use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use yrs::sync::{AwarenessUpdate, AwarenessUpdateEntry, Message as ProtoMessage, SyncMessage};

use crate::awareness::AwarenessRegistry;
use crate::document::SharedDoc;
use crate::protocol;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established, handshake sent.
    Connected,
    /// A handshake reply was applied; the local replica has caught up.
    Synced,
    /// A remote incremental update was applied to the local replica.
    RemoteUpdate(Vec<u8>),
    /// The room's awareness state changed.
    AwarenessChanged {
        added: Vec<u64>,
        updated: Vec<u64>,
        removed: Vec<u64>,
    },
    /// The server refused or evicted us with a coded close frame.
    Rejected { code: u16, reason: String },
    /// Connection lost.
    Disconnected,
}

/// A protocol-speaking replica of one room.
pub struct CollabClient {
    server_url: String,
    room_id: String,
    doc: Arc<SharedDoc>,
    awareness: Arc<StdMutex<AwarenessRegistry>>,
    awareness_clock: u32,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            doc: Arc::new(SharedDoc::new(true)),
            awareness: Arc::new(StdMutex::new(AwarenessRegistry::new())),
            awareness_clock: 0,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// The local document replica.
    pub fn doc(&self) -> &SharedDoc {
        &self.doc
    }

    /// The awareness client id this replica publishes under.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Live awareness client ids as seen by this replica.
    pub fn awareness_clients(&self) -> Vec<u64> {
        self.awareness
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .live_clients()
    }

    /// Presence payload of one client, if live.
    pub fn awareness_state_of(&self, client_id: u64) -> Option<String> {
        self.awareness
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .state_of(client_id)
            .map(|s| s.to_string())
    }

    /// Connect and run the handshake. Spawns reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url, self.room_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: drain the outgoing channel into the socket. Closing
        // the channel sends a clean close frame.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(frame.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Step 1: tell the server what we have (replays offline edits via
        // the server's step-2 request for what *it* is missing).
        out_tx
            .send(protocol::sync_step1(self.doc.state_vector()))
            .await
            .map_err(|_| ClientError::NotConnected)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: apply protocol messages to the local replica. It
        // holds only a weak sender, so dropping `outgoing_tx` in close()
        // still shuts the writer down.
        let doc = self.doc.clone();
        let awareness = self.awareness.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let reply_tx = out_tx.downgrade();
        drop(out_tx);
        tokio::spawn(async move {
            while let Some(incoming) = ws_reader.next().await {
                match incoming {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let message = match protocol::decode(&bytes) {
                            Ok(message) => message,
                            Err(e) => {
                                log::warn!("client dropped malformed frame: {e}");
                                continue;
                            }
                        };
                        match message {
                            ProtoMessage::Sync(SyncMessage::SyncStep1(remote_sv)) => {
                                let diff = doc.diff(&remote_sv);
                                let Some(tx) = reply_tx.upgrade() else {
                                    break;
                                };
                                if tx.send(protocol::sync_step2(diff)).await.is_err() {
                                    break;
                                }
                            }
                            ProtoMessage::Sync(SyncMessage::SyncStep2(update)) => {
                                match doc.apply_update(&update) {
                                    Ok(()) => {
                                        let _ = event_tx.send(ClientEvent::Synced).await;
                                    }
                                    Err(e) => log::warn!("client rejected step 2: {e}"),
                                }
                            }
                            ProtoMessage::Sync(SyncMessage::Update(update)) => {
                                match doc.apply_update(&update) {
                                    Ok(()) => {
                                        let _ =
                                            event_tx.send(ClientEvent::RemoteUpdate(update)).await;
                                    }
                                    Err(e) => log::warn!("client rejected update: {e}"),
                                }
                            }
                            ProtoMessage::Awareness(update) => {
                                let change = {
                                    let mut registry =
                                        awareness.lock().unwrap_or_else(|p| p.into_inner());
                                    registry.apply(&update)
                                };
                                if !change.is_empty() {
                                    let _ = event_tx
                                        .send(ClientEvent::AwarenessChanged {
                                            added: change.added,
                                            updated: change.updated,
                                            removed: change.removed,
                                        })
                                        .await;
                                }
                            }
                            other => {
                                log::debug!("client ignoring message: {other:?}");
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            if let CloseCode::Library(code) = frame.code {
                                let _ = event_tx
                                    .send(ClientEvent::Rejected {
                                        code,
                                        reason: frame.reason.as_str().to_string(),
                                    })
                                    .await;
                            }
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("client socket error: {e}");
                        break;
                    }
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Apply a local text insert and publish the incremental update.
    pub async fn insert_text(
        &self,
        field: &str,
        index: u32,
        chunk: &str,
    ) -> Result<(), ClientError> {
        let update = self.doc.insert_text(field, index, chunk);
        self.send_if_connected(protocol::sync_update(update)).await
    }

    /// Apply a local text delete and publish the incremental update.
    pub async fn remove_text(&self, field: &str, index: u32, len: u32) -> Result<(), ClientError> {
        let update = self.doc.remove_text(field, index, len);
        self.send_if_connected(protocol::sync_update(update)).await
    }

    /// Publish our presence payload (JSON).
    pub async fn set_awareness(&mut self, json: &str) -> Result<(), ClientError> {
        self.awareness_clock += 1;
        let mut clients = std::collections::HashMap::new();
        clients.insert(
            self.client_id(),
            AwarenessUpdateEntry {
                clock: self.awareness_clock,
                json: json.into(),
            },
        );
        let update = AwarenessUpdate {
            clients: clients.into_iter().collect(),
        };

        // Mirror locally so our own entry shows in awareness_clients().
        {
            let mut registry = self.awareness.lock().unwrap_or_else(|p| p.into_inner());
            registry.apply(&update);
        }

        self.send_if_connected(protocol::awareness(update)).await
    }

    /// Close the connection cleanly. Local edits remain in the replica.
    pub async fn close(&mut self) {
        // Dropping the channel ends the writer task, which sends the close
        // frame on its way out.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub fn text_content(&self, field: &str) -> Option<String> {
        self.doc.text_content(field)
    }

    async fn send_if_connected(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        // A disconnected replica just edits locally; the next handshake
        // carries the delta.
        let Some(tx) = &self.outgoing_tx else {
            return Ok(());
        };
        tx.send(frame).await.map_err(|_| ClientError::NotConnected)
    }
}

/// Client errors.
#[derive(Debug, Clone)]
pub enum ClientError {
    Connect(String),
    NotConnected,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "connect failed: {e}"),
            ClientError::NotConnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for ClientError {}
