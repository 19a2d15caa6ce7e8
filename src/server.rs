//! WebSocket synchronization server.
//!
//! ```text
//! Client A ──┐
//!             ├── ActiveRoom ── SharedDoc ── BroadcastGroup
//! Client B ──┘       │
//!                    ├── AwarenessRegistry (ephemeral)
//!                    └── PersistenceAdapter ── DocStorage
//! ```
//!
//! One event-driven process handles every connection. A connection names
//! its room in the request path (`ws://host/<room_id>`); the room record is
//! validated before the socket joins anything, and refusals carry a coded
//! close frame (4000 / 4001). Admitted connections complete the sync
//! handshake, receive the current awareness snapshot, and then relay: every
//! applied update is fanned out to the rest of the room and appended to
//! durable storage.
//!
//! There is no cross-connection locking (merge commutes) and no timeout on
//! the sync exchange itself. The only liveness mechanism is the
//! per-connection heartbeat: a fixed-interval ping, and a miss by the next
//! tick reclaims the socket through the normal close path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use yrs::sync::{Message as ProtoMessage, SyncMessage};

use crate::protocol::{self, RejectCode};
use crate::registry::{ActiveRoom, RoomFrame, RoomRegistry};
use crate::rooms::{self, RoomDirectory};
use crate::session::Session;
use crate::storage::DocStorage;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Liveness probe interval
    pub heartbeat_interval: Duration,
    /// Garbage-collect tombstones in room documents
    pub gc: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            gc: true,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Malformed envelopes plus inner updates that failed to apply.
    pub decode_errors: u64,
    pub active_rooms: usize,
}

/// The synchronization server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    directory: Arc<dyn RoomDirectory>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        storage: Arc<dyn DocStorage>,
        directory: Arc<dyn RoomDirectory>,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new(
            crate::persistence::PersistenceAdapter::new(storage),
            config.broadcast_capacity,
            config.gc,
        ));
        Self {
            config,
            registry,
            directory,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Handle to the room registry (shared with spawned connections).
    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Run the accept loop. Call from an async runtime; never returns
    /// under normal operation.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let config = self.config.clone();
            let registry = self.registry.clone();
            let directory = self.directory.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, config, registry, directory, stats).await
                {
                    log::warn!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from upgrade to cleanup.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: ServerConfig,
        registry: Arc<RoomRegistry>,
        directory: Arc<dyn RoomDirectory>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut request_path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, response: Response| {
            request_path = req.uri().path().to_string();
            Ok(response)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        stats.write().await.total_connections += 1;

        // Admission: validate the room before the socket joins anything.
        let record = match rooms::admit(directory.as_ref(), &request_path) {
            Ok(record) => record,
            Err(e) => {
                log::info!("refused connection from {addr}: {e}");
                stats.write().await.rejected_connections += 1;
                return Self::refuse(&mut ws_sender, e.reject_code(), e.reason()).await;
            }
        };

        let room = match registry.acquire(&record).await {
            Ok(room) => room,
            Err(e) => {
                log::error!("could not activate room {}: {e}", record.room_id);
                stats.write().await.rejected_connections += 1;
                return Self::refuse(
                    &mut ws_sender,
                    RejectCode::AuthFailed,
                    format!("room {} unavailable", record.room_id),
                )
                .await;
            }
        };

        let mut session = Session::new(record.room_id.clone());
        let room_rx = match registry.attach(&room, session.conn_id()).await {
            Ok(rx) => rx,
            Err(e) => {
                log::info!("refused connection from {addr}: {e}");
                stats.write().await.rejected_connections += 1;
                return Self::refuse(&mut ws_sender, e.reject_code(), e.reason()).await;
            }
        };

        {
            let mut s = stats.write().await;
            s.active_connections += 1;
            s.active_rooms = registry.room_count().await;
        }
        log::info!(
            "connection {} from {addr} joined room {}",
            session.conn_id(),
            session.room_id()
        );

        let result = Self::serve(
            &mut ws_sender,
            &mut ws_receiver,
            room_rx,
            &mut session,
            &room,
            &registry,
            &stats,
            &config,
        )
        .await;

        // Cleanup runs on every exit path: awareness entries cleared and
        // broadcast, registry refcount dropped, room drained when empty.
        registry
            .release(&room, session.conn_id(), &session.controlled_clients())
            .await;
        session.finish_close();
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = registry.room_count().await;
        }
        log::info!("connection {} left room {}", session.conn_id(), session.room_id());

        result
    }

    /// Close an unadmitted connection with a coded frame.
    async fn refuse(
        sender: &mut WsSink,
        code: RejectCode,
        reason: String,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        sender
            .send(Message::Close(Some(code.close_frame(reason))))
            .await?;
        Ok(())
    }

    /// Handshake plus steady-state relay for one admitted connection.
    async fn serve(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        mut room_rx: broadcast::Receiver<RoomFrame>,
        session: &mut Session,
        room: &Arc<ActiveRoom>,
        registry: &Arc<RoomRegistry>,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Step 1: our state vector, so the peer can send what we miss.
        ws_sender
            .send(Message::Binary(
                protocol::sync_step1(room.doc().state_vector()).into(),
            ))
            .await?;

        // Existing participants, visible immediately.
        if let Some(snapshot) = room.with_awareness(|awareness| awareness.snapshot()) {
            ws_sender
                .send(Message::Binary(protocol::awareness(snapshot).into()))
                .await?;
        }
        session.activate();

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);

        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            let raw: Arc<Vec<u8>> = Arc::new(data.into());
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += raw.len() as u64;
                            }
                            match protocol::decode(&raw) {
                                Ok(message) => {
                                    Self::handle_message(
                                        message, raw, ws_sender, session, room, registry, stats,
                                    )
                                    .await?;
                                }
                                Err(e) => {
                                    // Malformed envelope: a protocol error is
                                    // isolated to this connection.
                                    log::warn!(
                                        "protocol error on connection {}: {e}",
                                        session.conn_id()
                                    );
                                    stats.write().await.decode_errors += 1;
                                    session.begin_close();
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            ws_sender.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => session.pong(),
                        Some(Ok(Message::Close(_))) | None => {
                            session.begin_close();
                            break;
                        }
                        Some(Ok(_)) => {
                            log::debug!("ignoring non-binary frame on {}", session.conn_id());
                        }
                        Some(Err(e)) => {
                            // Framing error: drop the connection.
                            log::warn!("socket error on connection {}: {e}", session.conn_id());
                            session.begin_close();
                            break;
                        }
                    }
                }

                frame = room_rx.recv() => {
                    match frame {
                        Ok((from, bytes)) => {
                            if from != session.conn_id() {
                                ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!(
                                "connection {} lagged by {n} frames",
                                session.conn_id()
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            session.begin_close();
                            break;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if !session.probe() {
                        log::info!(
                            "connection {} missed heartbeat, reclaiming",
                            session.conn_id()
                        );
                        session.begin_close();
                        break;
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }

    /// Apply one decoded protocol message.
    async fn handle_message(
        message: ProtoMessage,
        raw: Arc<Vec<u8>>,
        ws_sender: &mut WsSink,
        session: &mut Session,
        room: &Arc<ActiveRoom>,
        registry: &Arc<RoomRegistry>,
        stats: &Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match message {
            ProtoMessage::Sync(SyncMessage::SyncStep1(remote_sv)) => {
                // The peer tells us what it has seen; answer with the rest.
                let diff = room.doc().diff(&remote_sv);
                ws_sender
                    .send(Message::Binary(protocol::sync_step2(diff).into()))
                    .await?;
            }

            ProtoMessage::Sync(SyncMessage::SyncStep2(update))
            | ProtoMessage::Sync(SyncMessage::Update(update)) => {
                match room.doc().apply_update(&update) {
                    Ok(()) => {
                        registry.persistence().append(session.room_id(), update);
                        room.broadcast().send(session.conn_id(), raw);
                    }
                    Err(e) => {
                        // The envelope was fine; the inner update was not.
                        // Nothing merged, nothing corrupted, connection
                        // stays up.
                        log::warn!(
                            "rejected update on connection {}: {e}",
                            session.conn_id()
                        );
                        stats.write().await.decode_errors += 1;
                    }
                }
            }

            ProtoMessage::Awareness(update) => {
                let change = room.with_awareness(|awareness| awareness.apply(&update));
                session.note_awareness(&change);
                room.broadcast().send(session.conn_id(), raw);
            }

            ProtoMessage::AwarenessQuery => {
                if let Some(snapshot) = room.with_awareness(|awareness| awareness.snapshot()) {
                    ws_sender
                        .send(Message::Binary(protocol::awareness(snapshot).into()))
                        .await?;
                }
            }

            other => {
                log::debug!(
                    "ignoring message on connection {}: {other:?}",
                    session.conn_id()
                );
            }
        }

        Ok(())
    }
}
