//! Per-room connection registry and room lifecycle.
//!
//! The registry owns the map from room id to live room state — an explicit,
//! reference-counted table rather than ambient module state, so teardown is
//! observable and testable. A room moves through:
//!
//! ```text
//! (absent) ──acquire──► Loading ──bind ok──► Active
//!                          │                    │ last release
//!                          │ bind failed        ▼
//!                          ▼                 Draining ──flush──► (absent)
//!                       (absent)
//! ```
//!
//! Each room carries one [`SharedDoc`], one [`AwarenessRegistry`], and one
//! [`BroadcastGroup`] fanning frames out to every connection of the room.
//! Receivers skip frames tagged with their own connection id, so the
//! originator never echoes itself.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::awareness::AwarenessRegistry;
use crate::document::SharedDoc;
use crate::persistence::PersistenceAdapter;
use crate::protocol;
use crate::rooms::{AdmissionError, RoomRecord};
use crate::storage::StoreError;

/// A frame fanned out within one room: (originating connection, bytes).
pub type RoomFrame = (Uuid, Arc<Vec<u8>>);

/// Lifecycle state of an in-memory room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Persistence fetch in flight.
    Loading,
    /// At least one connection attached.
    Active,
    /// Zero connections, final snapshot write in flight.
    Draining,
}

/// Fan-out channel for one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a lagging receiver may buffer
    /// before it starts dropping (backpressure).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.sender.subscribe()
    }

    /// Send a frame to every subscriber. Returns the receiver count.
    pub fn send(&self, from: Uuid, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send((from, frame)).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// In-memory state of one room while it has (or is gaining) connections.
pub struct ActiveRoom {
    room_id: String,
    capacity: usize,
    doc: SharedDoc,
    awareness: StdMutex<AwarenessRegistry>,
    broadcast: BroadcastGroup,
    connections: RwLock<HashSet<Uuid>>,
    state: StdMutex<RoomState>,
}

impl ActiveRoom {
    fn new(room_id: String, capacity: usize, broadcast_capacity: usize, gc: bool) -> Self {
        Self {
            room_id,
            capacity,
            doc: SharedDoc::new(gc),
            awareness: StdMutex::new(AwarenessRegistry::new()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            connections: RwLock::new(HashSet::new()),
            state: StdMutex::new(RoomState::Loading),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn doc(&self) -> &SharedDoc {
        &self.doc
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn state(&self) -> RoomState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: RoomState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Run a closure against the room's awareness state under its lock.
    pub fn with_awareness<R>(&self, f: impl FnOnce(&mut AwarenessRegistry) -> R) -> R {
        let mut awareness = self.awareness.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut awareness)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// Registry keyed by room id, owned by the server.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<ActiveRoom>>>,
    persistence: PersistenceAdapter,
    broadcast_capacity: usize,
    gc: bool,
}

impl RoomRegistry {
    pub fn new(persistence: PersistenceAdapter, broadcast_capacity: usize, gc: bool) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            persistence,
            broadcast_capacity,
            gc,
        }
    }

    pub fn persistence(&self) -> &PersistenceAdapter {
        &self.persistence
    }

    /// Get or create the in-memory room for an admitted record.
    ///
    /// First attach materializes the document from durable storage; a bind
    /// failure evicts the half-built entry and propagates.
    pub async fn acquire(&self, record: &RoomRecord) -> Result<Arc<ActiveRoom>, StoreError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&record.room_id) {
                return Ok(room.clone());
            }
        }

        // Slow path: write lock to create; double-check after acquiring
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&record.room_id) {
            return Ok(room.clone());
        }

        let room = Arc::new(ActiveRoom::new(
            record.room_id.clone(),
            record.capacity,
            self.broadcast_capacity,
            self.gc,
        ));

        if let Err(e) = self.persistence.bind(&record.room_id, room.doc()) {
            log::error!("failed to bind room {}: {e}", record.room_id);
            return Err(e);
        }

        room.set_state(RoomState::Active);
        rooms.insert(record.room_id.clone(), room.clone());
        log::info!("room {} materialized", record.room_id);
        Ok(room)
    }

    /// Register a connection, enforcing the room's capacity atomically.
    pub async fn attach(
        &self,
        room: &Arc<ActiveRoom>,
        conn_id: Uuid,
    ) -> Result<broadcast::Receiver<RoomFrame>, AdmissionError> {
        let mut connections = room.connections.write().await;
        if connections.len() >= room.capacity {
            return Err(AdmissionError::RoomFull(room.room_id.clone()));
        }
        connections.insert(conn_id);
        Ok(room.broadcast.subscribe())
    }

    /// Unregister a connection.
    ///
    /// Removes the awareness entries it controlled (broadcasting the
    /// removal so remaining peers see the departure), and when the last
    /// connection leaves, drains the room: synchronous snapshot flush, then
    /// eviction from memory.
    pub async fn release(&self, room: &Arc<ActiveRoom>, conn_id: Uuid, controlled: &[u64]) {
        if let Some(removal) = room.with_awareness(|awareness| awareness.remove(controlled)) {
            room.broadcast
                .send(conn_id, Arc::new(protocol::awareness(removal)));
        }

        let now_empty = {
            let mut connections = room.connections.write().await;
            connections.remove(&conn_id);
            connections.is_empty()
        };
        if !now_empty {
            return;
        }

        room.set_state(RoomState::Draining);
        if let Err(e) = self.persistence.flush(room.room_id(), room.doc()) {
            log::error!("final flush for room {} failed: {e}", room.room_id());
        }

        let mut rooms = self.rooms.write().await;
        // A connection may have attached while we were flushing.
        if room.connections.read().await.is_empty() {
            rooms.remove(room.room_id());
            log::info!("room {} released", room.room_id());
        } else {
            room.set_state(RoomState::Active);
        }
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<ActiveRoom>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
