//! # pairpad-collab — replicated-document synchronization engine
//!
//! Two participants jointly edit one code document in real time from
//! independent connections, with no central owner resolving conflicts and
//! no risk of one editor's keystrokes silently overwriting the other's.
//!
//! ```text
//! Client A ──┐  WebSocket   ┌──────────────┐
//!             ├────────────► │ CollabServer │
//! Client B ──┘  Binary Proto└──────┬───────┘
//!                                  │ per room
//!                                  ▼
//!                       ┌────────────────────┐
//!                       │ ActiveRoom         │
//!                       │  SharedDoc (CRDT)  │
//!                       │  AwarenessRegistry │
//!                       │  BroadcastGroup    │
//!                       └─────────┬──────────┘
//!                                 │ bind / append / flush
//!                                 ▼
//!                       ┌────────────────────┐
//!                       │ DocStorage         │
//!                       │ (RocksDB / memory) │
//!                       └────────────────────┘
//! ```
//!
//! Convergence rests on the CRDT merge being commutative and idempotent:
//! updates may arrive in any order, duplicated, from either replica, and
//! every connected replica reaches the same state. The wire protocol is
//! the Yjs sync protocol (varint-discriminated SYNC / AWARENESS envelope),
//! so browser peers interoperate directly.
//!
//! ## Modules
//!
//! - [`protocol`] — wire envelope codec and coded close frames
//! - [`document`] — per-room CRDT document store
//! - [`awareness`] — ephemeral presence state, last-write-wins per client
//! - [`rooms`] — room records, directory trait, connection admission
//! - [`registry`] — refcounted room table and broadcast fan-out
//! - [`session`] — per-connection state machine
//! - [`persistence`] — bind / append / flush into durable storage
//! - [`storage`] — storage trait with RocksDB and in-memory backends
//! - [`server`] — WebSocket accept loop and heartbeat supervision
//! - [`client`] — headless protocol client

pub mod awareness;
pub mod client;
pub mod document;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessRegistry};
pub use client::{ClientError, ClientEvent, CollabClient, ConnectionState};
pub use document::{DocumentError, SharedDoc};
pub use persistence::PersistenceAdapter;
pub use protocol::{ProtocolError, RejectCode};
pub use registry::{ActiveRoom, BroadcastGroup, RoomRegistry, RoomState};
pub use rooms::{
    AdmissionError, MemoryRoomDirectory, Participant, RoomDirectory, RoomRecord,
};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{Session, SessionState};
pub use storage::{DocStorage, MemoryStorage, RocksStorage, StorageConfig, StoreError};
