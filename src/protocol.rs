//! Binary wire protocol for document synchronization.
//!
//! Every frame is a length-delimited WebSocket binary message carrying a
//! varint-discriminated envelope:
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────────────┐
//! │ kind (varint)│ payload                                   │
//! ├──────────────┼───────────────────────────────────────────┤
//! │ 0 = SYNC     │ step (varint) + update bytes              │
//! │              │   step 0: state vector  (handshake)       │
//! │              │   step 1: state diff    (handshake reply) │
//! │              │   step 2: incremental update              │
//! │ 1 = AWARENESS│ per-client presence diff                  │
//! └──────────────┴───────────────────────────────────────────┘
//! ```
//!
//! The envelope is the Yjs sync protocol encoding provided by [`yrs::sync`],
//! so browser peers running the reference JavaScript client interoperate
//! without translation. This module wraps it with frame constructors, a
//! decode entry point with an isolated error type, and the coded close
//! frames used to refuse a connection.

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use yrs::sync::{AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

/// Envelope discriminator for sync messages.
pub const MSG_SYNC: u8 = 0;
/// Envelope discriminator for awareness messages.
pub const MSG_AWARENESS: u8 = 1;

/// Encode sync step 1: our state vector, telling the peer what we have seen.
///
/// Sent by the server immediately after a connection is admitted; either
/// side may also send it later to force a resync.
pub fn sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

/// Encode sync step 2: the diff the peer is missing, computed against the
/// state vector it sent in step 1.
pub fn sync_step2(diff: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1()
}

/// Encode an incremental document update.
pub fn sync_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

/// Encode an awareness diff (presence state keyed by client id).
pub fn awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

/// Decode an incoming frame into a protocol message.
///
/// A failure here means the envelope itself is malformed; the caller closes
/// the offending connection and nothing else. A well-formed envelope whose
/// inner update later fails to apply is a separate, softer condition.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    Message::decode_v1(bytes).map_err(|e| ProtocolError::Envelope(e.to_string()))
}

/// Close codes used to refuse or evict a connection.
///
/// These land in the 4000-range reserved for application use, so browser
/// clients can distinguish them from transport-level closures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    /// Room id missing, room unknown, or the room could not be activated.
    AuthFailed,
    /// Room exists but is closed, or is already at capacity.
    RoomClosed,
}

impl RejectCode {
    /// Numeric WebSocket close code.
    pub fn code(&self) -> u16 {
        match self {
            RejectCode::AuthFailed => 4000,
            RejectCode::RoomClosed => 4001,
        }
    }

    /// Build the close frame sent to the refused connection.
    pub fn close_frame(&self, reason: impl Into<String>) -> CloseFrame {
        CloseFrame {
            code: CloseCode::Library(self.code()),
            reason: reason.into().into(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// The outer envelope could not be decoded.
    Envelope(String),
    /// The connection was closed mid-exchange.
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Envelope(e) => write!(f, "malformed envelope: {e}"),
            ProtocolError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
