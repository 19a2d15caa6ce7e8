//! Per-connection state machine.
//!
//! A connection is owned by exactly one room for its lifetime and moves
//! through four states:
//!
//! ```text
//! Handshaking ──activate──► Active ──begin_close──► Closing ──finish_close──► Closed
//!      └──────────────begin_close──────────────────────┘
//! ```
//!
//! The session also tracks the awareness client ids this connection has
//! introduced (normally one — its own browser tab). Those ids are removed
//! from the room's shared awareness state when the session ends, so no
//! ghost presence outlives the socket, and the heartbeat flag that decides
//! whether the peer answered the last liveness probe.

use std::collections::HashSet;
use uuid::Uuid;

use crate::awareness::AwarenessChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Admitted; initial sync and awareness snapshot not yet exchanged.
    Handshaking,
    /// Steady state: relaying updates.
    Active,
    /// Teardown started (socket close, heartbeat miss, or protocol error).
    Closing,
    Closed,
}

#[derive(Debug)]
pub struct Session {
    conn_id: Uuid,
    room_id: String,
    state: SessionState,
    controlled: HashSet<u64>,
    awaiting_pong: bool,
}

impl Session {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            room_id: room_id.into(),
            state: SessionState::Handshaking,
            controlled: HashSet::new(),
            awaiting_pong: false,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handshake finished; enter steady state.
    pub fn activate(&mut self) {
        if self.state == SessionState::Handshaking {
            self.state = SessionState::Active;
        }
    }

    pub fn begin_close(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
    }

    pub fn finish_close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    /// Fold an applied awareness diff into the set of client ids this
    /// connection is responsible for.
    pub fn note_awareness(&mut self, change: &AwarenessChange) {
        for &id in change.added.iter().chain(change.updated.iter()) {
            self.controlled.insert(id);
        }
        for id in &change.removed {
            self.controlled.remove(id);
        }
    }

    /// Client ids to clear from the room's awareness state on close.
    pub fn controlled_clients(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.controlled.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Record an outgoing liveness probe.
    ///
    /// Returns false when the previous probe went unanswered — the peer is
    /// gone and the connection must be reclaimed.
    pub fn probe(&mut self) -> bool {
        if self.awaiting_pong {
            return false;
        }
        self.awaiting_pong = true;
        true
    }

    /// Record a probe response.
    pub fn pong(&mut self) {
        self.awaiting_pong = false;
    }
}
