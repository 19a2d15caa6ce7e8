//! In-memory CRDT document store.
//!
//! One [`SharedDoc`] exists per active room. All mutation goes through
//! [`SharedDoc::apply_update`], which merges a remote delta into the
//! document. Merge is commutative and idempotent, so updates may arrive in
//! any order, duplicated, from any replica, and every replica converges on
//! the same state without coordination.
//!
//! The document is guarded by a mutex so update application for a given
//! room is serialized; merge itself is synchronous and CPU-bound and never
//! touches I/O.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::sync::{Mutex, MutexGuard};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Options, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// A CRDT document shared by all connections of one room.
pub struct SharedDoc {
    doc: Mutex<Doc>,
}

impl SharedDoc {
    /// Create an empty document.
    ///
    /// When `gc` is false, tombstones for deleted content are retained.
    /// Snapshots grow larger, but a state-vector diff resolves correctly
    /// against arbitrarily old replicas.
    pub fn new(gc: bool) -> Self {
        let mut options = Options::default();
        options.skip_gc = !gc;
        Self {
            doc: Mutex::new(Doc::with_options(options)),
        }
    }

    fn doc(&self) -> MutexGuard<'_, Doc> {
        self.doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The client id this replica writes under.
    pub fn client_id(&self) -> u64 {
        self.doc().client_id()
    }

    /// Merge a remote update into the document.
    ///
    /// Malformed input yields an error and leaves the document untouched;
    /// the caller decides what to do with the connection that sent it.
    /// Re-applying an update the document already contains is a no-op.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(bytes).map_err(|e| DocumentError::Malformed(e.to_string()))?;
        let doc = self.doc();
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    /// Current state vector: a compact summary of what this replica has seen.
    pub fn state_vector(&self) -> StateVector {
        self.doc().transact().state_vector()
    }

    /// Encoded state vector, as exchanged during the sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// The delta a peer with the given state vector is missing.
    pub fn diff(&self, remote: &StateVector) -> Vec<u8> {
        self.doc().transact().encode_diff_v1(remote)
    }

    /// Like [`SharedDoc::diff`], but from an encoded state vector.
    pub fn diff_encoded(&self, remote: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv =
            StateVector::decode_v1(remote).map_err(|e| DocumentError::Malformed(e.to_string()))?;
        Ok(self.diff(&sv))
    }

    /// Full current state as a single update, for resync and snapshots.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc()
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Insert text into a named text field, returning the incremental
    /// update that encodes exactly this edit.
    pub fn insert_text(&self, field: &str, index: u32, chunk: &str) -> Vec<u8> {
        let doc = self.doc();
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(field);
            text.insert(&mut txn, index, chunk);
        }
        doc.transact().encode_diff_v1(&before)
    }

    /// Delete a range from a named text field, returning the incremental
    /// update for the edit.
    pub fn remove_text(&self, field: &str, index: u32, len: u32) -> Vec<u8> {
        let doc = self.doc();
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(field);
            text.remove_range(&mut txn, index, len);
        }
        doc.transact().encode_diff_v1(&before)
    }

    /// Current content of a named text field, if it exists.
    pub fn text_content(&self, field: &str) -> Option<String> {
        let doc = self.doc();
        let txn = doc.transact();
        txn.get_text(field).map(|text| text.get_string(&txn))
    }
}

/// Document errors.
#[derive(Debug, Clone)]
pub enum DocumentError {
    /// Input bytes are not a valid update or state vector.
    Malformed(String),
    /// A decoded update could not be integrated.
    Apply(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::Malformed(e) => write!(f, "malformed update: {e}"),
            DocumentError::Apply(e) => write!(f, "update rejected: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}
