//! Room records and connection admission.
//!
//! A room is the persisted pairing of two participants with one shared
//! document and one question. Records are produced by the external matching
//! service; this core reads them to admit connections and writes only two
//! things back through [`RoomDirectory`]: the `open` flag (closing) and a
//! participant's forfeit flag.
//!
//! Admission maps directly onto the coded close frames in
//! [`crate::protocol`]: an unknown or unreadable room refuses with 4000, a
//! closed or full room with 4001.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;
use uuid::Uuid;

use crate::protocol::RejectCode;
use crate::storage::StoreError;

/// One side of the pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub username: String,
    /// Set when this participant gave up the session.
    pub forfeited: bool,
}

impl Participant {
    pub fn new(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            forfeited: false,
        }
    }
}

/// Persisted room record.
///
/// Never deleted while referenced by history; closing a room flips `open`
/// to false and leaves the record in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: String,
    pub participants: [Participant; 2],
    pub question_id: Uuid,
    /// Seconds since epoch.
    pub created_at: u64,
    pub open: bool,
    /// Admission limit. The protocol itself is N-replica capable; two is
    /// the domain policy.
    pub capacity: usize,
}

impl RoomRecord {
    pub fn new(
        room_id: impl Into<String>,
        participants: [Participant; 2],
        question_id: Uuid,
    ) -> Self {
        let created_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            room_id: room_id.into(),
            participants,
            question_id,
            created_at,
            open: true,
            capacity: 2,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(record)
    }
}

/// The room-record collaborator.
///
/// Produced and administered by the matching service; this core reads
/// records during admission and delegates the two permitted mutations.
pub trait RoomDirectory: Send + Sync {
    fn fetch(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError>;

    /// Register a record. Called by the matching flow, not by this core.
    fn insert(&self, record: RoomRecord) -> Result<(), StoreError>;

    /// Flip `open` to false. Subsequent admissions refuse with 4001.
    fn close_room(&self, room_id: &str) -> Result<(), StoreError>;

    /// Mark a participant's forfeit flag.
    fn mark_forfeit(&self, room_id: &str, user_id: Uuid) -> Result<(), StoreError>;
}

/// In-memory directory for tests and embedded setups.
#[derive(Debug, Default)]
pub struct MemoryRoomDirectory {
    rooms: RwLock<HashMap<String, RoomRecord>>,
}

impl MemoryRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomDirectory for MemoryRoomDirectory {
    fn fetch(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        Ok(rooms.get(room_id).cloned())
    }

    fn insert(&self, record: RoomRecord) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        rooms.insert(record.room_id.clone(), record);
        Ok(())
    }

    fn close_room(&self, room_id: &str) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        match rooms.get_mut(room_id) {
            Some(record) => {
                record.open = false;
                Ok(())
            }
            None => Err(StoreError::NotFound(room_id.to_string())),
        }
    }

    fn mark_forfeit(&self, room_id: &str, user_id: Uuid) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        match rooms.get_mut(room_id) {
            Some(record) => {
                for participant in record.participants.iter_mut() {
                    if participant.user_id == user_id {
                        participant.forfeited = true;
                    }
                }
                Ok(())
            }
            None => Err(StoreError::NotFound(room_id.to_string())),
        }
    }
}

/// Why a connection was refused.
#[derive(Debug)]
pub enum AdmissionError {
    /// The request path carried no room id.
    MissingRoomId,
    /// No record exists for this id.
    UnknownRoom(String),
    /// The record exists but `open` is false.
    RoomClosed(String),
    /// The room already holds `capacity` connections.
    RoomFull(String),
    /// The directory or snapshot fetch failed; the activation attempt is
    /// abandoned rather than partially admitted.
    Unavailable(String),
}

impl AdmissionError {
    pub fn reject_code(&self) -> RejectCode {
        match self {
            AdmissionError::MissingRoomId
            | AdmissionError::UnknownRoom(_)
            | AdmissionError::Unavailable(_) => RejectCode::AuthFailed,
            AdmissionError::RoomClosed(_) | AdmissionError::RoomFull(_) => RejectCode::RoomClosed,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            AdmissionError::MissingRoomId => "missing room id".to_string(),
            AdmissionError::UnknownRoom(id) => format!("unknown room {id}"),
            AdmissionError::RoomClosed(id) => format!("room {id} is closed"),
            AdmissionError::RoomFull(_) => "room full".to_string(),
            AdmissionError::Unavailable(id) => format!("room {id} unavailable"),
        }
    }
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl std::error::Error for AdmissionError {}

/// Extract the room id from a connection path: the trailing segment, with
/// any query string stripped (auth parameters are consumed upstream).
pub fn room_id_from_path(path: &str) -> Option<String> {
    let path = path.split('?').next().unwrap_or(path);
    let segment = path.rsplit('/').next().unwrap_or("");
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

/// Validate a connection request against the directory.
///
/// Capacity is enforced separately at attach time, where the check and the
/// registration are atomic.
pub fn admit(directory: &dyn RoomDirectory, path: &str) -> Result<RoomRecord, AdmissionError> {
    let room_id = room_id_from_path(path).ok_or(AdmissionError::MissingRoomId)?;

    let record = directory
        .fetch(&room_id)
        .map_err(|e| {
            log::error!("room directory fetch failed for {room_id}: {e}");
            AdmissionError::Unavailable(room_id.clone())
        })?
        .ok_or_else(|| AdmissionError::UnknownRoom(room_id.clone()))?;

    if !record.open {
        return Err(AdmissionError::RoomClosed(room_id));
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(room_id: &str) -> RoomRecord {
        RoomRecord::new(
            room_id,
            [
                Participant::new(Uuid::new_v4(), "alice"),
                Participant::new(Uuid::new_v4(), "bob"),
            ],
            Uuid::new_v4(),
        )
    }

    #[test]
    fn test_room_id_from_path() {
        assert_eq!(room_id_from_path("/r1"), Some("r1".to_string()));
        assert_eq!(room_id_from_path("/collab/r1"), Some("r1".to_string()));
        assert_eq!(
            room_id_from_path("/r1?token=abc"),
            Some("r1".to_string())
        );
        assert_eq!(room_id_from_path("/"), None);
        assert_eq!(room_id_from_path(""), None);
    }

    #[test]
    fn test_record_roundtrip() {
        let record = sample_record("r1");
        let decoded = RoomRecord::decode(&record.encode().unwrap()).unwrap();

        assert_eq!(decoded.room_id, "r1");
        assert_eq!(decoded.participants, record.participants);
        assert_eq!(decoded.question_id, record.question_id);
        assert!(decoded.open);
        assert_eq!(decoded.capacity, 2);
    }

    #[test]
    fn test_admit_open_room() {
        let directory = MemoryRoomDirectory::new();
        directory.insert(sample_record("r1")).unwrap();

        let record = admit(&directory, "/r1").unwrap();
        assert_eq!(record.room_id, "r1");
    }

    #[test]
    fn test_admit_missing_id_is_auth_failed() {
        let directory = MemoryRoomDirectory::new();
        let err = admit(&directory, "/").unwrap_err();
        assert!(matches!(err, AdmissionError::MissingRoomId));
        assert_eq!(err.reject_code().code(), 4000);
    }

    #[test]
    fn test_admit_unknown_room_is_auth_failed() {
        let directory = MemoryRoomDirectory::new();
        let err = admit(&directory, "/nope").unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownRoom(_)));
        assert_eq!(err.reject_code().code(), 4000);
    }

    #[test]
    fn test_admit_closed_room() {
        let directory = MemoryRoomDirectory::new();
        directory.insert(sample_record("r1")).unwrap();
        directory.close_room("r1").unwrap();

        let err = admit(&directory, "/r1").unwrap_err();
        assert!(matches!(err, AdmissionError::RoomClosed(_)));
        assert_eq!(err.reject_code().code(), 4001);
    }

    #[test]
    fn test_room_full_maps_to_4001() {
        let err = AdmissionError::RoomFull("r1".to_string());
        assert_eq!(err.reject_code().code(), 4001);
        assert_eq!(err.reason(), "room full");
    }

    #[test]
    fn test_mark_forfeit() {
        let directory = MemoryRoomDirectory::new();
        let record = sample_record("r1");
        let alice = record.participants[0].user_id;
        directory.insert(record).unwrap();

        directory.mark_forfeit("r1", alice).unwrap();
        let reread = directory.fetch("r1").unwrap().unwrap();
        assert!(reread.participants[0].forfeited);
        assert!(!reread.participants[1].forfeited);
        // Forfeit does not close the room by itself.
        assert!(reread.open);
    }

    #[test]
    fn test_close_unknown_room_errors() {
        let directory = MemoryRoomDirectory::new();
        assert!(directory.close_room("ghost").is_err());
    }
}
