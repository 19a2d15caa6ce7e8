//! Ephemeral presence state, shared per room and never persisted.
//!
//! Every connected client publishes a small JSON payload (display name,
//! cursor color, user id) keyed by its awareness client id. Entries are
//! last-write-wins per client, ordered by a per-client clock carried on the
//! wire, so concurrent diffs converge trivially. A reconnect arrives under
//! a fresh client id; the old id is removed when its connection goes away.
//!
//! The wire representation is [`AwarenessUpdate`]: for each client a clock
//! and a JSON string, where the string `"null"` marks removal.

use std::collections::HashMap;
use std::sync::Arc;
use yrs::sync::{AwarenessUpdate, AwarenessUpdateEntry};

/// JSON payload marking a removed client.
const NULL_STATE: &str = "null";

#[derive(Debug, Clone)]
struct ClientEntry {
    clock: u32,
    /// `None` once the client has been removed. The tombstone keeps the
    /// clock so a stale diff cannot resurrect the entry.
    state: Option<Arc<str>>,
}

/// Which client ids an applied diff touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    /// True when the diff had no effect.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Per-room awareness state: client id → latest presence payload.
#[derive(Debug, Default)]
pub struct AwarenessRegistry {
    clients: HashMap<u64, ClientEntry>,
}

impl AwarenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an incoming diff, last-write-wins per client.
    ///
    /// An entry wins when its clock is newer, or equal with a removal
    /// payload (the tie-break that lets a departing client clear its own
    /// state). Losing entries are ignored.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for (&client_id, entry) in update.clients.iter() {
            let incoming_null = entry.json.as_ref() == NULL_STATE;

            match self.clients.get_mut(&client_id) {
                Some(current) => {
                    let wins = entry.clock > current.clock
                        || (entry.clock == current.clock && incoming_null);
                    if !wins {
                        continue;
                    }
                    let was_live = current.state.is_some();
                    current.clock = entry.clock;
                    if incoming_null {
                        current.state = None;
                        if was_live {
                            change.removed.push(client_id);
                        }
                    } else {
                        current.state = Some(entry.json.clone());
                        if was_live {
                            change.updated.push(client_id);
                        } else {
                            change.added.push(client_id);
                        }
                    }
                }
                None => {
                    let state = (!incoming_null).then(|| entry.json.clone());
                    if state.is_some() {
                        change.added.push(client_id);
                    }
                    self.clients.insert(
                        client_id,
                        ClientEntry {
                            clock: entry.clock,
                            state,
                        },
                    );
                }
            }
        }

        change
    }

    /// Full current state, for pushing to a newly admitted peer.
    /// `None` when nobody is present.
    pub fn snapshot(&self) -> Option<AwarenessUpdate> {
        let clients: HashMap<u64, AwarenessUpdateEntry> = self
            .clients
            .iter()
            .filter_map(|(&id, entry)| {
                entry.state.as_ref().map(|state| {
                    (
                        id,
                        AwarenessUpdateEntry {
                            clock: entry.clock,
                            json: state.clone(),
                        },
                    )
                })
            })
            .collect();

        if clients.is_empty() {
            None
        } else {
            Some(AwarenessUpdate {
                clients: clients.into_iter().collect(),
            })
        }
    }

    /// Remove the given clients, returning the diff to broadcast so the
    /// remaining peers drop them too. `None` when none of them were live.
    pub fn remove(&mut self, client_ids: &[u64]) -> Option<AwarenessUpdate> {
        let mut removed: HashMap<u64, AwarenessUpdateEntry> = HashMap::new();

        for &client_id in client_ids {
            if let Some(entry) = self.clients.get_mut(&client_id) {
                if entry.state.is_none() {
                    continue;
                }
                entry.clock += 1;
                entry.state = None;
                removed.insert(
                    client_id,
                    AwarenessUpdateEntry {
                        clock: entry.clock,
                        json: NULL_STATE.into(),
                    },
                );
            }
        }

        if removed.is_empty() {
            None
        } else {
            Some(AwarenessUpdate {
                clients: removed.into_iter().collect(),
            })
        }
    }

    /// Presence payload of a single client, if live.
    pub fn state_of(&self, client_id: u64) -> Option<&str> {
        self.clients
            .get(&client_id)
            .and_then(|entry| entry.state.as_deref())
    }

    /// Number of live clients.
    pub fn live_count(&self) -> usize {
        self.clients.values().filter(|e| e.state.is_some()).count()
    }

    /// Ids of all live clients.
    pub fn live_clients(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, e)| e.state.is_some())
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
