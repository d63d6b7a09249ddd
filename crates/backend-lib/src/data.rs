// ============================
// roomhub-backend-lib/src/data.rs
// ============================
//! Server replica of the map-of-maps data model.
//!
//! The model is a set of named arrays from a fixed schema. Each array is an
//! unordered mapping from `arrayIndexId` to a map; each map is a mapping
//! from field name to an `(epoch, value)` pair with last-writer-wins
//! semantics on the epoch. Values are opaque UTF-8 payloads the server never
//! interprets.
//!
//! The replica also tracks ownership claims ("hands"): a map, or a whole
//! array, can be claimed by at most one player at a time. Claim transfers
//! surface as [`DataEvent`]s so the coordinator can maintain each session's
//! dead-hand table.

use roomhub_common::{method, Frame, FrameError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// The fixed array schema. Arrays outside this list are rejected.
pub const ARRAY_SCHEMA: &[&str] = &["worldApps"];

/// A single last-writer-wins field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataField {
    pub epoch: u64,
    pub value: String,
}

/// One map: field name -> (epoch, value).
pub type DataMap = HashMap<String, DataField>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DataError {
    #[error("unknown array {0:?}")]
    UnknownArray(String),

    #[error("malformed hand key {0:?}")]
    MalformedKey(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("bad snapshot payload")]
    BadSnapshot,
}

/// A parsed ownership key: `"<arrayId>.<arrayIndexId>"` claims a single map,
/// a bare `"<arrayId>"` claims the whole array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandKey {
    pub array_id: String,
    pub array_index_id: Option<String>,
}

impl HandKey {
    pub fn parse(raw: &str) -> Result<HandKey, DataError> {
        let (array_id, array_index_id) = match raw.split_once('.') {
            Some((array, index)) => (array, Some(index)),
            None => (raw, None),
        };
        if array_id.is_empty() || array_index_id.is_some_and(str::is_empty) {
            return Err(DataError::MalformedKey(raw.to_string()));
        }
        Ok(HandKey {
            array_id: array_id.to_string(),
            array_index_id: array_index_id.map(str::to_string),
        })
    }

    pub fn map(array_id: &str, array_index_id: &str) -> HandKey {
        HandKey {
            array_id: array_id.to_string(),
            array_index_id: Some(array_index_id.to_string()),
        }
    }
}

impl fmt::Display for HandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.array_index_id {
            Some(index) => write!(f, "{}.{}", self.array_id, index),
            None => write!(f, "{}", self.array_id),
        }
    }
}

/// Ownership transfer events emitted while applying a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEvent {
    DeadHand { keys: Vec<HandKey>, dead_hand: String },
    LiveHand { keys: Vec<HandKey>, live_hand: String },
}

/// Storage keys whose persisted encoding changed during an apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyKey {
    Array(String),
    Map {
        array_id: String,
        array_index_id: String,
    },
}

/// Outcome of applying one frame to the replica.
#[derive(Debug, Default)]
pub struct Applied {
    /// The replica changed; the original frame should be proxied to peers.
    pub update: bool,
    /// Corrective frame for the originating session only.
    pub rollback: Option<Frame>,
    /// Ownership transfers to route into session dead-hand tables.
    pub events: Vec<DataEvent>,
    /// Persisted encodings invalidated by this apply.
    pub dirty: Vec<DirtyKey>,
}

/// Serialized replica state, sent to joining sessions as `STATE_IMPORT`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub arrays: BTreeMap<String, BTreeMap<String, DataMap>>,
    pub owners: BTreeMap<String, String>,
    pub players: BTreeMap<String, HashMap<String, String>>,
}

pub struct DataClient {
    arrays: BTreeMap<String, BTreeMap<String, DataMap>>,
    /// Composite hand key -> owning player.
    owners: BTreeMap<String, String>,
    /// Live players and their handshake-level data.
    players: BTreeMap<String, HashMap<String, String>>,
}

impl Default for DataClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DataClient {
    pub fn new() -> Self {
        DataClient {
            arrays: ARRAY_SCHEMA
                .iter()
                .map(|id| (id.to_string(), BTreeMap::new()))
                .collect(),
            owners: BTreeMap::new(),
            players: BTreeMap::new(),
        }
    }

    pub fn handles_method(m: u32) -> bool {
        method::is_data_method(m)
    }

    /// Insert a map read back from storage during room initialization.
    pub fn insert_loaded_map(&mut self, array_id: &str, array_index_id: String, map: DataMap) {
        if let Some(array) = self.arrays.get_mut(array_id) {
            array.insert(array_index_id, map);
        }
    }

    pub fn contains_map(&self, array_id: &str, array_index_id: &str) -> bool {
        self.arrays
            .get(array_id)
            .is_some_and(|array| array.contains_key(array_index_id))
    }

    pub fn array_indices(&self, array_id: &str) -> Vec<String> {
        self.arrays
            .get(array_id)
            .map(|array| array.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn owner_of(&self, key: &HandKey) -> Option<&str> {
        self.owners.get(&key.to_string()).map(String::as_str)
    }

    /// Persisted encoding of an array: the JSON list of its index ids.
    pub fn encode_array(&self, array_id: &str) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.array_indices(array_id))
    }

    /// Persisted encoding of a map; a removed map encodes as the empty map.
    pub fn encode_map(
        &self,
        array_id: &str,
        array_index_id: &str,
    ) -> Result<Vec<u8>, serde_json::Error> {
        let empty = DataMap::new();
        let map = self
            .arrays
            .get(array_id)
            .and_then(|array| array.get(array_index_id))
            .unwrap_or(&empty);
        serde_json::to_vec(map)
    }

    /// Full-state import snapshot for a joining session.
    pub fn export_frame(&self) -> Frame {
        let snapshot = DataSnapshot {
            arrays: self.arrays.clone(),
            owners: self.owners.clone(),
            players: self.players.clone(),
        };
        let payload = serde_json::to_vec(&snapshot).unwrap_or_default();
        Frame::new(method::STATE_IMPORT).push_bytes(payload)
    }

    /// Apply one inbound data-class frame.
    pub fn apply(&mut self, frame: &Frame) -> Result<Applied, DataError> {
        match frame.method {
            method::JOIN => self.apply_join(frame),
            method::LEAVE => self.apply_leave(frame),
            method::SET_PLAYER_DATA => self.apply_player_data(frame),
            method::STATE_ADD => self.apply_add(frame),
            method::STATE_SET => self.apply_set(frame),
            method::STATE_REMOVE => self.apply_remove(frame),
            method::DEAD_HAND => self.apply_dead_hand(frame),
            method::LIVE_HAND => self.apply_live_hand(frame),
            method::STATE_IMPORT => self.apply_import(frame),
            method::STATE_ROLLBACK => {
                // Rollbacks are server-to-client corrections; a replica never
                // applies one it receives.
                warn!("ignoring inbound rollback frame");
                Ok(Applied::default())
            }
            other => {
                warn!(method = other, "unhandled data method");
                Ok(Applied::default())
            }
        }
    }

    fn apply_join(&mut self, frame: &Frame) -> Result<Applied, DataError> {
        let player = frame.arg_str(0)?;
        self.players.entry(player.to_string()).or_default();
        Ok(Applied {
            update: true,
            ..Applied::default()
        })
    }

    fn apply_leave(&mut self, frame: &Frame) -> Result<Applied, DataError> {
        let player = frame.arg_str(0)?;
        let existed = self.players.remove(player).is_some();
        Ok(Applied {
            update: existed,
            ..Applied::default()
        })
    }

    fn apply_player_data(&mut self, frame: &Frame) -> Result<Applied, DataError> {
        let player = frame.arg_str(0)?.to_string();
        let key = frame.arg_str(1)?.to_string();
        let value = frame.arg_str(2)?.to_string();
        self.players.entry(player).or_default().insert(key, value);
        Ok(Applied {
            update: true,
            ..Applied::default()
        })
    }

    fn apply_add(&mut self, frame: &Frame) -> Result<Applied, DataError> {
        let array_id = frame.arg_str(0)?.to_string();
        let array_index_id = frame.arg_str(1)?.to_string();
        let array = self
            .arrays
            .get_mut(&array_id)
            .ok_or_else(|| DataError::UnknownArray(array_id.clone()))?;
        if array.contains_key(&array_index_id) {
            return Ok(Applied::default());
        }
        array.insert(array_index_id.clone(), DataMap::new());
        Ok(Applied {
            update: true,
            dirty: vec![
                DirtyKey::Array(array_id.clone()),
                DirtyKey::Map {
                    array_id,
                    array_index_id,
                },
            ],
            ..Applied::default()
        })
    }

    fn apply_set(&mut self, frame: &Frame) -> Result<Applied, DataError> {
        let array_id = frame.arg_str(0)?.to_string();
        let array_index_id = frame.arg_str(1)?.to_string();
        let field = frame.arg_str(2)?.to_string();
        let epoch = frame.arg_u64(3)?;
        let value = frame.arg_str(4)?.to_string();

        let array = self
            .arrays
            .get_mut(&array_id)
            .ok_or_else(|| DataError::UnknownArray(array_id.clone()))?;
        let created = !array.contains_key(&array_index_id);
        let map = array.entry(array_index_id.clone()).or_default();

        if let Some(current) = map.get(&field) {
            if epoch < current.epoch {
                // Stale write: answer with the authoritative field state.
                let rollback = Frame::new(method::STATE_ROLLBACK)
                    .push_str(&array_id)
                    .push_str(&array_index_id)
                    .push_str(&field)
                    .push_u64(current.epoch)
                    .push_str(&current.value);
                return Ok(Applied {
                    rollback: Some(rollback),
                    ..Applied::default()
                });
            }
        }

        map.insert(field, DataField { epoch, value });
        let mut dirty = vec![DirtyKey::Map {
            array_id: array_id.clone(),
            array_index_id,
        }];
        if created {
            dirty.push(DirtyKey::Array(array_id));
        }
        Ok(Applied {
            update: true,
            dirty,
            ..Applied::default()
        })
    }

    fn apply_remove(&mut self, frame: &Frame) -> Result<Applied, DataError> {
        let array_id = frame.arg_str(0)?.to_string();
        let array_index_id = frame.arg_str(1)?.to_string();
        let array = self
            .arrays
            .get_mut(&array_id)
            .ok_or_else(|| DataError::UnknownArray(array_id.clone()))?;
        if array.remove(&array_index_id).is_none() {
            return Ok(Applied::default());
        }

        let mut events = Vec::new();
        let key = HandKey::map(&array_id, &array_index_id);
        if let Some(owner) = self.owners.remove(&key.to_string()) {
            events.push(DataEvent::LiveHand {
                keys: vec![key],
                live_hand: owner,
            });
        }

        Ok(Applied {
            update: true,
            events,
            dirty: vec![
                DirtyKey::Array(array_id.clone()),
                DirtyKey::Map {
                    array_id,
                    array_index_id,
                },
            ],
            ..Applied::default()
        })
    }

    fn apply_dead_hand(&mut self, frame: &Frame) -> Result<Applied, DataError> {
        let player = frame.arg_str(0)?.to_string();
        let keys = Self::parse_hand_keys(frame)?;
        if keys.is_empty() {
            return Ok(Applied::default());
        }

        // Claiming a key away from another player releases it first, so the
        // exclusivity invariant holds across every session's table.
        let mut released: BTreeMap<String, Vec<HandKey>> = BTreeMap::new();
        for key in &keys {
            let composite = key.to_string();
            if let Some(previous) = self.owners.get(&composite) {
                if *previous != player {
                    released
                        .entry(previous.clone())
                        .or_default()
                        .push(key.clone());
                }
            }
            self.owners.insert(composite, player.clone());
        }

        let mut events: Vec<DataEvent> = released
            .into_iter()
            .map(|(live_hand, keys)| DataEvent::LiveHand { keys, live_hand })
            .collect();
        events.push(DataEvent::DeadHand {
            keys,
            dead_hand: player,
        });

        Ok(Applied {
            update: true,
            events,
            ..Applied::default()
        })
    }

    fn apply_live_hand(&mut self, frame: &Frame) -> Result<Applied, DataError> {
        let player = frame.arg_str(0)?.to_string();
        let keys = Self::parse_hand_keys(frame)?;

        let mut released = Vec::new();
        for key in keys {
            let composite = key.to_string();
            if self.owners.get(&composite).map(String::as_str) == Some(player.as_str()) {
                self.owners.remove(&composite);
                released.push(key);
            }
        }
        if released.is_empty() {
            return Ok(Applied::default());
        }

        Ok(Applied {
            update: true,
            events: vec![DataEvent::LiveHand {
                keys: released,
                live_hand: player,
            }],
            ..Applied::default()
        })
    }

    fn apply_import(&mut self, frame: &Frame) -> Result<Applied, DataError> {
        let snapshot: DataSnapshot =
            serde_json::from_slice(frame.arg(0)?).map_err(|_| DataError::BadSnapshot)?;

        self.owners = snapshot.owners;
        self.players = snapshot.players;
        self.arrays = ARRAY_SCHEMA
            .iter()
            .map(|id| (id.to_string(), BTreeMap::new()))
            .collect();

        let mut dirty = Vec::new();
        for (array_id, maps) in snapshot.arrays {
            let Some(target) = self.arrays.get_mut(&array_id) else {
                warn!(array = %array_id, "import carried an array outside the schema");
                continue;
            };
            dirty.push(DirtyKey::Array(array_id.clone()));
            for (array_index_id, map) in maps {
                dirty.push(DirtyKey::Map {
                    array_id: array_id.clone(),
                    array_index_id: array_index_id.clone(),
                });
                target.insert(array_index_id, map);
            }
        }

        Ok(Applied {
            update: true,
            dirty,
            ..Applied::default()
        })
    }

    // Validate every key before mutating anything: a malformed key rejects
    // the whole frame.
    fn parse_hand_keys(frame: &Frame) -> Result<Vec<HandKey>, DataError> {
        (1..frame.args.len())
            .map(|i| HandKey::parse(frame.arg_str(i)?))
            .collect()
    }
}
