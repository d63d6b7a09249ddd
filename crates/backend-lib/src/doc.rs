// ============================
// roomhub-backend-lib/src/doc.rs
// ============================
//! Server replica of the opaque document CRDT.
//!
//! The server never interprets document updates; it keeps the ordered log of
//! applied updates and can collapse it into a single state-as-update blob:
//! one applied update is returned as-is, several are concatenated with
//! length prefixes (a compound update). Clients that understand the document
//! format unpack compounds recursively.

use roomhub_common::{method, Frame};

/// Storage key the document state is persisted under.
pub const DOC_STORAGE_KEY: &str = "crdt";

/// Emitted after every applied mutation; drives the persistence write.
#[derive(Debug, PartialEq, Eq)]
pub enum DocEvent {
    Updated,
}

#[derive(Default)]
pub struct DocClient {
    updates: Vec<Vec<u8>>,
}

impl DocClient {
    /// Construct from the last persisted state, if any.
    pub fn new(initial: Option<Vec<u8>>) -> Self {
        DocClient {
            updates: initial.filter(|bytes| !bytes.is_empty()).into_iter().collect(),
        }
    }

    pub fn handles_method(m: u32) -> bool {
        method::is_document_method(m)
    }

    /// Initial-snapshot message for a newly joining session. The payload is
    /// empty on a fresh room.
    pub fn initial_frame(&self) -> Frame {
        Frame::new(method::DOC_SYNC).push_bytes(self.state_as_update())
    }

    pub fn apply_update(&mut self, update: &[u8]) -> DocEvent {
        if !update.is_empty() {
            self.updates.push(update.to_vec());
        }
        DocEvent::Updated
    }

    /// The full current state as a single update blob.
    pub fn state_as_update(&self) -> Vec<u8> {
        match self.updates.as_slice() {
            [] => Vec::new(),
            [single] => single.clone(),
            many => {
                let total: usize = many.iter().map(|u| 4 + u.len()).sum();
                let mut out = Vec::with_capacity(total);
                for update in many {
                    out.extend_from_slice(&(update.len() as u32).to_le_bytes());
                    out.extend_from_slice(update);
                }
                out
            }
        }
    }
}
