// ============================
// roomhub-backend-lib/src/lock.rs
// ============================
//! Distributed-mutex state machine.
//!
//! Each named lock is either free or held by one player, with a FIFO queue
//! of waiters. Transitions return the `lockResponse` events the coordinator
//! must broadcast; the state machine itself never touches the wire.

use roomhub_common::method;
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Response { player_id: String, lock_name: String },
}

#[derive(Debug)]
struct LockState {
    holder: String,
    waiters: VecDeque<String>,
}

#[derive(Default)]
pub struct LockClient {
    locks: BTreeMap<String, LockState>,
}

impl LockClient {
    pub fn new() -> Self {
        LockClient::default()
    }

    pub fn handles_method(m: u32) -> bool {
        method::is_lock_method(m)
    }

    pub fn holder(&self, lock_name: &str) -> Option<&str> {
        self.locks.get(lock_name).map(|state| state.holder.as_str())
    }

    pub fn request(&mut self, player_id: &str, lock_name: &str) -> Vec<LockEvent> {
        match self.locks.get_mut(lock_name) {
            None => {
                self.locks.insert(
                    lock_name.to_string(),
                    LockState {
                        holder: player_id.to_string(),
                        waiters: VecDeque::new(),
                    },
                );
                vec![LockEvent::Response {
                    player_id: player_id.to_string(),
                    lock_name: lock_name.to_string(),
                }]
            }
            Some(state) if state.holder == player_id => {
                // idempotent re-request
                vec![LockEvent::Response {
                    player_id: player_id.to_string(),
                    lock_name: lock_name.to_string(),
                }]
            }
            Some(state) => {
                if !state.waiters.iter().any(|waiter| waiter == player_id) {
                    state.waiters.push_back(player_id.to_string());
                }
                Vec::new()
            }
        }
    }

    pub fn release(&mut self, player_id: &str, lock_name: &str) -> Vec<LockEvent> {
        let Some(state) = self.locks.get_mut(lock_name) else {
            warn!(lock = lock_name, player = player_id, "release of a free lock ignored");
            return Vec::new();
        };
        if state.holder != player_id {
            warn!(
                lock = lock_name,
                player = player_id,
                holder = %state.holder,
                "release by non-holder ignored"
            );
            return Vec::new();
        }

        match state.waiters.pop_front() {
            Some(next) => {
                state.holder = next.clone();
                vec![LockEvent::Response {
                    player_id: next,
                    lock_name: lock_name.to_string(),
                }]
            }
            None => {
                self.locks.remove(lock_name);
                Vec::new()
            }
        }
    }

    /// Session-scoped auto-unlock: synthesize releases for every lock held
    /// by the player and drop every queue entry naming them.
    pub fn release_session(&mut self, player_id: &str) -> Vec<LockEvent> {
        for state in self.locks.values_mut() {
            state.waiters.retain(|waiter| waiter != player_id);
        }

        let held: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, state)| state.holder == player_id)
            .map(|(name, _)| name.clone())
            .collect();

        let mut events = Vec::new();
        for lock_name in held {
            events.extend(self.release(player_id, &lock_name));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(player: &str, lock: &str) -> LockEvent {
        LockEvent::Response {
            player_id: player.to_string(),
            lock_name: lock.to_string(),
        }
    }

    #[test]
    fn test_free_lock_grants_immediately() {
        let mut locks = LockClient::new();
        assert_eq!(locks.request("a", "L"), vec![response("a", "L")]);
        assert_eq!(locks.holder("L"), Some("a"));
    }

    #[test]
    fn test_contended_request_queues() {
        let mut locks = LockClient::new();
        locks.request("a", "L");
        assert_eq!(locks.request("b", "L"), Vec::new());
        assert_eq!(locks.holder("L"), Some("a"));
    }

    #[test]
    fn test_holder_re_request_is_idempotent() {
        let mut locks = LockClient::new();
        locks.request("a", "L");
        assert_eq!(locks.request("a", "L"), vec![response("a", "L")]);
    }

    #[test]
    fn test_release_promotes_head_of_queue() {
        let mut locks = LockClient::new();
        locks.request("a", "L");
        locks.request("b", "L");
        locks.request("c", "L");

        assert_eq!(locks.release("a", "L"), vec![response("b", "L")]);
        assert_eq!(locks.holder("L"), Some("b"));
        assert_eq!(locks.release("b", "L"), vec![response("c", "L")]);
        assert_eq!(locks.release("c", "L"), Vec::new());
        assert_eq!(locks.holder("L"), None);
    }

    #[test]
    fn test_release_by_non_holder_is_ignored() {
        let mut locks = LockClient::new();
        locks.request("a", "L");
        locks.request("b", "L");
        assert_eq!(locks.release("b", "L"), Vec::new());
        assert_eq!(locks.holder("L"), Some("a"));
    }

    #[test]
    fn test_duplicate_waiter_queued_once() {
        let mut locks = LockClient::new();
        locks.request("a", "L");
        locks.request("b", "L");
        locks.request("b", "L");
        assert_eq!(locks.release("a", "L"), vec![response("b", "L")]);
        // b released: the queue held b only once
        assert_eq!(locks.release("b", "L"), Vec::new());
        assert_eq!(locks.holder("L"), None);
    }

    #[test]
    fn test_release_session_promotes_waiters() {
        let mut locks = LockClient::new();
        locks.request("a", "L1");
        locks.request("a", "L2");
        locks.request("b", "L1");

        let events = locks.release_session("a");
        assert_eq!(events, vec![response("b", "L1")]);
        assert_eq!(locks.holder("L1"), Some("b"));
        assert_eq!(locks.holder("L2"), None);
    }

    #[test]
    fn test_release_session_purges_queue_entries() {
        let mut locks = LockClient::new();
        locks.request("a", "L");
        locks.request("b", "L");
        locks.request("c", "L");

        // b disconnects while queued
        assert_eq!(locks.release_session("b"), Vec::new());
        assert_eq!(locks.release("a", "L"), vec![response("c", "L")]);
    }
}
