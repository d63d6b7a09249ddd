// ============================
// roomhub-backend-lib/src/room_actor.rs
// ============================
//! Per-room session coordinator.
//!
//! One actor task per room owns the three replicated-state clients and the
//! session table, and drains a FIFO mailbox of [`RoomMsg`] values. All
//! dispatch for a room is serialized through that mailbox: no two handlers
//! for the same room ever run in parallel, which is the model the data
//! replica and the lock state machine assume.
//!
//! The mailbox is also the snapshot-before-live guard: a connection's
//! `Attach` is enqueued (and acknowledged) before its reader starts
//! forwarding frames, so a joining client always receives the three
//! snapshot messages before any live update reaches it.

use crate::data::{DataClient, DataEvent, DataMap, DirtyKey, HandKey, ARRAY_SCHEMA};
use crate::doc::{DocClient, DOC_STORAGE_KEY};
use crate::error::AppError;
use crate::lock::{LockClient, LockEvent};
use crate::metrics as metric;
use crate::storage::Storage;
use axum::body::Bytes;
use axum::extract::ws::Message;
use dashmap::DashMap;
use metrics::{counter, gauge};
use roomhub_common::{method, Frame};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

/// Everything the coordinator needs to admit a new session.
#[derive(Clone)]
pub struct SessionSeed {
    pub session_id: SessionId,
    /// Opaque player identifier from the connection URL; may be absent.
    pub player_id: Option<String>,
    /// Outbound queue pumped to the session's socket by its writer task.
    pub tx: mpsc::Sender<Message>,
}

/// Message sent *into* the actor
pub enum RoomMsg {
    Attach {
        seed: SessionSeed,
        resp_tx: mpsc::UnboundedSender<Result<(), AppError>>,
    },
    Frame {
        session_id: SessionId,
        data: Vec<u8>,
    },
    Detach {
        session_id: SessionId,
    },
}

/// Handle that connections keep: the actor's command channel.
#[derive(Clone)]
pub struct RoomHandle {
    cmd_tx: mpsc::UnboundedSender<RoomMsg>,
}

impl RoomHandle {
    /// Admit a session and wait for the attach sequence to complete.
    pub async fn attach(&self, seed: SessionSeed) -> Result<(), AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx
            .send(RoomMsg::Attach { seed, resp_tx })
            .map_err(|_| AppError::RoomClosed)?;
        resp_rx.recv().await.ok_or(AppError::RoomClosed)?
    }

    pub fn frame(&self, session_id: SessionId, data: Vec<u8>) {
        let _ = self.cmd_tx.send(RoomMsg::Frame { session_id, data });
    }

    pub fn detach(&self, session_id: SessionId) {
        let _ = self.cmd_tx.send(RoomMsg::Detach { session_id });
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

struct Session {
    id: SessionId,
    player_id: Option<String>,
    quit: bool,
    /// Composite key -> parsed key for state this player exclusively owns.
    dead_hands: HashMap<String, HandKey>,
    tx: mpsc::Sender<Message>,
}

struct RoomActor<S> {
    room_name: String,
    storage: S,
    sessions: Vec<Session>,
    data: DataClient,
    doc: DocClient,
    locks: LockClient,
}

/// Spawn a room actor and return its handle. The actor initializes its
/// state from storage exactly once, before draining the mailbox, so every
/// concurrent attach observes the same instances.
pub(crate) fn spawn_room_actor<S: Storage + Clone + 'static>(
    room_name: &str,
    storage: S,
    registry: Arc<DashMap<String, RoomHandle>>,
) -> RoomHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let room_name = room_name.to_string();
    tokio::spawn(run_room(room_name, storage, registry, cmd_rx));
    RoomHandle { cmd_tx }
}

async fn run_room<S: Storage + 'static>(
    room_name: String,
    storage: S,
    registry: Arc<DashMap<String, RoomHandle>>,
    mut rx: mpsc::UnboundedReceiver<RoomMsg>,
) {
    let (data, doc) = match load_room_state(&room_name, &storage).await {
        Ok(state) => state,
        Err(err) => {
            error!(room = %room_name, %err, "room state initialization failed");
            registry.remove(&room_name);
            rx.close();
            while let Some(msg) = rx.recv().await {
                if let RoomMsg::Attach { resp_tx, .. } = msg {
                    let _ = resp_tx.send(Err(AppError::Storage(err.to_string())));
                }
            }
            gauge!(metric::ROOM_ACTIVE).decrement(1.0);
            return;
        }
    };

    let mut actor = RoomActor {
        room_name,
        storage,
        sessions: Vec::new(),
        data,
        doc,
        locks: LockClient::new(),
    };

    while let Some(msg) = rx.recv().await {
        match msg {
            RoomMsg::Attach { seed, resp_tx } => {
                let result = actor.handle_attach(seed).await;
                let _ = resp_tx.send(result);
            }
            RoomMsg::Frame { session_id, data } => {
                actor.handle_frame(session_id, data).await;
            }
            RoomMsg::Detach { session_id } => {
                actor.handle_detach(session_id).await;
                if actor.sessions.is_empty() {
                    break;
                }
            }
        }
    }

    // Idle teardown: unregister first so a new joiner constructs a fresh
    // room, then reject anything already queued behind the last detach.
    debug!(room = %actor.room_name, "room idle, shutting down");
    registry.remove(&actor.room_name);
    rx.close();
    while let Some(msg) = rx.recv().await {
        if let RoomMsg::Attach { resp_tx, .. } = msg {
            let _ = resp_tx.send(Err(AppError::RoomClosed));
        }
    }
    counter!(metric::ROOM_EVICTED).increment(1);
    gauge!(metric::ROOM_ACTIVE).decrement(1.0);
}

/// Read the data-model and document state from storage. Called once per
/// room lifetime: one lookup per schema array, one per discovered map, one
/// for the document key.
async fn load_room_state<S: Storage>(
    room_name: &str,
    storage: &S,
) -> Result<(DataClient, DocClient), AppError> {
    let mut data = DataClient::new();
    for array_id in ARRAY_SCHEMA {
        let indices: Vec<String> = match storage.get(room_name, array_id).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };
        for array_index_id in indices {
            let map: DataMap = match storage.get(room_name, &array_index_id).await? {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                // a referenced map missing from storage is repaired as empty
                None => DataMap::new(),
            };
            data.insert_loaded_map(array_id, array_index_id, map);
        }
    }

    let doc = DocClient::new(storage.get(room_name, DOC_STORAGE_KEY).await?);
    Ok((data, doc))
}

impl<S: Storage> RoomActor<S> {
    /// The attach sequence: snapshots, session registration, join broadcast.
    async fn handle_attach(&mut self, seed: SessionSeed) -> Result<(), AppError> {
        debug!(room = %self.room_name, player = ?seed.player_id, "session attaching");

        // Snapshots, in order: data import, document state, current players.
        let import = self.data.export_frame();
        send_to(&seed.tx, binary(&import.encode())).await;
        let sync = self.doc.initial_frame();
        send_to(&seed.tx, binary(&sync.encode())).await;

        let mut init = Frame::new(method::INIT_PLAYERS);
        for session in self.sessions.iter().filter(|s| !s.quit) {
            if let Some(player) = &session.player_id {
                init = init.push_str(player);
            }
        }
        send_to(&seed.tx, binary(&init.encode())).await;

        self.sessions.push(Session {
            id: seed.session_id,
            player_id: seed.player_id.clone(),
            quit: false,
            dead_hands: HashMap::new(),
            tx: seed.tx,
        });

        if let Some(player) = &seed.player_id {
            let join = Frame::new(method::JOIN).push_str(player);
            self.proxy_to_peers(seed.session_id, &join.encode()).await;
            // the local replica observes the membership change too
            if let Err(err) = self.data.apply(&join) {
                warn!(room = %self.room_name, %err, "join frame rejected by data client");
            }
        }

        Ok(())
    }

    async fn handle_frame(&mut self, origin: SessionId, data: Vec<u8>) {
        counter!(metric::FRAME_DISPATCHED).increment(1);
        if let Err(err) = self.dispatch(origin, &data).await {
            warn!(room = %self.room_name, %err, "frame dispatch failed");
            self.respond_error(origin, &err).await;
        }
    }

    /// Route one frame by method class. Classes are not exclusive: every
    /// matching class runs. Methods matching none are dropped.
    async fn dispatch(&mut self, origin: SessionId, data: &[u8]) -> Result<(), AppError> {
        let frame = Frame::decode(data)?;
        let m = frame.method;
        let mut matched = false;

        if DataClient::handles_method(m) {
            matched = true;
            self.dispatch_data(origin, &frame, data).await?;
        }
        if DocClient::handles_method(m) {
            matched = true;
            self.dispatch_doc(origin, &frame, data).await?;
        }
        if LockClient::handles_method(m) {
            matched = true;
            self.dispatch_lock(&frame).await?;
        }
        if method::is_chat_method(m) {
            matched = true;
            self.reflect_to_all(data).await;
        }
        if method::is_audio_method(m) || method::is_video_method(m) {
            matched = true;
            self.proxy_to_peers(origin, data).await;
        }

        if !matched {
            trace!(room = %self.room_name, method = m, "unrecognized method dropped");
        }
        Ok(())
    }

    async fn dispatch_data(
        &mut self,
        origin: SessionId,
        frame: &Frame,
        raw: &[u8],
    ) -> Result<(), AppError> {
        let applied = self
            .data
            .apply(frame)
            .map_err(|err| AppError::Protocol(err.to_string()))?;

        if let Some(rollback) = applied.rollback {
            counter!(metric::DATA_ROLLBACK).increment(1);
            self.respond_to_self(origin, &rollback.encode()).await;
        }
        if applied.update {
            self.route_data_events(&applied.events);
            self.proxy_to_peers(origin, raw).await;
            self.persist_dirty(&applied.dirty).await;
        }
        Ok(())
    }

    async fn dispatch_doc(
        &mut self,
        origin: SessionId,
        frame: &Frame,
        raw: &[u8],
    ) -> Result<(), AppError> {
        let payload = frame.arg(0)?;
        let _event = self.doc.apply_update(payload);
        // the update event drives the persistence write
        let state = self.doc.state_as_update();
        match self
            .storage
            .put(&self.room_name, DOC_STORAGE_KEY, &state)
            .await
        {
            Ok(()) => counter!(metric::DOC_PERSISTED).increment(1),
            Err(err) => warn!(room = %self.room_name, %err, "document persist failed"),
        }
        self.proxy_to_peers(origin, raw).await;
        Ok(())
    }

    async fn dispatch_lock(&mut self, frame: &Frame) -> Result<(), AppError> {
        let events = match frame.method {
            method::LOCK_REQUEST => {
                let player_id = frame.arg_str(0)?;
                let lock_name = frame.arg_str(1)?;
                self.locks.request(player_id, lock_name)
            }
            method::LOCK_RELEASE => {
                let player_id = frame.arg_str(0)?;
                let lock_name = frame.arg_str(1)?;
                self.locks.release(player_id, lock_name)
            }
            other => {
                warn!(room = %self.room_name, method = other, "unknown lock method ignored");
                Vec::new()
            }
        };
        self.broadcast_lock_events(&events).await;
        Ok(())
    }

    /// Close and error share this path; it is idempotent.
    async fn handle_detach(&mut self, session_id: SessionId) {
        let Some(pos) = self.sessions.iter().position(|s| s.id == session_id) else {
            return;
        };
        let mut session = self.sessions.remove(pos);
        session.quit = true;
        debug!(room = %self.room_name, player = ?session.player_id, "session detached");

        if let Some(player) = &session.player_id {
            let leave = Frame::new(method::LEAVE).push_str(player);
            self.proxy_to_peers(session.id, &leave.encode()).await;
            if let Err(err) = self.data.apply(&leave) {
                warn!(room = %self.room_name, %err, "leave frame rejected by data client");
            }
        }

        self.dead_hand_cleanup(&session).await;

        if let Some(player) = &session.player_id {
            let events = self.locks.release_session(player);
            self.broadcast_lock_events(&events).await;
        }
    }

    /// Remove every piece of state the departed session owned. Synthesized
    /// removes take the same apply-then-proxy path as client updates, so
    /// peers converge through normal replication.
    async fn dead_hand_cleanup(&mut self, session: &Session) {
        for key in session.dead_hands.values() {
            match &key.array_index_id {
                Some(array_index_id) => {
                    if self.data.contains_map(&key.array_id, array_index_id) {
                        self.remove_map(session.id, &key.array_id, array_index_id)
                            .await;
                    }
                }
                None => {
                    for array_index_id in self.data.array_indices(&key.array_id) {
                        self.remove_map(session.id, &key.array_id, &array_index_id)
                            .await;
                    }
                }
            }
        }
    }

    async fn remove_map(&mut self, origin: SessionId, array_id: &str, array_index_id: &str) {
        let frame = Frame::new(method::STATE_REMOVE)
            .push_str(array_id)
            .push_str(array_index_id);
        let raw = frame.encode();
        match self.data.apply(&frame) {
            Ok(applied) => {
                self.route_data_events(&applied.events);
                self.proxy_to_peers(origin, &raw).await;
                self.persist_dirty(&applied.dirty).await;
            }
            Err(err) => {
                warn!(room = %self.room_name, %err, "synthesized remove rejected");
            }
        }
    }

    /// Maintain each session's dead-hand table from ownership events,
    /// filtered to the session's player id.
    fn route_data_events(&mut self, events: &[DataEvent]) {
        for event in events {
            match event {
                DataEvent::DeadHand { keys, dead_hand } => {
                    for session in self
                        .sessions
                        .iter_mut()
                        .filter(|s| s.player_id.as_deref() == Some(dead_hand.as_str()))
                    {
                        for key in keys {
                            session.dead_hands.insert(key.to_string(), key.clone());
                        }
                    }
                }
                DataEvent::LiveHand { keys, live_hand } => {
                    for session in self
                        .sessions
                        .iter_mut()
                        .filter(|s| s.player_id.as_deref() == Some(live_hand.as_str()))
                    {
                        for key in keys {
                            session.dead_hands.remove(&key.to_string());
                        }
                    }
                }
            }
        }
    }

    async fn persist_dirty(&self, dirty: &[DirtyKey]) {
        for key in dirty {
            let encoded = match key {
                DirtyKey::Array(array_id) => self
                    .data
                    .encode_array(array_id)
                    .map(|bytes| (array_id.clone(), bytes)),
                DirtyKey::Map {
                    array_id,
                    array_index_id,
                } => self
                    .data
                    .encode_map(array_id, array_index_id)
                    .map(|bytes| (array_index_id.clone(), bytes)),
            };
            let (storage_key, bytes) = match encoded {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(room = %self.room_name, %err, "state encode failed");
                    continue;
                }
            };
            if let Err(err) = self.storage.put(&self.room_name, &storage_key, &bytes).await {
                warn!(room = %self.room_name, %err, "state persist failed");
            }
        }
    }

    async fn broadcast_lock_events(&mut self, events: &[LockEvent]) {
        for LockEvent::Response {
            player_id,
            lock_name,
        } in events
        {
            counter!(metric::LOCK_GRANTED).increment(1);
            let frame = Frame::new(method::LOCK_RESPONSE)
                .push_str(player_id)
                .push_str(lock_name);
            // every peer observes the global lock outcome
            self.reflect_to_all(&frame.encode()).await;
        }
    }

    async fn respond_error(&self, origin: SessionId, err: &AppError) {
        if let Some(session) = self.sessions.iter().find(|s| s.id == origin && !s.quit) {
            if session.tx.send(err.client_frame()).await.is_err() {
                counter!(metric::SEND_FAILED).increment(1);
                warn!(room = %self.room_name, "error frame send failed");
            }
        }
    }

    /// Send to the originator only.
    async fn respond_to_self(&self, origin: SessionId, data: &[u8]) {
        if let Some(session) = self.sessions.iter().find(|s| s.id == origin && !s.quit) {
            if session.tx.send(binary(data)).await.is_err() {
                counter!(metric::SEND_FAILED).increment(1);
                warn!(room = %self.room_name, "send to originator failed");
            }
        }
    }

    /// Send to every session except the originator.
    async fn proxy_to_peers(&self, origin: SessionId, data: &[u8]) {
        let message = binary(data);
        for session in self.sessions.iter().filter(|s| !s.quit && s.id != origin) {
            if session.tx.send(message.clone()).await.is_err() {
                counter!(metric::SEND_FAILED).increment(1);
                warn!(room = %self.room_name, player = ?session.player_id, "peer send failed");
            }
        }
    }

    /// Send to every session including the originator.
    async fn reflect_to_all(&self, data: &[u8]) {
        let message = binary(data);
        for session in self.sessions.iter().filter(|s| !s.quit) {
            if session.tx.send(message.clone()).await.is_err() {
                counter!(metric::SEND_FAILED).increment(1);
                warn!(room = %self.room_name, player = ?session.player_id, "reflect send failed");
            }
        }
    }
}

fn binary(data: &[u8]) -> Message {
    Message::Binary(Bytes::copy_from_slice(data))
}

async fn send_to(tx: &mpsc::Sender<Message>, message: Message) {
    if tx.send(message).await.is_err() {
        counter!(metric::SEND_FAILED).increment(1);
        warn!("snapshot send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataSnapshot;
    use crate::storage::FlatFileStorage;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (RoomHandle, Arc<DashMap<String, RoomHandle>>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FlatFileStorage::new(temp_dir.path()).unwrap();
        let registry = Arc::new(DashMap::new());
        let handle = spawn_room_actor("r1", storage, registry.clone());
        registry.insert("r1".to_string(), handle.clone());
        (handle, registry, temp_dir)
    }

    async fn attach(handle: &RoomHandle, player: Option<&str>) -> (SessionId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(32);
        let session_id = Uuid::new_v4();
        handle
            .attach(SessionSeed {
                session_id,
                player_id: player.map(str::to_string),
                tx,
            })
            .await
            .unwrap();
        (session_id, rx)
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<Message>) -> Frame {
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("channel closed");
        match message {
            Message::Binary(data) => Frame::decode(&data).unwrap(),
            other => panic!("expected a binary frame, got {other:?}"),
        }
    }

    async fn recv_text(rx: &mut mpsc::Receiver<Message>) -> String {
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("channel closed");
        match message {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    async fn expect_silence(rx: &mut mpsc::Receiver<Message>) {
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "unexpected message: {:?}", result.unwrap());
    }

    /// Attach and drain the three snapshot frames.
    async fn attach_and_drain(
        handle: &RoomHandle,
        player: Option<&str>,
    ) -> (SessionId, mpsc::Receiver<Message>) {
        let (session_id, mut rx) = attach(handle, player).await;
        for _ in 0..3 {
            recv_frame(&mut rx).await;
        }
        (session_id, rx)
    }

    fn add_frame(index: &str) -> Vec<u8> {
        Frame::new(method::STATE_ADD)
            .push_str("worldApps")
            .push_str(index)
            .encode()
    }

    fn dead_hand_frame(player: &str, key: &str) -> Vec<u8> {
        Frame::new(method::DEAD_HAND)
            .push_str(player)
            .push_str(key)
            .encode()
    }

    #[tokio::test]
    async fn test_attach_sends_snapshots_in_order() {
        let (handle, _registry, _temp_dir) = setup();
        let (_a, mut rx) = attach(&handle, Some("a")).await;

        assert_eq!(recv_frame(&mut rx).await.method, method::STATE_IMPORT);
        assert_eq!(recv_frame(&mut rx).await.method, method::DOC_SYNC);
        let init = recv_frame(&mut rx).await;
        assert_eq!(init.method, method::INIT_PLAYERS);
        assert!(init.args.is_empty(), "first session sees no peers");
    }

    #[tokio::test]
    async fn test_join_broadcast_and_init_players() {
        let (handle, _registry, _temp_dir) = setup();
        let (_a, mut a_rx) = attach_and_drain(&handle, Some("a")).await;

        let (_b, mut b_rx) = attach(&handle, Some("b")).await;
        recv_frame(&mut b_rx).await; // import
        recv_frame(&mut b_rx).await; // doc sync
        let init = recv_frame(&mut b_rx).await;
        assert_eq!(init.method, method::INIT_PLAYERS);
        assert_eq!(init.arg_str(0).unwrap(), "a");

        let join = recv_frame(&mut a_rx).await;
        assert_eq!(join.method, method::JOIN);
        assert_eq!(join.arg_str(0).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_anonymous_session_produces_no_join() {
        let (handle, _registry, _temp_dir) = setup();
        let (_a, mut a_rx) = attach_and_drain(&handle, Some("a")).await;

        let (_n, mut n_rx) = attach(&handle, None).await;
        recv_frame(&mut n_rx).await;
        recv_frame(&mut n_rx).await;
        let init = recv_frame(&mut n_rx).await;
        assert_eq!(init.arg_str(0).unwrap(), "a");

        expect_silence(&mut a_rx).await;
    }

    // S1: join, ownership, clean disconnect.
    #[tokio::test]
    async fn test_dead_hand_removes_owned_map_on_disconnect() {
        let (handle, _registry, _temp_dir) = setup();
        let (a, mut a_rx) = attach_and_drain(&handle, Some("a")).await;

        handle.frame(a, add_frame("x1"));
        handle.frame(a, dead_hand_frame("a", "worldApps.x1"));

        let (_b, mut b_rx) = attach(&handle, Some("b")).await;
        let import = recv_frame(&mut b_rx).await;
        assert_eq!(import.method, method::STATE_IMPORT);
        let snapshot: DataSnapshot = serde_json::from_slice(import.arg(0).unwrap()).unwrap();
        assert!(snapshot.arrays["worldApps"].contains_key("x1"));
        recv_frame(&mut b_rx).await; // doc sync
        recv_frame(&mut b_rx).await; // init players
        recv_frame(&mut a_rx).await; // join b

        handle.detach(a);

        let leave = recv_frame(&mut b_rx).await;
        assert_eq!(leave.method, method::LEAVE);
        assert_eq!(leave.arg_str(0).unwrap(), "a");

        let remove = recv_frame(&mut b_rx).await;
        assert_eq!(remove.method, method::STATE_REMOVE);
        assert_eq!(remove.arg_str(0).unwrap(), "worldApps");
        assert_eq!(remove.arg_str(1).unwrap(), "x1");
    }

    // S4: array-scope dead hand removes every map in the array.
    #[tokio::test]
    async fn test_array_scope_dead_hand() {
        let (handle, _registry, _temp_dir) = setup();
        let (a, _a_rx) = attach_and_drain(&handle, Some("a")).await;

        handle.frame(a, dead_hand_frame("a", "worldApps"));
        handle.frame(a, add_frame("x1"));
        handle.frame(a, add_frame("x2"));

        let (_b, mut b_rx) = attach_and_drain(&handle, Some("b")).await;
        handle.detach(a);

        let leave = recv_frame(&mut b_rx).await;
        assert_eq!(leave.method, method::LEAVE);

        let mut removed = Vec::new();
        for _ in 0..2 {
            let frame = recv_frame(&mut b_rx).await;
            assert_eq!(frame.method, method::STATE_REMOVE);
            removed.push(frame.arg_str(1).unwrap().to_string());
        }
        removed.sort();
        assert_eq!(removed, vec!["x1".to_string(), "x2".to_string()]);
    }

    // S5: a stale update rolls back to the originator only.
    #[tokio::test]
    async fn test_rollback_goes_to_originator_only() {
        let (handle, _registry, _temp_dir) = setup();
        let (a, mut a_rx) = attach_and_drain(&handle, Some("a")).await;

        let set = |epoch: u64, value: &str| {
            Frame::new(method::STATE_SET)
                .push_str("worldApps")
                .push_str("x1")
                .push_str("color")
                .push_u64(epoch)
                .push_str(value)
                .encode()
        };
        handle.frame(a, set(5, "blue"));

        let (_b, mut b_rx) = attach_and_drain(&handle, Some("b")).await;
        recv_frame(&mut a_rx).await; // join b

        handle.frame(a, set(3, "red"));

        let rollback = recv_frame(&mut a_rx).await;
        assert_eq!(rollback.method, method::STATE_ROLLBACK);
        assert_eq!(rollback.arg_u64(3).unwrap(), 5);
        assert_eq!(rollback.arg_str(4).unwrap(), "blue");

        expect_silence(&mut b_rx).await;
    }

    #[tokio::test]
    async fn test_chat_reflects_to_originator_and_peers() {
        let (handle, _registry, _temp_dir) = setup();
        let (a, mut a_rx) = attach_and_drain(&handle, Some("a")).await;
        let (_b, mut b_rx) = attach_and_drain(&handle, Some("b")).await;
        recv_frame(&mut a_rx).await; // join b

        let chat = Frame::new(method::CHAT).push_str("hello").encode();
        handle.frame(a, chat);

        assert_eq!(recv_frame(&mut a_rx).await.method, method::CHAT);
        assert_eq!(recv_frame(&mut b_rx).await.method, method::CHAT);
    }

    #[tokio::test]
    async fn test_audio_proxies_to_peers_only() {
        let (handle, _registry, _temp_dir) = setup();
        let (a, mut a_rx) = attach_and_drain(&handle, Some("a")).await;
        let (_b, mut b_rx) = attach_and_drain(&handle, Some("b")).await;
        recv_frame(&mut a_rx).await; // join b

        handle.frame(a, Frame::new(method::AUDIO).push_bytes(vec![1, 2, 3]).encode());

        assert_eq!(recv_frame(&mut b_rx).await.method, method::AUDIO);
        expect_silence(&mut a_rx).await;
    }

    #[tokio::test]
    async fn test_unknown_method_is_dropped() {
        let (handle, _registry, _temp_dir) = setup();
        let (a, mut a_rx) = attach_and_drain(&handle, Some("a")).await;

        handle.frame(a, Frame::new(99).push_str("noise").encode());
        expect_silence(&mut a_rx).await;

        // the session still works afterwards
        handle.frame(a, Frame::new(method::CHAT).push_str("still here").encode());
        assert_eq!(recv_frame(&mut a_rx).await.method, method::CHAT);
    }

    #[tokio::test]
    async fn test_undecodable_frame_reports_error_to_sender() {
        let (handle, _registry, _temp_dir) = setup();
        let (a, mut a_rx) = attach_and_drain(&handle, Some("a")).await;

        handle.frame(a, vec![1, 2, 3]);
        let text = recv_text(&mut a_rx).await;
        assert!(text.contains("error"));
    }

    // S2: lock handoff on release.
    #[tokio::test]
    async fn test_lock_handoff_on_release() {
        let (handle, _registry, _temp_dir) = setup();
        let (a, mut a_rx) = attach_and_drain(&handle, Some("a")).await;
        let (b, mut b_rx) = attach_and_drain(&handle, Some("b")).await;
        recv_frame(&mut a_rx).await; // join b

        let lock = |m: u32, player: &str| {
            Frame::new(m).push_str(player).push_str("L").encode()
        };

        handle.frame(a, lock(method::LOCK_REQUEST, "a"));
        let granted = recv_frame(&mut a_rx).await;
        assert_eq!(granted.method, method::LOCK_RESPONSE);
        assert_eq!(granted.arg_str(0).unwrap(), "a");
        assert_eq!(recv_frame(&mut b_rx).await.method, method::LOCK_RESPONSE);

        handle.frame(b, lock(method::LOCK_REQUEST, "b"));
        expect_silence(&mut b_rx).await;

        handle.frame(a, lock(method::LOCK_RELEASE, "a"));
        let handoff = recv_frame(&mut b_rx).await;
        assert_eq!(handoff.method, method::LOCK_RESPONSE);
        assert_eq!(handoff.arg_str(0).unwrap(), "b");
    }

    // S3: lock handoff when the holder disconnects.
    #[tokio::test]
    async fn test_lock_handoff_on_disconnect() {
        let (handle, _registry, _temp_dir) = setup();
        let (a, mut a_rx) = attach_and_drain(&handle, Some("a")).await;
        let (b, mut b_rx) = attach_and_drain(&handle, Some("b")).await;
        recv_frame(&mut a_rx).await; // join b

        let lock = |m: u32, player: &str| {
            Frame::new(m).push_str(player).push_str("L").encode()
        };
        handle.frame(a, lock(method::LOCK_REQUEST, "a"));
        recv_frame(&mut a_rx).await;
        recv_frame(&mut b_rx).await;
        handle.frame(b, lock(method::LOCK_REQUEST, "b"));

        handle.detach(a);

        let leave = recv_frame(&mut b_rx).await;
        assert_eq!(leave.method, method::LEAVE);
        let handoff = recv_frame(&mut b_rx).await;
        assert_eq!(handoff.method, method::LOCK_RESPONSE);
        assert_eq!(handoff.arg_str(0).unwrap(), "b");
        assert_eq!(handoff.arg_str(1).unwrap(), "L");
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let (handle, _registry, _temp_dir) = setup();
        let (a, _a_rx) = attach_and_drain(&handle, Some("a")).await;
        let (b, mut b_rx) = attach_and_drain(&handle, Some("b")).await;

        handle.detach(a);
        handle.detach(a);

        let leave = recv_frame(&mut b_rx).await;
        assert_eq!(leave.method, method::LEAVE);
        expect_silence(&mut b_rx).await;

        // the room is still serving the remaining session
        handle.frame(b, Frame::new(method::CHAT).push_str("hi").encode());
        assert_eq!(recv_frame(&mut b_rx).await.method, method::CHAT);
    }

    #[tokio::test]
    async fn test_idle_room_unregisters_and_exits() {
        let (handle, registry, _temp_dir) = setup();
        let (a, _a_rx) = attach_and_drain(&handle, Some("a")).await;
        handle.detach(a);

        for _ in 0..50 {
            if handle.is_closed() && registry.get("r1").is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("idle room did not shut down");
    }
}
