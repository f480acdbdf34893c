//! CRDT collaboration engine.
//!
//! ```text
//! set(key, value)                       remote frame
//!       │                                    │
//!       ▼                                    ▼
//! ┌─────────────┐   update bytes   ┌──────────────────┐
//! │ Yrs replica │ ───────────────► │ broadcast group  │
//! │ (this peer) │ ◄─────────────── │ "<ns>-<roomId>"  │
//! └──────┬──────┘   apply_update   └──────────────────┘
//!        │
//!        ▼ append / compact
//! ┌─────────────┐
//! │ ReplicaCache│  (RocksDB, offline continuation)
//! └─────────────┘
//! ```
//!
//! Every replica holds full causal history; updates merge commutatively,
//! associatively, and idempotently, so replicas that have seen the same
//! set of operations converge regardless of arrival order. A session
//! with no peers degrades to local-only operation — reads and writes
//! keep working against the local replica and reconcile when traffic
//! resumes. Peer and cache failures are logged, never thrown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

use crate::awareness::{color_for, Awareness};
use crate::error::ErrorKind;
use crate::protocol::{AwarenessPayload, Frame, FrameKind};
use crate::storage::ReplicaCache;
use crate::transport::{BroadcastHub, GroupHandle};

/// Name of the shared root map every session operates on.
const SHARED_ROOT: &str = "shared";

/// Identity of the human behind a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

struct DocState {
    doc: Doc,
    map: MapRef,
}

struct Replica {
    state: Mutex<DocState>,
}

/// Factory for collaborative sessions. Holds the injected peer hub and
/// the shared durable cache.
#[derive(Clone)]
pub struct CollabEngine {
    hub: BroadcastHub,
    cache: Arc<ReplicaCache>,
}

impl CollabEngine {
    pub fn new(hub: BroadcastHub, cache: Arc<ReplicaCache>) -> Self {
        Self { hub, cache }
    }

    /// Open (or reattach to) the replica for `room_id`.
    ///
    /// `seed` is applied only when the locally persisted replica comes
    /// up empty — reopening an existing replica ignores it, and racing
    /// seeders converge by merge.
    pub async fn open(
        &self,
        room_id: &str,
        participant: Participant,
        seed: Option<serde_json::Map<String, Value>>,
    ) -> Result<CollabSession, ErrorKind> {
        let session_id = Uuid::new_v4();
        let doc = Doc::new();
        let map = doc.get_or_insert_map(SHARED_ROOT);

        let mut group = self.hub.join(room_id, session_id);
        let receiver = group
            .take_receiver()
            .ok_or(ErrorKind::FailedPrecondition)?;
        let group = Arc::new(group);

        // Load whatever this device already knows about the room.
        let (synced_tx, synced_rx) = watch::channel(false);
        self.cache.load_into(room_id, &doc)?;
        let _ = synced_tx.send(true);

        // First writer wins the seed: only an empty replica takes it.
        if let Some(seed) = seed {
            let is_empty = {
                let txn = doc.transact();
                map.len(&txn) == 0
            };
            if is_empty && !seed.is_empty() {
                let sv_before = doc.transact().state_vector();
                {
                    let mut txn = doc.transact_mut();
                    for (key, value) in &seed {
                        map.insert(&mut txn, key.as_str(), json_to_any(value));
                    }
                }
                let update = doc.transact().encode_state_as_update_v1(&sv_before);
                if let Err(e) = self.cache.append_update(room_id, &update) {
                    log::warn!("seed persistence for {room_id} failed: {e}");
                }
                publish_frame(&group, Frame::update(session_id, room_id, update));
            }
        }

        let local_state = AwarenessPayload {
            participant_id: participant.id.clone(),
            display_name: participant.display_name.clone(),
            color: color_for(&participant.id).to_string(),
        };
        let awareness = Arc::new(Awareness::new(session_id, local_state.clone()));

        let replica = Arc::new(Replica {
            state: Mutex::new(DocState { doc, map }),
        });

        // Handshake: ask the group for anything we're missing, and
        // announce ourselves on the awareness channel.
        {
            let state = replica.state.lock().await;
            let sv = state.doc.transact().state_vector().encode_v1();
            publish_frame(&group, Frame::sync_request(session_id, room_id, sv));
        }
        match Frame::awareness(session_id, room_id, &local_state) {
            Ok(frame) => publish_frame(&group, frame),
            Err(e) => log::warn!("awareness announce failed: {e}"),
        }

        let closed = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(
            receiver,
            replica.clone(),
            awareness.clone(),
            group.clone(),
            self.cache.clone(),
            room_id.to_string(),
            session_id,
        );

        Ok(CollabSession {
            room_id: room_id.to_string(),
            session_id,
            replica,
            awareness,
            group: std::sync::Mutex::new(Some(group)),
            cache: self.cache.clone(),
            synced: synced_rx,
            closed,
            reader,
        })
    }
}

/// A live editing session over one room's shared key-value namespace.
pub struct CollabSession {
    room_id: String,
    session_id: Uuid,
    replica: Arc<Replica>,
    awareness: Arc<Awareness>,
    group: std::sync::Mutex<Option<Arc<GroupHandle>>>,
    cache: Arc<ReplicaCache>,
    synced: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl CollabSession {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Write one key. The value replaces whatever was there wholesale;
    /// callers wanting finer-grained merge model finer-grained keys.
    ///
    /// Always succeeds locally while the session is open — peer or
    /// cache trouble degrades to local-only operation and reconciles
    /// later.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), ErrorKind> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ErrorKind::FailedPrecondition);
        }

        let update = {
            let state = self.replica.state.lock().await;
            let sv_before = state.doc.transact().state_vector();
            {
                let mut txn = state.doc.transact_mut();
                state.map.insert(&mut txn, key, json_to_any(&value));
            }
            let update = state.doc.transact().encode_state_as_update_v1(&sv_before);
            update
        };

        if let Err(e) = self.cache.append_update(&self.room_id, &update) {
            log::warn!("local persistence for {} degraded: {e}", self.room_id);
        }
        if let Some(group) = self.group.lock().expect("group lock poisoned").as_ref() {
            publish_frame(group, Frame::update(self.session_id, &self.room_id, update));
        }
        Ok(())
    }

    /// Read one key from the local replica.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let state = self.replica.state.lock().await;
        let txn = state.doc.transact();
        match state.map.get(&txn, key) {
            Some(Out::Any(any)) => Some(any_to_json(&any)),
            _ => None,
        }
    }

    /// Snapshot of the whole shared namespace.
    pub async fn entries(&self) -> HashMap<String, Value> {
        let state = self.replica.state.lock().await;
        let txn = state.doc.transact();
        state
            .map
            .iter(&txn)
            .filter_map(|(k, v)| match v {
                Out::Any(any) => Some((k.to_string(), any_to_json(&any))),
                _ => None,
            })
            .collect()
    }

    /// Ephemeral awareness channel for this session.
    pub fn awareness(&self) -> Arc<Awareness> {
        self.awareness.clone()
    }

    /// True once prior local state has been loaded into the replica.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait for the local-load signal. The session should not be
    /// treated as usable before this resolves.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// End the session: announce departure, leave the broadcast group,
    /// fold the update log into a snapshot, and release the replica.
    /// Idempotent — later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let group = self.group.lock().expect("group lock poisoned").take();
        if let Some(group) = group {
            publish_frame(
                &group,
                Frame::awareness_leave(self.session_id, &self.room_id),
            );
        }
        self.reader.abort();

        let state = self.replica.state.lock().await;
        if let Err(e) = self.cache.compact(&self.room_id, &state.doc) {
            log::warn!("snapshot compaction for {} failed: {e}", self.room_id);
        }
        drop(state);

        self.awareness.clear();
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        // Best-effort release when close() was never awaited.
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
    }
}

fn publish_frame(group: &GroupHandle, frame: Frame) {
    match frame.encode() {
        Ok(bytes) => {
            group.publish(Arc::new(bytes));
        }
        Err(e) => log::warn!("frame encode failed, dropping: {e}"),
    }
}

fn spawn_reader(
    mut receiver: tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>,
    replica: Arc<Replica>,
    awareness: Arc<Awareness>,
    group: Arc<GroupHandle>,
    cache: Arc<ReplicaCache>,
    room_id: String,
    session_id: Uuid,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(payload) => {
                    handle_frame(
                        &payload, &replica, &awareness, &group, &cache, &room_id, session_id,
                    )
                    .await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // Dropped frames are recovered by asking the group
                    // for a fresh diff against our state vector.
                    log::debug!("peer channel lagged by {missed} frames, resyncing");
                    let sv = {
                        let state = replica.state.lock().await;
                        let sv = state.doc.transact().state_vector();
                        sv.encode_v1()
                    };
                    publish_frame(&group, Frame::sync_request(session_id, &room_id, sv));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_frame(
    payload: &[u8],
    replica: &Replica,
    awareness: &Awareness,
    group: &GroupHandle,
    cache: &ReplicaCache,
    room_id: &str,
    session_id: Uuid,
) {
    let frame = match Frame::decode(payload) {
        Ok(frame) => frame,
        Err(e) => {
            log::debug!("ignoring undecodable peer frame: {e}");
            return;
        }
    };
    // Skip our own echoes and any stray cross-room traffic.
    if frame.session_id == session_id || frame.room_id != room_id {
        return;
    }

    match frame.kind {
        FrameKind::Update | FrameKind::SyncReply => {
            let applied = {
                let state = replica.state.lock().await;
                match Update::decode_v1(&frame.payload) {
                    Ok(update) => {
                        let mut txn = state.doc.transact_mut();
                        txn.apply_update(update).is_ok()
                    }
                    Err(e) => {
                        log::debug!("ignoring malformed update from peer: {e}");
                        false
                    }
                }
            };
            if applied {
                // Remote operations are cached too, so an offline
                // restart resumes from the fully merged state.
                if let Err(e) = cache.append_update(room_id, &frame.payload) {
                    log::warn!("caching remote update for {room_id} failed: {e}");
                }
            }
        }
        FrameKind::SyncRequest => {
            let diff = {
                let state = replica.state.lock().await;
                let txn = state.doc.transact();
                match StateVector::decode_v1(&frame.payload) {
                    Ok(sv) => Some(txn.encode_state_as_update_v1(&sv)),
                    Err(e) => {
                        log::debug!("ignoring malformed state vector: {e}");
                        None
                    }
                }
            };
            if let Some(diff) = diff {
                publish_frame(group, Frame::sync_reply(session_id, room_id, diff));
            }
            // The requester joined after our announce; repeat it so it
            // learns who is already here.
            if let Some(local) = awareness.local_state() {
                match Frame::awareness(session_id, room_id, &local) {
                    Ok(frame) => publish_frame(group, frame),
                    Err(e) => log::warn!("awareness re-announce failed: {e}"),
                }
            }
        }
        FrameKind::Awareness => match frame.awareness_payload() {
            Ok(state) => awareness.apply_remote(frame.session_id, state),
            Err(e) => log::debug!("ignoring malformed awareness payload: {e}"),
        },
        FrameKind::AwarenessLeave => awareness.remove(frame.session_id),
    }
}

fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Any::BigInt(i)
            } else {
                Any::Number(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Any::from(s.as_str()),
        Value::Array(items) => Any::from(items.iter().map(json_to_any).collect::<Vec<_>>()),
        Value::Object(map) => Any::from(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect::<HashMap<String, Any>>(),
        ),
    }
}

fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_any_roundtrip_scalars() {
        for value in [json!(null), json!(true), json!(42), json!(2.5), json!("hi")] {
            let back = any_to_json(&json_to_any(&value));
            assert_eq!(back, value);
        }
    }

    #[test]
    fn test_json_any_roundtrip_structured() {
        let value = json!({
            "title": "Week 3 notes",
            "strokes": [{"x": 1, "y": 2}, {"x": 3, "y": 4}],
            "pinned": true
        });
        assert_eq!(any_to_json(&json_to_any(&value)), value);
    }

    #[test]
    fn test_participant_ctor() {
        let p = Participant::new("u1", "Alice");
        assert_eq!(p.id, "u1");
        assert_eq!(p.display_name, "Alice");
    }
}
