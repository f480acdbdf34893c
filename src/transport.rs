//! In-process peer transport: named broadcast groups.
//!
//! Every collaborative room maps to one group named
//! `"<namespace>-<roomId>"`. All current members receive every payload
//! published to the group (opaque bytes, shared as `Arc<Vec<u8>>` so
//! fan-out never copies). Filtering out one's own frames is the
//! subscriber's job.
//!
//! Membership is scoped: a `GroupHandle` leaves its group on drop, and
//! a group with no members is removed from the hub.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use uuid::Uuid;

/// Fan-out statistics for one group.
#[derive(Debug, Clone, Default)]
pub struct GroupStats {
    pub messages_sent: u64,
    pub members: usize,
}

struct Group {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: RwLock<HashSet<Uuid>>,
    messages_sent: AtomicU64,
}

impl Group {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            messages_sent: AtomicU64::new(0),
        }
    }
}

struct HubInner {
    groups: RwLock<HashMap<String, Arc<Group>>>,
    namespace: String,
    capacity: usize,
}

/// Registry of broadcast groups, one per room. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// `capacity` bounds how many payloads a lagging member may buffer
    /// before it starts dropping (and resynchronizes via handshake).
    pub fn new(namespace: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                groups: RwLock::new(HashMap::new()),
                namespace: namespace.into(),
                capacity,
            }),
        }
    }

    fn group_name(&self, room_id: &str) -> String {
        format!("{}-{}", self.inner.namespace, room_id)
    }

    /// Join the group for `room_id`. The returned handle carries this
    /// member's receiver and publishes to the whole group; dropping it
    /// leaves the group.
    pub fn join(&self, room_id: &str, session_id: Uuid) -> GroupHandle {
        let name = self.group_name(room_id);
        let group = {
            let groups = self.inner.groups.read().expect("hub lock poisoned");
            groups.get(&name).cloned()
        };
        let group = match group {
            Some(g) => g,
            None => {
                let mut groups = self.inner.groups.write().expect("hub lock poisoned");
                groups
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(Group::new(self.inner.capacity)))
                    .clone()
            }
        };

        group
            .members
            .write()
            .expect("group lock poisoned")
            .insert(session_id);
        let receiver = group.sender.subscribe();

        GroupHandle {
            hub: self.clone(),
            group,
            name,
            session_id,
            receiver: Some(receiver),
        }
    }

    /// Number of members currently in the group for `room_id`.
    pub fn member_count(&self, room_id: &str) -> usize {
        let name = self.group_name(room_id);
        let groups = self.inner.groups.read().expect("hub lock poisoned");
        groups
            .get(&name)
            .map(|g| g.members.read().expect("group lock poisoned").len())
            .unwrap_or(0)
    }

    /// Number of live groups.
    pub fn group_count(&self) -> usize {
        self.inner.groups.read().expect("hub lock poisoned").len()
    }

    fn drop_member(&self, name: &str, session_id: Uuid) {
        let mut groups = self.inner.groups.write().expect("hub lock poisoned");
        if let Some(group) = groups.get(name) {
            let empty = {
                let mut members = group.members.write().expect("group lock poisoned");
                members.remove(&session_id);
                members.is_empty()
            };
            if empty {
                groups.remove(name);
            }
        }
    }
}

/// One member's handle into a broadcast group.
pub struct GroupHandle {
    hub: BroadcastHub,
    group: Arc<Group>,
    name: String,
    session_id: Uuid,
    receiver: Option<broadcast::Receiver<Arc<Vec<u8>>>>,
}

impl GroupHandle {
    /// Take this member's receiver (once) to move into a reader task.
    pub fn take_receiver(&mut self) -> Option<broadcast::Receiver<Arc<Vec<u8>>>> {
        self.receiver.take()
    }

    /// Publish a payload to every member (including this one — callers
    /// filter by session id). Returns the number of receivers reached.
    pub fn publish(&self, payload: Arc<Vec<u8>>) -> usize {
        let reached = self.group.sender.send(payload).unwrap_or(0);
        self.group.messages_sent.fetch_add(1, Ordering::Relaxed);
        reached
    }

    pub fn stats(&self) -> GroupStats {
        GroupStats {
            messages_sent: self.group.messages_sent.load(Ordering::Relaxed),
            members: self
                .group
                .members
                .read()
                .expect("group lock poisoned")
                .len(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for GroupHandle {
    fn drop(&mut self) {
        self.hub.drop_member(&self.name, self.session_id);
    }
}
