//! Ephemeral per-session awareness: who is in the collaborative room
//! right now, under what name and color.
//!
//! Awareness lives only in memory and on the peer channel — it is never
//! persisted and cannot survive a process restart. Consumers get a
//! coalescable change signal and re-derive the full active-peer list
//! from `states()` rather than receiving deltas.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::AwarenessPayload;

/// Fixed display palette. Colors are picked by hashing the participant
/// id, so one identity keeps its color across sessions; two identities
/// may share a color.
pub const PALETTE: [&str; 8] = [
    "#ef4444", "#f97316", "#eab308", "#22c55e", "#14b8a6", "#3b82f6", "#8b5cf6", "#ec4899",
];

/// Stable palette color for a participant id.
pub fn color_for(participant_id: &str) -> &'static str {
    let mut hasher = DefaultHasher::new();
    participant_id.hash(&mut hasher);
    PALETTE[(hasher.finish() % PALETTE.len() as u64) as usize]
}

/// Per-session awareness map for one collaborative room.
pub struct Awareness {
    session_id: Uuid,
    states: Mutex<HashMap<Uuid, AwarenessPayload>>,
    changed: broadcast::Sender<()>,
}

impl Awareness {
    pub(crate) fn new(session_id: Uuid, local: AwarenessPayload) -> Self {
        let (changed, _) = broadcast::channel(64);
        let mut states = HashMap::new();
        states.insert(session_id, local);
        Self {
            session_id,
            states: Mutex::new(states),
            changed,
        }
    }

    /// This session's ephemeral id.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Full current awareness state, local session included.
    pub fn states(&self) -> HashMap<Uuid, AwarenessPayload> {
        self.states.lock().expect("awareness lock poisoned").clone()
    }

    /// This session's own state.
    pub fn local_state(&self) -> Option<AwarenessPayload> {
        self.states
            .lock()
            .expect("awareness lock poisoned")
            .get(&self.session_id)
            .cloned()
    }

    /// Subscribe to change notifications. Events carry no payload —
    /// re-read `states()` on each one. Dropping the receiver
    /// unsubscribes.
    pub fn changes(&self) -> broadcast::Receiver<()> {
        self.changed.subscribe()
    }

    fn notify(&self) {
        let _ = self.changed.send(());
    }

    pub(crate) fn apply_remote(&self, session: Uuid, state: AwarenessPayload) {
        self.states
            .lock()
            .expect("awareness lock poisoned")
            .insert(session, state);
        self.notify();
    }

    pub(crate) fn remove(&self, session: Uuid) {
        let removed = self
            .states
            .lock()
            .expect("awareness lock poisoned")
            .remove(&session)
            .is_some();
        if removed {
            self.notify();
        }
    }

    /// Drop every state, local included. Used when the session closes.
    pub(crate) fn clear(&self) {
        self.states.lock().expect("awareness lock poisoned").clear();
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(id: &str, name: &str) -> AwarenessPayload {
        AwarenessPayload {
            participant_id: id.to_string(),
            display_name: name.to_string(),
            color: color_for(id).to_string(),
        }
    }

    #[test]
    fn test_color_is_stable_and_from_palette() {
        let first = color_for("u1");
        assert_eq!(first, color_for("u1"));
        assert!(PALETTE.contains(&first));
    }

    #[test]
    fn test_local_state_present_at_open() {
        let session = Uuid::new_v4();
        let awareness = Awareness::new(session, payload("u1", "Alice"));

        let states = awareness.states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[&session].display_name, "Alice");
        assert_eq!(awareness.local_state().unwrap().participant_id, "u1");
    }

    #[test]
    fn test_remote_join_and_leave_fire_changes() {
        let awareness = Awareness::new(Uuid::new_v4(), payload("u1", "Alice"));
        let mut changes = awareness.changes();

        let remote = Uuid::new_v4();
        awareness.apply_remote(remote, payload("u2", "Bob"));
        assert_eq!(awareness.states().len(), 2);
        assert!(changes.try_recv().is_ok());

        awareness.remove(remote);
        assert_eq!(awareness.states().len(), 1);
        assert!(changes.try_recv().is_ok());
    }

    #[test]
    fn test_remove_unknown_session_is_silent() {
        let awareness = Awareness::new(Uuid::new_v4(), payload("u1", "Alice"));
        let mut changes = awareness.changes();
        awareness.remove(Uuid::new_v4());
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_remote_update_replaces_state() {
        let awareness = Awareness::new(Uuid::new_v4(), payload("u1", "Alice"));
        let remote = Uuid::new_v4();
        awareness.apply_remote(remote, payload("u2", "Bob"));
        awareness.apply_remote(remote, payload("u2", "Bobby"));

        let states = awareness.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[&remote].display_name, "Bobby");
    }

    #[test]
    fn test_clear_empties_everything() {
        let awareness = Awareness::new(Uuid::new_v4(), payload("u1", "Alice"));
        awareness.apply_remote(Uuid::new_v4(), payload("u2", "Bob"));
        awareness.clear();
        assert!(awareness.states().is_empty());
    }
}
