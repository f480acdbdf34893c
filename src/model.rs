//! Chat data model: rooms, messages, presence entries.
//!
//! Rooms and messages live in the document store as schemaless JSON
//! documents; these types are the serde-backed views the components work
//! with. A room embeds its participants' presence entries and a
//! denormalized last-message summary — there is no standalone presence
//! collection.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// Store collection holding room documents, keyed by room id.
pub const ROOMS: &str = "rooms";
/// Store collection holding message documents, keyed by generated id.
pub const MESSAGES: &str = "messages";

/// Sender id used for system-authored messages.
pub const SYSTEM_SENDER: &str = "system";
/// Content of the system message seeded into a freshly created room.
pub const WELCOME_TEXT: &str = "Welcome to the chat room!";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What kind of community space a room belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Course,
    Community,
}

/// A participant's last-known status inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Presence entry embedded in a room's participant map.
///
/// There is no expiry sweep: an entry stays as written until the next
/// explicit transition (a send refreshing it, or a teardown marking it
/// offline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub status: PresenceStatus,
    pub last_seen: u64,
}

impl PresenceEntry {
    pub fn online_now() -> Self {
        Self {
            status: PresenceStatus::Online,
            last_seen: now_millis(),
        }
    }

    pub fn offline_now() -> Self {
        Self {
            status: PresenceStatus::Offline,
            last_seen: now_millis(),
        }
    }
}

/// Denormalized summary of a room's most recent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub sender_name: String,
    pub content: String,
    pub sent_at: u64,
}

/// A chat room document. Exactly one per room id, created lazily and
/// never deleted by this subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub kind: RoomKind,
    pub name: String,
    pub participant_count: u32,
    pub active_participants: BTreeMap<String, PresenceEntry>,
    pub last_message: Option<LastMessage>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Room {
    /// A freshly created room with no participants.
    pub fn new(id: impl Into<String>, kind: RoomKind, name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            participant_count: 0,
            active_participants: BTreeMap::new(),
            last_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh a participant's presence entry to online-now.
    pub fn touch_presence(&mut self, participant_id: &str) {
        self.active_participants
            .insert(participant_id.to_string(), PresenceEntry::online_now());
        self.participant_count = self.active_participants.len() as u32;
        self.updated_at = now_millis();
    }

    /// Mark a participant offline with a fresh last-seen stamp.
    pub fn mark_offline(&mut self, participant_id: &str) {
        self.active_participants
            .insert(participant_id.to_string(), PresenceEntry::offline_now());
        self.updated_at = now_millis();
    }
}

/// Message type tag. Only text exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
}

/// An immutable chat message. `created_at` is server-assigned at write
/// time; messages within a room are totally ordered by it, ties broken
/// by write order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub created_at: Option<u64>,
    pub read_by: Vec<String>,
    pub kind: MessageKind,
}

impl ChatMessage {
    /// A message ready for writing: `created_at` is left unset so the
    /// store stamps it (server-assigned timestamp sentinel).
    pub fn outgoing(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let sender_id = sender_id.into();
        Self {
            id: String::new(),
            room_id: room_id.into(),
            sender_id: sender_id.clone(),
            sender_name: sender_name.into(),
            content: content.into(),
            created_at: None,
            read_by: vec![sender_id],
            kind: MessageKind::Text,
        }
    }

    /// The system welcome message seeded into a new room.
    pub fn welcome(room_id: impl Into<String>) -> Self {
        Self::outgoing(room_id, SYSTEM_SENDER, SYSTEM_SENDER, WELCOME_TEXT)
    }
}

/// Serialize a model into a store document.
pub fn to_doc<T: Serialize>(value: &T) -> Result<Value, ErrorKind> {
    serde_json::to_value(value).map_err(|e| {
        log::warn!("document encode failed: {e}");
        ErrorKind::Unknown
    })
}

/// Deserialize a store document into a model.
pub fn from_doc<T: for<'de> Deserialize<'de>>(doc: Value) -> Result<T, ErrorKind> {
    serde_json::from_value(doc).map_err(|e| {
        log::warn!("document decode failed: {e}");
        ErrorKind::DataLoss
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_roundtrip() {
        let mut room = Room::new("r1", RoomKind::Community, "Lounge");
        room.touch_presence("u1");

        let doc = to_doc(&room).unwrap();
        let back: Room = from_doc(doc).unwrap();
        assert_eq!(back, room);
        assert_eq!(back.active_participants["u1"].status, PresenceStatus::Online);
    }

    #[test]
    fn test_touch_presence_updates_count() {
        let mut room = Room::new("r1", RoomKind::Course, "Rust 101");
        assert_eq!(room.participant_count, 0);

        room.touch_presence("u1");
        room.touch_presence("u2");
        room.touch_presence("u1"); // refresh, not a new participant
        assert_eq!(room.participant_count, 2);
    }

    #[test]
    fn test_mark_offline_keeps_entry() {
        let mut room = Room::new("r1", RoomKind::Community, "Lounge");
        room.touch_presence("u1");
        room.mark_offline("u1");

        let entry = &room.active_participants["u1"];
        assert_eq!(entry.status, PresenceStatus::Offline);
        assert!(entry.last_seen > 0);
    }

    #[test]
    fn test_outgoing_message_seeds_read_by_with_sender() {
        let msg = ChatMessage::outgoing("r1", "u1", "Alice", "hi");
        assert_eq!(msg.read_by, vec!["u1".to_string()]);
        assert_eq!(msg.created_at, None);
        assert_eq!(msg.kind, MessageKind::Text);
    }

    #[test]
    fn test_welcome_message_is_system_authored() {
        let msg = ChatMessage::welcome("r1");
        assert_eq!(msg.sender_id, SYSTEM_SENDER);
        assert_eq!(msg.content, WELCOME_TEXT);
    }

    #[test]
    fn test_message_doc_has_created_at_null_sentinel() {
        let msg = ChatMessage::outgoing("r1", "u1", "Alice", "hi");
        let doc = to_doc(&msg).unwrap();
        assert!(doc.get("created_at").unwrap().is_null());
    }
}
