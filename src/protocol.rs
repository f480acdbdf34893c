//! Binary wire frames exchanged inside a peer broadcast group.
//!
//! One frame format multiplexes CRDT synchronization and ephemeral
//! awareness over the same group (bincode-encoded):
//!
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────┐
//! │ kind     │ session_id │ room_id  │ payload  │
//! │ 1 byte   │ 16 bytes   │ variable │ variable │
//! └──────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! `SyncRequest` carries a state vector, `SyncReply` the missing diff,
//! `Update` an incremental CRDT delta. `Awareness`/`AwarenessLeave`
//! carry per-session presence that is never persisted anywhere.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// State vector of a joining replica asking for what it's missing.
    SyncRequest = 1,
    /// Diff answering a `SyncRequest`.
    SyncReply = 2,
    /// Incremental CRDT update.
    Update = 3,
    /// Full awareness state of one session.
    Awareness = 4,
    /// Session ended; drop its awareness state.
    AwarenessLeave = 5,
}

/// Ephemeral per-session awareness payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessPayload {
    pub participant_id: String,
    pub display_name: String,
    pub color: String,
}

/// A single frame on the peer channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    /// Ephemeral session that produced the frame (used to skip echoes).
    pub session_id: Uuid,
    pub room_id: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn update(session_id: Uuid, room_id: impl Into<String>, update: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Update,
            session_id,
            room_id: room_id.into(),
            payload: update,
        }
    }

    pub fn sync_request(session_id: Uuid, room_id: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::SyncRequest,
            session_id,
            room_id: room_id.into(),
            payload: state_vector,
        }
    }

    pub fn sync_reply(session_id: Uuid, room_id: impl Into<String>, diff: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::SyncReply,
            session_id,
            room_id: room_id.into(),
            payload: diff,
        }
    }

    pub fn awareness(
        session_id: Uuid,
        room_id: impl Into<String>,
        state: &AwarenessPayload,
    ) -> Result<Self, CodecError> {
        let payload = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Self {
            kind: FrameKind::Awareness,
            session_id,
            room_id: room_id.into(),
            payload,
        })
    }

    pub fn awareness_leave(session_id: Uuid, room_id: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::AwarenessLeave,
            session_id,
            room_id: room_id.into(),
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(frame)
    }

    /// Parse the awareness payload of an `Awareness` frame.
    pub fn awareness_payload(&self) -> Result<AwarenessPayload, CodecError> {
        if self.kind != FrameKind::Awareness {
            return Err(CodecError::UnexpectedKind);
        }
        let (state, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(state)
    }
}

/// Frame codec failures. Swallowed (logged) at the engine boundary —
/// malformed peer traffic never becomes a user-facing error.
#[derive(Debug, Clone)]
pub enum CodecError {
    Encode(String),
    Decode(String),
    UnexpectedKind,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "frame encode failed: {e}"),
            CodecError::Decode(e) => write!(f, "frame decode failed: {e}"),
            CodecError::UnexpectedKind => write!(f, "unexpected frame kind"),
        }
    }
}

impl std::error::Error for CodecError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_frame_roundtrip() {
        let session = Uuid::new_v4();
        let frame = Frame::update(session, "room-7", vec![1, 2, 3]);

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, FrameKind::Update);
        assert_eq!(decoded.session_id, session);
        assert_eq!(decoded.room_id, "room-7");
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_sync_frames_roundtrip() {
        let session = Uuid::new_v4();
        let request = Frame::sync_request(session, "r1", vec![9]);
        let reply = Frame::sync_reply(session, "r1", vec![8, 7]);

        assert_eq!(
            Frame::decode(&request.encode().unwrap()).unwrap().kind,
            FrameKind::SyncRequest
        );
        let reply = Frame::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(reply.kind, FrameKind::SyncReply);
        assert_eq!(reply.payload, vec![8, 7]);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let session = Uuid::new_v4();
        let state = AwarenessPayload {
            participant_id: "u1".into(),
            display_name: "Alice".into(),
            color: "#f87171".into(),
        };
        let frame = Frame::awareness(session, "r1", &state).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_payload().unwrap(), state);
    }

    #[test]
    fn test_awareness_payload_wrong_kind() {
        let frame = Frame::update(Uuid::new_v4(), "r1", vec![]);
        assert!(matches!(
            frame.awareness_payload(),
            Err(CodecError::UnexpectedKind)
        ));
    }

    #[test]
    fn test_leave_frame_is_empty() {
        let frame = Frame::awareness_leave(Uuid::new_v4(), "r1");
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, FrameKind::AwarenessLeave);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Frame::decode(&[0xFF, 0xFE]).is_err());
    }
}
