//! # agora-sync
//!
//! Real-time core for a community platform: chat rooms over a
//! versioned document store, and peer-replicated collaborative
//! documents with ephemeral awareness.
//!
//! ```text
//!           chat                          collaboration
//!  ┌──────────────────┐            ┌───────────────────────┐
//!  │  MessageChannel  │            │      CollabEngine     │
//!  │  RoomRegistry    │            │  CollabSession (yrs)  │
//!  └────────┬─────────┘            └───────┬───────┬───────┘
//!           │ docs / watches               │       │
//!           ▼                     frames   ▼       ▼ updates
//!  ┌──────────────────┐         ┌──────────────┐ ┌──────────────┐
//!  │     DocStore     │         │ BroadcastHub │ │ ReplicaCache │
//!  │ (versioned docs) │         │  (fan-out)   │ │  (RocksDB)   │
//!  └──────────────────┘         └──────────────┘ └──────────────┘
//! ```
//!
//! The two halves share an error vocabulary ([`ErrorKind`]) and a
//! design stance: callers on flaky connections see degraded data, not
//! crashes. Chat reads fall back to empty snapshots, collaborative
//! sessions keep working locally and reconcile when peers return.

pub mod awareness;
pub mod channel;
pub mod engine;
pub mod error;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod store;
pub mod transport;

pub use awareness::{color_for, Awareness, PALETTE};
pub use channel::{MessageChannel, SubscriptionGuard, MESSAGE_WINDOW};
pub use engine::{CollabEngine, CollabSession, Participant};
pub use error::ErrorKind;
pub use model::{
    ChatMessage, LastMessage, MessageKind, PresenceEntry, PresenceStatus, Room, RoomKind,
};
pub use protocol::{AwarenessPayload, Frame, FrameKind};
pub use registry::RoomRegistry;
pub use storage::{CacheConfig, CacheError, ReplicaCache};
pub use store::{Direction, DocStore, Query, Watch, WatchTarget};
pub use transport::{BroadcastHub, GroupHandle, GroupStats};
