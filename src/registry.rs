//! Room registry: lazy, idempotent room creation.
//!
//! A room document exists exactly once per room id. The first caller
//! creates it (via the store's create-if-absent primitive) and seeds the
//! room with a single system welcome message so consumers never mistake
//! a brand-new room for an error state. Racing first callers are safe:
//! the loser observes `AlreadyExists`, re-reads, and writes nothing.

use crate::error::ErrorKind;
use crate::model::{from_doc, to_doc, ChatMessage, Room, RoomKind, MESSAGES, ROOMS};
use crate::store::DocStore;

/// Idempotent get-or-create for room records. Holds an injected store
/// handle; cheap to clone.
#[derive(Clone)]
pub struct RoomRegistry {
    store: DocStore,
}

impl RoomRegistry {
    pub fn new(store: DocStore) -> Self {
        Self { store }
    }

    /// Return the room for `room_id`, creating it (plus its welcome
    /// message) on first access.
    ///
    /// Store-level failures surface unchanged; nothing is retried here.
    pub async fn ensure_room(
        &self,
        room_id: &str,
        kind: RoomKind,
        name: &str,
    ) -> Result<Room, ErrorKind> {
        if room_id.is_empty() || name.is_empty() {
            return Err(ErrorKind::InvalidArgument);
        }

        if let Some(doc) = self.store.get(ROOMS, room_id).await? {
            return from_doc(doc);
        }

        let room = Room::new(room_id, kind, name);
        match self.store.create(ROOMS, room_id, to_doc(&room)?).await {
            Ok(()) => {
                let welcome = ChatMessage::welcome(room_id);
                self.store.write(MESSAGES, to_doc(&welcome)?).await?;
                Ok(room)
            }
            Err(ErrorKind::AlreadyExists) => {
                // Lost the creation race; the winner seeded the welcome.
                let doc = self
                    .store
                    .get(ROOMS, room_id)
                    .await?
                    .ok_or(ErrorKind::NotFound)?;
                from_doc(doc)
            }
            Err(e) => Err(e),
        }
    }
}
