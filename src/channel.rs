//! Message channel: append-only per-room message log with live,
//! full-snapshot subscriptions, plus the presence contract.
//!
//! `send` appends the message first and then updates the room's
//! denormalized summary and the sender's presence entry inside one
//! optimistic transaction. The two steps are deliberately not atomic:
//! the message is durable before the transaction runs, and a failed
//! summary update leaves a correct message log behind.
//!
//! `subscribe` delivers the complete visible message list (ascending by
//! server timestamp, capped to the most recent 100) on every change.
//! Subscription errors degrade to an empty list instead of crashing the
//! consumer.

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::ErrorKind;
use crate::model::{from_doc, to_doc, ChatMessage, LastMessage, Room, RoomKind, MESSAGES, ROOMS};
use crate::store::{Direction, DocStore, Query, Snapshot, WatchTarget};

/// How many recent messages a subscription keeps visible.
pub const MESSAGE_WINDOW: usize = 100;

/// Owns the live subscription tasks behind a `subscribe` call.
///
/// `cancel` stops further callbacks; calling it repeatedly is a no-op,
/// and dropping the guard cancels as well, so every exit path releases
/// the listeners.
pub struct SubscriptionGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionGuard {
    fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    pub fn cancel(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Per-room message log over the document store.
#[derive(Clone)]
pub struct MessageChannel {
    store: DocStore,
    registry: crate::registry::RoomRegistry,
}

impl MessageChannel {
    pub fn new(store: DocStore) -> Self {
        let registry = crate::registry::RoomRegistry::new(store.clone());
        Self { store, registry }
    }

    pub fn registry(&self) -> &crate::registry::RoomRegistry {
        &self.registry
    }

    /// Append a message and refresh the room summary + sender presence.
    ///
    /// The room is created on the fly if this is the first activity in
    /// it. Content is trimmed; an empty result is a caller bug.
    pub async fn send(
        &self,
        room_id: &str,
        content: &str,
        sender_id: &str,
        sender_name: &str,
    ) -> Result<(), ErrorKind> {
        let content = content.trim();
        if room_id.is_empty() || sender_id.is_empty() || content.is_empty() {
            return Err(ErrorKind::InvalidArgument);
        }

        if self.store.get(ROOMS, room_id).await?.is_none() {
            self.registry
                .ensure_room(room_id, RoomKind::Community, room_id)
                .await?;
        }

        let message = ChatMessage::outgoing(room_id, sender_id, sender_name, content);
        let message_id = self.store.write(MESSAGES, to_doc(&message)?).await?;

        let summary = LastMessage {
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            sent_at: crate::model::now_millis(),
        };
        let result = self
            .store
            .transaction(ROOMS, room_id, |doc| {
                let mut room: Room = from_doc(doc.clone())?;
                room.last_message = Some(summary.clone());
                room.touch_presence(sender_id);
                *doc = to_doc(&room)?;
                Ok(())
            })
            .await;

        if let Err(kind) = result {
            // The message is already durable; only the display summary
            // is stale. Surface the failure to the caller anyway.
            log::warn!(
                "room summary update failed after message {message_id}: {kind} ({})",
                kind.user_message()
            );
            return Err(kind);
        }
        Ok(())
    }

    /// Open a live subscription on a room's messages.
    ///
    /// `on_messages` receives the full ordered list on every change; a
    /// reported error is mapped to a notice and a single empty-list
    /// callback. The returned guard cancels both underlying
    /// subscriptions.
    pub async fn subscribe<F>(&self, room_id: &str, on_messages: F) -> SubscriptionGuard
    where
        F: FnMut(Vec<ChatMessage>) + Send + 'static,
    {
        // Both watch tasks report through the one consumer callback, so
        // an error on either side degrades to an empty list.
        let on_messages = std::sync::Arc::new(std::sync::Mutex::new(on_messages));
        // Room document subscription comes first; an absent room gets
        // created in the background so the message stream has something
        // to attach to.
        let mut room_watch = self.store.watch(WatchTarget::doc(ROOMS, room_id)).await;
        match room_watch.current() {
            Ok(snap) if snap.is_empty() => {
                let registry = self.registry.clone();
                let room_id = room_id.to_string();
                tokio::spawn(async move {
                    if let Err(kind) = registry
                        .ensure_room(&room_id, RoomKind::Community, &room_id)
                        .await
                    {
                        log::warn!("lazy room creation for {room_id} failed: {kind}");
                    }
                });
            }
            Ok(_) => {}
            Err(kind) => {
                log::warn!("room subscription error: {kind} ({})", kind.user_message());
            }
        }

        let query = Query::collection(MESSAGES)
            .where_eq("room_id", room_id)
            .order_by("created_at", Direction::Descending)
            .limit(MESSAGE_WINDOW);
        let mut message_watch = self.store.watch(WatchTarget::Query(query)).await;

        let callback = on_messages.clone();
        let message_task = tokio::spawn(async move {
            loop {
                {
                    let mut f = callback.lock().expect("callback lock poisoned");
                    deliver(message_watch.current(), &mut *f);
                }
                if !message_watch.changed().await {
                    break;
                }
            }
        });

        // Keep the room subscription alive for the lifetime of the
        // guard; its errors are mapped to the degraded empty-list
        // callback, never re-thrown.
        let callback = on_messages;
        let room_task = tokio::spawn(async move {
            loop {
                if let Err(kind) = room_watch.current() {
                    log::warn!("room subscription degraded: {kind} ({})", kind.user_message());
                    let mut f = callback.lock().expect("callback lock poisoned");
                    (*f)(Vec::new());
                }
                if !room_watch.changed().await {
                    break;
                }
            }
        });

        SubscriptionGuard::new(vec![message_task, room_task])
    }

    /// Best-effort teardown write: mark a participant offline with a
    /// fresh last-seen stamp. Fire-and-forget — no acknowledgment, no
    /// retry.
    pub fn mark_offline(&self, room_id: &str, participant_id: &str) {
        if room_id.is_empty() || participant_id.is_empty() {
            return;
        }
        let store = self.store.clone();
        let room_id = room_id.to_string();
        let participant_id = participant_id.to_string();
        tokio::spawn(async move {
            let result = store
                .transaction(ROOMS, &room_id, |doc| {
                    let mut room: Room = from_doc(doc.clone())?;
                    room.mark_offline(&participant_id);
                    *doc = to_doc(&room)?;
                    Ok(())
                })
                .await;
            if let Err(kind) = result {
                log::debug!("offline mark for {participant_id} in {room_id} dropped: {kind}");
            }
        });
    }
}

/// Turn a raw snapshot into an ordered message list for the consumer.
fn deliver<F>(snapshot: Snapshot, on_messages: &mut F)
where
    F: FnMut(Vec<ChatMessage>),
{
    match snapshot {
        Ok(docs) => {
            let mut messages: Vec<ChatMessage> = docs
                .into_iter()
                .filter_map(|doc: Value| match from_doc(doc) {
                    Ok(msg) => Some(msg),
                    Err(kind) => {
                        log::warn!("skipping undecodable message: {kind}");
                        None
                    }
                })
                .collect();
            // The query returns newest-first to apply the window cap;
            // consumers read oldest-first.
            messages.reverse();
            on_messages(messages);
        }
        Err(kind) => {
            log::warn!("message subscription degraded: {kind} ({})", kind.user_message());
            on_messages(Vec::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PresenceStatus, now_millis};
    use std::sync::{Arc, Mutex};
    use tokio::time::{sleep, Duration};

    fn collector() -> (Arc<Mutex<Vec<Vec<ChatMessage>>>>, impl FnMut(Vec<ChatMessage>) + Send) {
        let seen: Arc<Mutex<Vec<Vec<ChatMessage>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |msgs| sink.lock().unwrap().push(msgs))
    }

    #[tokio::test]
    async fn test_send_rejects_blank_content() {
        let channel = MessageChannel::new(DocStore::new());
        for content in ["", "   ", "\t\n"] {
            assert_eq!(
                channel.send("r1", content, "u1", "Alice").await.unwrap_err(),
                ErrorKind::InvalidArgument
            );
        }
        // No message was written.
        let q = Query::collection(MESSAGES).where_eq("room_id", "r1");
        assert!(channel.store.query(&q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_trims_content() {
        let store = DocStore::new();
        let channel = MessageChannel::new(store.clone());
        channel.send("r1", "  hi  ", "u1", "Alice").await.unwrap();

        let q = Query::collection(MESSAGES)
            .where_eq("room_id", "r1")
            .where_eq("sender_id", "u1");
        let docs = store.query(&q).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["content"], "hi");
    }

    #[tokio::test]
    async fn test_send_creates_room_and_refreshes_presence() {
        let store = DocStore::new();
        let channel = MessageChannel::new(store.clone());

        let before = now_millis();
        channel.send("r1", "hi", "u1", "Alice").await.unwrap();

        let room: Room = from_doc(store.get(ROOMS, "r1").await.unwrap().unwrap()).unwrap();
        let entry = &room.active_participants["u1"];
        assert_eq!(entry.status, PresenceStatus::Online);
        assert!(entry.last_seen >= before);
        assert_eq!(room.participant_count, 1);

        let summary = room.last_message.unwrap();
        assert_eq!(summary.sender_name, "Alice");
        assert_eq!(summary.content, "hi");
    }

    #[tokio::test]
    async fn test_subscribe_delivers_ordered_snapshots() {
        let channel = MessageChannel::new(DocStore::new());
        let (seen, sink) = collector();
        let guard = channel.subscribe("r1", sink).await;

        for text in ["one", "two", "three"] {
            channel.send("r1", text, "u1", "Alice").await.unwrap();
        }
        sleep(Duration::from_millis(100)).await;

        let snapshots = seen.lock().unwrap();
        let last = snapshots.last().unwrap();
        // Welcome message first, then sends, ascending by timestamp.
        assert_eq!(last.first().unwrap().sender_id, crate::model::SYSTEM_SENDER);
        assert_eq!(last.last().unwrap().content, "three");
        for snapshot in snapshots.iter() {
            let times: Vec<u64> = snapshot.iter().map(|m| m.created_at.unwrap()).collect();
            let mut sorted = times.clone();
            sorted.sort_unstable();
            assert_eq!(times, sorted, "snapshot must be non-decreasing");
        }
        drop(snapshots);
        guard.cancel();
    }

    #[tokio::test]
    async fn test_subscribe_disposal_stops_callbacks() {
        let channel = MessageChannel::new(DocStore::new());
        let (seen, sink) = collector();
        let guard = channel.subscribe("r1", sink).await;
        channel.send("r1", "before", "u1", "Alice").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        guard.cancel();
        guard.cancel(); // second cancel is a no-op
        let count_at_cancel = seen.lock().unwrap().len();

        channel.send("r1", "after", "u1", "Alice").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), count_at_cancel);
    }

    #[tokio::test]
    async fn test_subscribe_degrades_to_empty_on_error() {
        let store = DocStore::new();
        let channel = MessageChannel::new(store.clone());
        channel.send("r1", "hi", "u1", "Alice").await.unwrap();

        let (seen, sink) = collector();
        let _guard = channel.subscribe("r1", sink).await;
        sleep(Duration::from_millis(50)).await;

        store.set_unavailable(true);
        sleep(Duration::from_millis(100)).await;

        let snapshots = seen.lock().unwrap();
        assert!(
            snapshots.last().unwrap().is_empty(),
            "degraded subscription must deliver an empty list"
        );
    }

    #[tokio::test]
    async fn test_mark_offline_best_effort() {
        let store = DocStore::new();
        let channel = MessageChannel::new(store.clone());
        channel.send("r1", "hi", "u1", "Alice").await.unwrap();

        channel.mark_offline("r1", "u1");
        sleep(Duration::from_millis(100)).await;

        let room: Room = from_doc(store.get(ROOMS, "r1").await.unwrap().unwrap()).unwrap();
        assert_eq!(
            room.active_participants["u1"].status,
            PresenceStatus::Offline
        );

        // Unknown room: silently dropped, nothing panics.
        channel.mark_offline("ghost", "u1");
        sleep(Duration::from_millis(50)).await;
    }
}
