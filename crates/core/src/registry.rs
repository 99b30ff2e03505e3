//! Registry (§4.G): the process-wide, named-room directory.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::room::Room;

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
        })
    }

    /// Atomic get-or-create: a fast read-lock lookup, falling back to a
    /// write-lock `entry` insert only on miss. Shared by both the ingest and
    /// participant join paths (§9 decision (iii): either side may create the
    /// room).
    pub async fn get_or_create_room(self: &Arc<Self>, name: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().await.get(name) {
            return Arc::clone(room);
        }
        let mut rooms = self.rooms.write().await;
        Arc::clone(
            rooms
                .entry(name.to_string())
                .or_insert_with(|| Room::new(name.to_string(), Arc::downgrade(self))),
        )
    }

    pub async fn get_room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Remove `room` from the directory iff it is still empty and offline
    /// *and* the entry under its name is still this exact room (guards
    /// against a racing create-then-delete where the name was reused).
    pub async fn delete_room_if_empty(&self, room: &Arc<Room>) {
        if !room.is_empty_and_offline().await {
            return;
        }
        let mut rooms = self.rooms.write().await;
        if let Some(existing) = rooms.get(&room.name) {
            if Arc::ptr_eq(existing, room) && room.is_empty_and_offline().await {
                rooms.remove(&room.name);
                debug!(room = %room.name, "removed empty, offline room from registry");
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_same_room_for_same_name() {
        let registry = RoomRegistry::new();
        let a = registry.get_or_create_room("alpha").await;
        let b = registry.get_or_create_room("alpha").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn get_or_create_distinguishes_names() {
        let registry = RoomRegistry::new();
        let a = registry.get_or_create_room("alpha").await;
        let b = registry.get_or_create_room("beta").await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn delete_if_empty_removes_empty_offline_room() {
        let registry = RoomRegistry::new();
        let room = registry.get_or_create_room("alpha").await;
        registry.delete_room_if_empty(&room).await;
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.get_room("alpha").await.is_none());
    }

    #[tokio::test]
    async fn delete_if_empty_is_a_no_op_when_room_has_participants() {
        use crate::participant::Participant;
        use std::sync::Arc as StdArc;

        let registry = RoomRegistry::new();
        let room = registry.get_or_create_room("alpha").await;

        // Build a bare participant without a live peer connection/duplex --
        // only the room's bookkeeping is under test here, so an
        // `Option`-free happy path isn't needed, just a map entry.
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = futures_util::sink::unfold(tx, |tx, frame: crate::duplex::DuplexFrame| async move {
            tx.send(frame).map_err(|_| crate::error::DuplexError::Closed)?;
            Ok::<_, crate::error::DuplexError>(tx)
        });
        let stream = Box::pin(futures_util::stream::empty());
        let duplex = crate::duplex::SafeDuplexChannel::spawn(Box::pin(sink), stream, false);

        let config = relay_protocol::RelayConfig::default();
        let facade = crate::facade::WebRtcFacade::new(&config).unwrap();
        let pc = facade.new_peer_connection(|| {}).await.unwrap();

        let participant = Participant::new(
            "guest".to_string(),
            StdArc::downgrade(&room),
            pc,
            duplex,
        );
        room.add_participant(StdArc::clone(&participant)).await;

        registry.delete_room_if_empty(&room).await;
        assert_eq!(registry.room_count().await, 1, "room has a participant, must not be removed");
    }
}
