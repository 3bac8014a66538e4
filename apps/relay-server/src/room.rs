//! Per-session rooms: membership, fan-out, and resolution arbitration.

use chrono::{DateTime, Utc};
use cofield::{CollabMessage, ConflictId, ParticipantInfo, Resolution, SessionId, UserId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A routed message: `to` targets one participant, otherwise everyone except
/// `from` receives it
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: Option<UserId>,
    pub to: Option<UserId>,
    pub message: CollabMessage,
}

impl Envelope {
    pub fn should_deliver_to(&self, user_id: UserId) -> bool {
        match self.to {
            Some(target) => target == user_id,
            None => self.from != Some(user_id),
        }
    }
}

/// One collaboration session's server-side state
pub struct Room {
    pub id: SessionId,
    pub model: String,
    pub record_id: String,
    pub created_at: DateTime<Utc>,
    participants: DashMap<UserId, ParticipantInfo>,
    /// First accepted resolution per conflict; later attempts bounce
    resolutions: DashMap<ConflictId, Resolution>,
    broadcast_tx: broadcast::Sender<Envelope>,
}

impl Room {
    fn new(id: SessionId, model: &str, record_id: &str) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1000);
        Self {
            id,
            model: model.to_string(),
            record_id: record_id.to_string(),
            created_at: Utc::now(),
            participants: DashMap::new(),
            resolutions: DashMap::new(),
            broadcast_tx,
        }
    }

    /// Add a participant and announce them to the existing members. The
    /// returned receiver sees every envelope sent after this call; the
    /// joiner's own announcement is not among them.
    pub fn join(&self, user: ParticipantInfo) -> broadcast::Receiver<Envelope> {
        let user_id = user.user_id;
        self.participants.insert(user_id, user.clone());
        self.send(Envelope {
            from: Some(user_id),
            to: None,
            message: CollabMessage::UserJoined { user },
        });
        self.broadcast_tx.subscribe()
    }

    /// Remove a participant and announce it. Returns true when the room is
    /// now empty.
    pub fn leave(&self, user_id: UserId) -> bool {
        if self.participants.remove(&user_id).is_some() {
            self.send(Envelope {
                from: Some(user_id),
                to: None,
                message: CollabMessage::UserLeft { user_id },
            });
        }
        self.participants.is_empty()
    }

    /// Roster in stable order, for `participants_updated`.
    pub fn roster(&self) -> Vec<ParticipantInfo> {
        let mut all: Vec<ParticipantInfo> =
            self.participants.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|p| p.user_id);
        all
    }

    /// Fan a client event out to every other participant.
    pub fn forward(&self, from: UserId, message: CollabMessage) {
        self.send(Envelope {
            from: Some(from),
            to: None,
            message,
        });
    }

    /// Arbitrate a resolution: the first commit per conflict id wins and is
    /// broadcast to everyone (the resolver included); later attempts get
    /// `conflict_resolution_failed` addressed to their sender only.
    pub fn resolve(&self, from: UserId, resolution: Resolution) {
        use dashmap::mapref::entry::Entry;

        let conflict_id = resolution.conflict_id;
        match self.resolutions.entry(conflict_id) {
            Entry::Occupied(_) => {
                warn!(
                    "conflict {} already resolved; rejecting attempt from {}",
                    conflict_id, from
                );
                self.send(Envelope {
                    from: None,
                    to: Some(from),
                    message: CollabMessage::ConflictResolutionFailed {
                        conflict_id,
                        error: "conflict already resolved".to_string(),
                    },
                });
            }
            Entry::Vacant(entry) => {
                let message = CollabMessage::ConflictResolved {
                    conflict_id,
                    resolution: resolution.strategy,
                    resolved_value: resolution.resolved_value.clone(),
                };
                entry.insert(resolution);
                self.send(Envelope {
                    from: None,
                    to: None,
                    message,
                });
            }
        }
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    fn send(&self, envelope: Envelope) {
        // An error only means no one is subscribed right now.
        let _ = self.broadcast_tx.send(envelope);
    }
}

/// All live rooms
pub struct RoomManager {
    rooms: DashMap<SessionId, Arc<Room>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, id: SessionId, model: &str, record_id: &str) -> Arc<Room> {
        self.rooms
            .entry(id)
            .or_insert_with(|| {
                info!("creating session {} ({}/{})", id, model, record_id);
                Arc::new(Room::new(id, model, record_id))
            })
            .clone()
    }

    pub fn remove_if_empty(&self, id: SessionId) {
        let removed = self
            .rooms
            .remove_if(&id, |_, room| room.participant_count() == 0);
        if removed.is_some() {
            info!("session {} is empty, removing", id);
        }
    }

    pub fn list(&self) -> Vec<serde_json::Value> {
        self.rooms
            .iter()
            .map(|entry| {
                let room = entry.value();
                serde_json::json!({
                    "id": room.id,
                    "model": room.model,
                    "record_id": room.record_id,
                    "created_at": room.created_at,
                    "participant_count": room.participant_count(),
                    "participants": room.roster(),
                })
            })
            .collect()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cofield::ResolutionStrategy;
    use serde_json::Value;

    fn resolution(conflict_id: ConflictId, value: &str) -> Resolution {
        Resolution {
            conflict_id,
            strategy: ResolutionStrategy::Local,
            resolved_value: Value::String(value.to_string()),
        }
    }

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let room = Room::new(SessionId::new(), "article", "42");
        let alice = ParticipantInfo::new(UserId::new(), "Alice");
        let bob = ParticipantInfo::new(UserId::new(), "Bob");

        let mut alice_rx = room.join(alice.clone());
        let mut bob_rx = room.join(bob.clone());

        // Alice sees Bob join.
        let env = alice_rx.try_recv().unwrap();
        assert!(matches!(env.message, CollabMessage::UserJoined { .. }));
        assert!(env.should_deliver_to(alice.user_id));

        let conflict_id = ConflictId::new();
        room.resolve(alice.user_id, resolution(conflict_id, "alice wins"));
        room.resolve(bob.user_id, resolution(conflict_id, "bob wins"));

        // Everyone (the winner included) gets the first resolution.
        let env = alice_rx.try_recv().unwrap();
        match &env.message {
            CollabMessage::ConflictResolved { resolved_value, .. } => {
                assert_eq!(*resolved_value, Value::String("alice wins".into()));
            }
            other => panic!("expected conflict_resolved, got {:?}", other),
        }
        assert!(env.should_deliver_to(alice.user_id));
        assert!(env.should_deliver_to(bob.user_id));

        // The loser is told, and only the loser.
        let failed = loop {
            let env = bob_rx.try_recv().unwrap();
            if let CollabMessage::ConflictResolutionFailed { .. } = &env.message {
                break env;
            }
        };
        assert!(failed.should_deliver_to(bob.user_id));
        assert!(!failed.should_deliver_to(alice.user_id));
    }

    #[tokio::test]
    async fn test_room_empties_on_last_leave() {
        let manager = RoomManager::new();
        let id = SessionId::new();
        let room = manager.get_or_create(id, "article", "42");

        let alice = ParticipantInfo::new(UserId::new(), "Alice");
        let _rx = room.join(alice.clone());
        assert!(!room.leave(UserId::new()));
        assert!(room.leave(alice.user_id));

        manager.remove_if_empty(id);
        assert!(manager.list().is_empty());
    }

    #[test]
    fn test_roster_is_sorted() {
        let room = Room::new(SessionId::new(), "article", "42");
        for name in ["Carol", "Alice", "Bob"] {
            let _rx = room.join(ParticipantInfo::new(UserId::new(), name));
        }
        let roster = room.roster();
        assert_eq!(roster.len(), 3);
        let ids: Vec<UserId> = roster.iter().map(|p| p.user_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
