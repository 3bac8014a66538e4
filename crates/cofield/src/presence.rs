//! Participant roster, cursors, and per-field focus indicators.
//!
//! Colors are a pure function of the sorted set of known user ids over a
//! fixed palette, so every client derives the same color for the same user
//! without a negotiation round-trip.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::{ParticipantInfo, UserId};

/// Fixed palette cycled by sorted roster position
pub const PARTICIPANT_PALETTE: [&str; 8] = [
    "#e06c75", "#61afef", "#98c379", "#e5c07b", "#c678dd", "#56b6c2", "#d19a66", "#abb2bf",
];

/// A cursor with no update for this long fades out
pub const CURSOR_STALE_AFTER: Duration = Duration::from_secs(3);

/// A participant with no cursor or heartbeat activity for this long counts
/// as idle
pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(60);

/// Minimum spacing between outbound cursor broadcasts (10/second)
pub const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

/// A connected user within the session
#[derive(Debug, Clone)]
pub struct Participant {
    pub info: ParticipantInfo,
    pub color: &'static str,
    pub focused_field: Option<String>,
    last_activity: Instant,
}

impl Participant {
    fn new(info: ParticipantInfo, now: Instant) -> Self {
        Self {
            info,
            color: PARTICIPANT_PALETTE[0],
            focused_field: None,
            last_activity: now,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.info.user_id
    }

    pub fn is_active(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) <= ACTIVITY_WINDOW
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }
}

/// A remote participant's cursor in viewport coordinates
#[derive(Debug, Clone)]
pub struct CursorState {
    pub x: f64,
    pub y: f64,
    pub field_name: Option<String>,
    updated_at: Instant,
}

impl CursorState {
    pub fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.updated_at) > CURSOR_STALE_AFTER
    }
}

/// A visible remote cursor, ready for rendering
#[derive(Debug, Clone)]
pub struct RemoteCursor<'a> {
    pub user_id: UserId,
    pub x: f64,
    pub y: f64,
    pub field_name: Option<&'a str>,
    pub color: &'static str,
}

/// Tracks who is in the session, where their cursors are, and which fields
/// they are editing
#[derive(Debug)]
pub struct PresenceTracker {
    local_user: UserId,
    participants: HashMap<UserId, Participant>,
    cursors: HashMap<UserId, CursorState>,
    last_cursor_broadcast: Option<Instant>,
}

impl PresenceTracker {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            participants: HashMap::new(),
            cursors: HashMap::new(),
            last_cursor_broadcast: None,
        }
    }

    /// Add one participant. Returns false for a duplicate join (at most one
    /// entry per user id).
    pub fn on_participant_joined(&mut self, info: ParticipantInfo, now: Instant) -> bool {
        if self.participants.contains_key(&info.user_id) {
            return false;
        }
        let id = info.user_id;
        self.participants.insert(id, Participant::new(info, now));
        self.reassign_colors();
        true
    }

    /// Mirror the relay's authoritative roster.
    pub fn replace_roster(&mut self, roster: Vec<ParticipantInfo>, now: Instant) {
        let mut replaced = HashMap::new();
        for info in roster {
            let id = info.user_id;
            let participant = match self.participants.remove(&id) {
                Some(mut existing) => {
                    existing.info = info;
                    existing
                }
                None => Participant::new(info, now),
            };
            replaced.insert(id, participant);
        }
        self.participants = replaced;
        self.cursors.retain(|id, _| self.participants.contains_key(id));
        self.reassign_colors();
    }

    /// Remove a participant along with their cursor. Returns the removed
    /// entry so the caller can clear attributed field labels.
    pub fn on_participant_left(&mut self, user_id: UserId) -> Option<Participant> {
        let removed = self.participants.remove(&user_id);
        self.cursors.remove(&user_id);
        if removed.is_some() {
            self.reassign_colors();
        }
        removed
    }

    /// Record a remote cursor update; with a field name the field also gets
    /// a "being edited by" attribution.
    pub fn on_cursor_moved(
        &mut self,
        user_id: UserId,
        x: f64,
        y: f64,
        field_name: Option<String>,
        now: Instant,
    ) {
        if let Some(p) = self.participants.get_mut(&user_id) {
            p.touch(now);
            if field_name.is_some() {
                p.focused_field = field_name.clone();
            }
        }
        self.cursors.insert(
            user_id,
            CursorState {
                x,
                y,
                field_name,
                updated_at: now,
            },
        );
    }

    pub fn on_field_focus(&mut self, user_id: UserId, field: &str, now: Instant) {
        if let Some(p) = self.participants.get_mut(&user_id) {
            p.focused_field = Some(field.to_string());
            p.touch(now);
        }
    }

    pub fn on_field_blur(&mut self, user_id: UserId, field: &str, now: Instant) {
        if let Some(p) = self.participants.get_mut(&user_id) {
            if p.focused_field.as_deref() == Some(field) {
                p.focused_field = None;
            }
            p.touch(now);
        }
    }

    /// Remote cursors fresh enough to render. Stale cursors fade but their
    /// owners stay in the roster; only `user_left` removes them.
    pub fn visible_cursors(&self, now: Instant) -> Vec<RemoteCursor<'_>> {
        self.cursors
            .iter()
            .filter(|(id, cursor)| **id != self.local_user && !cursor.is_stale(now))
            .filter_map(|(id, cursor)| {
                self.participants.get(id).map(|p| RemoteCursor {
                    user_id: *id,
                    x: cursor.x,
                    y: cursor.y,
                    field_name: cursor.field_name.as_deref(),
                    color: p.color,
                })
            })
            .collect()
    }

    /// Participants focused on the given field, excluding self.
    pub fn editors_of<'a>(&'a self, field: &str) -> Vec<&'a Participant> {
        let mut editors: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.user_id() != self.local_user && p.focused_field.as_deref() == Some(field))
            .collect();
        editors.sort_by_key(|p| p.user_id());
        editors
    }

    /// Local throttle: at most one outbound cursor broadcast per interval.
    pub fn should_broadcast_cursor(&mut self, now: Instant) -> bool {
        match self.last_cursor_broadcast {
            Some(last) if now.duration_since(last) < CURSOR_BROADCAST_INTERVAL => false,
            _ => {
                self.last_cursor_broadcast = Some(now);
                true
            }
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<&Participant> {
        self.participants.get(&user_id)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.participants.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Roster in stable (sorted) order.
    pub fn participants(&self) -> Vec<&Participant> {
        let mut all: Vec<&Participant> = self.participants.values().collect();
        all.sort_by_key(|p| p.user_id());
        all
    }

    /// Fail-safe on disconnect: show no one rather than stale presence.
    pub fn clear(&mut self) {
        self.participants.clear();
        self.cursors.clear();
    }

    fn reassign_colors(&mut self) {
        let mut ids: Vec<UserId> = self.participants.keys().copied().collect();
        ids.sort();
        for (index, id) in ids.iter().enumerate() {
            if let Some(p) = self.participants.get_mut(id) {
                p.color = PARTICIPANT_PALETTE[index % PARTICIPANT_PALETTE.len()];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> ParticipantInfo {
        ParticipantInfo::new(UserId::new(), name)
    }

    #[test]
    fn test_color_assignment_is_roster_deterministic() {
        let alice = info("Alice");
        let bob = info("Bob");
        let carol = info("Carol");
        let now = Instant::now();

        // Two clients learn about the same users in different orders.
        let mut first = PresenceTracker::new(alice.user_id);
        first.on_participant_joined(alice.clone(), now);
        first.on_participant_joined(bob.clone(), now);
        first.on_participant_joined(carol.clone(), now);

        let mut second = PresenceTracker::new(bob.user_id);
        second.on_participant_joined(carol.clone(), now);
        second.on_participant_joined(alice.clone(), now);
        second.on_participant_joined(bob.clone(), now);

        for user in [&alice, &bob, &carol] {
            assert_eq!(
                first.get(user.user_id).unwrap().color,
                second.get(user.user_id).unwrap().color,
            );
        }
    }

    #[test]
    fn test_duplicate_join_is_rejected() {
        let alice = info("Alice");
        let now = Instant::now();
        let mut tracker = PresenceTracker::new(UserId::new());
        assert!(tracker.on_participant_joined(alice.clone(), now));
        assert!(!tracker.on_participant_joined(alice, now));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_stale_cursor_hides_but_roster_keeps_user() {
        let me = UserId::new();
        let bob = info("Bob");
        let now = Instant::now();

        let mut tracker = PresenceTracker::new(me);
        tracker.on_participant_joined(bob.clone(), now);
        tracker.on_cursor_moved(bob.user_id, 10.0, 20.0, None, now);

        assert_eq!(tracker.visible_cursors(now + Duration::from_secs(1)).len(), 1);
        assert!(tracker
            .visible_cursors(now + Duration::from_secs(4))
            .is_empty());
        assert!(tracker.contains(bob.user_id));

        // A fresh update brings the cursor back.
        tracker.on_cursor_moved(bob.user_id, 11.0, 20.0, None, now + Duration::from_secs(5));
        assert_eq!(tracker.visible_cursors(now + Duration::from_secs(5)).len(), 1);
    }

    #[test]
    fn test_cursor_with_field_marks_editor() {
        let me = UserId::new();
        let bob = info("Bob");
        let now = Instant::now();

        let mut tracker = PresenceTracker::new(me);
        tracker.on_participant_joined(bob.clone(), now);
        tracker.on_cursor_moved(bob.user_id, 0.0, 0.0, Some("title".into()), now);

        let editors = tracker.editors_of("title");
        assert_eq!(editors.len(), 1);
        assert_eq!(editors[0].user_id(), bob.user_id);

        tracker.on_field_blur(bob.user_id, "title", now);
        assert!(tracker.editors_of("title").is_empty());
    }

    #[test]
    fn test_cursor_broadcast_throttle() {
        let mut tracker = PresenceTracker::new(UserId::new());
        let now = Instant::now();

        assert!(tracker.should_broadcast_cursor(now));
        assert!(!tracker.should_broadcast_cursor(now + Duration::from_millis(50)));
        assert!(tracker.should_broadcast_cursor(now + Duration::from_millis(150)));
    }

    #[test]
    fn test_activity_window() {
        let bob = info("Bob");
        let now = Instant::now();
        let mut tracker = PresenceTracker::new(UserId::new());
        tracker.on_participant_joined(bob.clone(), now);

        let p = tracker.get(bob.user_id).unwrap();
        assert!(p.is_active(now + Duration::from_secs(30)));
        assert!(!p.is_active(now + Duration::from_secs(61)));
    }
}
