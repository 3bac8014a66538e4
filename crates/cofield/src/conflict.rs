//! Conflict detection bookkeeping and resolution strategies.
//!
//! Each conflict moves `Detected -> Resolved` exactly once; nothing is
//! persisted. A locally chosen resolution is applied optimistically and sits
//! in `pending_ack` until the relay's broadcast settles it, so losing a
//! resolution race converges on the winner's value.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::{CollabError, ConflictId, FieldChange, Resolution, ResolutionStrategy, Result};

/// Two disagreeing edits of the same field against a shared base value
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub id: ConflictId,
    pub field_name: String,
    /// Last value both sides agreed on
    pub base_value: Value,
    pub local_change: FieldChange,
    pub remote_change: FieldChange,
    pub detected_at: DateTime<Utc>,
}

/// What the resolving user picked
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionChoice {
    KeepLocal,
    AcceptRemote,
    MergeAuto,
    /// Arbitrary value typed by the user; must be non-empty
    MergeManual(Value),
}

/// Outcome of feeding a broadcast `conflict_resolved` into the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Accepted {
    /// First time this id settles; apply the value
    Applied(Conflict),
    /// Already settled; replaying is a logged no-op
    Replay,
    /// Never heard of this id; logged and dropped
    Unknown,
}

/// Tracks open conflicts and produces resolutions
#[derive(Debug, Default)]
pub struct ConflictEngine {
    open: HashMap<ConflictId, Conflict>,
    /// Locally resolved, waiting for the relay's broadcast
    pending_ack: HashMap<ConflictId, Conflict>,
    resolved: HashSet<ConflictId>,
}

impl ConflictEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a conflict detected by this client. Returns a clone for the
    /// `conflict_detected` broadcast.
    pub fn detect(
        &mut self,
        field_name: &str,
        base_value: Value,
        local_change: FieldChange,
        remote_change: FieldChange,
    ) -> Conflict {
        let conflict = Conflict {
            id: ConflictId::new(),
            field_name: field_name.to_string(),
            base_value,
            local_change,
            remote_change,
            detected_at: Utc::now(),
        };
        self.open.insert(conflict.id, conflict.clone());
        conflict
    }

    /// Track a conflict another participant detected and broadcast.
    pub fn track_remote(&mut self, conflict: Conflict) {
        let id = conflict.id;
        if self.resolved.contains(&id)
            || self.open.contains_key(&id)
            || self.pending_ack.contains_key(&id)
        {
            debug!("ignoring already-known conflict {}", id);
            return;
        }
        self.open.insert(id, conflict);
    }

    pub fn get(&self, id: ConflictId) -> Option<&Conflict> {
        self.open.get(&id)
    }

    pub fn open_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.open.values()
    }

    pub fn open_for_field<'a>(&'a self, field: &str) -> Option<&'a Conflict> {
        self.open.values().find(|c| c.field_name == field)
    }

    pub fn is_resolved(&self, id: ConflictId) -> bool {
        self.resolved.contains(&id)
    }

    /// Resolve an open conflict with the chosen strategy. The conflict moves
    /// to `pending_ack`; the relay broadcast settles it. An empty manual
    /// value is rejected and the conflict stays open.
    pub fn resolve(
        &mut self,
        id: ConflictId,
        choice: ResolutionChoice,
    ) -> Result<(Conflict, Resolution)> {
        let conflict = match self.open.remove(&id) {
            Some(conflict) => conflict,
            None => {
                return Err(CollabError::Protocol(format!("conflict {} is not open", id)));
            }
        };

        let (strategy, resolved_value) = match choice {
            ResolutionChoice::KeepLocal => (
                ResolutionStrategy::Local,
                conflict.local_change.new_value.clone(),
            ),
            ResolutionChoice::AcceptRemote => (
                ResolutionStrategy::Remote,
                conflict.remote_change.new_value.clone(),
            ),
            ResolutionChoice::MergeAuto => (
                ResolutionStrategy::MergeAuto,
                merge_auto(
                    &conflict.base_value,
                    &conflict.local_change,
                    &conflict.remote_change,
                ),
            ),
            ResolutionChoice::MergeManual(value) => {
                if is_blank(&value) {
                    // Rejected inline; the conflict stays open.
                    self.open.insert(id, conflict);
                    return Err(CollabError::InvalidInput(
                        "merged value must not be empty".to_string(),
                    ));
                }
                (ResolutionStrategy::MergeManual, value)
            }
        };

        self.pending_ack.insert(id, conflict.clone());

        Ok((
            conflict,
            Resolution {
                conflict_id: id,
                strategy,
                resolved_value,
            },
        ))
    }

    /// Feed a broadcast `conflict_resolved` in. Exactly one acceptance per
    /// id; replays and unknown ids are logged anomalies, never user errors.
    pub fn accept_resolution(&mut self, id: ConflictId) -> Accepted {
        if let Some(conflict) = self
            .open
            .remove(&id)
            .or_else(|| self.pending_ack.remove(&id))
        {
            self.resolved.insert(id);
            return Accepted::Applied(conflict);
        }
        if self.resolved.contains(&id) {
            debug!("replayed resolution for settled conflict {}", id);
            Accepted::Replay
        } else {
            warn!("resolution for unknown conflict {}", id);
            Accepted::Unknown
        }
    }

    /// The relay rejected our resolution; reopen and wait for the winner's
    /// broadcast.
    pub fn on_resolution_failed(&mut self, id: ConflictId, error: &str) {
        match self.pending_ack.remove(&id) {
            Some(conflict) => {
                warn!("resolution of conflict {} lost the race: {}", id, error);
                self.open.insert(id, conflict);
            }
            None => debug!("resolution failure for settled conflict {}", id),
        }
    }

    /// Closing the editor discards everything silently.
    pub fn discard_all(&mut self) {
        self.open.clear();
        self.pending_ack.clear();
    }
}

/// Deterministic three-way merge.
///
/// An unchanged side yields to the other. Two changed string values merge by
/// substring containment (the superset wins) or, failing that, by
/// newline-joined concatenation. Anything else falls back to the later
/// timestamp.
pub fn merge_auto(base: &Value, local: &FieldChange, remote: &FieldChange) -> Value {
    let local_value = &local.new_value;
    let remote_value = &remote.new_value;

    if local_value == base {
        return remote_value.clone();
    }
    if remote_value == base {
        return local_value.clone();
    }

    if let (Some(l), Some(r)) = (local_value.as_str(), remote_value.as_str()) {
        if l.contains(r) {
            return local_value.clone();
        }
        if r.contains(l) {
            return remote_value.clone();
        }
        return Value::String(format!("{}\n{}", l, r));
    }

    // Last-writer-wins for non-string values; ties keep the local change.
    if remote.timestamp > local.timestamp {
        remote_value.clone()
    } else {
        local_value.clone()
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserId;
    use chrono::Duration;

    fn change(field: &str, old: &str, new: &str) -> FieldChange {
        FieldChange::new(
            field,
            Value::String(old.into()),
            Value::String(new.into()),
            UserId::new(),
        )
    }

    fn merge_strings(base: &str, local: &str, remote: &str) -> Value {
        merge_auto(
            &Value::String(base.into()),
            &change("f", base, local),
            &change("f", base, remote),
        )
    }

    #[test]
    fn test_auto_merge_table() {
        // Unchanged local yields to remote and vice versa.
        assert_eq!(merge_strings("A", "A", "B"), Value::String("B".into()));
        assert_eq!(merge_strings("A", "B", "A"), Value::String("B".into()));
        // Substring containment: the superset wins.
        assert_eq!(merge_strings("A", "AB", "B"), Value::String("AB".into()));
        assert_eq!(merge_strings("A", "B", "AB"), Value::String("AB".into()));
        // Neither contains the other: conservative concatenation.
        assert_eq!(merge_strings("A", "B", "C"), Value::String("B\nC".into()));
    }

    #[test]
    fn test_auto_merge_non_string_falls_back_to_lww() {
        let base = Value::from(1);
        let mut local = FieldChange::new("n", base.clone(), Value::from(2), UserId::new());
        let mut remote = FieldChange::new("n", base.clone(), Value::from(3), UserId::new());

        local.timestamp = Utc::now();
        remote.timestamp = local.timestamp + Duration::milliseconds(5);
        assert_eq!(merge_auto(&base, &local, &remote), Value::from(3));

        remote.timestamp = local.timestamp - Duration::milliseconds(5);
        assert_eq!(merge_auto(&base, &local, &remote), Value::from(2));
    }

    #[test]
    fn test_resolve_strategies() {
        let mut engine = ConflictEngine::new();
        let conflict = engine.detect(
            "title",
            Value::String("A".into()),
            change("title", "A", "mine"),
            change("title", "A", "theirs"),
        );

        let (_, resolution) = engine
            .resolve(conflict.id, ResolutionChoice::KeepLocal)
            .unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::Local);
        assert_eq!(resolution.resolved_value, Value::String("mine".into()));

        // Already pending; a second local attempt is a protocol error.
        assert!(engine
            .resolve(conflict.id, ResolutionChoice::AcceptRemote)
            .is_err());
    }

    #[test]
    fn test_empty_manual_merge_rejected_and_conflict_stays_open() {
        let mut engine = ConflictEngine::new();
        let conflict = engine.detect(
            "title",
            Value::String("A".into()),
            change("title", "A", "B"),
            change("title", "A", "C"),
        );

        let err = engine
            .resolve(
                conflict.id,
                ResolutionChoice::MergeManual(Value::String("   ".into())),
            )
            .unwrap_err();
        assert!(matches!(err, CollabError::InvalidInput(_)));
        assert!(engine.get(conflict.id).is_some());

        // A real value goes through.
        engine
            .resolve(
                conflict.id,
                ResolutionChoice::MergeManual(Value::String("merged".into())),
            )
            .unwrap();
    }

    #[test]
    fn test_accept_resolution_is_idempotent() {
        let mut engine = ConflictEngine::new();
        let conflict = engine.detect(
            "title",
            Value::String("A".into()),
            change("title", "A", "B"),
            change("title", "A", "C"),
        );

        assert!(matches!(
            engine.accept_resolution(conflict.id),
            Accepted::Applied(_)
        ));
        assert_eq!(engine.accept_resolution(conflict.id), Accepted::Replay);
        assert_eq!(engine.accept_resolution(ConflictId::new()), Accepted::Unknown);
    }

    #[test]
    fn test_lost_race_reopens_until_winner_broadcast() {
        let mut engine = ConflictEngine::new();
        let conflict = engine.detect(
            "title",
            Value::String("A".into()),
            change("title", "A", "B"),
            change("title", "A", "C"),
        );

        engine
            .resolve(conflict.id, ResolutionChoice::KeepLocal)
            .unwrap();
        engine.on_resolution_failed(conflict.id, "conflict already resolved");
        assert!(engine.get(conflict.id).is_some());

        // The winner's broadcast settles it.
        assert!(matches!(
            engine.accept_resolution(conflict.id),
            Accepted::Applied(_)
        ));
    }
}
