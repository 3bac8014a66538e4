//! Message protocol carried over the relay.
//!
//! One tagged union covers both directions; the relay routes by session and
//! never inspects payloads beyond the `resolve_conflict` arbitration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConflictId, SessionId, UserId};

/// Wire description of a connected user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl ParticipantInfo {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

/// A single committed edit to one form field. Immutable once created.
///
/// `old_value` is the value the author believed was current before editing;
/// it is the sole basis for conflict detection on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field_name: String,
    pub old_value: Value,
    pub new_value: Value,
    pub author: UserId,
    pub timestamp: DateTime<Utc>,
}

impl FieldChange {
    pub fn new(
        field_name: impl Into<String>,
        old_value: Value,
        new_value: Value,
        author: UserId,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            old_value,
            new_value,
            author,
            timestamp: Utc::now(),
        }
    }
}

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the local edit, discard the remote one
    Local,

    /// Accept the remote edit, discard the local one
    Remote,

    /// Deterministic three-way merge of both edits
    MergeAuto,

    /// Value supplied by the resolving user
    MergeManual,
}

/// The settled outcome of one conflict; broadcast so every participant
/// converges on the same value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub conflict_id: ConflictId,
    pub strategy: ResolutionStrategy,
    pub resolved_value: Value,
}

/// Messages exchanged between clients and the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CollabMessage {
    // Session lifecycle
    #[serde(rename = "join_collaboration")]
    Join {
        session_id: SessionId,
        model: String,
        record_id: String,
        user: ParticipantInfo,
    },

    #[serde(rename = "leave_collaboration")]
    Leave { user_id: UserId },

    #[serde(rename = "user_joined")]
    UserJoined { user: ParticipantInfo },

    #[serde(rename = "user_left")]
    UserLeft { user_id: UserId },

    /// Full roster, sent by the relay to a joining client. The relay is
    /// authoritative for membership; clients mirror it.
    #[serde(rename = "participants_updated")]
    ParticipantsUpdated { participants: Vec<ParticipantInfo> },

    // Field synchronization
    #[serde(rename = "field_change")]
    FieldChanged { change: FieldChange },

    // Presence
    #[serde(rename = "cursor_moved")]
    CursorMoved {
        user_id: UserId,
        x: f64,
        y: f64,
        field_name: Option<String>,
    },

    #[serde(rename = "field_focused")]
    FieldFocused { user_id: UserId, field_name: String },

    #[serde(rename = "field_blurred")]
    FieldBlurred { user_id: UserId, field_name: String },

    // Conflict lifecycle
    #[serde(rename = "conflict_detected")]
    ConflictDetected {
        conflict_id: ConflictId,
        field_name: String,
        base_value: Value,
        local_change: FieldChange,
        remote_change: FieldChange,
    },

    #[serde(rename = "resolve_conflict")]
    ResolveConflict { resolution: Resolution },

    #[serde(rename = "conflict_resolved")]
    ConflictResolved {
        conflict_id: ConflictId,
        resolution: ResolutionStrategy,
        resolved_value: Value,
    },

    #[serde(rename = "conflict_resolution_failed")]
    ConflictResolutionFailed { conflict_id: ConflictId, error: String },

    // Error reporting
    #[serde(rename = "error")]
    Error { message: String },

    // Heartbeat
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_tags_match_wire_names() {
        let msg = CollabMessage::FieldFocused {
            user_id: UserId::new(),
            field_name: "title".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"field_focused\""));

        let msg = CollabMessage::Join {
            session_id: SessionId::new(),
            model: "article".to_string(),
            record_id: "42".to_string(),
            user: ParticipantInfo::new(UserId::new(), "Alice"),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"join_collaboration\""));
    }

    #[test]
    fn test_field_change_roundtrip() {
        let change = FieldChange::new(
            "title",
            Value::String("old".into()),
            Value::String("new".into()),
            UserId::new(),
        );
        let json = serde_json::to_string(&CollabMessage::FieldChanged {
            change: change.clone(),
        })
        .unwrap();
        let parsed: CollabMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, CollabMessage::FieldChanged { change });
    }

    #[test]
    fn test_strategy_serializes_snake_case() {
        let json = serde_json::to_string(&ResolutionStrategy::MergeAuto).unwrap();
        assert_eq!(json, "\"merge_auto\"");
    }
}
