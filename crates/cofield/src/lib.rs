//! Real-time collaborative editing of a record's form fields.
//!
//! Multiple users edit the same record at once, see each other's cursors and
//! focus, and reconcile simultaneous edits to the same field. The crate is the
//! client-side core: it decides what goes over the relay, what a received
//! message does to the local form, and how a divergence between two edits is
//! detected and resolved. The relay itself is an external fan-out bus (see
//! `apps/relay-server` for the reference implementation).

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod protocol;
pub use protocol::*;

mod fields;
pub use fields::*;

mod sync;
pub use sync::*;

mod presence;
pub use presence::*;

mod conflict;
pub use conflict::*;

mod session;
pub use session::*;

mod client;
pub use client::*;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol anomaly: {0}")]
    Protocol(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

pub type Result<T> = std::result::Result<T, CollabError>;

/// User identifier within a collaboration session
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a collaboration session (one open record)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a detected edit conflict
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConflictId(pub uuid::Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConflictId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
