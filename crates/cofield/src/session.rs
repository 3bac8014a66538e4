//! Session lifecycle and wiring.
//!
//! [`CollabSession`] owns the presence tracker, field synchronizer and
//! conflict engine for one open record, with the relay sender and the form
//! view injected at construction. All handlers run on the caller's single
//! thread and complete within the call; the debounce deadline polled via
//! [`CollabSession::poll`] is the only deferred work.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    Accepted, CollabMessage, Conflict, ConflictEngine, ConflictId, FieldChange, FieldKind,
    FieldSynchronizer, FieldView, Highlight, HighlightKind, ParticipantInfo, PresenceTracker,
    RemoteApply, ResolutionChoice, Result, SessionId, SyncConfig, UserId,
};

/// Relay connection state as the session sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Join sent, roster not yet received
    Joining,
    Connected,
}

/// Identity of one collaboration room: (model, record) plus the local user
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub model_name: String,
    pub record_id: String,
    pub created_at: DateTime<Utc>,
    pub local_user: ParticipantInfo,
    /// Capability: read-only participants observe but never broadcast edits
    pub can_edit: bool,
}

impl SessionContext {
    pub fn new(
        session_id: SessionId,
        model_name: impl Into<String>,
        record_id: impl Into<String>,
        local_user: ParticipantInfo,
        can_edit: bool,
    ) -> Self {
        Self {
            session_id,
            model_name: model_name.into(),
            record_id: record_id.into(),
            created_at: Utc::now(),
            local_user,
            can_edit,
        }
    }
}

/// Transient notifications for the surrounding UI, drained via
/// [`CollabSession::take_events`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    ParticipantJoined {
        user_id: UserId,
        display_name: String,
    },
    ParticipantLeft {
        user_id: UserId,
        display_name: String,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        field_name: String,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        field_name: String,
    },
}

/// One open collaborative editor over a record's form fields
pub struct CollabSession<V: FieldView> {
    context: SessionContext,
    state: ConnectionState,
    presence: PresenceTracker,
    sync: FieldSynchronizer,
    conflicts: ConflictEngine,
    view: V,
    relay_tx: mpsc::UnboundedSender<CollabMessage>,
    /// Committed changes retained while the relay is unreachable
    outbox: Vec<FieldChange>,
    /// Fields currently carrying a "being edited by" label
    labeled: HashSet<String>,
    events: Vec<SessionEvent>,
}

impl<V: FieldView> CollabSession<V> {
    /// Open the session: emits the join handshake; the roster arrives as
    /// `participants_updated` and confirms the join.
    pub fn open(
        context: SessionContext,
        view: V,
        relay_tx: mpsc::UnboundedSender<CollabMessage>,
    ) -> Self {
        let local_user = context.local_user.user_id;
        let mut session = Self {
            presence: PresenceTracker::new(local_user),
            sync: FieldSynchronizer::new(local_user, context.can_edit, SyncConfig::default()),
            conflicts: ConflictEngine::new(),
            state: ConnectionState::Disconnected,
            context,
            view,
            relay_tx,
            outbox: Vec::new(),
            labeled: HashSet::new(),
            events: Vec::new(),
        };
        session.send_join();
        session
    }

    /// Close the editor: best-effort leave, then local teardown regardless
    /// of relay acknowledgment. Unresolved conflicts are discarded silently.
    pub fn close(&mut self) {
        let user_id = self.context.local_user.user_id;
        let _ = self.relay_tx.send(CollabMessage::Leave { user_id });
        self.sync.cancel_all();
        self.conflicts.discard_all();
        self.presence.clear();
        self.outbox.clear();
        self.state = ConnectionState::Disconnected;
        info!("left session {}", self.context.session_id);
    }

    pub fn observe(&mut self, field: &str, kind: FieldKind) {
        self.sync.observe(field, kind, &self.view);
    }

    // ---- local edit path -------------------------------------------------

    /// A keystroke in an observed field.
    pub fn note_input(&mut self, field: &str, now: Instant) {
        self.sync.note_input(field, now);
    }

    /// Fire expired debounce deadlines and broadcast the resulting commits.
    pub fn poll(&mut self, now: Instant) {
        let changes = self.sync.poll(now, &self.view);
        for change in changes {
            self.dispatch_change(change);
        }
    }

    /// Hard commit (a `select` commit, or any change event that should not
    /// wait out the debounce).
    pub fn commit_field(&mut self, field: &str) {
        if let Some(change) = self.sync.commit_now(field, &self.view) {
            self.dispatch_change(change);
        }
    }

    pub fn focus_field(&mut self, field: &str) {
        self.sync.focus_local(field);
        let user_id = self.context.local_user.user_id;
        self.send(CollabMessage::FieldFocused {
            user_id,
            field_name: field.to_string(),
        });
    }

    /// Local blur: commit a changed value immediately, release any remote
    /// change that queued while the field was focused, and broadcast the
    /// blur.
    pub fn blur_field(&mut self, field: &str, now: Instant) {
        if let Some(change) = self.sync.commit_now(field, &self.view) {
            self.dispatch_change(change);
        }
        if let Some(queued) = self.sync.blur_local(field) {
            self.handle_remote_change(queued, now);
        }
        let user_id = self.context.local_user.user_id;
        self.send(CollabMessage::FieldBlurred {
            user_id,
            field_name: field.to_string(),
        });
    }

    /// Broadcast the local cursor, throttled to the presence tracker's rate.
    pub fn move_cursor(&mut self, x: f64, y: f64, field_name: Option<String>, now: Instant) {
        if !self.presence.should_broadcast_cursor(now) {
            return;
        }
        let user_id = self.context.local_user.user_id;
        self.send(CollabMessage::CursorMoved {
            user_id,
            x,
            y,
            field_name,
        });
    }

    /// Resolve an open conflict. The resolved value is applied locally right
    /// away and published; the relay's broadcast makes everyone converge.
    pub fn resolve_conflict(&mut self, id: ConflictId, choice: ResolutionChoice) -> Result<()> {
        let (conflict, resolution) = self.conflicts.resolve(id, choice)?;
        self.sync.apply_resolution(
            &conflict.field_name,
            &resolution.resolved_value,
            &mut self.view,
        );
        self.send(CollabMessage::ResolveConflict { resolution });
        Ok(())
    }

    // ---- relay message path ----------------------------------------------

    /// Dispatch one inbound relay message. The message set is closed; every
    /// variant is handled here.
    pub fn handle_message(&mut self, message: CollabMessage, now: Instant) {
        match message {
            CollabMessage::UserJoined { user } => {
                let user_id = user.user_id;
                let display_name = user.display_name.clone();
                if self.presence.on_participant_joined(user, now) {
                    self.events.push(SessionEvent::ParticipantJoined {
                        user_id,
                        display_name,
                    });
                }
            }

            CollabMessage::UserLeft { user_id } => {
                if let Some(participant) = self.presence.on_participant_left(user_id) {
                    if let Some(field) = participant.focused_field.clone() {
                        self.refresh_editor_label(&field);
                    }
                    self.events.push(SessionEvent::ParticipantLeft {
                        user_id,
                        display_name: participant.info.display_name,
                    });
                }
            }

            CollabMessage::ParticipantsUpdated { participants } => {
                self.presence.replace_roster(participants, now);
                if self.state != ConnectionState::Connected {
                    self.state = ConnectionState::Connected;
                    self.events.push(SessionEvent::Connected);
                    self.flush_outbox();
                }
            }

            CollabMessage::FieldChanged { change } => {
                self.handle_remote_change(change, now);
            }

            CollabMessage::CursorMoved {
                user_id,
                x,
                y,
                field_name,
            } => {
                if user_id != self.context.local_user.user_id {
                    self.presence
                        .on_cursor_moved(user_id, x, y, field_name.clone(), now);
                    if let Some(field) = field_name {
                        self.refresh_editor_label(&field);
                    }
                }
            }

            CollabMessage::FieldFocused {
                user_id,
                field_name,
            } => {
                self.presence.on_field_focus(user_id, &field_name, now);
                self.refresh_editor_label(&field_name);
            }

            CollabMessage::FieldBlurred {
                user_id,
                field_name,
            } => {
                self.presence.on_field_blur(user_id, &field_name, now);
                self.refresh_editor_label(&field_name);
            }

            CollabMessage::ConflictDetected {
                conflict_id,
                field_name,
                base_value,
                local_change,
                remote_change,
            } => {
                // Another participant's divergence; mirror it so the field
                // shows as contested here too.
                self.conflicts.track_remote(Conflict {
                    id: conflict_id,
                    field_name: field_name.clone(),
                    base_value,
                    local_change,
                    remote_change,
                    detected_at: Utc::now(),
                });
                self.view.highlight(&field_name, Highlight::Conflict);
                self.events.push(SessionEvent::ConflictDetected {
                    conflict_id,
                    field_name,
                });
            }

            CollabMessage::ConflictResolved {
                conflict_id,
                resolution: _,
                resolved_value,
            } => match self.conflicts.accept_resolution(conflict_id) {
                Accepted::Applied(conflict) => {
                    self.sync.apply_resolution(
                        &conflict.field_name,
                        &resolved_value,
                        &mut self.view,
                    );
                    self.events.push(SessionEvent::ConflictResolved {
                        conflict_id,
                        field_name: conflict.field_name,
                    });
                }
                Accepted::Replay | Accepted::Unknown => {}
            },

            CollabMessage::ConflictResolutionFailed { conflict_id, error } => {
                self.conflicts.on_resolution_failed(conflict_id, &error);
            }

            CollabMessage::Error { message } => {
                warn!("relay reported an error: {}", message);
            }

            CollabMessage::Ping => self.send(CollabMessage::Pong),

            CollabMessage::Pong => debug!("heartbeat acknowledged"),

            CollabMessage::Join { .. }
            | CollabMessage::Leave { .. }
            | CollabMessage::ResolveConflict { .. } => {
                warn!("dropping client-to-relay message received from the relay");
            }
        }
    }

    /// The transport noticed a broken connection: clear presence (show no
    /// one rather than stale avatars) and keep buffering edits.
    pub fn on_disconnected(&mut self) {
        self.mark_disconnected();
    }

    /// The transport re-established the connection: re-join and flush the
    /// buffer once the roster confirms.
    pub fn reconnect(&mut self) {
        self.state = ConnectionState::Joining;
        self.send_join();
    }

    // ---- accessors -------------------------------------------------------

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn conflicts(&self) -> &ConflictEngine {
        &self.conflicts
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    pub fn last_known(&self, field: &str) -> Option<&serde_json::Value> {
        self.sync.last_known(field)
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // ---- internals -------------------------------------------------------

    fn send_join(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Joining;
        }
        let message = CollabMessage::Join {
            session_id: self.context.session_id,
            model: self.context.model_name.clone(),
            record_id: self.context.record_id.clone(),
            user: self.context.local_user.clone(),
        };
        info!(
            "joining session {} as {}",
            self.context.session_id, self.context.local_user.display_name
        );
        self.send(message);
    }

    fn send(&mut self, message: CollabMessage) {
        if self.relay_tx.send(message).is_err() {
            self.mark_disconnected();
        }
    }

    fn dispatch_change(&mut self, change: FieldChange) {
        if self.state == ConnectionState::Connected {
            let wire = CollabMessage::FieldChanged {
                change: change.clone(),
            };
            if self.relay_tx.send(wire).is_ok() {
                return;
            }
            self.mark_disconnected();
        }
        self.outbox.push(change);
    }

    fn flush_outbox(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        info!("flushing {} buffered field changes", self.outbox.len());
        let changes = std::mem::take(&mut self.outbox);
        for change in changes {
            self.dispatch_change(change);
        }
    }

    fn handle_remote_change(&mut self, change: FieldChange, _now: Instant) {
        let field = change.field_name.clone();
        match self.sync.apply_remote(change, &mut self.view) {
            RemoteApply::Applied | RemoteApply::Ignored => {}
            RemoteApply::Queued => {
                debug!("holding remote change to focused field {}", field);
            }
            RemoteApply::Conflicted {
                base_value,
                local_change,
                remote_change,
            } => {
                let conflict =
                    self.conflicts
                        .detect(&field, base_value, local_change, remote_change);
                self.view.highlight(&field, Highlight::Conflict);
                self.events.push(SessionEvent::ConflictDetected {
                    conflict_id: conflict.id,
                    field_name: field.clone(),
                });
                self.send(CollabMessage::ConflictDetected {
                    conflict_id: conflict.id,
                    field_name: conflict.field_name,
                    base_value: conflict.base_value,
                    local_change: conflict.local_change,
                    remote_change: conflict.remote_change,
                });
            }
        }
    }

    fn refresh_editor_label(&mut self, field: &str) {
        let editor = self.presence.editors_of(field).first().map(|p| p.user_id());
        match editor {
            Some(user_id) => {
                self.view.highlight(field, Highlight::EditedBy { user_id });
                self.labeled.insert(field.to_string());
            }
            None => {
                self.view.clear_highlight(field, HighlightKind::EditedBy);
                self.labeled.remove(field);
            }
        }
    }

    fn mark_disconnected(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        self.presence.clear();
        let labeled: Vec<String> = self.labeled.drain().collect();
        for field in labeled {
            self.view.clear_highlight(&field, HighlightKind::EditedBy);
        }
        self.events.push(SessionEvent::Disconnected);
        info!("relay connection lost; presence cleared, edits buffered");
    }
}
