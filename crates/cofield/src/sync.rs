//! Field synchronization: debounced local commits and remote apply.
//!
//! Local keystrokes coalesce behind a per-field debounce; a commit only goes
//! out if the value actually changed since the last synchronized one. Remote
//! changes apply directly when their `old_value` matches what this client
//! sees, queue while the local user holds focus on the field, and otherwise
//! hand off to the conflict engine.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{FieldChange, FieldKind, FieldView, Highlight, UserId};

/// Default pause after the last keystroke before a commit fires
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Tunables for the synchronizer
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub debounce: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Outcome of feeding one remote change into the synchronizer
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteApply {
    /// Applied to the view; `last_known` advanced, field flashed
    Applied,

    /// Held back until the local user blurs the field
    Queued,

    /// Diverges from the local state; the conflict engine takes over
    Conflicted {
        base_value: Value,
        local_change: FieldChange,
        remote_change: FieldChange,
    },

    /// Echo of our own change, or a field we do not observe
    Ignored,
}

/// Watches observed form fields and reconciles local and remote edits
#[derive(Debug)]
pub struct FieldSynchronizer {
    user_id: UserId,
    can_edit: bool,
    config: SyncConfig,
    observed: HashMap<String, FieldKind>,
    /// Last value this client believes is synchronized, per field. Must be
    /// advanced atomically with every applied change or resolution.
    last_known: HashMap<String, Value>,
    /// Armed debounce deadlines, one per dirty field
    pending: HashMap<String, Instant>,
    /// Field currently focused by the local user
    focused: Option<String>,
    /// Non-conflicting remote changes held while their field is focused
    queued_remote: HashMap<String, FieldChange>,
}

impl FieldSynchronizer {
    pub fn new(user_id: UserId, can_edit: bool, config: SyncConfig) -> Self {
        Self {
            user_id,
            can_edit,
            config,
            observed: HashMap::new(),
            last_known: HashMap::new(),
            pending: HashMap::new(),
            focused: None,
            queued_remote: HashMap::new(),
        }
    }

    /// Start watching a field. Non-collaborative kinds are skipped.
    pub fn observe(&mut self, field: &str, kind: FieldKind, view: &dyn FieldView) {
        if !kind.is_collaborative() {
            debug!("not observing non-collaborative field {}", field);
            return;
        }
        self.observed.insert(field.to_string(), kind);
        let initial = view.value(field).unwrap_or(Value::Null);
        self.last_known.insert(field.to_string(), initial);
    }

    pub fn is_observed(&self, field: &str) -> bool {
        self.observed.contains_key(field)
    }

    pub fn last_known(&self, field: &str) -> Option<&Value> {
        self.last_known.get(field)
    }

    pub fn focused_field(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    /// A local keystroke: (re)arm the debounce for this field.
    pub fn note_input(&mut self, field: &str, now: Instant) {
        if !self.can_edit || !self.observed.contains_key(field) {
            return;
        }
        self.pending
            .insert(field.to_string(), now + self.config.debounce);
    }

    /// Fire every debounce deadline that has expired. Returns the changes to
    /// broadcast; no-op edits (value reverted before the timer fired) are
    /// suppressed.
    pub fn poll(&mut self, now: Instant, view: &dyn FieldView) -> Vec<FieldChange> {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(field, _)| field.clone())
            .collect();

        let mut changes = Vec::new();
        for field in due {
            self.pending.remove(&field);
            if let Some(change) = self.commit_field(&field, view) {
                changes.push(change);
            }
        }
        changes
    }

    /// Hard commit, bypassing the debounce (blur with a changed value, or a
    /// `select` commit).
    pub fn commit_now(&mut self, field: &str, view: &dyn FieldView) -> Option<FieldChange> {
        self.pending.remove(field);
        self.commit_field(field, view)
    }

    fn commit_field(&mut self, field: &str, view: &dyn FieldView) -> Option<FieldChange> {
        if !self.can_edit || !self.observed.contains_key(field) {
            return None;
        }
        let current = view.value(field)?;
        let last = self.last_known.get(field).cloned().unwrap_or(Value::Null);
        if current == last {
            return None;
        }
        let change = FieldChange::new(field, last, current.clone(), self.user_id);
        self.last_known.insert(field.to_string(), current);
        Some(change)
    }

    /// Next armed deadline, for drivers that schedule a wakeup.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    pub fn focus_local(&mut self, field: &str) {
        self.focused = Some(field.to_string());
    }

    /// Local blur. The caller commits the field and re-feeds anything this
    /// returns through [`FieldSynchronizer::apply_remote`] now that focus is
    /// released.
    pub fn blur_local(&mut self, field: &str) -> Option<FieldChange> {
        if self.focused.as_deref() == Some(field) {
            self.focused = None;
        }
        self.queued_remote.remove(field)
    }

    /// Feed one remote change in. The conflict check compares the incoming
    /// `old_value` against the field's current value; any mismatch is a
    /// conflict.
    pub fn apply_remote(&mut self, change: FieldChange, view: &mut dyn FieldView) -> RemoteApply {
        if change.author == self.user_id {
            debug!("ignoring echo of our own change to {}", change.field_name);
            return RemoteApply::Ignored;
        }
        if !self.observed.contains_key(&change.field_name) {
            warn!(
                "dropping change to unobserved field {} from {}",
                change.field_name, change.author
            );
            return RemoteApply::Ignored;
        }

        let field = change.field_name.clone();
        let current = view.value(&field).unwrap_or(Value::Null);

        if change.old_value != current {
            // The author edited against a value we no longer hold; let the
            // conflict engine reconcile both sides.
            let local_change = FieldChange::new(
                &field,
                self.last_known.get(&field).cloned().unwrap_or(Value::Null),
                current,
                self.user_id,
            );
            return RemoteApply::Conflicted {
                base_value: change.old_value.clone(),
                local_change,
                remote_change: change,
            };
        }

        if self.focused.as_deref() == Some(field.as_str()) {
            // Never overwrite an in-progress keystroke; hold until blur.
            self.queued_remote.insert(field, change);
            return RemoteApply::Queued;
        }

        let author = change.author;
        view.set_value(&field, change.new_value.clone());
        view.highlight(&field, Highlight::RemoteChange { author });
        self.last_known.insert(field, change.new_value);
        RemoteApply::Applied
    }

    /// Apply a broadcast resolution: the resolved value becomes both the
    /// field value and the synchronized baseline, and the conflict marker
    /// goes away.
    pub fn apply_resolution(&mut self, field: &str, value: &Value, view: &mut dyn FieldView) {
        view.set_value(field, value.clone());
        view.clear_highlight(field, crate::HighlightKind::Conflict);
        self.last_known.insert(field.to_string(), value.clone());
        self.pending.remove(field);
        self.queued_remote.remove(field);
    }

    /// Drop all pending timers and queued applies (session teardown).
    pub fn cancel_all(&mut self) {
        self.pending.clear();
        self.queued_remote.clear();
        self.focused = None;
    }
}
