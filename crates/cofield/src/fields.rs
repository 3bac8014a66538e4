//! Form field abstraction.
//!
//! Synchronization and conflict logic never touch a real DOM; they talk to a
//! [`FieldView`]. The in-memory [`FormModel`] backs tests and headless
//! drivers, a real frontend supplies its own implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::UserId;

/// What kind of input a form field is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    TextArea,
    Select,
    Checkbox,
    Number,
    Hidden,
    Csrf,
    Submit,
    Button,
}

impl FieldKind {
    /// Hidden, CSRF, submit and button inputs are never synchronized.
    pub fn is_collaborative(&self) -> bool {
        !matches!(
            self,
            FieldKind::Hidden | FieldKind::Csrf | FieldKind::Submit | FieldKind::Button
        )
    }
}

/// Visual markers the core asks the view to apply
#[derive(Debug, Clone, PartialEq)]
pub enum Highlight {
    /// Brief flash after a remote edit was applied, attributed to its author
    RemoteChange { author: UserId },

    /// The field holds a detected, unresolved conflict
    Conflict,

    /// "Being edited by" label for a remote participant
    EditedBy { user_id: UserId },
}

impl Highlight {
    pub fn kind(&self) -> HighlightKind {
        match self {
            Highlight::RemoteChange { .. } => HighlightKind::RemoteChange,
            Highlight::Conflict => HighlightKind::Conflict,
            Highlight::EditedBy { .. } => HighlightKind::EditedBy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HighlightKind {
    RemoteChange,
    Conflict,
    EditedBy,
}

/// The seam between the collaboration core and the rendered form.
///
/// All mutation happens on the caller's single thread; implementations do not
/// need interior mutability.
pub trait FieldView {
    /// Current value of a field, `None` if the field does not exist.
    fn value(&self, field: &str) -> Option<Value>;

    /// Overwrite a field's value.
    fn set_value(&mut self, field: &str, value: Value);

    /// Apply a visual marker to a field.
    fn highlight(&mut self, field: &str, highlight: Highlight);

    /// Remove all markers of one kind from a field.
    fn clear_highlight(&mut self, field: &str, kind: HighlightKind);
}

#[derive(Debug, Clone)]
struct FormField {
    kind: FieldKind,
    value: Value,
    highlights: Vec<Highlight>,
}

/// In-memory form backing tests and headless clients
#[derive(Debug, Clone, Default)]
pub struct FormModel {
    fields: BTreeMap<String, FormField>,
}

impl FormModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_field(&mut self, name: impl Into<String>, kind: FieldKind, initial: Value) {
        self.fields.insert(
            name.into(),
            FormField {
                kind,
                value: initial,
                highlights: Vec::new(),
            },
        );
    }

    /// Convenience for the common case of a text input.
    pub fn insert_text(&mut self, name: impl Into<String>, initial: &str) {
        self.insert_field(name, FieldKind::Text, Value::String(initial.to_string()));
    }

    pub fn kind(&self, field: &str) -> Option<FieldKind> {
        self.fields.get(field).map(|f| f.kind)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Markers currently applied to a field, in application order.
    pub fn highlights(&self, field: &str) -> &[Highlight] {
        self.fields
            .get(field)
            .map(|f| f.highlights.as_slice())
            .unwrap_or(&[])
    }
}

impl FieldView for FormModel {
    fn value(&self, field: &str) -> Option<Value> {
        self.fields.get(field).map(|f| f.value.clone())
    }

    fn set_value(&mut self, field: &str, value: Value) {
        if let Some(f) = self.fields.get_mut(field) {
            f.value = value;
        }
    }

    fn highlight(&mut self, field: &str, highlight: Highlight) {
        if let Some(f) = self.fields.get_mut(field) {
            // One marker per kind; a new one replaces the old.
            f.highlights.retain(|h| h.kind() != highlight.kind());
            f.highlights.push(highlight);
        }
    }

    fn clear_highlight(&mut self, field: &str, kind: HighlightKind) {
        if let Some(f) = self.fields.get_mut(field) {
            f.highlights.retain(|h| h.kind() != kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_field_kinds() {
        assert!(FieldKind::Text.is_collaborative());
        assert!(FieldKind::Select.is_collaborative());
        assert!(!FieldKind::Hidden.is_collaborative());
        assert!(!FieldKind::Csrf.is_collaborative());
        assert!(!FieldKind::Submit.is_collaborative());
        assert!(!FieldKind::Button.is_collaborative());
    }

    #[test]
    fn test_form_model_highlights_replace_per_kind() {
        let mut form = FormModel::new();
        form.insert_text("title", "hello");

        let alice = UserId::new();
        let bob = UserId::new();

        form.highlight("title", Highlight::EditedBy { user_id: alice });
        form.highlight("title", Highlight::Conflict);
        form.highlight("title", Highlight::EditedBy { user_id: bob });

        assert_eq!(form.highlights("title").len(), 2);
        assert!(form
            .highlights("title")
            .contains(&Highlight::EditedBy { user_id: bob }));

        form.clear_highlight("title", HighlightKind::Conflict);
        assert_eq!(form.highlights("title").len(), 1);
    }
}
