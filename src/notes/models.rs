//! Note models and DTOs
//!
//! A note is a titled piece of free text. The only derived state it carries
//! is `derived_metric`, written back by the enrichment worker.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{PipelineError, Result};

// ============================================================================
// Core types
// ============================================================================

/// A stored note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Opaque, creation-time-derived unique id
    pub id: String,
    pub title: String,
    pub content: String,
    /// Word count of `content`, absent until enrichment has run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_metric: Option<i64>,
}

impl Note {
    /// Create a new note with a freshly generated id and no derived metric
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: generate_note_id(),
            title: title.into(),
            content: content.into(),
            derived_metric: None,
        }
    }

    /// Apply a single-field update in place
    pub fn apply(&mut self, update: &FieldUpdate) {
        match update {
            FieldUpdate::Title(title) => self.title = title.clone(),
            FieldUpdate::Content(content) => self.content = content.clone(),
            FieldUpdate::DerivedMetric(value) => self.derived_metric = Some(*value),
        }
    }
}

/// Build a note id from the creation timestamp.
///
/// The RFC 3339 millisecond timestamp keeps ids sortable by creation time;
/// the random suffix keeps two notes created in the same millisecond apart.
pub fn generate_note_id() -> String {
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", ts, &suffix[..8])
}

/// Name of the field a [`FieldUpdate`] touches, as it appears in store logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoteField {
    Title,
    Content,
    DerivedMetric,
}

impl fmt::Display for NoteField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Title => write!(f, "title"),
            Self::Content => write!(f, "content"),
            Self::DerivedMetric => write!(f, "derivedMetric"),
        }
    }
}

/// A write touching exactly one field of a note
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    Title(String),
    Content(String),
    DerivedMetric(i64),
}

impl FieldUpdate {
    pub fn field(&self) -> NoteField {
        match self {
            Self::Title(_) => NoteField::Title,
            Self::Content(_) => NoteField::Content,
            Self::DerivedMetric(_) => NoteField::DerivedMetric,
        }
    }
}

/// Result of a conditional single-field update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The note did not exist, nothing was written
    ConditionFailed,
}

// ============================================================================
// Request DTOs
// ============================================================================

/// Request body for creating a note
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateNoteRequest {
    pub title: Option<String>,
    pub content: Option<String>,
}

impl CreateNoteRequest {
    /// Validate the request and build the note to store.
    ///
    /// Both `title` and `content` must be present and not blank.
    pub fn into_note(self) -> Result<Note> {
        let title = non_blank(self.title, "title")?;
        let content = non_blank(self.content, "content")?;
        Ok(Note::new(title, content))
    }
}

fn non_blank(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(PipelineError::MalformedInput(format!(
            "`{}` is required",
            field
        ))),
    }
}
