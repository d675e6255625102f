//! NoteStore trait definition
//!
//! Abstract key-value interface over note records: atomic single-item read,
//! write and conditional single-field update, plus a full scan. Every store
//! exposes the change log its mutations are appended to.

use crate::error::Result;
use crate::notes::{FieldUpdate, Note, UpdateOutcome};
use async_trait::async_trait;
use std::sync::Arc;

use super::changelog::ChangeLog;

#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Get a note by id
    async fn get(&self, id: &str) -> Result<Option<Note>>;

    /// Insert or replace a note
    async fn put(&self, note: &Note) -> Result<()>;

    /// Update a single field of an existing note.
    ///
    /// Fails the condition (and writes nothing) if the note does not exist.
    async fn update_field(&self, id: &str, update: FieldUpdate) -> Result<UpdateOutcome>;

    /// All notes, ordered by id
    async fn scan_all(&self) -> Result<Vec<Note>>;

    /// Remove a note. Returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool>;

    /// The change log this store appends its mutations to
    fn change_log(&self) -> Arc<ChangeLog>;
}
