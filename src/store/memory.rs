//! In-memory implementation of NoteStore.
//!
//! Notes live in a `tokio::sync::RwLock<HashMap<String, Note>>`. The change
//! log append happens while the write lock is held, which makes the log's
//! per-key order equal to commit order.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::changelog::{ChangeKind, ChangeLog};
use super::traits::NoteStore;
use crate::error::Result;
use crate::notes::{FieldUpdate, Note, UpdateOutcome};

pub struct InMemoryNoteStore {
    notes: RwLock<HashMap<String, Note>>,
    log: Arc<ChangeLog>,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        Self::with_change_log(Arc::new(ChangeLog::default()))
    }

    pub fn with_change_log(log: Arc<ChangeLog>) -> Self {
        Self {
            notes: RwLock::new(HashMap::new()),
            log,
        }
    }
}

impl Default for InMemoryNoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NoteStore for InMemoryNoteStore {
    async fn get(&self, id: &str) -> Result<Option<Note>> {
        Ok(self.notes.read().await.get(id).cloned())
    }

    async fn put(&self, note: &Note) -> Result<()> {
        let mut notes = self.notes.write().await;
        let kind = if notes.contains_key(&note.id) {
            ChangeKind::Modified
        } else {
            ChangeKind::Created
        };
        notes.insert(note.id.clone(), note.clone());
        self.log.append(&note.id, kind, Some(note.clone())).await;
        Ok(())
    }

    async fn update_field(&self, id: &str, update: FieldUpdate) -> Result<UpdateOutcome> {
        let mut notes = self.notes.write().await;
        let Some(note) = notes.get_mut(id) else {
            debug!(
                note_id = %id,
                field = %update.field(),
                "Conditional update skipped, note absent"
            );
            return Ok(UpdateOutcome::ConditionFailed);
        };
        debug!(note_id = %id, field = %update.field(), "Applying field update");
        note.apply(&update);
        let snapshot = note.clone();
        self.log.append(id, ChangeKind::Modified, Some(snapshot)).await;
        Ok(UpdateOutcome::Applied)
    }

    async fn scan_all(&self) -> Result<Vec<Note>> {
        let mut all: Vec<Note> = self.notes.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut notes = self.notes.write().await;
        if notes.remove(id).is_none() {
            return Ok(false);
        }
        self.log.append(id, ChangeKind::Removed, None).await;
        Ok(true)
    }

    fn change_log(&self) -> Arc<ChangeLog> {
        self.log.clone()
    }
}
