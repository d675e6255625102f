//! Note store and its change log
//!
//! - `NoteStore`: abstract keyed storage with conditional single-field updates
//! - `InMemoryNoteStore`: `RwLock<HashMap>` implementation
//! - `ChangeLog`: ordered, replayable log of mutations consumed in batches

pub mod changelog;
pub mod memory;
pub mod traits;

pub use changelog::{
    ChangeBatch, ChangeKind, ChangeLog, ChangeLogConsumer, ChangeRecord, DEFAULT_RETENTION,
};
pub use memory::InMemoryNoteStore;
pub use traits::NoteStore;
