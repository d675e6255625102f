//! Ordered change log emitted by the note store
//!
//! Every mutation appends one [`ChangeRecord`] while the store's write lock is
//! held, so the log order for a given key is its commit order. The log keeps
//! at most `retention` records; consumers that fall behind the trim point
//! resume from the oldest retained record.
//!
//! Consumers read in batches and acknowledge by committing the whole batch.
//! An uncommitted batch is handed out again on the next read.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

use crate::notes::Note;

/// Default number of records kept by the log
pub const DEFAULT_RETENTION: usize = 10_000;

/// Kind of mutation recorded in the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// A single change log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Position in the log, increasing with commit order
    pub sequence: u64,
    /// Note id the mutation applies to
    pub key: String,
    pub event_kind: ChangeKind,
    /// Snapshot of the note after the mutation (absent for removals)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<Note>,
}

impl ChangeRecord {
    /// Build a record that has not been appended to a log yet
    pub fn new(key: impl Into<String>, event_kind: ChangeKind, new_content: Option<Note>) -> Self {
        Self {
            sequence: 0,
            key: key.into(),
            event_kind,
            new_content,
        }
    }
}

struct LogInner {
    records: VecDeque<ChangeRecord>,
    next_sequence: u64,
}

/// Append-only, replayable change log with bounded retention
pub struct ChangeLog {
    inner: RwLock<LogInner>,
    notify: Notify,
    retention: usize,
}

impl ChangeLog {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: RwLock::new(LogInner {
                records: VecDeque::new(),
                next_sequence: 1,
            }),
            notify: Notify::new(),
            retention: retention.max(1),
        }
    }

    /// Append a record and wake waiting consumers. Returns the assigned sequence.
    pub async fn append(&self, key: &str, kind: ChangeKind, snapshot: Option<Note>) -> u64 {
        let sequence = {
            let mut inner = self.inner.write().await;
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.records.push_back(ChangeRecord {
                sequence,
                key: key.to_string(),
                event_kind: kind,
                new_content: snapshot,
            });
            while inner.records.len() > self.retention {
                inner.records.pop_front();
            }
            sequence
        };
        debug!(key = %key, kind = ?kind, sequence, "Change record appended");
        self.notify.notify_waiters();
        sequence
    }

    /// Read up to `max` records starting at `sequence`.
    ///
    /// A `sequence` older than the oldest retained record starts at the oldest.
    pub async fn read_from(&self, sequence: u64, max: usize) -> Vec<ChangeRecord> {
        let inner = self.inner.read().await;
        inner
            .records
            .iter()
            .filter(|r| r.sequence >= sequence)
            .take(max)
            .cloned()
            .collect()
    }

    /// Sequence of the oldest retained record, if any
    pub async fn oldest_sequence(&self) -> Option<u64> {
        self.inner.read().await.records.front().map(|r| r.sequence)
    }

    /// Number of retained records
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Create a named consumer positioned at the oldest retained record
    pub fn consumer(self: &Arc<Self>, name: impl Into<String>) -> ChangeLogConsumer {
        ChangeLogConsumer {
            log: self.clone(),
            name: name.into(),
            cursor: 0,
            last_head: None,
            attempt: 0,
        }
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

/// A batch handed to a consumer, acknowledged with [`ChangeLogConsumer::commit`]
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,
    /// 1 on first delivery, incremented on every redelivery of the same head
    pub delivery_attempt: u32,
    next_cursor: u64,
}

/// Cursor over a [`ChangeLog`]
pub struct ChangeLogConsumer {
    log: Arc<ChangeLog>,
    name: String,
    cursor: u64,
    last_head: Option<u64>,
    attempt: u32,
}

impl ChangeLogConsumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence of the next record this consumer will read
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Wait until at least one record is available and return a batch of at most `max`.
    ///
    /// The cursor does not advance until the batch is committed.
    pub async fn next_batch(&mut self, max: usize) -> ChangeBatch {
        loop {
            let notified = self.log.notify.notified();
            let records = self.log.read_from(self.cursor, max.max(1)).await;

            if let Some(first) = records.first() {
                if self.cursor > 0 && first.sequence > self.cursor {
                    warn!(
                        consumer = %self.name,
                        cursor = self.cursor,
                        oldest = first.sequence,
                        "Change records trimmed before consumption"
                    );
                }
                if self.last_head == Some(first.sequence) {
                    self.attempt += 1;
                } else {
                    self.last_head = Some(first.sequence);
                    self.attempt = 1;
                }
                let next_cursor = records.last().map(|r| r.sequence + 1).unwrap_or(self.cursor);
                return ChangeBatch {
                    records,
                    delivery_attempt: self.attempt,
                    next_cursor,
                };
            }

            notified.await;
        }
    }

    /// Acknowledge a batch; its records will not be delivered again
    pub fn commit(&mut self, batch: &ChangeBatch) {
        if batch.next_cursor > self.cursor {
            self.cursor = batch.next_cursor;
        }
    }
}
