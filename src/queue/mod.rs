//! Work queue between the change relay and the enrichment worker
//!
//! At-least-once, unordered delivery with visibility-timeout redelivery:
//! a received message stays invisible until it is acked or its timeout
//! expires, after which it is handed out again.

mod memory;

pub use memory::{InMemoryWorkQueue, QueueSettings};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Reference to a note that needs enrichment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub note_id: String,
}

impl WorkItem {
    pub fn new(note_id: impl Into<String>) -> Self {
        Self {
            note_id: note_id.into(),
        }
    }

    /// Serialize to the JSON body carried on the queue
    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a queue body, rejecting bodies without a usable `noteId`
    pub fn from_body(body: &str) -> Result<Self> {
        let item: WorkItem = serde_json::from_str(body)?;
        if item.note_id.trim().is_empty() {
            return Err(crate::error::PipelineError::MalformedInput(
                "`noteId` is empty".into(),
            ));
        }
        Ok(item)
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: Uuid,
    /// Handle for acking this particular delivery
    pub receipt: Uuid,
    pub body: String,
    /// How many times this message has been received, including this one
    pub receive_count: u32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Add a message body to the queue
    async fn enqueue(&self, body: String) -> Result<Uuid>;

    /// Wait for at least one visible message and return up to `max` of them
    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>>;

    /// Delete a received message. Unknown or stale receipts are ignored.
    async fn ack(&self, receipt: Uuid) -> Result<()>;

    /// Visible plus in-flight messages
    async fn len(&self) -> Result<usize>;
}
