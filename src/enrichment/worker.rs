//! Enrichment worker
//!
//! Receives work items from the queue, recomputes the note's metric from its
//! current content and writes it back with a single-field update. After a
//! successful write a `DerivedEvent` is published; publish is best-effort and
//! never rolls the write back.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::word_count;
use crate::error::{with_timeout, PipelineError, Result};
use crate::notes::{FieldUpdate, UpdateOutcome};
use crate::queue::{ReceivedMessage, WorkItem, WorkQueue};
use crate::router::{DerivedEvent, EventPublisher};
use crate::store::NoteStore;

/// Upper bound for local update retries
const MAX_UPDATE_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy)]
pub struct EnrichmentSettings {
    pub call_timeout: Duration,
    /// Local retries of a transiently failed update, clamped to 0..=2
    pub update_retries: u32,
    /// Base delay between update retries, multiplied by the attempt number
    pub retry_backoff: Duration,
    /// Messages taken per queue receive
    pub receive_batch: usize,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            update_retries: 1,
            retry_backoff: Duration::from_millis(100),
            receive_batch: 10,
        }
    }
}

/// Result of enriching one work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// Metric written; `published` is false when the publish failed
    Enriched { metric: i64, published: bool },
    /// The note no longer exists, nothing was written
    NoteMissing,
}

/// What happened to a received queue message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Acked,
    /// Left unacked so the queue hands it out again after the visibility timeout
    Redeliver,
}

pub struct EnrichmentWorker {
    store: Arc<dyn NoteStore>,
    publisher: Arc<dyn EventPublisher>,
    settings: EnrichmentSettings,
}

impl EnrichmentWorker {
    pub fn new(
        store: Arc<dyn NoteStore>,
        publisher: Arc<dyn EventPublisher>,
        mut settings: EnrichmentSettings,
    ) -> Self {
        settings.update_retries = settings.update_retries.min(MAX_UPDATE_RETRIES);
        Self {
            store,
            publisher,
            settings,
        }
    }

    pub fn settings(&self) -> &EnrichmentSettings {
        &self.settings
    }

    /// Enrich the note referenced by `item`
    pub async fn process(&self, item: &WorkItem) -> Result<EnrichOutcome> {
        let note_id = item.note_id.as_str();
        let note = with_timeout(
            "store.get",
            self.settings.call_timeout,
            self.store.get(note_id),
        )
        .await?;
        let Some(note) = note else {
            debug!(note_id = %note_id, "Note gone before enrichment, skipping");
            return Ok(EnrichOutcome::NoteMissing);
        };

        let metric = word_count(&note.content);
        if self.update_metric(note_id, metric).await? == UpdateOutcome::ConditionFailed {
            debug!(note_id = %note_id, "Note removed during enrichment, skipping");
            return Ok(EnrichOutcome::NoteMissing);
        }

        let published = self
            .publish(DerivedEvent::metric_computed(note_id, metric))
            .await;
        debug!(note_id = %note_id, derived_metric = metric, published, "Note enriched");
        Ok(EnrichOutcome::Enriched { metric, published })
    }

    async fn update_metric(&self, note_id: &str, metric: i64) -> Result<UpdateOutcome> {
        let mut attempt = 0;
        loop {
            let res = with_timeout(
                "store.update_field",
                self.settings.call_timeout,
                self.store
                    .update_field(note_id, FieldUpdate::DerivedMetric(metric)),
            )
            .await;
            match res {
                Err(e) if e.is_transient() && attempt < self.settings.update_retries => {
                    attempt += 1;
                    warn!(note_id = %note_id, attempt, "Metric update failed, retrying: {}", e);
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn publish(&self, event: DerivedEvent) -> bool {
        let res = with_timeout(
            "router.publish",
            self.settings.call_timeout,
            self.publisher.publish(&event),
        )
        .await;
        match res {
            Ok(report) => {
                debug!(
                    note_id = %event.note_id,
                    matched = report.matched,
                    dropped = report.dropped,
                    "Derived event published"
                );
                true
            }
            Err(e) => {
                warn!(note_id = %event.note_id, "Failed to publish derived event: {}", e);
                false
            }
        }
    }

    /// Process one queue message and ack it unless the failure is transient
    pub async fn handle_message(
        &self,
        queue: &dyn WorkQueue,
        msg: ReceivedMessage,
    ) -> MessageDisposition {
        let result = match WorkItem::from_body(&msg.body) {
            Ok(item) => self.process(&item).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(_) | Err(PipelineError::NotFound(_)) => {}
            Err(e) if e.is_transient() => {
                warn!(
                    message_id = %msg.message_id,
                    receive_count = msg.receive_count,
                    "Enrichment failed, leaving message for redelivery: {}",
                    e
                );
                return MessageDisposition::Redeliver;
            }
            Err(PipelineError::MalformedInput(reason)) => {
                warn!(message_id = %msg.message_id, "Dropping malformed work item: {}", reason);
            }
            Err(e) => {
                error!(message_id = %msg.message_id, "Dropping work item: {}", e);
            }
        }

        let acked = with_timeout(
            "queue.ack",
            self.settings.call_timeout,
            queue.ack(msg.receipt),
        )
        .await;
        if let Err(e) = acked {
            warn!(message_id = %msg.message_id, "Failed to ack message: {}", e);
        }
        MessageDisposition::Acked
    }

    /// Receive and handle messages until `shutdown` is cancelled
    pub async fn run(
        self: Arc<Self>,
        worker_id: usize,
        queue: Arc<dyn WorkQueue>,
        shutdown: CancellationToken,
    ) {
        info!(worker_id, "Enrichment worker started");
        loop {
            let messages = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = queue.receive(self.settings.receive_batch) => res,
            };
            match messages {
                Ok(messages) => {
                    for msg in messages {
                        self.handle_message(queue.as_ref(), msg).await;
                    }
                }
                Err(e) => {
                    warn!(worker_id, "Queue receive failed: {}", e);
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
            }
        }
        info!(worker_id, "Enrichment worker stopped");
    }
}
