//! Change relay: forwards note creations from the change log to the work queue
//!
//! Every record in a batch is evaluated on its own. A record of another kind,
//! a record without a snapshot, or a failed enqueue never stops the records
//! after it from being processed.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::with_timeout;
use crate::queue::{WorkItem, WorkQueue};
use crate::store::{ChangeKind, ChangeLogConsumer, ChangeRecord};

/// Outcome of relaying one batch
#[derive(Debug, Default, Clone, Serialize)]
pub struct RelayReport {
    /// Note ids enqueued, in batch order
    pub enqueued: Vec<String>,
    /// Records that were not creations or had no snapshot
    pub skipped: usize,
    /// Keys whose enqueue failed, with the error
    pub failed: Vec<(String, String)>,
}

impl RelayReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Settings shared by the change-log consumer loops
#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    pub batch_size: usize,
    pub call_timeout: Duration,
    /// Times a failed batch is redelivered before it is committed anyway
    pub max_batch_redeliveries: u32,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            call_timeout: Duration::from_secs(5),
            max_batch_redeliveries: 2,
        }
    }
}

pub struct ChangeRelay {
    queue: Arc<dyn WorkQueue>,
    settings: ConsumerSettings,
}

impl ChangeRelay {
    pub fn new(queue: Arc<dyn WorkQueue>, settings: ConsumerSettings) -> Self {
        Self { queue, settings }
    }

    /// Enqueue a work item for every creation record in `records`
    pub async fn process_batch(&self, records: &[ChangeRecord]) -> RelayReport {
        let mut report = RelayReport::default();

        for record in records {
            if record.event_kind != ChangeKind::Created || record.new_content.is_none() {
                debug!(
                    key = %record.key,
                    kind = ?record.event_kind,
                    sequence = record.sequence,
                    "Skipping non-creation change record"
                );
                report.skipped += 1;
                continue;
            }

            match self.enqueue(&record.key).await {
                Ok(()) => report.enqueued.push(record.key.clone()),
                Err(e) => {
                    warn!(
                        key = %record.key,
                        sequence = record.sequence,
                        "Failed to enqueue work item: {}",
                        e
                    );
                    report.failed.push((record.key.clone(), e.to_string()));
                }
            }
        }

        report
    }

    async fn enqueue(&self, note_id: &str) -> crate::error::Result<()> {
        let body = WorkItem::new(note_id).to_body()?;
        with_timeout(
            "queue.enqueue",
            self.settings.call_timeout,
            self.queue.enqueue(body),
        )
        .await?;
        Ok(())
    }

    /// Consume the change log until `shutdown` is cancelled
    pub async fn run(self, mut consumer: ChangeLogConsumer, shutdown: CancellationToken) {
        info!(consumer = %consumer.name(), "Change relay started");
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = consumer.next_batch(self.settings.batch_size) => batch,
            };

            let report = self.process_batch(&batch.records).await;
            if report.is_success() {
                consumer.commit(&batch);
                continue;
            }

            if batch.delivery_attempt > self.settings.max_batch_redeliveries {
                error!(
                    failed = report.failed.len(),
                    attempts = batch.delivery_attempt,
                    "Abandoning change batch after repeated enqueue failures"
                );
                consumer.commit(&batch);
            } else {
                // Leave uncommitted so the change log hands the batch out again
                tokio::time::sleep(redelivery_delay(batch.delivery_attempt)).await;
            }
        }
        info!("Change relay stopped");
    }
}

pub(crate) fn redelivery_delay(attempt: u32) -> Duration {
    Duration::from_millis(50 * u64::from(attempt.min(10)))
}
