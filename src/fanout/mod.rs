//! Fanout notifier
//!
//! Observes note creations on its own change-log cursor, independently of
//! enrichment, and publishes a normalized message to the topic.

mod topic;
mod transport;

pub use topic::{
    DeliveryOutcome, PublishHandle, Subscription, Topic, TopicSettings, MAX_DELIVERY_ATTEMPTS,
};
pub use transport::{HttpTransport, Transport, MESSAGE_ID_HEADER};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::with_timeout;
use crate::relay::{redelivery_delay, ConsumerSettings};
use crate::store::{ChangeKind, ChangeLogConsumer, ChangeRecord};

/// Message pushed to topic subscribers.
///
/// Fields missing from the snapshot are left out rather than defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl NormalizedMessage {
    pub fn from_record(record: &ChangeRecord) -> Self {
        let snapshot = record.new_content.as_ref();
        Self {
            id: record.key.clone(),
            title: snapshot.map(|n| n.title.clone()),
            content: snapshot.map(|n| n.content.clone()),
        }
    }
}

/// Outcome of fanning out one batch
#[derive(Debug, Default, Clone, Serialize)]
pub struct FanoutReport {
    pub published: Vec<String>,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
}

impl FanoutReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct FanoutNotifier {
    topic: Arc<Topic>,
    settings: ConsumerSettings,
}

impl FanoutNotifier {
    pub fn new(topic: Arc<Topic>, settings: ConsumerSettings) -> Self {
        Self { topic, settings }
    }

    /// Publish a message for every creation record in `records`.
    ///
    /// Deliveries continue in the background; their handles are dropped.
    pub async fn process_batch(&self, records: &[ChangeRecord]) -> FanoutReport {
        let mut report = FanoutReport::default();

        for record in records {
            if record.event_kind != ChangeKind::Created {
                report.skipped += 1;
                continue;
            }

            let message = NormalizedMessage::from_record(record);
            let res = with_timeout(
                "topic.publish",
                self.settings.call_timeout,
                self.topic.publish(&message),
            )
            .await;
            match res {
                Ok(handle) => {
                    debug!(key = %record.key, fanout = handle.fanout(), "Creation fanned out");
                    report.published.push(record.key.clone());
                }
                Err(e) => {
                    warn!(
                        key = %record.key,
                        sequence = record.sequence,
                        "Failed to publish creation: {}",
                        e
                    );
                    report.failed.push((record.key.clone(), e.to_string()));
                }
            }
        }

        report
    }

    /// Consume the change log until `shutdown` is cancelled
    pub async fn run(self, mut consumer: ChangeLogConsumer, shutdown: CancellationToken) {
        info!(consumer = %consumer.name(), "Fanout notifier started");
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = consumer.next_batch(self.settings.batch_size) => batch,
            };

            let report = self.process_batch(&batch.records).await;
            if report.is_success() {
                consumer.commit(&batch);
            } else if batch.delivery_attempt > self.settings.max_batch_redeliveries {
                error!(
                    failed = report.failed.len(),
                    attempts = batch.delivery_attempt,
                    "Abandoning fanout batch after repeated publish failures"
                );
                consumer.commit(&batch);
            } else {
                tokio::time::sleep(redelivery_delay(batch.delivery_attempt)).await;
            }
        }
        info!("Fanout notifier stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::Note;
    use crate::store::ChangeLog;
    use crate::test_helpers::RecordingTransport;
    use std::time::Duration;

    fn note(id: &str) -> Note {
        Note {
            id: id.into(),
            title: format!("title {}", id),
            content: "body".into(),
            derived_metric: None,
        }
    }

    async fn topic_with_sub() -> (Arc<Topic>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let topic = Arc::new(Topic::new(
            transport.clone(),
            TopicSettings {
                retry_backoff: Duration::from_millis(5),
                ..Default::default()
            },
        ));
        topic.subscribe("https://sub.example/notify").await.unwrap();
        (topic, transport)
    }

    #[test]
    fn test_message_omits_absent_fields() {
        let full = NormalizedMessage::from_record(&ChangeRecord::new(
            "a",
            ChangeKind::Created,
            Some(note("a")),
        ));
        assert_eq!(
            serde_json::to_value(&full).unwrap(),
            serde_json::json!({"id": "a", "title": "title a", "content": "body"})
        );

        let bare = NormalizedMessage::from_record(&ChangeRecord::new("b", ChangeKind::Created, None));
        assert_eq!(serde_json::to_string(&bare).unwrap(), r#"{"id":"b"}"#);
    }

    #[tokio::test]
    async fn test_process_batch_publishes_every_creation() {
        let (topic, transport) = topic_with_sub().await;
        let notifier = FanoutNotifier::new(topic, ConsumerSettings::default());

        let batch = vec![
            ChangeRecord::new("a", ChangeKind::Modified, Some(note("a"))),
            ChangeRecord::new("b", ChangeKind::Created, Some(note("b"))),
            ChangeRecord::new("c", ChangeKind::Removed, None),
            ChangeRecord::new("d", ChangeKind::Created, Some(note("d"))),
        ];
        let report = notifier.process_batch(&batch).await;
        assert_eq!(report.published, vec!["b", "d"]);
        assert_eq!(report.skipped, 2);

        let deliveries = transport.wait_for(2, Duration::from_secs(2)).await;
        let mut ids: Vec<_> = deliveries.iter().map(|d| d.message_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[tokio::test]
    async fn test_run_consumes_change_log() {
        let log = Arc::new(ChangeLog::default());
        let (topic, transport) = topic_with_sub().await;
        let notifier = FanoutNotifier::new(topic, ConsumerSettings::default());
        let consumer = log.consumer("fanout");
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(notifier.run(consumer, shutdown.clone()));

        log.append("x", ChangeKind::Created, Some(note("x"))).await;
        log.append("x", ChangeKind::Modified, Some(note("x"))).await;

        let deliveries = transport.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(deliveries[0].message_id, "x");

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(transport.deliveries().await.len(), 1);
    }
}
