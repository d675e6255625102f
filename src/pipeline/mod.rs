//! Pipeline runtime
//!
//! Builds the store, queue, router, topic and HTTP client once per process
//! and spawns the consumer loops over them:
//! - change relay on the `relay` cursor
//! - fanout notifier on the `fanout` cursor
//! - `worker_concurrency` enrichment workers on the work queue

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::enrichment::EnrichmentWorker;
use crate::error::with_timeout;
use crate::fanout::{FanoutNotifier, HttpTransport, Topic, Transport};
use crate::queue::{InMemoryWorkQueue, WorkItem, WorkQueue};
use crate::relay::ChangeRelay;
use crate::router::{EventHandler, EventRouter, LogHandler, WebhookHandler};
use crate::store::{ChangeLog, InMemoryNoteStore, NoteStore};
use crate::{AppState, Config, RuleTarget};

pub const RELAY_CURSOR: &str = "relay";
pub const FANOUT_CURSOR: &str = "fanout";

pub struct Pipeline {
    config: Arc<Config>,
    store: Arc<dyn NoteStore>,
    queue: Arc<dyn WorkQueue>,
    router: Arc<EventRouter>,
    topic: Arc<Topic>,
}

impl Pipeline {
    /// Build a pipeline over in-memory backends
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(InMemoryNoteStore::with_change_log(Arc::new(ChangeLog::new(
            config.changelog_retention,
        ))));
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let transport = Arc::new(HttpTransport::new(http.clone()));
        Self::with_parts(config, store, transport, http).await
    }

    /// Build a pipeline over the given store and fanout transport
    pub async fn with_parts(
        config: Config,
        store: Arc<dyn NoteStore>,
        transport: Arc<dyn Transport>,
        http: reqwest::Client,
    ) -> Result<Self> {
        config.validate()?;

        let queue: Arc<dyn WorkQueue> = Arc::new(InMemoryWorkQueue::new(config.queue_settings()));
        let router = Arc::new(EventRouter::default());
        let topic = Arc::new(Topic::new(transport, config.topic_settings()));

        for rule_config in &config.rules {
            let rule = rule_config.rule()?;
            let handler: Arc<dyn EventHandler> = match &rule_config.target {
                RuleTarget::Log => Arc::new(LogHandler::new(rule.name.clone())),
                RuleTarget::Webhook { url } => Arc::new(WebhookHandler::new(
                    rule.name.clone(),
                    http.clone(),
                    url.clone(),
                    config.call_timeout,
                )),
            };
            router
                .subscribe(rule, handler)
                .await
                .with_context(|| format!("Failed to register rule {:?}", rule_config.name))?;
        }

        for endpoint in &config.fanout_endpoints {
            topic
                .subscribe(endpoint)
                .await
                .with_context(|| format!("Invalid fanout endpoint {:?}", endpoint))?;
        }

        info!(
            rules = config.rules.len(),
            subscriptions = config.fanout_endpoints.len(),
            workers = config.worker_concurrency,
            "Pipeline initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            queue,
            router,
            topic,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn NoteStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn WorkQueue> {
        self.queue.clone()
    }

    pub fn router(&self) -> Arc<EventRouter> {
        self.router.clone()
    }

    pub fn topic(&self) -> Arc<Topic> {
        self.topic.clone()
    }

    /// State shared with the HTTP handlers
    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            topic: self.topic.clone(),
        }
    }

    /// Spawn every consumer loop. Call once per pipeline.
    pub fn start(&self) -> PipelineHandle {
        let shutdown = CancellationToken::new();
        let log = self.store.change_log();
        let consumer_settings = self.config.consumer_settings();
        let mut tasks = Vec::new();

        let relay = ChangeRelay::new(self.queue.clone(), consumer_settings);
        tasks.push(tokio::spawn(
            relay.run(log.consumer(RELAY_CURSOR), shutdown.clone()),
        ));

        let notifier = FanoutNotifier::new(self.topic.clone(), consumer_settings);
        tasks.push(tokio::spawn(
            notifier.run(log.consumer(FANOUT_CURSOR), shutdown.clone()),
        ));

        let worker = Arc::new(EnrichmentWorker::new(
            self.store.clone(),
            self.router.clone(),
            self.config.enrichment_settings(),
        ));
        for worker_id in 0..self.config.worker_concurrency {
            tasks.push(tokio::spawn(worker.clone().run(
                worker_id,
                self.queue.clone(),
                shutdown.clone(),
            )));
        }

        info!(tasks = tasks.len(), "Pipeline started");
        PipelineHandle { shutdown, tasks }
    }

    /// Enqueue a work item for every stored note.
    ///
    /// Returns how many items were enqueued.
    pub async fn backfill(&self) -> crate::error::Result<usize> {
        let notes = with_timeout(
            "store.scan_all",
            self.config.call_timeout,
            self.store.scan_all(),
        )
        .await?;

        let mut enqueued = 0;
        for note in &notes {
            let body = WorkItem::new(&note.id).to_body()?;
            let res = with_timeout(
                "queue.enqueue",
                self.config.call_timeout,
                self.queue.enqueue(body),
            )
            .await;
            match res {
                Ok(_) => enqueued += 1,
                Err(e) => warn!(note_id = %note.id, "Backfill enqueue failed: {}", e),
            }
        }

        info!(total = notes.len(), enqueued, "Backfill enqueued");
        Ok(enqueued)
    }

    /// Wait until the work queue is empty, up to `timeout`.
    ///
    /// Returns false if messages were still pending when the timeout hit.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.queue.len().await {
                Ok(0) => return true,
                Ok(pending) => debug!(pending, "Waiting for work queue to drain"),
                Err(e) => warn!("Failed to read queue length: {}", e),
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Running consumer loops of a started pipeline
pub struct PipelineHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Token cancelled on shutdown, for tying other tasks to the pipeline
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every loop and wait for it to stop
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Pipeline task ended abnormally: {}", e);
            }
        }
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::Note;
    use crate::router::{FieldPredicate, Rule};
    use crate::test_helpers::{RecordingHandler, RecordingTransport};
    use crate::YamlConfig;

    async fn pipeline_with(transport: Arc<RecordingTransport>, config: Config) -> Pipeline {
        Pipeline::with_parts(
            config,
            Arc::new(InMemoryNoteStore::new()),
            transport,
            reqwest::Client::new(),
        )
        .await
        .unwrap()
    }

    fn test_config() -> Config {
        Config {
            worker_concurrency: 2,
            call_timeout: Duration::from_millis(500),
            ..Config::default()
        }
    }

    async fn wait_for_metric(store: &Arc<dyn NoteStore>, id: &str) -> Option<i64> {
        for _ in 0..200 {
            if let Some(metric) = store.get(id).await.unwrap().and_then(|n| n.derived_metric) {
                return Some(metric);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_note_is_enriched_routed_and_fanned_out() {
        let transport = Arc::new(RecordingTransport::default());
        let config = Config {
            fanout_endpoints: vec!["https://sub.example/notify".into()],
            ..test_config()
        };
        let pipeline = pipeline_with(transport.clone(), config).await;
        let long_notes = Arc::new(RecordingHandler::new("long"));
        pipeline
            .router()
            .subscribe(
                Rule::new("long", vec![FieldPredicate::gt("derivedMetric", 10)]).unwrap(),
                long_notes.clone(),
            )
            .await
            .unwrap();

        let handle = pipeline.start();
        let store = pipeline.store();
        let short = Note::new("T", "a b c");
        let long = Note::new("L", "one two three four five six seven eight nine ten eleven");
        store.put(&short).await.unwrap();
        store.put(&long).await.unwrap();

        assert_eq!(wait_for_metric(&store, &short.id).await, Some(3));
        assert_eq!(wait_for_metric(&store, &long.id).await, Some(11));

        let routed = long_notes.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].note_id, long.id);

        // Creations only: the metric write-backs are MODIFIED records
        let deliveries = transport.wait_for(2, Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(deliveries.len(), 2);
        assert_eq!(transport.deliveries().await.len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_backfill_recomputes_stale_metrics() {
        let pipeline = pipeline_with(Arc::new(RecordingTransport::default()), test_config()).await;
        let store = pipeline.store();

        // Written before the pipeline starts, with a stale metric
        let mut note = Note::new("T", "a b");
        note.derived_metric = Some(99);
        store.put(&note).await.unwrap();

        assert_eq!(pipeline.backfill().await.unwrap(), 1);
        let handle = pipeline.start();
        assert!(pipeline.drain(Duration::from_secs(2)).await);

        // Relay redelivers the CREATED record too; either way the value converges
        let mut metric = None;
        for _ in 0..100 {
            metric = store.get(&note.id).await.unwrap().and_then(|n| n.derived_metric);
            if metric == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metric, Some(2));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_startup() {
        let yaml = r#"
fanout:
  subscriptions: ["not-a-url"]
"#;
        let config = Config::from_yaml(serde_yaml::from_str::<YamlConfig>(yaml).unwrap());
        let res = Pipeline::with_parts(
            config,
            Arc::new(InMemoryNoteStore::new()),
            Arc::new(RecordingTransport::default()),
            reqwest::Client::new(),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_rules_from_config_are_registered() {
        let yaml = r#"
router:
  rules:
    - name: long-notes
      match:
        - { field: derivedMetric, op: gt, value: 10 }
    - name: hook
      target: { type: webhook, url: "https://example.com/hook" }
"#;
        let config = Config::from_yaml(serde_yaml::from_str::<YamlConfig>(yaml).unwrap());
        let pipeline = pipeline_with(Arc::new(RecordingTransport::default()), config).await;
        assert_eq!(
            pipeline.router().rule_names().await,
            vec!["long-notes", "hook"]
        );
    }
}
