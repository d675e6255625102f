//! Notes Pipeline
//!
//! A note store with an asynchronous event pipeline:
//! - Change relay forwarding note creations to a work queue
//! - Enrichment worker deriving a word-count metric
//! - Content-based event router with declarative rules
//! - Fanout notifier pushing creations to HTTP subscribers

pub mod api;
pub mod enrichment;
pub mod error;
pub mod fanout;
pub mod notes;
pub mod pipeline;
pub mod queue;
pub mod relay;
pub mod router;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use enrichment::EnrichmentSettings;
use fanout::{TopicSettings, MAX_DELIVERY_ATTEMPTS};
use queue::QueueSettings;
use relay::ConsumerSettings;
use router::{FieldPredicate, Rule};

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: ServerYamlConfig,
    pub pipeline: PipelineYamlConfig,
    pub queue: QueueYamlConfig,
    pub router: RouterYamlConfig,
    pub fanout: FanoutYamlConfig,
}

/// Server configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerYamlConfig {
    pub port: u16,
}

impl Default for ServerYamlConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Consumer loop tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineYamlConfig {
    pub worker_concurrency: usize,
    pub batch_size: usize,
    pub call_timeout_ms: u64,
    /// Local retries of a failed metric update (clamped to 0..=2)
    pub update_retries: u32,
    pub max_batch_redeliveries: u32,
    pub changelog_retention: usize,
}

impl Default for PipelineYamlConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            batch_size: 100,
            call_timeout_ms: 5000,
            update_retries: 1,
            max_batch_redeliveries: 2,
            changelog_retention: store::DEFAULT_RETENTION,
        }
    }
}

/// Work queue section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueYamlConfig {
    pub visibility_timeout_secs: u64,
    pub max_receive_count: u32,
}

impl Default for QueueYamlConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 30,
            max_receive_count: 5,
        }
    }
}

/// Router section: declarative rules bound to targets
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RouterYamlConfig {
    pub rules: Vec<RuleConfig>,
}

/// One routing rule as written in YAML
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(rename = "match", default)]
    pub predicates: Vec<FieldPredicate>,
    #[serde(default)]
    pub target: RuleTarget,
}

impl RuleConfig {
    /// Build the validated rule
    pub fn rule(&self) -> error::Result<Rule> {
        Rule::new(self.name.clone(), self.predicates.clone())
    }
}

/// Where matched events for a rule are delivered
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleTarget {
    #[default]
    Log,
    Webhook {
        url: String,
    },
}

/// Fanout section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutYamlConfig {
    pub subscriptions: Vec<String>,
    pub delivery_attempts: u32,
}

impl Default for FanoutYamlConfig {
    fn default() -> Self {
        Self {
            subscriptions: Vec::new(),
            delivery_attempts: 3,
        }
    }
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub worker_concurrency: usize,
    pub batch_size: usize,
    pub call_timeout: Duration,
    pub update_retries: u32,
    pub max_batch_redeliveries: u32,
    pub changelog_retention: usize,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub rules: Vec<RuleConfig>,
    pub fanout_endpoints: Vec<String>,
    pub delivery_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_yaml(YamlConfig::default())
    }
}

impl Config {
    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. If the file doesn't
    /// exist, falls back to env vars / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_yaml(Self::load_yaml(yaml_path));

        if let Some(port) = env_parse("SERVER_PORT") {
            config.server_port = port;
        }
        if let Some(workers) = env_parse("PIPELINE_WORKERS") {
            config.worker_concurrency = workers;
        }
        if let Some(ms) = env_parse("PIPELINE_CALL_TIMEOUT_MS") {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = env_parse::<u32>("PIPELINE_UPDATE_RETRIES") {
            config.update_retries = retries.min(2);
        }
        if let Some(secs) = env_parse("QUEUE_VISIBILITY_TIMEOUT_SECS") {
            config.visibility_timeout = Duration::from_secs(secs);
        }
        if let Ok(endpoints) = std::env::var("FANOUT_ENDPOINTS") {
            config.fanout_endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Build a runtime config from parsed YAML, without env overrides
    pub fn from_yaml(yaml: YamlConfig) -> Self {
        Self {
            server_port: yaml.server.port,
            worker_concurrency: yaml.pipeline.worker_concurrency,
            batch_size: yaml.pipeline.batch_size,
            call_timeout: Duration::from_millis(yaml.pipeline.call_timeout_ms),
            update_retries: yaml.pipeline.update_retries.min(2),
            max_batch_redeliveries: yaml.pipeline.max_batch_redeliveries,
            changelog_retention: yaml.pipeline.changelog_retention,
            visibility_timeout: Duration::from_secs(yaml.queue.visibility_timeout_secs),
            max_receive_count: yaml.queue.max_receive_count,
            rules: yaml.router.rules,
            fanout_endpoints: yaml.fanout.subscriptions,
            delivery_attempts: yaml.fanout.delivery_attempts,
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_concurrency == 0 {
            bail!("pipeline.worker_concurrency must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("pipeline.batch_size must be at least 1");
        }
        if self.call_timeout.is_zero() {
            bail!("pipeline.call_timeout_ms must be positive");
        }
        if self.changelog_retention == 0 {
            bail!("pipeline.changelog_retention must be at least 1");
        }
        if self.visibility_timeout.is_zero() {
            bail!("queue.visibility_timeout_secs must be positive");
        }
        if self.max_receive_count == 0 {
            bail!("queue.max_receive_count must be at least 1");
        }
        if !(1..=MAX_DELIVERY_ATTEMPTS).contains(&self.delivery_attempts) {
            bail!(
                "fanout.delivery_attempts must be between 1 and {}",
                MAX_DELIVERY_ATTEMPTS
            );
        }
        for rule in &self.rules {
            rule.rule()?;
        }
        Ok(())
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            batch_size: self.batch_size,
            call_timeout: self.call_timeout,
            max_batch_redeliveries: self.max_batch_redeliveries,
        }
    }

    pub fn enrichment_settings(&self) -> EnrichmentSettings {
        EnrichmentSettings {
            call_timeout: self.call_timeout,
            update_retries: self.update_retries,
            ..Default::default()
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            visibility_timeout: self.visibility_timeout,
            max_receive_count: self.max_receive_count,
            ..Default::default()
        }
    }

    pub fn topic_settings(&self) -> TopicSettings {
        TopicSettings {
            delivery_attempts: self.delivery_attempts,
            call_timeout: self.call_timeout,
            ..Default::default()
        }
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn store::NoteStore>,
    pub topic: Arc<fanout::Topic>,
}

/// Build the pipeline, start its loops and serve the HTTP API until a
/// shutdown signal arrives
pub async fn start_server(config: Config) -> Result<()> {
    let port = config.server_port;
    let pipeline = pipeline::Pipeline::new(config).await?;
    let handle = pipeline.start();
    let app = api::create_router(pipeline.app_state());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("Server listening on port {}", port);

    let token = handle.token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = token.cancelled() => {}
            }
        })
        .await?;

    handle.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received terminate signal, shutting down"),
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

// ============================================================================
// Tests
// ============================================================================
