//! Handlers bound to routing rules

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use super::DerivedEvent;
use crate::error::{PipelineError, Result};

/// Receives events whose rule matched
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn handle(&self, event: &DerivedEvent) -> Result<()>;
}

/// Logs every matched event
pub struct LogHandler {
    name: String,
}

impl LogHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl EventHandler for LogHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DerivedEvent) -> Result<()> {
        info!(
            rule = %self.name,
            note_id = %event.note_id,
            derived_metric = event.derived_metric,
            kind = ?event.kind,
            "Routed event received"
        );
        Ok(())
    }
}

/// POSTs matched events as JSON to a fixed URL
pub struct WebhookHandler {
    name: String,
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookHandler {
    /// `client` is the process-wide HTTP client
    pub fn new(
        name: impl Into<String>,
        client: reqwest::Client,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl EventHandler for WebhookHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DerivedEvent) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(event)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(PipelineError::TransientIo(format!(
                "webhook {} returned {}",
                self.url,
                resp.status()
            )));
        }
        Ok(())
    }
}
