//! Fanout topic with external-endpoint subscriptions
//!
//! `publish` serializes the message once and spawns one delivery task per
//! subscription registered at that moment. Deliveries retry on their own with
//! exponential backoff; one endpoint failing never affects another.

use futures::future::join_all;
use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::Transport;
use super::NormalizedMessage;
use crate::error::{with_timeout, PipelineError, Result};

/// Upper bound on `delivery_attempts` accepted from config
pub const MAX_DELIVERY_ATTEMPTS: u32 = 10;

/// A registered external endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy)]
pub struct TopicSettings {
    /// Attempts per delivery, at least one
    pub delivery_attempts: u32,
    pub call_timeout: Duration,
    /// Delay before the first retry, doubled for each later one
    pub retry_backoff: Duration,
    /// Ceiling for any single retry delay
    pub max_backoff: Duration,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            delivery_attempts: 3,
            call_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Result of delivering one message to one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub subscription_id: Uuid,
    pub endpoint: String,
    pub attempts: u32,
    pub delivered: bool,
    pub last_error: Option<String>,
}

/// In-flight deliveries of one published message
pub struct PublishHandle {
    deliveries: Vec<(Subscription, JoinHandle<DeliveryOutcome>)>,
}

impl PublishHandle {
    /// Number of subscriptions the message was sent to
    pub fn fanout(&self) -> usize {
        self.deliveries.len()
    }

    /// Wait for every delivery task to finish
    pub async fn wait(self) -> Vec<DeliveryOutcome> {
        let (subs, handles): (Vec<_>, Vec<_>) = self.deliveries.into_iter().unzip();
        join_all(handles)
            .await
            .into_iter()
            .zip(subs)
            .map(|(res, sub)| match res {
                Ok(outcome) => outcome,
                Err(e) => DeliveryOutcome {
                    subscription_id: sub.id,
                    endpoint: sub.endpoint,
                    attempts: 0,
                    delivered: false,
                    last_error: Some(e.to_string()),
                },
            })
            .collect()
    }
}

pub struct Topic {
    subscriptions: RwLock<Vec<Subscription>>,
    transport: Arc<dyn Transport>,
    settings: TopicSettings,
}

impl Topic {
    pub fn new(transport: Arc<dyn Transport>, mut settings: TopicSettings) -> Self {
        settings.delivery_attempts = settings.delivery_attempts.max(1);
        Self {
            subscriptions: RwLock::new(Vec::new()),
            transport,
            settings,
        }
    }

    /// Register an absolute http(s) endpoint.
    ///
    /// Subscribing an endpoint twice returns the existing id.
    pub async fn subscribe(&self, endpoint: &str) -> Result<Uuid> {
        let endpoint = validate_endpoint(endpoint)?;
        let mut subs = self.subscriptions.write().await;
        if let Some(existing) = subs.iter().find(|s| s.endpoint == endpoint) {
            return Ok(existing.id);
        }
        let id = Uuid::new_v4();
        info!(endpoint = %endpoint, subscription = %id, "Subscription added");
        subs.push(Subscription { id, endpoint });
        Ok(id)
    }

    pub async fn unsubscribe(&self, id: Uuid) -> bool {
        let mut subs = self.subscriptions.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().await.clone()
    }

    /// Start delivering `message` to every current subscription
    pub async fn publish(&self, message: &NormalizedMessage) -> Result<PublishHandle> {
        let body: Arc<str> = serde_json::to_string(message)?.into();
        let message_id: Arc<str> = message.id.as_str().into();
        let subs = self.subscriptions.read().await.clone();

        let deliveries = subs
            .into_iter()
            .map(|sub| {
                let task = tokio::spawn(deliver(
                    self.transport.clone(),
                    sub.clone(),
                    body.clone(),
                    message_id.clone(),
                    self.settings,
                ));
                (sub, task)
            })
            .collect::<Vec<_>>();

        debug!(message_id = %message.id, fanout = deliveries.len(), "Message published");
        Ok(PublishHandle { deliveries })
    }
}

fn validate_endpoint(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint.trim())
        .map_err(|e| PipelineError::Config(format!("invalid endpoint {:?}: {}", endpoint, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(PipelineError::Config(format!(
            "endpoint must be an absolute http(s) URI: {:?}",
            endpoint
        )));
    }
    Ok(url.to_string())
}

async fn deliver(
    transport: Arc<dyn Transport>,
    sub: Subscription,
    body: Arc<str>,
    message_id: Arc<str>,
    settings: TopicSettings,
) -> DeliveryOutcome {
    let mut last_error = None;
    let mut attempts = 0;
    while attempts < settings.delivery_attempts {
        if attempts > 0 {
            tokio::time::sleep(retry_delay(&settings, attempts)).await;
        }
        attempts += 1;

        let res = with_timeout(
            "topic.deliver",
            settings.call_timeout,
            transport.deliver(&sub.endpoint, &body, &message_id),
        )
        .await;
        match res {
            Ok(()) => {
                return DeliveryOutcome {
                    subscription_id: sub.id,
                    endpoint: sub.endpoint,
                    attempts,
                    delivered: true,
                    last_error: None,
                }
            }
            Err(e) => {
                warn!(
                    endpoint = %sub.endpoint,
                    message_id = %message_id,
                    attempt = attempts,
                    "Delivery attempt failed: {}",
                    e
                );
                last_error = Some(e.to_string());
            }
        }
    }

    warn!(
        endpoint = %sub.endpoint,
        message_id = %message_id,
        attempts,
        "Giving up on delivery"
    );
    DeliveryOutcome {
        subscription_id: sub.id,
        endpoint: sub.endpoint,
        attempts,
        delivered: false,
        last_error,
    }
}

/// Delay before retry number `retry` (1-based), doubling up to `max_backoff`
fn retry_delay(settings: &TopicSettings, retry: u32) -> Duration {
    2u32.checked_pow(retry.saturating_sub(1))
        .and_then(|factor| settings.retry_backoff.checked_mul(factor))
        .map_or(settings.max_backoff, |delay| delay.min(settings.max_backoff))
}
