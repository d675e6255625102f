//! Content-based event router
//!
//! Each registration owns a bounded mpsc channel drained by its own delivery
//! task, so:
//! - `publish` never waits on a handler;
//! - a failing or panicking handler only affects its own registration;
//! - events from one sequential publisher reach each handler in publish order.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::handlers::EventHandler;
use super::predicate::Rule;
use super::DerivedEvent;
use crate::error::Result;

/// Default per-registration channel capacity
const DEFAULT_CAPACITY: usize = 1024;

pub type SubscriptionId = Uuid;

/// What happened to one published event
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Registrations whose rule matched and that accepted the event
    pub matched: usize,
    /// Registrations whose rule matched but whose channel was full or closed
    pub dropped: usize,
}

/// Publishing seam used by the enrichment worker
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DerivedEvent) -> Result<PublishReport>;
}

struct Registration {
    id: SubscriptionId,
    rule: Rule,
    tx: mpsc::Sender<DerivedEvent>,
}

pub struct EventRouter {
    registrations: RwLock<Vec<Registration>>,
    capacity: usize,
}

impl EventRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register `handler` for events matching `rule`.
    ///
    /// Spawns the registration's delivery task; must be called inside a Tokio runtime.
    pub async fn subscribe(
        &self,
        rule: Rule,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        rule.validate()?;
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.capacity);
        tokio::spawn(deliver_loop(rule.name.clone(), handler, rx));

        debug!(rule = %rule.name, subscription = %id, "Rule registered");
        self.registrations
            .write()
            .await
            .push(Registration { id, rule, tx });
        Ok(id)
    }

    /// Remove a registration. Events already queued for it are still delivered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registrations = self.registrations.write().await;
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Number of active registrations
    pub async fn rule_count(&self) -> usize {
        self.registrations.read().await.len()
    }

    /// Names of the registered rules, in registration order
    pub async fn rule_names(&self) -> Vec<String> {
        self.registrations
            .read()
            .await
            .iter()
            .map(|r| r.rule.name.clone())
            .collect()
    }

    /// Hand `event` to every registration whose rule matches.
    ///
    /// Unmatched events are dropped silently.
    pub async fn route(&self, event: &DerivedEvent) -> PublishReport {
        let fields = event.fields();
        let mut report = PublishReport::default();

        let registrations = self.registrations.read().await;
        for registration in registrations.iter() {
            if !registration.rule.matches(&fields) {
                continue;
            }
            match registration.tx.try_send(event.clone()) {
                Ok(()) => report.matched += 1,
                Err(e) => {
                    warn!(
                        rule = %registration.rule.name,
                        note_id = %event.note_id,
                        "Dropping routed event: {}",
                        e
                    );
                    report.dropped += 1;
                }
            }
        }

        debug!(
            note_id = %event.note_id,
            matched = report.matched,
            dropped = report.dropped,
            "Event routed"
        );
        report
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EventPublisher for EventRouter {
    async fn publish(&self, event: &DerivedEvent) -> Result<PublishReport> {
        Ok(self.route(event).await)
    }
}

/// Deliver events to one handler in order, isolating failures and panics
async fn deliver_loop(
    rule: String,
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::Receiver<DerivedEvent>,
) {
    while let Some(event) = rx.recv().await {
        let h = handler.clone();
        let note_id = event.note_id.clone();
        let result = tokio::spawn(async move { h.handle(&event).await }).await;
        match result {
            Ok(Ok(())) => {
                debug!(rule = %rule, handler = %handler.name(), note_id = %note_id, "Event delivered");
            }
            Ok(Err(e)) => {
                warn!(
                    rule = %rule,
                    handler = %handler.name(),
                    note_id = %note_id,
                    "Handler failed: {}",
                    e
                );
            }
            Err(e) => {
                warn!(
                    rule = %rule,
                    handler = %handler.name(),
                    note_id = %note_id,
                    "Handler panicked: {}",
                    e
                );
            }
        }
    }
    debug!(rule = %rule, "Registration closed");
}
