//! In-memory work queue with visibility timeouts and a dead-letter list

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{ReceivedMessage, WorkQueue};
use crate::error::Result;

/// Queue tuning knobs
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    /// A message received more often than this is moved to the dead-letter list
    pub max_receive_count: u32,
    /// Dead letters kept before the oldest are discarded
    pub dead_letter_capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 5,
            dead_letter_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: Uuid,
    body: String,
    receive_count: u32,
}

#[derive(Default)]
struct QueueInner {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<Uuid, (Instant, StoredMessage)>,
    dead_letters: VecDeque<StoredMessage>,
}

impl QueueInner {
    /// Move expired in-flight messages back to the visible set
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some((_, msg)) = self.in_flight.remove(&receipt) {
                debug!(message_id = %msg.id, "Visibility timeout expired, message visible again");
                self.visible.push_back(msg);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|(deadline, _)| *deadline).min()
    }
}

pub struct InMemoryWorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    settings: QueueSettings,
}

impl InMemoryWorkQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            settings,
        }
    }

    /// Bodies of messages that exceeded `max_receive_count`
    pub async fn dead_letters(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .dead_letters
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }

    /// Remove and return every dead-lettered body, oldest first
    pub async fn drain_dead_letters(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .dead_letters
            .drain(..)
            .map(|m| m.body)
            .collect()
    }

    /// Bodies of all messages not yet acked, visible or in flight
    pub async fn pending_bodies(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .visible
            .iter()
            .chain(inner.in_flight.values().map(|(_, m)| m))
            .map(|m| m.body.clone())
            .collect()
    }

    /// Try to take up to `max` visible messages without waiting
    async fn take_visible(&self, max: usize) -> (Vec<ReceivedMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.requeue_expired(now);

        let mut out = Vec::new();
        while out.len() < max {
            let Some(mut msg) = inner.visible.pop_front() else {
                break;
            };
            msg.receive_count += 1;
            if msg.receive_count > self.settings.max_receive_count {
                error!(
                    message_id = %msg.id,
                    receive_count = msg.receive_count - 1,
                    "Message exceeded max receive count, moved to dead letters"
                );
                if inner.dead_letters.len() >= self.settings.dead_letter_capacity {
                    if let Some(evicted) = inner.dead_letters.pop_front() {
                        warn!(message_id = %evicted.id, "Dead-letter list full, discarding oldest");
                    }
                }
                if self.settings.dead_letter_capacity > 0 {
                    inner.dead_letters.push_back(msg);
                }
                continue;
            }
            let receipt = Uuid::new_v4();
            out.push(ReceivedMessage {
                message_id: msg.id,
                receipt,
                body: msg.body.clone(),
                receive_count: msg.receive_count,
            });
            inner
                .in_flight
                .insert(receipt, (now + self.settings.visibility_timeout, msg));
        }
        (out, inner.next_deadline())
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, body: String) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.inner.lock().await.visible.push_back(StoredMessage {
            id,
            body,
            receive_count: 0,
        });
        self.notify.notify_one();
        Ok(id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        let max = max.max(1);
        loop {
            let notified = self.notify.notified();
            let (messages, next_deadline) = self.take_visible(max).await;
            if !messages.is_empty() {
                return Ok(messages);
            }

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, receipt: Uuid) -> Result<()> {
        if let Some((_, msg)) = self.inner.lock().await.in_flight.remove(&receipt) {
            debug!(message_id = %msg.id, "Message acked");
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.visible.len() + inner.in_flight.len())
    }
}
