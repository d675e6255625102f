//! Test doubles for the pipeline's seams
//!
//! Wrappers that inject failures into the queue and store, plus recording
//! implementations of the router and topic sinks.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::fanout::Transport;
use crate::notes::{FieldUpdate, Note, UpdateOutcome};
use crate::queue::{InMemoryWorkQueue, ReceivedMessage, WorkQueue};
use crate::router::{DerivedEvent, EventHandler, EventPublisher, PublishReport};
use crate::store::{ChangeLog, InMemoryNoteStore, NoteStore};

/// Poll `snapshot` until it holds at least `n` items or `timeout` elapses
async fn poll_until<T, F, Fut>(n: usize, timeout: Duration, snapshot: F) -> Vec<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Vec<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let items = snapshot().await;
        if items.len() >= n || tokio::time::Instant::now() >= deadline {
            return items;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Work queue whose first `n` enqueues fail, or whose enqueues are slow
pub struct FailingQueue {
    inner: Arc<InMemoryWorkQueue>,
    fail_first: usize,
    delay: Option<Duration>,
    attempts: AtomicUsize,
}

impl FailingQueue {
    pub fn new(fail_first: usize) -> Self {
        Self {
            inner: Arc::new(InMemoryWorkQueue::default()),
            fail_first,
            delay: None,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(0)
        }
    }

    pub fn inner(&self) -> Arc<InMemoryWorkQueue> {
        self.inner.clone()
    }

    /// Enqueue calls seen so far, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkQueue for FailingQueue {
    async fn enqueue(&self, body: String) -> Result<Uuid> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if n < self.fail_first {
            return Err(PipelineError::TransientIo("queue unavailable".into()));
        }
        self.inner.enqueue(body).await
    }

    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        self.inner.receive(max).await
    }

    async fn ack(&self, receipt: Uuid) -> Result<()> {
        self.inner.ack(receipt).await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }
}

// ============================================================================
// Store
// ============================================================================

/// Note store that fails its first `n` field updates transiently, stalls
/// reads, or deletes a note right after it is read
pub struct FlakyStore {
    inner: Arc<InMemoryNoteStore>,
    fail_updates: usize,
    get_delay: Option<Duration>,
    remove_after_get: bool,
    update_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_updates(inner: Arc<InMemoryNoteStore>, fail_updates: usize) -> Self {
        Self {
            inner,
            fail_updates,
            get_delay: None,
            remove_after_get: false,
            update_calls: AtomicUsize::new(0),
        }
    }

    pub fn slow_gets(inner: Arc<InMemoryNoteStore>, delay: Duration) -> Self {
        Self {
            get_delay: Some(delay),
            ..Self::failing_updates(inner, 0)
        }
    }

    /// Every `get` returns the note and then removes it, as a concurrent
    /// delete landing between read and update would
    pub fn removing_after_get(inner: Arc<InMemoryNoteStore>) -> Self {
        Self {
            remove_after_get: true,
            ..Self::failing_updates(inner, 0)
        }
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NoteStore for FlakyStore {
    async fn get(&self, id: &str) -> Result<Option<Note>> {
        if let Some(delay) = self.get_delay {
            tokio::time::sleep(delay).await;
        }
        let note = self.inner.get(id).await?;
        if self.remove_after_get {
            self.inner.remove(id).await?;
        }
        Ok(note)
    }

    async fn put(&self, note: &Note) -> Result<()> {
        self.inner.put(note).await
    }

    async fn update_field(&self, id: &str, update: FieldUpdate) -> Result<UpdateOutcome> {
        let n = self.update_calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_updates {
            return Err(PipelineError::TransientIo("store throttled".into()));
        }
        self.inner.update_field(id, update).await
    }

    async fn scan_all(&self) -> Result<Vec<Note>> {
        self.inner.scan_all().await
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        self.inner.remove(id).await
    }

    fn change_log(&self) -> Arc<ChangeLog> {
        self.inner.change_log()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Records every event it receives
pub struct RecordingHandler {
    name: String,
    delay: Option<Duration>,
    events: Mutex<Vec<DerivedEvent>>,
}

impl RecordingHandler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: None,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(name: &str, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(name)
        }
    }

    pub async fn events(&self) -> Vec<DerivedEvent> {
        self.events.lock().await.clone()
    }

    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<DerivedEvent> {
        poll_until(n, timeout, || self.events()).await
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DerivedEvent) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Handler that always errors, or panics
pub struct FailingHandler {
    name: String,
    panic: bool,
    calls: AtomicUsize,
}

impl FailingHandler {
    pub fn new(name: &str, panic: bool) -> Self {
        Self {
            name: name.to_string(),
            panic,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _event: &DerivedEvent) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("handler {} blew up", self.name);
        }
        Err(PipelineError::TransientIo("handler backend down".into()))
    }
}

/// Publisher that records events without routing them
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<DerivedEvent>>,
}

impl RecordingPublisher {
    pub async fn events(&self) -> Vec<DerivedEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &DerivedEvent) -> Result<PublishReport> {
        self.events.lock().await.push(event.clone());
        Ok(PublishReport {
            matched: 1,
            dropped: 0,
        })
    }
}

/// Publisher that always fails
pub struct FailingPublisher;

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(&self, _event: &DerivedEvent) -> Result<PublishReport> {
        Err(PipelineError::TransientIo("router unreachable".into()))
    }
}

// ============================================================================
// Fanout
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelivery {
    pub endpoint: String,
    pub body: String,
    pub message_id: String,
}

/// Transport that records successful deliveries, fails chosen endpoints,
/// or takes `delay` before each delivery
#[derive(Default)]
pub struct RecordingTransport {
    failing: HashSet<String>,
    delay: Option<Duration>,
    deliveries: Mutex<Vec<RecordedDelivery>>,
}

impl RecordingTransport {
    pub fn failing_for<'a>(endpoints: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            failing: endpoints.into_iter().map(str::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub async fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries.lock().await.clone()
    }

    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<RecordedDelivery> {
        poll_until(n, timeout, || self.deliveries()).await
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, endpoint: &str, body: &str, message_id: &str) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(endpoint) {
            return Err(PipelineError::TransientIo(format!("{} refused", endpoint)));
        }
        self.deliveries.lock().await.push(RecordedDelivery {
            endpoint: endpoint.to_string(),
            body: body.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }
}
