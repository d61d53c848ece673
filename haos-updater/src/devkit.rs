/*!
In-process doubles for the bus, the install backend and the install handler

Lets the channel and the executor run in tests without a broker or RAUC.
Every double is `Clone` and shares its recording state between clones.
*/

use crate::channel::{BusClient, InstallHandler};
use crate::error::PipelineError;
use crate::install::{InstallStrategy, StatusProbe};
use crate::version::Version;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Records publishes and subscriptions instead of talking to a broker
#[derive(Clone, Default)]
pub struct MockBusClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl MockBusClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following publish fail until switched back
    pub fn fail_publishes(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Number of publish calls, failed ones included
    pub fn publish_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Forget recorded messages; subscriptions and counters stay
    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

#[async_trait]
impl BusClient for MockBusClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err("mock broker unavailable".to_string());
        }
        debug!("[MOCK] Published to {}: {} bytes", topic, payload.len());
        self.published_messages.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), String> {
        debug!("[MOCK] Subscribed to {}", topic);
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }
}

/// Scripted install strategy; tracks calls and peak concurrency
#[derive(Clone)]
pub struct MockStrategy {
    name: String,
    succeed: bool,
    delay: Duration,
    calls: Arc<Mutex<Vec<PathBuf>>>,
    in_flight: Arc<AtomicUsize>,
    pub max_concurrency: Arc<AtomicUsize>,
}

impl MockStrategy {
    fn scripted(name: &str, succeed: bool) -> Self {
        Self {
            name: name.to_string(),
            succeed,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_concurrency: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn succeeding(name: &str) -> Self {
        Self::scripted(name, true)
    }

    pub fn failing(name: &str) -> Self {
        Self::scripted(name, false)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Bundle paths handed to this strategy, in call order
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl InstallStrategy for MockStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, bundle: &Path) -> Result<(), String> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrency.fetch_max(running, Ordering::SeqCst);
        self.calls.lock().push(bundle.to_path_buf());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.succeed {
            Ok(())
        } else {
            Err(format!("{} refused the bundle", self.name))
        }
    }
}

/// Status probe returning a fixed answer
#[derive(Clone)]
pub struct StaticProbe {
    answer: Result<String, String>,
    queries: Arc<AtomicUsize>,
}

impl StaticProbe {
    pub fn new(answer: Result<String, String>) -> Self {
        Self {
            answer,
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusProbe for StaticProbe {
    async fn status(&self) -> Result<String, String> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

/// Install handler that only remembers what it was asked to install
#[derive(Clone, Default)]
pub struct RecordingInstaller {
    versions: Arc<Mutex<Vec<String>>>,
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn versions(&self) -> Vec<String> {
        self.versions.lock().clone()
    }
}

#[async_trait]
impl InstallHandler for RecordingInstaller {
    async fn install_version(&self, version: Version) -> Result<(), PipelineError> {
        self.versions.lock().push(version.to_string());
        Ok(())
    }
}
