//! Test doubles for the engine, the client transport and the transcript store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tiergate_common::ServerFrame;
use tokio::sync::Notify;

use crate::admission::CapacityRegistry;
use crate::config::Config;
use crate::engine::{FragmentStream, GenerationEngine, GenerationRequest};
use crate::error::{Error, Result};
use crate::session::FrameSink;
use crate::state::AppState;
use crate::transcript::{TranscriptRecord, TranscriptStore};

/// Configuration suitable for tests: default policy, transcripts off.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.logging.level = "debug".to_string();
    config
}

/// State backed by a `ScriptedEngine` yielding `fragments`.
pub fn test_state<I, T>(fragments: I) -> AppState
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    AppState::new(
        test_config(),
        Arc::new(ScriptedEngine::new(fragments)),
        Arc::new(MemoryTranscripts::default()),
    )
}

/// Engine that replays a fixed list of fragments.
#[derive(Default)]
pub struct ScriptedEngine {
    fragments: Vec<String>,
    failure: Option<String>,
    start_failure: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedEngine {
    pub fn new<I, T>(fragments: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// End the stream with an engine error after the fragments.
    pub fn failing_with(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Refuse to start generating at all.
    pub fn failing_to_start(mut self, message: &str) -> Self {
        self.start_failure = Some(message.to_string());
        self
    }

    /// Pause before every item of the stream.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    fn engine_type(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        if let Some(ref message) = self.start_failure {
            return Err(Error::EngineFailure(message.clone()));
        }

        let mut items: Vec<Result<String>> = self.fragments.iter().cloned().map(Ok).collect();
        if let Some(ref message) = self.failure {
            items.push(Err(Error::EngineFailure(message.clone())));
        }

        let delay = self.delay;
        let stream = futures_util::stream::iter(items).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(stream))
    }
}

/// Client transport that keeps every frame in memory.
#[derive(Default)]
pub struct MemorySink {
    pub frames: Vec<ServerFrame>,
    pub closed: bool,
    /// Registry total seen at each send, when observing a registry.
    pub totals_at_send: Vec<usize>,
    /// Registry total seen at close, when observing a registry.
    pub total_at_close: Option<usize>,
    registry: Option<Arc<CapacityRegistry>>,
}

impl MemorySink {
    /// Record the registry's total occupancy at every send and at close.
    pub fn observing(mut self, registry: Arc<CapacityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: ServerFrame) -> Result<()> {
        if self.closed {
            return Err(Error::ClientDisconnected);
        }
        if let Some(ref registry) = self.registry {
            self.totals_at_send.push(registry.total());
        }
        self.frames.push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(ref registry) = self.registry {
            self.total_at_close = Some(registry.total());
        }
        self.closed = true;
    }
}

/// Transcript store that keeps records in memory.
#[derive(Default)]
pub struct MemoryTranscripts {
    records: Mutex<Vec<TranscriptRecord>>,
    recorded: Notify,
}

impl MemoryTranscripts {
    pub fn records(&self) -> Vec<TranscriptRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Wait until at least `count` records have been written.
    pub async fn wait_for(&self, count: usize) -> Vec<TranscriptRecord> {
        loop {
            let recorded = self.recorded.notified();
            let records = self.records();
            if records.len() >= count {
                return records;
            }
            recorded.await;
        }
    }
}

impl TranscriptStore for MemoryTranscripts {
    fn record(&self, record: &TranscriptRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        self.recorded.notify_waiters();
        Ok(())
    }
}
