//! One client's streaming session.
//!
//! A session moves through `Connecting -> Queued -> Generating -> Closing ->
//! Closed`. `Queued` is skipped when the gate admits on arrival. Client
//! disconnection is raced against every suspension point: while queued it
//! stops the wait with no counter touched, while generating it drops the
//! engine stream and the lease.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tiergate_common::{QueueStatus, ServerFrame, StreamRequest};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::admission::{Admission, AdmissionGate, InvalidTierPolicy, QueueObserver, Tier};
use crate::engine::{GenerationEngine, GenerationRequest};
use crate::error::{Error, Result};
use crate::fail_fast::FailFast;
use crate::transcript::{spawn_record, TranscriptRecord, TranscriptStore};

/// Where frames for the client go.
#[async_trait]
pub trait FrameSink: Send {
    /// Deliver one frame. Fails with `Error::ClientDisconnected` once the
    /// client is gone.
    async fn send(&mut self, frame: ServerFrame) -> Result<()>;

    /// Close the channel to the client.
    async fn close(&mut self);
}

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Queued,
    Generating,
    Closing,
    Closed,
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Every fragment was delivered.
    Completed {
        admission: Admission,
        fragments: usize,
    },
    /// The engine raised or produced nothing; the client got an error frame.
    EngineFailed { admission: Admission, message: String },
    /// The request was refused before queuing.
    Rejected(Error),
    /// The client went away.
    Disconnected,
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub gate: AdmissionGate,
    pub engine: Arc<dyn GenerationEngine>,
    pub transcripts: Arc<dyn TranscriptStore>,
    pub fail_fast: Arc<FailFast>,
    pub tier_policy: InvalidTierPolicy,
    pub generation_timeout: Option<Duration>,
}

/// Drives one client from request to close.
pub struct StreamingSession {
    id: Uuid,
    client_addr: String,
    ctx: SessionContext,
    state: SessionState,
}

impl StreamingSession {
    pub fn new(ctx: SessionContext, client_addr: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_addr: client_addr.into(),
            ctx,
            state: SessionState::Connecting,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve `request`, sending frames to `sink` until the session closes.
    ///
    /// `disconnected` must resolve when the client goes away.
    pub async fn run<S, D>(
        mut self,
        request: StreamRequest,
        sink: &mut S,
        disconnected: D,
    ) -> SessionOutcome
    where
        S: FrameSink + ?Sized,
        D: Future<Output = ()> + Send,
    {
        tokio::pin!(disconnected);

        let tiers = self.ctx.gate.registry().tiers();
        let tier = match Tier::new(request.tier, tiers, self.ctx.tier_policy) {
            Ok(tier) => tier,
            Err(e) => {
                tracing::warn!(session = %self.id, client = %self.client_addr, "Rejecting session: {}", e);
                let _ = sink.send(ServerFrame::error(e.to_string())).await;
                let _ = sink.send(ServerFrame::Done).await;
                self.transition(SessionState::Closing);
                sink.close().await;
                self.transition(SessionState::Closed);
                return SessionOutcome::Rejected(e);
            }
        };

        tracing::info!(
            session = %self.id,
            client = %self.client_addr,
            tier = %tier,
            "Session started: {}",
            request.prompt
        );

        let admitted = {
            let mut notices = QueueNotices {
                sink: &mut *sink,
                session: self.id,
                state: &mut self.state,
            };
            tokio::select! {
                result = self.ctx.gate.admit(tier, &mut notices) => result,
                _ = disconnected.as_mut() => Err(Error::ClientDisconnected),
            }
        };

        let (mut lease, admission) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                tracing::info!(session = %self.id, "Client left while queued: {}", e);
                self.transition(SessionState::Closed);
                return SessionOutcome::Disconnected;
            }
        };

        self.transition(SessionState::Generating);
        tracing::debug!(session = %self.id, ?admission, "Session admitted");

        let result = self.forward(&request, sink, disconnected.as_mut()).await;

        let (outcome, response) = match result {
            Ok((response, fragments)) => {
                self.ctx.fail_fast.record_success();
                let _ = sink.send(ServerFrame::Done).await;
                (
                    SessionOutcome::Completed {
                        admission,
                        fragments,
                    },
                    Some(response),
                )
            }
            Err(Error::ClientDisconnected) => {
                tracing::info!(session = %self.id, "Client left while generating");
                (SessionOutcome::Disconnected, None)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(session = %self.id, "Generation failed: {}", message);
                self.ctx.fail_fast.record_failure();
                let _ = sink.send(ServerFrame::error(message.clone())).await;
                let _ = sink.send(ServerFrame::Done).await;
                (
                    SessionOutcome::EngineFailed { admission, message },
                    Some(String::new()),
                )
            }
        };

        // The slot goes back before the connection does.
        self.transition(SessionState::Closing);
        lease.release();
        if let Some(response) = response {
            spawn_record(
                self.ctx.transcripts.clone(),
                TranscriptRecord::new(&self.client_addr, &request.prompt, &response),
            );
        }
        sink.close().await;
        self.transition(SessionState::Closed);

        outcome
    }

    /// Run the engine and forward every fragment as soon as it arrives.
    ///
    /// Returns the full response and the number of fragments sent.
    async fn forward<S, D>(
        &self,
        request: &StreamRequest,
        sink: &mut S,
        mut disconnected: Pin<&mut D>,
    ) -> Result<(String, usize)>
    where
        S: FrameSink + ?Sized,
        D: Future<Output = ()> + Send,
    {
        let deadline = self.ctx.generation_timeout.map(|t| Instant::now() + t);
        let timeout = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout);

        let generation = GenerationRequest::from_stream_request(self.ctx.engine.as_ref(), request);
        let mut stream = tokio::select! {
            stream = self.ctx.engine.generate(generation) => stream?,
            _ = disconnected.as_mut() => return Err(Error::ClientDisconnected),
            _ = timeout.as_mut() => return Err(timed_out()),
        };

        let mut response = String::new();
        let mut fragments = 0;
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = disconnected.as_mut() => return Err(Error::ClientDisconnected),
                _ = timeout.as_mut() => return Err(timed_out()),
            };

            match next {
                Some(Ok(fragment)) if fragment.is_empty() => continue,
                Some(Ok(fragment)) => {
                    response.push_str(&fragment);
                    sink.send(ServerFrame::Fragment { text: fragment }).await?;
                    fragments += 1;
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        if fragments == 0 {
            return Err(Error::EngineFailure(
                "engine finished without producing output".to_string(),
            ));
        }
        Ok((response, fragments))
    }

    fn transition(&mut self, next: SessionState) {
        log_transition(self.id, self.state, next);
        self.state = next;
    }
}

fn log_transition(session: Uuid, from: SessionState, to: SessionState) {
    tracing::debug!(session = %session, ?from, ?to, "Session state change");
}

fn timed_out() -> Error {
    Error::EngineFailure("generation timed out".to_string())
}

/// Forwards gate progress to the client as `Queued` frames.
struct QueueNotices<'a, S: ?Sized> {
    sink: &'a mut S,
    session: Uuid,
    state: &'a mut SessionState,
}

#[async_trait]
impl<'a, S> QueueObserver for QueueNotices<'a, S>
where
    S: FrameSink + ?Sized,
{
    async fn queued(&mut self, status: QueueStatus) -> Result<()> {
        if *self.state != SessionState::Queued {
            log_transition(self.session, *self.state, SessionState::Queued);
            *self.state = SessionState::Queued;
        }
        tracing::debug!(
            session = %self.session,
            occupancy = status.occupancy,
            remaining_secs = status.remaining_secs,
            "Waiting for capacity"
        );
        self.sink.send(ServerFrame::Queued(status)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{CapacityRegistry, SessionLease};
    use crate::test_util::{MemorySink, MemoryTranscripts, ScriptedEngine};

    struct Harness {
        ctx: SessionContext,
        registry: Arc<CapacityRegistry>,
        engine: Arc<ScriptedEngine>,
        transcripts: Arc<MemoryTranscripts>,
    }

    fn harness(engine: ScriptedEngine) -> Harness {
        let registry = Arc::new(CapacityRegistry::new(4));
        let engine = Arc::new(engine);
        let transcripts = Arc::new(MemoryTranscripts::default());
        let ctx = SessionContext {
            gate: AdmissionGate::new(registry.clone(), Duration::from_secs(1)),
            engine: engine.clone(),
            transcripts: transcripts.clone(),
            fail_fast: Arc::new(FailFast::new(Some(2))),
            tier_policy: InvalidTierPolicy::Reject,
            generation_timeout: None,
        };
        Harness {
            ctx,
            registry,
            engine,
            transcripts,
        }
    }

    fn tier(value: i64) -> Tier {
        Tier::new(value, 4, InvalidTierPolicy::Reject).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_forwarded_in_order() {
        let h = harness(ScriptedEngine::new(["Hel", "lo", ", ", "world"]));
        let mut sink = MemorySink::default();

        let session = StreamingSession::new(h.ctx.clone(), "127.0.0.1");
        assert_eq!(session.state(), SessionState::Connecting);
        let outcome = session
            .run(StreamRequest::new("hi").with_tier(0), &mut sink, std::future::pending::<()>())
            .await;

        assert!(matches!(
            outcome,
            SessionOutcome::Completed {
                admission: Admission::Immediate,
                fragments: 4
            }
        ));
        assert_eq!(
            sink.frames,
            vec![
                ServerFrame::fragment("Hel"),
                ServerFrame::fragment("lo"),
                ServerFrame::fragment(", "),
                ServerFrame::fragment("world"),
                ServerFrame::Done,
            ]
        );
        assert!(sink.closed);
        assert_eq!(h.registry.total(), 0);

        let record = h.transcripts.wait_for(1).await.remove(0);
        assert_eq!(record.prompt, "hi");
        assert_eq!(record.response, "Hello, world");
        assert_eq!(record.client_addr, "127.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_released_before_close() {
        let h = harness(ScriptedEngine::new(["a"]));
        let mut sink = MemorySink::default().observing(h.registry.clone());

        StreamingSession::new(h.ctx.clone(), "c")
            .run(StreamRequest::new("p").with_tier(2), &mut sink, std::future::pending::<()>())
            .await;

        // While generating the slot is held; by the time close runs it is gone.
        assert_eq!(sink.totals_at_send, vec![1, 1]);
        assert_eq!(sink.total_at_close, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_generation_surfaces_error() {
        let h = harness(ScriptedEngine::new(Vec::<String>::new()));
        let mut sink = MemorySink::default();

        let outcome = StreamingSession::new(h.ctx.clone(), "c")
            .run(StreamRequest::new("p").with_tier(0), &mut sink, std::future::pending::<()>())
            .await;

        assert!(matches!(outcome, SessionOutcome::EngineFailed { .. }));
        assert_eq!(sink.frames.len(), 2);
        assert!(matches!(&sink.frames[0], ServerFrame::Error { .. }));
        assert_eq!(sink.frames[1], ServerFrame::Done);
        assert!(sink.closed);
        assert_eq!(h.registry.total(), 0);
        assert_eq!(h.ctx.fail_fast.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_error_mid_stream() {
        let h = harness(ScriptedEngine::new(["partial"]).failing_with("device lost"));
        let mut sink = MemorySink::default();

        let outcome = StreamingSession::new(h.ctx.clone(), "c")
            .run(StreamRequest::new("p").with_tier(1), &mut sink, std::future::pending::<()>())
            .await;

        match outcome {
            SessionOutcome::EngineFailed { message, .. } => assert!(message.contains("device lost")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            sink.frames,
            vec![
                ServerFrame::fragment("partial"),
                ServerFrame::error("Engine failure: device lost"),
                ServerFrame::Done,
            ]
        );
        assert_eq!(h.registry.total(), 0);

        // Failed sessions are recorded with an empty answer.
        let record = h.transcripts.wait_for(1).await.remove(0);
        assert_eq!(record.response, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_refusing_to_start() {
        let h = harness(ScriptedEngine::new(["x"]).failing_to_start("not loaded"));
        let mut sink = MemorySink::default();

        let outcome = StreamingSession::new(h.ctx.clone(), "c")
            .run(StreamRequest::new("p").with_tier(0), &mut sink, std::future::pending::<()>())
            .await;

        assert!(matches!(outcome, SessionOutcome::EngineFailed { .. }));
        assert_eq!(sink.frames.last(), Some(&ServerFrame::Done));
        assert_eq!(h.registry.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_tier_rejected_before_queuing() {
        let h = harness(ScriptedEngine::new(["x"]));
        let mut sink = MemorySink::default();

        let outcome = StreamingSession::new(h.ctx.clone(), "c")
            .run(StreamRequest::new("p").with_tier(4), &mut sink, std::future::pending::<()>())
            .await;

        assert!(matches!(
            outcome,
            SessionOutcome::Rejected(Error::InvalidTier { tier: 4, tiers: 4 })
        ));
        assert!(matches!(&sink.frames[0], ServerFrame::Error { .. }));
        assert_eq!(sink.frames[1], ServerFrame::Done);
        assert!(sink.closed);
        assert_eq!(h.engine.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_queued_leaves_counters() {
        let h = harness(ScriptedEngine::new(["x"]));
        let _busy = SessionLease::acquire(h.registry.clone(), tier(0));
        let mut sink = MemorySink::default();

        let outcome = StreamingSession::new(h.ctx.clone(), "c")
            .run(
                StreamRequest::new("p").with_tier(3),
                &mut sink,
                tokio::time::sleep(Duration::from_millis(2500)),
            )
            .await;

        assert!(matches!(outcome, SessionOutcome::Disconnected));
        assert_eq!(h.registry.counts(), vec![1, 0, 0, 0]);
        assert_eq!(sink.frames.len(), 3);
        assert!(sink
            .frames
            .iter()
            .all(|f| matches!(f, ServerFrame::Queued(QueueStatus { occupancy: 1, .. }))));
        assert_eq!(h.engine.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_generating_releases_lease() {
        let h = harness(
            ScriptedEngine::new(["a", "b", "c", "d"]).with_delay(Duration::from_secs(1)),
        );
        let mut sink = MemorySink::default();

        let outcome = StreamingSession::new(h.ctx.clone(), "c")
            .run(
                StreamRequest::new("p").with_tier(0),
                &mut sink,
                tokio::time::sleep(Duration::from_millis(2500)),
            )
            .await;

        assert!(matches!(outcome, SessionOutcome::Disconnected));
        assert_eq!(sink.frames, vec![ServerFrame::fragment("a"), ServerFrame::fragment("b")]);
        assert_eq!(h.registry.total(), 0);
        assert!(h.transcripts.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_session_receives_notices_then_generates() {
        let h = harness(ScriptedEngine::new(["ok"]));
        let busy = SessionLease::acquire(h.registry.clone(), tier(0));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            drop(busy);
        });
        let mut sink = MemorySink::default();

        let outcome = StreamingSession::new(h.ctx.clone(), "c")
            .run(StreamRequest::new("p").with_tier(3), &mut sink, std::future::pending::<()>())
            .await;

        assert!(matches!(
            outcome,
            SessionOutcome::Completed {
                admission: Admission::Freed { waited: 2 },
                fragments: 1
            }
        ));
        assert_eq!(
            sink.frames,
            vec![
                ServerFrame::Queued(QueueStatus {
                    occupancy: 1,
                    remaining_secs: 6
                }),
                ServerFrame::Queued(QueueStatus {
                    occupancy: 1,
                    remaining_secs: 5
                }),
                ServerFrame::fragment("ok"),
                ServerFrame::Done,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_timeout() {
        let mut h = harness(ScriptedEngine::new(["a", "b"]).with_delay(Duration::from_secs(5)));
        h.ctx.generation_timeout = Some(Duration::from_secs(7));
        let mut sink = MemorySink::default();

        let outcome = StreamingSession::new(h.ctx.clone(), "c")
            .run(StreamRequest::new("p").with_tier(0), &mut sink, std::future::pending::<()>())
            .await;

        match outcome {
            SessionOutcome::EngineFailed { message, .. } => assert!(message.contains("timed out")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(sink.frames[0], ServerFrame::fragment("a"));
        assert_eq!(h.registry.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_trip_fail_fast() {
        let h = harness(ScriptedEngine::new(Vec::<String>::new()));

        for _ in 0..2 {
            StreamingSession::new(h.ctx.clone(), "c")
                .run(
                    StreamRequest::new("p").with_tier(0),
                    &mut MemorySink::default(),
                    std::future::pending::<()>(),
                )
                .await;
        }

        assert!(h.ctx.fail_fast.is_tripped());
    }
}
