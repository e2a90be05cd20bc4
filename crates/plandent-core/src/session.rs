//! One streaming extraction, from first chunk to a terminal event
//!
//! A session drives `ModelGateway::generate_stream`, accumulates the text,
//! relays partial snapshots as they resolve and finishes with exactly one
//! `complete` or `error` event, unless it is cancelled first. After
//! [`SessionHandle::cancel`] returns, the observer is never called again.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionOptions;
use crate::error::{ErrorReport, ExtractionError, SessionError, StreamError};
use crate::extract::PartialJsonExtractor;
use crate::gateway::{ExtractionRequest, FinishReason, ModelGateway, StreamChunk, StreamSummary};
use crate::plan::{PartialPlanSnapshot, Phase, Task};
use crate::prompts::PromptVariant;
use crate::reconcile::snapshot_from_value;
use crate::repair;

/// Chunks buffered between the gateway and the session loop
const CHUNK_BUFFER: usize = 32;

const PLACEHOLDER_NAME: &str = "Plan à compléter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Events emitted to the session observer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ExtractionEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        /// Best-effort estimate, never decreasing, below 100 until completion
        percent_complete: u8,
        bytes_processed: usize,
    },
    /// New partial knowledge
    Data { snapshot: PartialPlanSnapshot },
    Complete(ExtractionOutput),
    Error { cause: ErrorReport },
}

impl ExtractionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Data { .. } => "data",
            Self::Complete(_) => "complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error { .. })
    }
}

/// Payload of a `complete` event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOutput {
    /// Object to hand to the reconciler
    pub plan: Value,
    /// Typed view of `plan`, merged with everything streamed before
    pub snapshot: PartialPlanSnapshot,
    pub quality: OutputQuality,
    pub finish_reason: FinishReason,
    /// The response text exactly as received
    #[serde(skip)]
    pub raw_text: String,
}

/// Distinguishes a full success from a degraded one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutputQuality {
    /// The response parsed as-is
    Full,
    /// The response parsed after closing unterminated structures
    Repaired,
    /// Built from partial knowledge or a placeholder
    Degraded { reason: DegradedReason },
}

impl OutputQuality {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    /// The model hit its output limit
    Truncated,
    /// Neither strict parse nor repair succeeded
    UnrepairableOutput,
}

/// Receives session events.
///
/// `notify` runs on the session's task, between chunks; keep it short.
pub trait ExtractionObserver: Send + Sync {
    fn notify(&self, event: ExtractionEvent);
}

/// No-op implementation for testing
pub struct NoOpObserver;

impl ExtractionObserver for NoOpObserver {
    fn notify(&self, _event: ExtractionEvent) {}
}

/// Forwards events to an unbounded channel
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ExtractionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExtractionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ExtractionObserver for ChannelObserver {
    fn notify(&self, event: ExtractionEvent) {
        let _ = self.tx.send(event);
    }
}

/// State shared between a session and its handles
struct Shared {
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    /// Held for the duration of every observer call
    emit_gate: Mutex<()>,
    /// Thread currently inside `notify`, so a cancel from the observer itself does not wait on the gate
    notifying: Mutex<Option<ThreadId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move from `from` to `to`; false if the session was elsewhere.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = lock(&self.state);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }
}

/// Cloneable control handle for a running session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Stop the session. Once this returns, no further event is delivered.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();

        let from_observer = *lock(&self.shared.notifying) == Some(thread::current().id());
        if !from_observer {
            // Wait out an observer call that started before the token was set
            drop(lock(&self.shared.emit_gate));
        }

        if self.shared.transition(SessionState::Streaming, SessionState::Cancelled)
            || self.shared.transition(SessionState::Idle, SessionState::Cancelled)
        {
            info!("Extraction session cancelled");
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// How the chunk loop ended
enum StreamOutcome {
    Finished(StreamSummary),
    Failed(StreamError),
    TimedOut,
    Cancelled,
}

/// A single-use streaming extraction
pub struct ExtractionSession {
    gateway: Arc<dyn ModelGateway>,
    observer: Arc<dyn ExtractionObserver>,
    options: SessionOptions,
    shared: Arc<Shared>,
}

impl ExtractionSession {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        observer: Arc<dyn ExtractionObserver>,
        options: SessionOptions,
    ) -> Self {
        Self {
            gateway,
            observer,
            options,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Idle),
                cancel: CancellationToken::new(),
                emit_gate: Mutex::new(()),
                notifying: Mutex::new(None),
            }),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Run the extraction to its end. Events go to the observer.
    ///
    /// Returns once the session reached a terminal state.
    pub async fn start(&self, request: ExtractionRequest) -> Result<SessionState, SessionError> {
        if !self.shared.transition(SessionState::Idle, SessionState::Streaming) {
            return Err(SessionError::NotIdle {
                state: self.shared.state(),
            });
        }
        info!(
            provider = self.gateway.provider_name(),
            model = self.gateway.model_id(),
            variant = %request.variant,
            document_bytes = request.document.len(),
            "Starting extraction session"
        );

        let mut buffer = String::new();
        let mut extractor = PartialJsonExtractor::new();
        let outcome = self.stream(&request, &mut buffer, &mut extractor).await;
        let last = extractor.into_latest();

        let terminal = match outcome {
            StreamOutcome::Cancelled => SessionState::Cancelled,
            StreamOutcome::Finished(summary) => {
                match finalize(&buffer, &summary.finish_reason, last, request.variant) {
                    Ok(output) => {
                        info!(
                            quality = ?output.quality,
                            bytes = buffer.len(),
                            chunks = summary.chunks,
                            "Extraction complete"
                        );
                        self.emit(ExtractionEvent::Progress {
                            percent_complete: 100,
                            bytes_processed: buffer.len(),
                        });
                        self.emit(ExtractionEvent::Complete(output));
                        SessionState::Completed
                    }
                    Err((cause, partial)) => self.fail(cause, partial),
                }
            }
            StreamOutcome::Failed(err) => {
                warn!(error = %err, point = ?err.point, "Model stream failed");
                self.fail(err.into(), last)
            }
            StreamOutcome::TimedOut => {
                let timeout = self.options.timeout.unwrap_or_default();
                self.fail(ExtractionError::Timeout(timeout), last)
            }
        };

        self.shared.transition(SessionState::Streaming, terminal);
        Ok(self.shared.state())
    }

    fn fail(&self, cause: ExtractionError, partial: Option<PartialPlanSnapshot>) -> SessionState {
        warn!(kind = cause.kind(), error = %cause, "Extraction failed");
        self.emit(ExtractionEvent::Error {
            cause: ErrorReport::new(cause, partial),
        });
        SessionState::Failed
    }

    /// Consume the gateway stream until it ends, fails, times out or is cancelled.
    async fn stream(
        &self,
        request: &ExtractionRequest,
        buffer: &mut String,
        extractor: &mut PartialJsonExtractor,
    ) -> StreamOutcome {
        let cancel = self.shared.cancel.clone();
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(CHUNK_BUFFER);

        let producer = self
            .gateway
            .generate_stream(request, chunk_tx, cancel.child_token());
        tokio::pin!(producer);

        let timeout = self.options.timeout;
        let deadline = async move {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut progress = ProgressEstimator::new(&self.options);
        let mut summary: Option<Result<StreamSummary, StreamError>> = None;
        let mut chunks_open = true;

        while chunks_open || summary.is_none() {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(bytes = buffer.len(), "Session loop cancelled");
                    return StreamOutcome::Cancelled;
                }

                _ = &mut deadline => return StreamOutcome::TimedOut,

                chunk = chunk_rx.recv(), if chunks_open => match chunk {
                    Some(chunk) => self.on_chunk(chunk, buffer, extractor, &mut progress),
                    None => chunks_open = false,
                },

                result = &mut producer, if summary.is_none() => summary = Some(result),
            }
        }

        match summary {
            Some(Ok(summary)) => StreamOutcome::Finished(summary),
            Some(Err(err)) => StreamOutcome::Failed(err),
            None => StreamOutcome::Cancelled,
        }
    }

    fn on_chunk(
        &self,
        chunk: StreamChunk,
        buffer: &mut String,
        extractor: &mut PartialJsonExtractor,
        progress: &mut ProgressEstimator,
    ) {
        buffer.push_str(&chunk.text);
        debug!(
            sequence = chunk.sequence_index,
            chunk_len = chunk.text.len(),
            buffer_len = buffer.len(),
            "Received chunk"
        );

        self.emit(ExtractionEvent::Progress {
            percent_complete: progress.update(buffer.len()),
            bytes_processed: buffer.len(),
        });

        if let Some(update) = extractor.update(buffer.as_str()) {
            // Header fields alone are held back until the first phase or task
            if update.is_new && update.snapshot.has_plan_content() {
                self.emit(ExtractionEvent::Data {
                    snapshot: update.snapshot,
                });
            }
        }
    }

    /// Deliver an event unless the session was cancelled.
    fn emit(&self, event: ExtractionEvent) {
        let _gate = lock(&self.shared.emit_gate);
        if self.shared.cancel.is_cancelled() {
            debug!(event = event.kind(), "Dropping event after cancellation");
            return;
        }
        self.notify(event);
    }

    fn notify(&self, event: ExtractionEvent) {
        *lock(&self.shared.notifying) = Some(thread::current().id());
        self.observer.notify(event);
        *lock(&self.shared.notifying) = None;
    }
}

/// Percentage from buffer length against an expected response length.
///
/// Capped below 100 and never decreasing.
struct ProgressEstimator {
    expected: usize,
    cap: u8,
    last: u8,
}

impl ProgressEstimator {
    fn new(options: &SessionOptions) -> Self {
        Self {
            expected: options.expected_response_chars.max(1),
            cap: options.progress_cap.min(99),
            last: 0,
        }
    }

    fn update(&mut self, bytes: usize) -> u8 {
        let estimate = (bytes.saturating_mul(100) / self.expected).min(self.cap as usize) as u8;
        self.last = self.last.max(estimate);
        self.last
    }
}

/// Turn the accumulated buffer into the `complete` payload.
///
/// Parse-layer failures never escape: they only choose between degraded
/// output and an error carrying whatever was recovered.
pub(crate) fn finalize(
    buffer: &str,
    finish_reason: &FinishReason,
    last: Option<PartialPlanSnapshot>,
    variant: PromptVariant,
) -> Result<ExtractionOutput, (ExtractionError, Option<PartialPlanSnapshot>)> {
    if finish_reason.is_truncated() {
        warn!(bytes = buffer.len(), "Response truncated by output limit, using fallback");
        return Ok(degraded(buffer, last, variant, DegradedReason::Truncated, finish_reason));
    }

    let (plan, quality) = match repair::parse_strict(buffer) {
        Ok(value) => (value, OutputQuality::Full),
        Err(parse_error) => {
            debug!(error = %parse_error, "Strict parse failed, attempting repair");
            match repair::repair(buffer) {
                Ok(value) => (value, OutputQuality::Repaired),
                Err(unrepairable) => {
                    return match last {
                        Some(snapshot) if !snapshot.is_empty() => {
                            warn!("Unrepairable output, completing with last partial snapshot");
                            Ok(degraded(
                                buffer,
                                Some(snapshot),
                                variant,
                                DegradedReason::UnrepairableOutput,
                                finish_reason,
                            ))
                        }
                        _ => Err((unrepairable.into(), None)),
                    };
                }
            }
        }
    };

    let fresh = snapshot_from_value(&plan);
    let snapshot = match &last {
        Some(previous) => fresh.merged_over(previous),
        None => fresh,
    };

    Ok(ExtractionOutput {
        plan,
        snapshot,
        quality,
        finish_reason: finish_reason.clone(),
        raw_text: buffer.to_string(),
    })
}

/// Minimal valid plan from partial knowledge, padded with a placeholder
/// phase or task when no plan item was recovered.
fn degraded(
    buffer: &str,
    last: Option<PartialPlanSnapshot>,
    variant: PromptVariant,
    reason: DegradedReason,
    finish_reason: &FinishReason,
) -> ExtractionOutput {
    let mut snapshot = last.unwrap_or_default();
    if !snapshot.has_plan_content() {
        match variant {
            PromptVariant::Legacy => {
                snapshot.phases = Some(vec![Phase {
                    number: 1,
                    name: PLACEHOLDER_NAME.to_string(),
                    ..Default::default()
                }]);
            }
            PromptVariant::TaskBased => {
                snapshot.tasks = Some(vec![Task {
                    id: "T1".to_string(),
                    name: PLACEHOLDER_NAME.to_string(),
                    phase: 1,
                    ..Default::default()
                }]);
            }
        }
    }

    ExtractionOutput {
        plan: serde_json::to_value(&snapshot).unwrap_or_default(),
        snapshot,
        quality: OutputQuality::Degraded { reason },
        finish_reason: finish_reason.clone(),
        raw_text: buffer.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{SourceDocument, MIME_TEXT};
    use crate::error::GatewayError;
    use crate::gateway::{ScriptStep, ScriptedGateway};
    use std::time::Duration;

    fn request(variant: PromptVariant) -> ExtractionRequest {
        let document = SourceDocument::from_bytes(b"Devis".to_vec(), MIME_TEXT).unwrap();
        ExtractionRequest::new(document, variant)
    }

    async fn run(gateway: ScriptedGateway, variant: PromptVariant) -> (SessionState, Vec<ExtractionEvent>) {
        let (observer, mut rx) = ChannelObserver::new();
        let session = ExtractionSession::new(
            Arc::new(gateway),
            Arc::new(observer),
            SessionOptions::default(),
        );
        let state = session.start(request(variant)).await.unwrap();
        drop(session);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (state, events)
    }

    fn terminal(events: &[ExtractionEvent]) -> &ExtractionEvent {
        events.last().unwrap()
    }

    #[tokio::test]
    async fn test_repaired_output_is_flagged() {
        let gateway = ScriptedGateway::from_chunks([r#"{"phases":[{"numero":1,"nom":"A""#]);
        let (state, events) = run(gateway, PromptVariant::Legacy).await;

        assert_eq!(state, SessionState::Completed);
        match terminal(&events) {
            ExtractionEvent::Complete(output) => {
                assert_eq!(output.quality, OutputQuality::Repaired);
                assert_eq!(output.plan["phases"][0]["nom"], "A");
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unrepairable_without_snapshot_is_error() {
        let gateway = ScriptedGateway::from_chunks(["Je ne peux pas ", "traiter ce document."]);
        let (state, events) = run(gateway, PromptVariant::Legacy).await;

        assert_eq!(state, SessionState::Failed);
        match terminal(&events) {
            ExtractionEvent::Error { cause } => assert_eq!(cause.kind, "unrepairable_json"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unrepairable_with_snapshot_completes_degraded() {
        let gateway = ScriptedGateway::from_chunks([r#"{"patient":"Jean","phases":[{"numero":1,"nom":"A"}],"#, r#""total": }"#]);
        let (state, events) = run(gateway, PromptVariant::Legacy).await;

        assert_eq!(state, SessionState::Completed);
        match terminal(&events) {
            ExtractionEvent::Complete(output) => {
                assert_eq!(
                    output.quality,
                    OutputQuality::Degraded {
                        reason: DegradedReason::UnrepairableOutput
                    }
                );
                assert_eq!(output.snapshot.patient.as_deref(), Some("Jean"));
                assert_eq!(output.snapshot.phases.as_ref().unwrap()[0].name, "A");
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_without_content_gets_placeholder_phase() {
        let gateway = ScriptedGateway::from_steps([
            ScriptStep::Chunk(r#"{"patient":"Jean"#.to_string()),
            ScriptStep::Finish(FinishReason::Length),
        ]);
        let (_, events) = run(gateway, PromptVariant::Legacy).await;

        match terminal(&events) {
            ExtractionEvent::Complete(output) => {
                assert!(output.quality.is_degraded());
                let phases = output.snapshot.phases.as_ref().unwrap();
                assert_eq!(phases.len(), 1);
                assert_eq!(phases[0].name, PLACEHOLDER_NAME);
                assert_eq!(output.plan["phases"][0]["number"], 1);
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gateway_error_before_first_chunk() {
        let gateway = ScriptedGateway::failing(GatewayError::QuotaExceeded("429".to_string()));
        let (state, events) = run(gateway, PromptVariant::Legacy).await;

        assert_eq!(state, SessionState::Failed);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ExtractionEvent::Error { cause } => {
                assert_eq!(cause.kind, "model_quota_exceeded");
                assert!(cause.hint.contains("upgrade"));
                assert!(cause.partial_snapshot.is_none());
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mid_stream_error_keeps_partial_snapshot() {
        let gateway = ScriptedGateway::from_steps([
            ScriptStep::Chunk(r#"{"patient":"Jean","phases":[{"numero":1,"nom":"A"}"#.to_string()),
            ScriptStep::Fail(GatewayError::Unavailable("connection reset".to_string())),
        ]);
        let (_, events) = run(gateway, PromptVariant::Legacy).await;

        match terminal(&events) {
            ExtractionEvent::Error { cause } => {
                assert!(cause.retryable);
                assert!(matches!(
                    cause.cause,
                    ExtractionError::Model {
                        point: crate::error::FailurePoint::MidStream { chunks_received: 1 },
                        ..
                    }
                ));
                assert_eq!(cause.partial_snapshot.as_ref().unwrap().patient.as_deref(), Some("Jean"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_capped() {
        let chunk = "x".repeat(2000);
        let gateway = ScriptedGateway::from_chunks(vec![chunk.clone(); 6]);
        let (_, events) = run(gateway, PromptVariant::Legacy).await;

        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ExtractionEvent::Progress { percent_complete, .. } => Some(*percent_complete),
                _ => None,
            })
            .collect();
        assert_eq!(percents.len(), 6);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents.iter().all(|p| *p <= 90));
        assert_eq!(percents[5], 90);
    }

    #[tokio::test]
    async fn test_timeout_reports_error() {
        let (gateway, feed) = ScriptedGateway::live();
        feed.chunk(r#"{"patient":"Jean","#);
        let (observer, mut rx) = ChannelObserver::new();
        let session = ExtractionSession::new(
            Arc::new(gateway),
            Arc::new(observer),
            SessionOptions::default().with_timeout(Duration::from_millis(50)),
        );

        let state = session.start(request(PromptVariant::Legacy)).await.unwrap();
        assert_eq!(state, SessionState::Failed);
        drop(session);

        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        match last {
            Some(ExtractionEvent::Error { cause }) => {
                assert_eq!(cause.kind, "timeout");
                assert_eq!(cause.partial_snapshot.unwrap().patient.as_deref(), Some("Jean"));
            }
            other => panic!("expected timeout error, got {other:?}"),
        }
        drop(feed);
    }

    #[tokio::test]
    async fn test_session_is_single_use() {
        let session = ExtractionSession::new(
            Arc::new(ScriptedGateway::from_chunks([r#"{"phases":[]}"#])),
            Arc::new(NoOpObserver),
            SessionOptions::default(),
        );
        session.start(request(PromptVariant::Legacy)).await.unwrap();

        let err = session.start(request(PromptVariant::Legacy)).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::NotIdle {
                state: SessionState::Completed
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_from_observer_does_not_deadlock() {
        struct CancelOnData {
            handle: Mutex<Option<SessionHandle>>,
            seen: Mutex<Vec<&'static str>>,
        }
        impl ExtractionObserver for CancelOnData {
            fn notify(&self, event: ExtractionEvent) {
                lock(&self.seen).push(event.kind());
                if matches!(event, ExtractionEvent::Data { .. }) {
                    if let Some(handle) = lock(&self.handle).as_ref() {
                        handle.cancel();
                    }
                }
            }
        }

        let observer = Arc::new(CancelOnData {
            handle: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        });
        let session = ExtractionSession::new(
            Arc::new(ScriptedGateway::from_chunks([
                r#"{"phases":[{"numero":1,"nom":"A"}]"#,
                "}",
            ])),
            observer.clone(),
            SessionOptions::default(),
        );
        *lock(&observer.handle) = Some(session.handle());

        let state = session.start(request(PromptVariant::Legacy)).await.unwrap();
        assert_eq!(state, SessionState::Cancelled);
        assert_eq!(*lock(&observer.seen), vec!["progress", "data"]);
    }

    #[test]
    fn test_event_serialization() {
        let event = ExtractionEvent::Progress {
            percent_complete: 42,
            bytes_processed: 1000,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["data"]["percentComplete"], 42);

        let output = ExtractionOutput {
            plan: serde_json::json!({"phases": []}),
            snapshot: PartialPlanSnapshot::default(),
            quality: OutputQuality::Degraded {
                reason: DegradedReason::Truncated,
            },
            finish_reason: FinishReason::Length,
            raw_text: r#"{"phases":["#.to_string(),
        };
        let value = serde_json::to_value(ExtractionEvent::Complete(output)).unwrap();
        assert_eq!(value["type"], "complete");
        assert_eq!(value["data"]["quality"]["status"], "degraded");
        assert_eq!(value["data"]["quality"]["reason"], "truncated");
        assert_eq!(value["data"]["finishReason"], "length");
        assert!(value["data"].get("rawText").is_none());
    }
}
