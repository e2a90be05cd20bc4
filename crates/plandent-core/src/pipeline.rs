//! End-to-end extraction: document in, saved plan out.
//!
//! ```text
//! ExtractionRequest
//!       │
//!       ├── complete ──► ModelGateway::generate ──────────┐
//!       │                                                 │
//!       └── streaming ─► ExtractionSession ─► observer    │
//!                              │ complete                 │
//!                              ▼                          ▼
//!                      strict parse / repair / degraded fallback
//!                                     │
//!                                     ▼
//!                               PlanReconciler
//!                                     │
//!                                     ▼
//!                              PlanStore::save
//! ```
//!
//! The pipeline itself never retries; retrying is the caller's decision,
//! guided by [`ExtractionError::is_retryable`].

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::config::SessionOptions;
use crate::error::{ExtractionError, SessionError};
use crate::extract::extract_partial;
use crate::gateway::{ExtractionMode, ExtractionRequest, ModelGateway};
use crate::plan::ReconciledTreatmentPlan;
use crate::reconcile::{PlanContext, PlanReconciler};
use crate::session::{
    finalize, ChannelObserver, ExtractionEvent, ExtractionObserver, ExtractionOutput,
    ExtractionSession, OutputQuality, SessionHandle,
};
use crate::store::{PlanId, PlanStore};

/// Result of a finished extraction
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutcome {
    pub plan: ReconciledTreatmentPlan,
    pub quality: OutputQuality,
    /// Set when the pipeline has a store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,
}

/// Couples a gateway with reconciliation and optional persistence.
pub struct ExtractionPipeline {
    gateway: Arc<dyn ModelGateway>,
    store: Option<Arc<dyn PlanStore>>,
    options: SessionOptions,
    context: PlanContext,
}

impl ExtractionPipeline {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self {
            gateway,
            store: None,
            options: SessionOptions::default(),
            context: PlanContext::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_context(mut self, context: PlanContext) -> Self {
        self.context = context;
        self
    }

    /// Run in whichever mode the request asks for, without progress events.
    pub async fn run(
        &self,
        request: ExtractionRequest,
    ) -> Result<Option<PipelineOutcome>, ExtractionError> {
        match request.mode {
            ExtractionMode::Complete => self.run_complete(request).await.map(Some),
            ExtractionMode::Streaming => {
                self.run_streaming(request, Arc::new(crate::session::NoOpObserver))
                    .await
            }
        }
    }

    /// Single-shot call: generate, parse or repair, reconcile, save.
    pub async fn run_complete(
        &self,
        request: ExtractionRequest,
    ) -> Result<PipelineOutcome, ExtractionError> {
        info!(
            provider = self.gateway.provider_name(),
            model = self.gateway.model_id(),
            variant = %request.variant,
            "Starting complete-mode extraction"
        );

        let call = self.gateway.generate(&request);
        let completion = match self.options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| ExtractionError::Timeout(timeout))?,
            None => call.await,
        }
        .map_err(ExtractionError::model)?;

        debug!(
            bytes = completion.text.len(),
            finish_reason = ?completion.finish_reason,
            "Model response received"
        );

        let partial = extract_partial(&completion.text);
        let output = finalize(
            &completion.text,
            &completion.finish_reason,
            partial,
            request.variant,
        )
        .map_err(|(cause, _)| cause)?;

        self.reconcile_and_save(&request, output).await
    }

    /// Streaming call with events relayed to `observer`.
    ///
    /// `Ok(None)` means the session was cancelled.
    pub async fn run_streaming(
        &self,
        request: ExtractionRequest,
        observer: Arc<dyn ExtractionObserver>,
    ) -> Result<Option<PipelineOutcome>, ExtractionError> {
        self.streaming(observer).run(request).await
    }

    /// Prepare a streaming run so its handle can be taken before it starts.
    pub fn streaming(&self, observer: Arc<dyn ExtractionObserver>) -> StreamingRun<'_> {
        let capture = Arc::new(TerminalCapture {
            inner: observer,
            terminal: Mutex::new(None),
        });
        let session = ExtractionSession::new(
            Arc::clone(&self.gateway),
            capture.clone(),
            self.options.clone(),
        );
        StreamingRun {
            pipeline: self,
            session,
            capture,
        }
    }

    /// Session events as an async stream. The session runs on its own task.
    ///
    /// The stream ends after the terminal event, or right after cancellation.
    pub fn event_stream(
        &self,
        request: ExtractionRequest,
    ) -> (SessionHandle, UnboundedReceiverStream<ExtractionEvent>) {
        let (observer, rx) = ChannelObserver::new();
        let session = ExtractionSession::new(
            Arc::clone(&self.gateway),
            Arc::new(observer),
            self.options.clone(),
        );
        let handle = session.handle();

        tokio::spawn(async move {
            if let Err(e) = session.start(request).await {
                debug!(error = %e, "Event stream session did not start");
            }
        });

        (handle, UnboundedReceiverStream::new(rx))
    }

    async fn reconcile_and_save(
        &self,
        request: &ExtractionRequest,
        output: ExtractionOutput,
    ) -> Result<PipelineOutcome, ExtractionError> {
        let mut context = self.context.clone();
        context.source_fingerprint = Some(request.document.fingerprint().to_string());

        let mut plan = PlanReconciler::new(context).reconcile(&output.plan)?;
        if output.quality.is_degraded() {
            warn!(quality = ?output.quality, "Reconciled a degraded plan");
        }
        if output.quality != OutputQuality::Full {
            plan.raw_model_text = Some(output.raw_text);
        }

        let plan_id = match &self.store {
            Some(store) => Some(store.save(&plan).await?),
            None => None,
        };

        info!(
            title = %plan.title,
            phases = plan.statistics.phase_count,
            tasks = plan.statistics.task_count,
            warnings = plan.warnings.len(),
            saved = plan_id.is_some(),
            "Extraction pipeline finished"
        );

        Ok(PipelineOutcome {
            plan,
            quality: output.quality,
            plan_id,
        })
    }
}

/// A streaming run that has not started yet
pub struct StreamingRun<'a> {
    pipeline: &'a ExtractionPipeline,
    session: ExtractionSession,
    capture: Arc<TerminalCapture>,
}

impl StreamingRun<'_> {
    pub fn handle(&self) -> SessionHandle {
        self.session.handle()
    }

    pub async fn run(
        self,
        request: ExtractionRequest,
    ) -> Result<Option<PipelineOutcome>, ExtractionError> {
        match self.session.start(request.clone()).await {
            Ok(state) => debug!(%state, "Session finished"),
            Err(SessionError::NotIdle { state }) => {
                debug!(%state, "Session cancelled before it started");
                return Ok(None);
            }
        }

        let terminal = self
            .capture
            .terminal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match terminal {
            Some(ExtractionEvent::Complete(output)) => self
                .pipeline
                .reconcile_and_save(&request, output)
                .await
                .map(Some),
            Some(ExtractionEvent::Error { cause }) => Err(cause.cause),
            _ => Ok(None),
        }
    }
}

/// Forwards every event and keeps the terminal one for the pipeline.
struct TerminalCapture {
    inner: Arc<dyn ExtractionObserver>,
    terminal: Mutex<Option<ExtractionEvent>>,
}

impl ExtractionObserver for TerminalCapture {
    fn notify(&self, event: ExtractionEvent) {
        if event.is_terminal() {
            *self.terminal.lock().unwrap_or_else(|e| e.into_inner()) = Some(event.clone());
        }
        self.inner.notify(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{SourceDocument, MIME_TEXT};
    use crate::error::GatewayError;
    use crate::gateway::{FinishReason, ScriptedGateway};
    use crate::prompts::PromptVariant;
    use crate::store::MemoryPlanStore;
    use futures::StreamExt;

    const LEGACY_RESPONSE: &str = r#"{"patient":"Jean Dupont","phases":[{"numero":1,"nom":"Soins","groupes_actes":[{"type":"soins","actes":[{"libelle":"Composite","dents":[16],"cout":80}]}]}]}"#;

    fn request(variant: PromptVariant) -> ExtractionRequest {
        let document = SourceDocument::from_bytes(b"Devis du 12/03".to_vec(), MIME_TEXT).unwrap();
        ExtractionRequest::new(document, variant)
    }

    #[tokio::test]
    async fn test_run_complete_saves_plan_with_fingerprint() {
        let store = Arc::new(MemoryPlanStore::new());
        let pipeline = ExtractionPipeline::new(Arc::new(ScriptedGateway::from_text(
            LEGACY_RESPONSE,
            16,
            FinishReason::Stop,
        )))
        .with_store(store.clone());

        let req = request(PromptVariant::Legacy).with_mode(ExtractionMode::Complete);
        let fingerprint = req.document.fingerprint().to_string();
        let outcome = pipeline.run(req).await.unwrap().unwrap();

        assert_eq!(outcome.quality, OutputQuality::Full);
        assert_eq!(outcome.plan.statistics.total_cost, 80.0);
        assert_eq!(outcome.plan.source_fingerprint.as_deref(), Some(fingerprint.as_str()));

        let stored = store.get(outcome.plan_id.unwrap()).await.unwrap();
        assert_eq!(stored.plan.title, outcome.plan.title);
    }

    #[tokio::test]
    async fn test_run_complete_surfaces_gateway_error() {
        let pipeline = ExtractionPipeline::new(Arc::new(ScriptedGateway::failing(
            GatewayError::ConfigMissing,
        )));
        let err = pipeline
            .run_complete(request(PromptVariant::Legacy))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "model_config_missing");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_run_streaming_relays_events_and_reconciles() {
        let (observer, mut rx) = ChannelObserver::new();
        let pipeline = ExtractionPipeline::new(Arc::new(ScriptedGateway::from_text(
            LEGACY_RESPONSE,
            24,
            FinishReason::Stop,
        )));

        let outcome = pipeline
            .run_streaming(request(PromptVariant::Legacy), Arc::new(observer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.plan.phases[0].name, "Soins");
        assert!(outcome.plan_id.is_none());

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds.last(), Some(&"complete"));
        assert!(kinds.contains(&"data"));
    }

    #[tokio::test]
    async fn test_cancel_before_start_returns_none() {
        let pipeline = ExtractionPipeline::new(Arc::new(ScriptedGateway::from_chunks([
            LEGACY_RESPONSE,
        ])));
        let run = pipeline.streaming(Arc::new(crate::session::NoOpObserver));
        run.handle().cancel();

        let outcome = run.run(request(PromptVariant::Legacy)).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_event_stream_ends_after_complete() {
        let pipeline = ExtractionPipeline::new(Arc::new(ScriptedGateway::from_chunks([
            r#"{"taches":[{"id":"T1","nom":"Consultation"}]}"#,
        ])));
        let (_handle, stream) = pipeline.event_stream(request(PromptVariant::TaskBased));

        let events: Vec<ExtractionEvent> = stream.collect().await;
        assert!(matches!(events.last(), Some(ExtractionEvent::Complete(_))));
    }
}
