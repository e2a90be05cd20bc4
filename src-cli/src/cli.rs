//! Command implementations
//!
//! Streaming commands write one JSON object per line to stdout: every session
//! event as `{"type": ..., "data": ...}`, then a final `plan` record. Logs go
//! to stderr.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use plandent_core::document::MIME_TEXT;
use plandent_core::prompts::{extraction_prompt, output_schema, prompt_version};
use plandent_core::repair::repair;
use plandent_core::{
    Config, ExtractionError, ExtractionEvent, ExtractionMode, ExtractionObserver,
    ExtractionPipeline, ExtractionRequest, FinishReason, GeminiGateway, JsonFilePlanStore,
    ModelGateway, PipelineOutcome, PlanContext, PlanId, PlanReconciler, PlanStore,
    PromptVariant, ScriptedGateway, SessionOptions, SourceDocument,
};
use serde::Serialize;

use crate::error::{CliError, CliResult};

/// First retry waits this long, doubling each attempt
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Options shared by `extract` and `replay`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub variant: PromptVariant,
    pub timeout: Option<Duration>,
    pub save: bool,
    pub doctor_id: Option<String>,
    pub title: Option<String>,
}

impl RunOptions {
    fn context(&self) -> PlanContext {
        PlanContext {
            referring_doctor_id: self.doctor_id.clone(),
            title: self.title.clone(),
            source_fingerprint: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub file: PathBuf,
    pub mode: ExtractionMode,
    pub retries: u32,
    pub run: RunOptions,
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub file: PathBuf,
    pub chunk_size: usize,
    pub truncated: bool,
    pub run: RunOptions,
}

/// Writes each session event as one JSON line on stdout
pub struct StdoutObserver;

impl ExtractionObserver for StdoutObserver {
    fn notify(&self, event: ExtractionEvent) {
        if let Err(e) = write_line(&event) {
            tracing::debug!(error = %e, "Failed to write event to stdout");
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum Record<'a> {
    Plan(&'a PipelineOutcome),
}

fn write_line<T: Serialize>(value: &T) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    stdout.write_all(b"\n")?;
    stdout.flush()
}

fn write_pretty<T: Serialize>(value: &T) -> CliResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| CliError::internal(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

fn open_store(config: &Config) -> CliResult<Arc<dyn PlanStore>> {
    Ok(Arc::new(JsonFilePlanStore::open(&config.plans_dir)?))
}

fn pipeline_for(
    config: &Config,
    gateway: Arc<dyn ModelGateway>,
    options: SessionOptions,
    run: &RunOptions,
) -> CliResult<ExtractionPipeline> {
    let mut pipeline = ExtractionPipeline::new(gateway)
        .with_options(options)
        .with_context(run.context());
    if run.save {
        pipeline = pipeline.with_store(open_store(config)?);
    }
    Ok(pipeline)
}

/// Run `attempt` until it succeeds, fails for good, or `retries` is spent.
///
/// Only errors whose `is_retryable()` is true are retried, with exponential
/// backoff starting at `base_delay`.
pub async fn with_retry<T, F, Fut>(
    retries: u32,
    base_delay: Duration,
    mut attempt: F,
) -> Result<T, ExtractionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ExtractionError>>,
{
    let mut tries = 0;
    loop {
        match attempt(tries).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && tries < retries => {
                let delay = base_delay * 2u32.saturating_pow(tries);
                tracing::warn!(
                    kind = e.kind(),
                    attempt = tries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Extraction failed, retrying"
                );
                tokio::time::sleep(delay).await;
                tries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Stream a session to stdout, cancelling it on Ctrl+C.
async fn stream_to_stdout(
    pipeline: &ExtractionPipeline,
    request: ExtractionRequest,
) -> Result<Option<PipelineOutcome>, ExtractionError> {
    let run = pipeline.streaming(Arc::new(StdoutObserver));
    let handle = run.handle();
    let cancel_on_interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling extraction");
            handle.cancel();
        }
    });

    let result = run.run(request).await;
    cancel_on_interrupt.abort();
    result
}

fn report_outcome(outcome: Option<PipelineOutcome>, streamed: bool) -> CliResult<()> {
    let Some(outcome) = outcome else {
        tracing::info!("Extraction cancelled");
        return Ok(());
    };

    if let Some(id) = outcome.plan_id {
        tracing::info!("Saved plan {}", id);
    }
    if streamed {
        write_line(&Record::Plan(&outcome))?;
        Ok(())
    } else {
        write_pretty(&outcome)
    }
}

/// Extract a plan from a document with the configured model.
pub async fn extract(config: &Config, options: ExtractOptions) -> CliResult<()> {
    let settings = config.load_settings()?;
    let gateway: Arc<dyn ModelGateway> = Arc::new(
        GeminiGateway::new(Arc::new(settings.clone()))
            .map_err(|e| CliError::from(ExtractionError::model(e)))?,
    );

    let mut session_options = SessionOptions::from_settings(&settings);
    if let Some(timeout) = options.run.timeout {
        session_options = session_options.with_timeout(timeout);
    }
    let pipeline = pipeline_for(config, gateway, session_options, &options.run)?;

    let document = SourceDocument::from_path(&options.file)?;
    tracing::info!(
        file = %options.file.display(),
        mime_type = document.mime_type(),
        pages = ?document.page_count(),
        variant = %options.run.variant,
        "Extracting treatment plan"
    );
    let request = ExtractionRequest::new(document, options.run.variant).with_mode(options.mode);

    let streamed = options.mode == ExtractionMode::Streaming;
    let outcome = with_retry(options.retries, RETRY_BASE_DELAY, |_| {
        let request = request.clone();
        let pipeline = &pipeline;
        async move {
            match request.mode {
                ExtractionMode::Streaming => stream_to_stdout(pipeline, request).await,
                ExtractionMode::Complete => pipeline.run_complete(request).await.map(Some),
            }
        }
    })
    .await?;

    report_outcome(outcome, streamed)
}

/// Feed a recorded model response through a streaming session.
pub async fn replay(config: &Config, options: ReplayOptions) -> CliResult<()> {
    let text = std::fs::read_to_string(&options.file)?;
    if text.trim().is_empty() {
        return Err(CliError::invalid_input(format!(
            "Recording is empty: {}",
            options.file.display()
        )));
    }

    let finish_reason = if options.truncated {
        FinishReason::Length
    } else {
        FinishReason::Stop
    };
    let gateway = ScriptedGateway::from_text(&text, options.chunk_size, finish_reason)
        .with_model(options.file.display().to_string());

    let mut session_options = SessionOptions::default();
    if let Some(timeout) = options.run.timeout {
        session_options = session_options.with_timeout(timeout);
    }
    let pipeline = pipeline_for(config, Arc::new(gateway), session_options, &options.run)?;

    let document = SourceDocument::from_bytes(text.into_bytes(), MIME_TEXT)?;
    let request = ExtractionRequest::new(document, options.run.variant);

    let outcome = stream_to_stdout(&pipeline, request).await?;
    report_outcome(outcome, true)
}

/// Reconcile a saved model output without calling the model.
pub async fn reconcile_file(config: &Config, file: &Path, run: &RunOptions) -> CliResult<()> {
    let text = std::fs::read_to_string(file)?;
    let raw = repair(&text).map_err(|e| CliError::from(ExtractionError::from(e)))?;

    let plan = PlanReconciler::new(run.context())
        .reconcile(&raw)
        .map_err(|e| CliError::from(ExtractionError::from(e)))?;

    if run.save {
        let id = open_store(config)?.save(&plan).await?;
        tracing::info!("Saved plan {}", id);
    }
    write_pretty(&plan)
}

pub async fn show(config: &Config, id: &str) -> CliResult<()> {
    let id: PlanId = id.parse().map_err(|_| CliError::plan_not_found(id))?;
    let stored = open_store(config)?.get(id).await?;
    write_pretty(&stored)
}

pub async fn list(config: &Config) -> CliResult<()> {
    let summaries = open_store(config)?.list().await?;
    tracing::info!("{} saved plan(s)", summaries.len());
    write_pretty(&summaries)
}

pub fn prompt(variant: PromptVariant, schema: bool) -> CliResult<()> {
    tracing::info!(version = prompt_version(variant), "Prompt for {}", variant);
    if schema {
        write_pretty(&output_schema(variant))
    } else {
        println!("{}", extraction_prompt(variant));
        Ok(())
    }
}
