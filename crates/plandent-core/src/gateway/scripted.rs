//! Scripted gateway for replaying recorded responses and driving tests
//!
//! A script is a channel of steps consumed by exactly one call. Scripts can be
//! fixed up front (`from_steps`, `from_text`) or fed while the call runs
//! (`live`), which lets tests interleave chunks with assertions.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Completion, ExtractionRequest, FinishReason, ModelGateway, StreamChunk, StreamSummary};
use crate::error::{GatewayError, StreamError};

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Deliver one chunk of text
    Chunk(String),
    /// End the response with this finish reason
    Finish(FinishReason),
    /// Fail the call
    Fail(GatewayError),
    /// Wait before the next step
    Pause(Duration),
}

pub struct ScriptedGateway {
    steps: Mutex<Option<mpsc::UnboundedReceiver<ScriptStep>>>,
    model: String,
}

impl ScriptedGateway {
    pub fn from_steps(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        let (gateway, feed) = Self::live();
        for step in steps {
            feed.push(step);
        }
        gateway
    }

    /// Chunks followed by a normal stop
    pub fn from_chunks<S: Into<String>>(chunks: impl IntoIterator<Item = S>) -> Self {
        Self::from_steps(
            chunks
                .into_iter()
                .map(|c| ScriptStep::Chunk(c.into()))
                .chain(std::iter::once(ScriptStep::Finish(FinishReason::Stop))),
        )
    }

    /// Split a recorded response into chunks of roughly `chunk_size` bytes
    pub fn from_text(text: &str, chunk_size: usize, finish_reason: FinishReason) -> Self {
        Self::from_steps(
            split_chunks(text, chunk_size)
                .into_iter()
                .map(ScriptStep::Chunk)
                .chain(std::iter::once(ScriptStep::Finish(finish_reason))),
        )
    }

    pub fn failing(error: GatewayError) -> Self {
        Self::from_steps([ScriptStep::Fail(error)])
    }

    /// A gateway whose steps are pushed through the returned feed.
    ///
    /// Dropping the feed ends the response with a normal stop.
    pub fn live() -> (Self, LiveFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Self {
            steps: Mutex::new(Some(rx)),
            model: "scripted".to_string(),
        };
        (gateway, LiveFeed { tx })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn take_script(&self) -> Result<mpsc::UnboundedReceiver<ScriptStep>, GatewayError> {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| GatewayError::Unavailable("Scripted response already consumed".to_string()))
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn generate(&self, _request: &ExtractionRequest) -> Result<Completion, GatewayError> {
        let mut steps = self.take_script()?;
        let mut text = String::new();

        while let Some(step) = steps.recv().await {
            match step {
                ScriptStep::Chunk(chunk) => text.push_str(&chunk),
                ScriptStep::Pause(duration) => tokio::time::sleep(duration).await,
                ScriptStep::Fail(error) => return Err(error),
                ScriptStep::Finish(finish_reason) => return Ok(Completion { text, finish_reason }),
            }
        }
        Ok(Completion {
            text,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn generate_stream(
        &self,
        _request: &ExtractionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
        cancel_token: CancellationToken,
    ) -> Result<StreamSummary, StreamError> {
        let mut steps = self.take_script().map_err(|e| StreamError::new(e, 0))?;
        let mut summary = StreamSummary {
            finish_reason: FinishReason::Stop,
            ..Default::default()
        };

        loop {
            let step = tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!(chunks = summary.chunks, "Scripted stream cancelled");
                    return Ok(summary);
                }

                step = steps.recv() => step,
            };

            match step {
                Some(ScriptStep::Chunk(text)) => {
                    let len = text.len();
                    let chunk = StreamChunk {
                        text,
                        sequence_index: summary.chunks,
                    };
                    if chunk_tx.send(chunk).await.is_err() {
                        return Ok(summary);
                    }
                    summary.chunks += 1;
                    summary.bytes += len;
                }
                Some(ScriptStep::Pause(duration)) => {
                    tokio::select! {
                        _ = cancel_token.cancelled() => return Ok(summary),
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                Some(ScriptStep::Fail(error)) => return Err(StreamError::new(error, summary.chunks)),
                Some(ScriptStep::Finish(reason)) => {
                    summary.finish_reason = reason;
                    return Ok(summary);
                }
                None => return Ok(summary),
            }
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Sending half of a live script. Pushes after the call ended are dropped.
#[derive(Debug, Clone)]
pub struct LiveFeed {
    tx: mpsc::UnboundedSender<ScriptStep>,
}

impl LiveFeed {
    pub fn push(&self, step: ScriptStep) {
        let _ = self.tx.send(step);
    }

    pub fn chunk(&self, text: impl Into<String>) {
        self.push(ScriptStep::Chunk(text.into()));
    }

    pub fn finish(&self, reason: FinishReason) {
        self.push(ScriptStep::Finish(reason));
    }

    pub fn fail(&self, error: GatewayError) {
        self.push(ScriptStep::Fail(error));
    }

    /// Whether the gateway side is gone (call finished or cancelled)
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Split on char boundaries into pieces of at most `chunk_size` bytes
/// (a single wide character may exceed it).
fn split_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if !current.is_empty() && current.len() + c.len_utf8() > chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
