//! Model gateway abstraction
//!
//! A gateway sends one document plus prompt to a generative model and hands
//! back raw text. It does no domain interpretation:
//! - `gemini`: Google Generative Language API over HTTP/SSE
//! - `scripted`: recorded or test-driven responses

pub mod gemini;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::document::SourceDocument;
use crate::error::{GatewayError, StreamError};
use crate::prompts::PromptVariant;

pub use gemini::GeminiGateway;
pub use scripted::{LiveFeed, ScriptStep, ScriptedGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    Complete,
    #[default]
    Streaming,
}

/// One extraction request: a document and which prompt to run on it.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub document: SourceDocument,
    pub variant: PromptVariant,
    pub mode: ExtractionMode,
}

impl ExtractionRequest {
    pub fn new(document: SourceDocument, variant: PromptVariant) -> Self {
        Self {
            document,
            variant,
            mode: ExtractionMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// One text fragment of a streamed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    pub sequence_index: usize,
}

/// Why the model stopped generating
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Output token limit reached; the response is cut short
    Length,
    ContentFiltered,
    Other(String),
    #[default]
    Unspecified,
}

impl FinishReason {
    /// Map a provider's finish reason string
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "STOP" | "END_TURN" | "FINISHED" => Self::Stop,
            "MAX_TOKENS" | "LENGTH" | "TRUNCATED" => Self::Length,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
                Self::ContentFiltered
            }
            "" | "FINISH_REASON_UNSPECIFIED" => Self::Unspecified,
            _ => Self::Other(raw.to_string()),
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Length)
    }
}

/// Result of a complete-mode call
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: FinishReason,
}

/// End-of-stream summary of a streaming call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamSummary {
    pub finish_reason: FinishReason,
    pub chunks: usize,
    pub bytes: usize,
}

/// Unified model gateway interface
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Single-shot call returning the whole response text
    async fn generate(&self, request: &ExtractionRequest) -> Result<Completion, GatewayError>;

    /// Streaming call
    ///
    /// Chunks are sent in order on `chunk_tx`. The gateway stops reading
    /// upstream as soon as `cancel_token` fires or `chunk_tx` is closed.
    /// Errors record whether any chunk was delivered before the failure.
    async fn generate_stream(
        &self,
        request: &ExtractionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
        cancel_token: CancellationToken,
    ) -> Result<StreamSummary, StreamError>;

    /// Get the provider name (e.g., "gemini", "scripted")
    fn provider_name(&self) -> &'static str;

    /// Get the model identifier
    fn model_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_parse() {
        assert_eq!(FinishReason::parse("STOP"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("MAX_TOKENS"), FinishReason::Length);
        assert!(FinishReason::parse("max_tokens").is_truncated());
        assert_eq!(FinishReason::parse("SAFETY"), FinishReason::ContentFiltered);
        assert_eq!(
            FinishReason::parse("MALFORMED_FUNCTION_CALL"),
            FinishReason::Other("MALFORMED_FUNCTION_CALL".to_string())
        );
        assert!(!FinishReason::Stop.is_truncated());
    }
}
