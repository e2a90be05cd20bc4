//! Google Generative Language API gateway
//!
//! Uses reqwest for `generateContent` and for `streamGenerateContent` via SSE.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Completion, ExtractionRequest, FinishReason, ModelGateway, StreamChunk, StreamSummary};
use crate::config::ModelSettings;
use crate::error::{GatewayError, StreamError};
use crate::prompts::{extraction_prompt, output_schema, prompt_version};

/// Limit on establishing a connection. Streamed bodies have no overall
/// limit here; the session deadline bounds them.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Gemini gateway bound to one settings snapshot
pub struct GeminiGateway {
    client: reqwest::Client,
    settings: Arc<ModelSettings>,
}

impl GeminiGateway {
    /// Fails with `ConfigMissing` when the snapshot has no API key.
    pub fn new(settings: Arc<ModelSettings>) -> Result<Self, GatewayError> {
        if !settings.has_credential() {
            return Err(GatewayError::ConfigMissing);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(Self { client, settings })
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.model,
            method
        )
    }

    fn headers(&self) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(self.settings.api_key.trim()).map_err(|_| {
                GatewayError::InvalidCredential("API key contains invalid characters".to_string())
            })?,
        );
        Ok(headers)
    }

    fn build_request(&self, request: &ExtractionRequest) -> GenerateContentRequest {
        let document = &request.document;
        let document_part = match document.as_text() {
            Some(text) => Part::Text {
                text: text.to_string(),
            },
            None => Part::InlineData {
                inline_data: InlineData {
                    mime_type: document.mime_type().to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(document.bytes()),
                },
            },
        };

        GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::Text {
                        text: extraction_prompt(request.variant).to_string(),
                    },
                    document_part,
                ],
            }],
            generation_config: GenerationConfig {
                temperature: self.settings.temperature,
                max_output_tokens: self.settings.max_output_tokens,
                response_mime_type: "application/json",
                response_schema: output_schema(request.variant),
            },
        }
    }

    /// `total_timeout` bounds the whole exchange, body included.
    fn post(
        &self,
        url: &str,
        body: &GenerateContentRequest,
        total_timeout: Option<Duration>,
    ) -> Result<reqwest::RequestBuilder, GatewayError> {
        let builder = self.client.post(url).headers(self.headers()?).json(body);
        Ok(match total_timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, GatewayError> {
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), &body))
    }
}

#[async_trait]
impl ModelGateway for GeminiGateway {
    async fn generate(&self, request: &ExtractionRequest) -> Result<Completion, GatewayError> {
        let body = self.build_request(request);
        info!(
            model = %self.settings.model,
            prompt = prompt_version(request.variant),
            document_bytes = request.document.len(),
            "Sending generateContent request"
        );

        let url = self.endpoint("generateContent");
        let http_request = self.post(&url, &body, Some(self.settings.request_timeout()))?;
        let response = self.send(http_request).await?;
        let parsed: GenerateContentResponse = response.json().await.map_err(transport_error)?;

        Ok(Completion {
            text: parsed.text(),
            finish_reason: parsed.finish_reason().unwrap_or_default(),
        })
    }

    async fn generate_stream(
        &self,
        request: &ExtractionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
        cancel_token: CancellationToken,
    ) -> Result<StreamSummary, StreamError> {
        let body = self.build_request(request);
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        info!(
            model = %self.settings.model,
            prompt = prompt_version(request.variant),
            document_bytes = request.document.len(),
            "Opening streamGenerateContent"
        );

        let http_request = self
            .post(&url, &body, None)
            .map_err(|e| StreamError::new(e, 0))?;
        let response = tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!("Stream cancelled before the response started");
                return Ok(StreamSummary::default());
            }

            response = self.send(http_request) => response.map_err(|e| StreamError::new(e, 0))?,
        };

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut summary = StreamSummary::default();

        loop {
            let next = tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!(chunks = summary.chunks, "Stream cancelled, closing connection");
                    return Ok(summary);
                }

                next = stream.next() => next,
            };

            let payloads = match next {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(e)) => return Err(StreamError::new(transport_error(e), summary.chunks)),
                None => decoder.finish(),
            };

            for payload in payloads {
                let event = parse_stream_event(&payload)
                    .map_err(|e| StreamError::new(e, summary.chunks))?;
                if let Some(reason) = event.finish_reason() {
                    summary.finish_reason = reason;
                }
                let text = event.text();
                if text.is_empty() {
                    continue;
                }

                let len = text.len();
                let chunk = StreamChunk {
                    text,
                    sequence_index: summary.chunks,
                };
                if chunk_tx.send(chunk).await.is_err() {
                    debug!("Chunk receiver dropped, stopping stream");
                    return Ok(summary);
                }
                summary.chunks += 1;
                summary.bytes += len;
            }

            if decoder.is_finished() {
                break;
            }
        }

        debug!(
            chunks = summary.chunks,
            bytes = summary.bytes,
            finish_reason = ?summary.finish_reason,
            "Stream complete"
        );
        Ok(summary)
    }

    fn provider_name(&self) -> &'static str {
        "gemini"
    }

    fn model_id(&self) -> &str {
        &self.settings.model
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    GatewayError::Unavailable(e.to_string())
}

/// Map an HTTP error status (and the API's error body) to a gateway error
fn classify_status(status: u16, body: &str) -> GatewayError {
    let (message, api_status) = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => (parsed.error.message, parsed.error.status.unwrap_or_default()),
        Err(_) => (body.trim().to_string(), String::new()),
    };

    match status {
        429 => GatewayError::QuotaExceeded(message),
        _ if api_status == "RESOURCE_EXHAUSTED" => GatewayError::QuotaExceeded(message),
        401 | 403 => GatewayError::InvalidCredential(message),
        400 if message.contains("API key") => GatewayError::InvalidCredential(message),
        408 | 500..=599 => GatewayError::Unavailable(format!("HTTP {status}: {message}")),
        _ => GatewayError::Rejected { status, message },
    }
}

/// One SSE `data:` payload. Mid-stream failures arrive as an `error` object.
fn parse_stream_event(payload: &str) -> Result<GenerateContentResponse, GatewayError> {
    if let Ok(api_error) = serde_json::from_str::<ApiErrorBody>(payload) {
        let status = api_error.error.code.unwrap_or(500);
        return Err(classify_status(status, payload));
    }
    serde_json::from_str(payload).map_err(|e| GatewayError::Unavailable(format!("Malformed stream event: {e}")))
}

/// Splits a byte stream into SSE `data` payloads.
///
/// Events are separated by a blank line; multiple `data:` lines of one
/// event are joined with newlines. Carriage returns are dropped.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend(bytes.iter().filter(|b| **b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.buffer.drain(..end + 2).collect();
            payloads.extend(Self::data_of(&event));
        }
        payloads
    }

    /// Flush a trailing event that was not followed by a blank line
    fn finish(&mut self) -> Vec<String> {
        self.finished = true;
        let event = std::mem::take(&mut self.buffer);
        Self::data_of(&event).into_iter().collect()
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn data_of(event: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(event);
        let data: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();
        if data.is_empty() {
            return None;
        }
        let joined = data.join("\n");
        (joined.trim() != "[DONE]").then_some(joined)
    }
}

// Gemini API types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
    response_schema: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

impl GenerateContentResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<FinishReason> {
        if self
            .prompt_feedback
            .as_ref()
            .is_some_and(|f| f.block_reason.is_some())
        {
            return Some(FinishReason::ContentFiltered);
        }
        self.candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .map(FinishReason::parse)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<u16>,
    message: String,
    status: Option<String>,
}
