//! Error taxonomy for the extraction pipeline
//!
//! Gateway errors travel through a session untouched and end up in an
//! `error` event. Parse-layer failures never escape the session; they only
//! decide between `complete` and `error`.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::plan::PartialPlanSnapshot;

/// Failures raised by a model gateway.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("No model credential configured")]
    ConfigMissing,

    #[error("Model credential rejected: {0}")]
    InvalidCredential(String),

    #[error("Model service unavailable: {0}")]
    Unavailable(String),

    #[error("Model quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Model rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Where a model call was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum FailurePoint {
    /// Non-streaming request
    Request,
    /// Streaming request, nothing received yet
    BeforeFirstChunk,
    /// Streaming request, some chunks were already delivered
    MidStream { chunks_received: usize },
}

impl FailurePoint {
    pub fn after_chunks(chunks_received: usize) -> Self {
        if chunks_received == 0 {
            Self::BeforeFirstChunk
        } else {
            Self::MidStream { chunks_received }
        }
    }
}

/// A gateway failure during a streaming call, tagged with how far it got.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error}")]
pub struct StreamError {
    pub error: GatewayError,
    pub point: FailurePoint,
}

impl StreamError {
    pub fn new(error: GatewayError, chunks_received: usize) -> Self {
        Self {
            error,
            point: FailurePoint::after_chunks(chunks_received),
        }
    }
}

/// Structural repair could not make the buffer parse.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Model output is not repairable JSON: {reason}")]
pub struct UnrepairableJson {
    pub reason: String,
    /// The buffer as received, before any repair attempt
    pub buffer: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    /// None of the known plan shapes were found. The raw output is kept for inspection.
    #[error("Unrecognized plan shape: expected phases, taches or sections")]
    UnrecognizedPlanShape { raw: serde_json::Value },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Plan not found: {0}")]
    NotFound(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored plan is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Misuse of a session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session already left the idle state ({state}); start a new session")]
    NotIdle { state: crate::session::SessionState },
}

/// Errors a session or pipeline reports to its caller.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("{source}")]
    Model {
        source: GatewayError,
        point: FailurePoint,
    },

    #[error("Model did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Unrepairable(#[from] UnrepairableJson),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("Could not save plan: {0}")]
    Store(String),
}

impl From<StreamError> for ExtractionError {
    fn from(err: StreamError) -> Self {
        Self::Model {
            source: err.error,
            point: err.point,
        }
    }
}

impl From<StoreError> for ExtractionError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

/// What a user can do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remedy {
    ConfigureCredentials,
    Retry,
    WaitOrUpgradePlan,
    CheckDocument,
}

impl ExtractionError {
    pub fn model(source: GatewayError) -> Self {
        Self::Model {
            source,
            point: FailurePoint::Request,
        }
    }

    /// Stable snake_case code for callers to match on.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Model { source, .. } => match source {
                GatewayError::ConfigMissing => "model_config_missing",
                GatewayError::InvalidCredential(_) => "model_credential_invalid",
                GatewayError::Unavailable(_) => "model_unavailable",
                GatewayError::QuotaExceeded(_) => "model_quota_exceeded",
                GatewayError::Rejected { .. } => "model_request_rejected",
            },
            Self::Timeout(_) => "timeout",
            Self::Unrepairable(_) => "unrepairable_json",
            Self::Reconcile(ReconcileError::UnrecognizedPlanShape { .. }) => {
                "unrecognized_plan_shape"
            }
            Self::Store(_) => "store_failed",
        }
    }

    pub fn remedy(&self) -> Remedy {
        match self {
            Self::Model { source, .. } => match source {
                GatewayError::ConfigMissing | GatewayError::InvalidCredential(_) => {
                    Remedy::ConfigureCredentials
                }
                GatewayError::QuotaExceeded(_) => Remedy::WaitOrUpgradePlan,
                GatewayError::Unavailable(_) => Remedy::Retry,
                GatewayError::Rejected { .. } => Remedy::CheckDocument,
            },
            Self::Timeout(_) | Self::Store(_) => Remedy::Retry,
            Self::Unrepairable(_) | Self::Reconcile(_) => Remedy::Retry,
        }
    }

    /// Human-readable next step, distinguishing configuration, transient and quota problems.
    pub fn user_hint(&self) -> &'static str {
        match self.remedy() {
            Remedy::ConfigureCredentials => {
                "Configure the model API key in settings, then start the extraction again."
            }
            Remedy::WaitOrUpgradePlan => {
                "The model quota is exhausted. Wait for it to reset or upgrade the billing plan."
            }
            Remedy::CheckDocument => {
                "The model refused this document. Check that it is a readable quote and retry."
            }
            Remedy::Retry => "This is usually temporary. Retry the extraction.",
        }
    }

    /// Whether running the whole extraction again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Model { source, .. } => matches!(source, GatewayError::Unavailable(_)),
            Self::Timeout(_) | Self::Unrepairable(_) | Self::Store(_) => true,
            Self::Reconcile(_) => false,
        }
    }
}

/// Payload of an `error` event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    pub hint: &'static str,
    pub remedy: Remedy,
    pub retryable: bool,
    /// Best knowledge recovered before the failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_snapshot: Option<PartialPlanSnapshot>,
    /// The original cause
    #[serde(skip)]
    pub cause: ExtractionError,
}

impl ErrorReport {
    pub fn new(cause: ExtractionError, partial_snapshot: Option<PartialPlanSnapshot>) -> Self {
        Self {
            kind: cause.kind(),
            message: cause.to_string(),
            hint: cause.user_hint(),
            remedy: cause.remedy(),
            retryable: cause.is_retryable(),
            partial_snapshot,
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hints_distinguish_config_transient_and_quota() {
        let config = ExtractionError::model(GatewayError::ConfigMissing);
        let transient = ExtractionError::model(GatewayError::Unavailable("503".into()));
        let quota = ExtractionError::model(GatewayError::QuotaExceeded("429".into()));

        assert!(config.user_hint().contains("API key"));
        assert!(transient.user_hint().contains("Retry"));
        assert!(quota.user_hint().contains("upgrade"));

        assert!(!config.is_retryable());
        assert!(transient.is_retryable());
        assert!(!quota.is_retryable());
    }

    #[test]
    fn test_failure_point_from_chunk_count() {
        assert_eq!(FailurePoint::after_chunks(0), FailurePoint::BeforeFirstChunk);
        assert_eq!(
            FailurePoint::after_chunks(3),
            FailurePoint::MidStream { chunks_received: 3 }
        );
    }

    #[test]
    fn test_stream_error_keeps_point() {
        let err: ExtractionError =
            StreamError::new(GatewayError::Unavailable("reset".into()), 2).into();
        match err {
            ExtractionError::Model { point, .. } => {
                assert_eq!(point, FailurePoint::MidStream { chunks_received: 2 })
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_report_serialization() {
        let report = ErrorReport::new(ExtractionError::Timeout(Duration::from_secs(30)), None);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["remedy"], "retry");
        assert_eq!(value["retryable"], true);
        assert!(value.get("cause").is_none());
        assert!(value["message"].as_str().unwrap().contains("30s"));
    }
}
