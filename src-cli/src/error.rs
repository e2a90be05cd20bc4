//! Command error types for the CLI
//!
//! Provides structured errors that serialize to `{"code": "...", "message": "..."}`
//! so a caller reading the NDJSON output can match on them.

use plandent_core::error::StoreError;
use plandent_core::ExtractionError;
use serde::Serialize;

/// Errors returned by CLI commands
///
/// Each variant serializes with a snake_case `code` field.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum CliError {
    // Validation errors
    InvalidInput { message: String },

    // Not found errors
    PlanNotFound { message: String, plan_id: String },

    // Extraction errors, with the core's stable kind and remedy text
    ExtractionFailed {
        message: String,
        kind: String,
        hint: String,
        retryable: bool,
    },

    // Operation errors
    StorageError { message: String },
    InternalError { message: String },
}

impl CliError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn plan_not_found(plan_id: impl Into<String>) -> Self {
        let plan_id = plan_id.into();
        Self::PlanNotFound {
            message: format!("Plan not found: {}", plan_id),
            plan_id,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput { .. } | Self::PlanNotFound { .. } => 2,
            Self::ExtractionFailed { .. } => 3,
            Self::StorageError { .. } | Self::InternalError { .. } => 1,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "{}", message),
            Self::PlanNotFound { message, .. } => write!(f, "{}", message),
            Self::ExtractionFailed { message, hint, .. } => write!(f, "{} ({})", message, hint),
            Self::StorageError { message } => write!(f, "{}", message),
            Self::InternalError { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for CliError {}

impl From<ExtractionError> for CliError {
    fn from(err: ExtractionError) -> Self {
        Self::ExtractionFailed {
            message: err.to_string(),
            kind: err.kind().to_string(),
            hint: err.user_hint().to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::plan_not_found(id),
            other => Self::storage(other.to_string()),
        }
    }
}

// Conversion from anyhow::Error (used by plandent-core for file and config loading)
impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

/// Result type alias for commands
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;
    use plandent_core::GatewayError;

    #[test]
    fn test_extraction_error_keeps_kind_and_hint() {
        let err: CliError = ExtractionError::model(GatewayError::QuotaExceeded("429".into())).into();
        let value = serde_json::to_value(&err).unwrap();

        assert_eq!(value["code"], "extraction_failed");
        assert_eq!(value["kind"], "model_quota_exceeded");
        assert_eq!(value["retryable"], false);
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_store_not_found_maps_to_plan_not_found() {
        let err: CliError = StoreError::NotFound("abc".to_string()).into();
        assert!(matches!(err, CliError::PlanNotFound { ref plan_id, .. } if plan_id == "abc"));
        assert_eq!(err.to_string(), "Plan not found: abc");
    }
}
