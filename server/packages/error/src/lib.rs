use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    UnsupportedMediaType,
    NotFound,
    InitializationFault,
    ExecutionFault,
    CorrelationMismatch,
    CredentialResolution,
    UpstreamStream,
    TransportCancelled,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:termrelay:error:invalid_request",
            Self::UnsupportedMediaType => "urn:termrelay:error:unsupported_media_type",
            Self::NotFound => "urn:termrelay:error:not_found",
            Self::InitializationFault => "urn:termrelay:error:initialization_fault",
            Self::ExecutionFault => "urn:termrelay:error:execution_fault",
            Self::CorrelationMismatch => "urn:termrelay:error:correlation_mismatch",
            Self::CredentialResolution => "urn:termrelay:error:credential_resolution",
            Self::UpstreamStream => "urn:termrelay:error:upstream_stream",
            Self::TransportCancelled => "urn:termrelay:error:transport_cancelled",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::NotFound => "Not Found",
            Self::InitializationFault => "Initialization Fault",
            Self::ExecutionFault => "Execution Fault",
            Self::CorrelationMismatch => "Correlation Mismatch",
            Self::CredentialResolution => "Credential Resolution Failed",
            Self::UpstreamStream => "Upstream Stream Error",
            Self::TransportCancelled => "Transport Cancelled",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnsupportedMediaType => 415,
            Self::NotFound => 404,
            Self::InitializationFault => 500,
            Self::ExecutionFault => 500,
            Self::CorrelationMismatch => 409,
            Self::CredentialResolution => 502,
            Self::UpstreamStream => 502,
            // Client went away; nobody reads this status, nginx uses 499 for the same case.
            Self::TransportCancelled => 499,
        }
    }

    /// Whether the failure ends the sandbox session rather than a single run.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::InitializationFault)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// One failed attempt of the credential fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct CredentialAttempt {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unsupported media type: {message}")]
    UnsupportedMediaType { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("sandbox initialization failed: {message}")]
    InitializationFault {
        message: String,
        trace: Option<String>,
    },
    #[error("execution failed: {message}")]
    ExecutionFault {
        message: String,
        trace: Option<String>,
    },
    #[error("no pending request for correlation id {id}")]
    CorrelationMismatch { id: u64 },
    #[error("credential resolution failed after {} attempt(s)", attempts.len())]
    CredentialResolution { attempts: Vec<CredentialAttempt> },
    #[error("upstream stream error: {message}")]
    UpstreamStream { message: String },
    #[error("client disconnected")]
    TransportCancelled,
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::UnsupportedMediaType { .. } => ErrorType::UnsupportedMediaType,
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::InitializationFault { .. } => ErrorType::InitializationFault,
            Self::ExecutionFault { .. } => ErrorType::ExecutionFault,
            Self::CorrelationMismatch { .. } => ErrorType::CorrelationMismatch,
            Self::CredentialResolution { .. } => ErrorType::CredentialResolution,
            Self::UpstreamStream { .. } => ErrorType::UpstreamStream,
            Self::TransportCancelled => ErrorType::TransportCancelled,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::InitializationFault {
                trace: Some(trace), ..
            }
            | Self::ExecutionFault {
                trace: Some(trace), ..
            } => {
                let mut map = Map::new();
                map.insert("trace".to_string(), Value::String(trace.clone()));
                Some(Value::Object(map))
            }
            Self::CorrelationMismatch { id } => {
                let mut map = Map::new();
                map.insert("id".to_string(), Value::Number((*id).into()));
                Some(Value::Object(map))
            }
            Self::CredentialResolution { attempts } => {
                let mut map = Map::new();
                map.insert(
                    "attempts".to_string(),
                    serde_json::to_value(attempts).unwrap_or(Value::Null),
                );
                Some(Value::Object(map))
            }
            _ => None,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        if let Some(details) = self.details() {
            problem.extensions.insert("details".to_string(), details);
        }
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}
