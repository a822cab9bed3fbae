//! Adapter around the hosted model's streaming converse API.

use std::future::Future;
use std::pin::Pin;

use futures::stream::BoxStream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use termrelay_credentials::{CredentialVerifier, Credentials, SourceError, SourceFuture};
use termrelay_error::RelayError;
use thiserror::Error;
use utoipa::ToSchema;

mod event_stream;
mod http;
mod scripted;
pub mod sigv4;

pub use event_stream::{EventFrame, EventStreamDecoder};
pub use http::HttpModelClient;
pub use scripted::{ScriptedModelClient, StreamObserver};

pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Text deltas in arrival order. Ends after the first error.
pub type ChunkStream = BoxStream<'static, Result<String, UpstreamError>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConverseRequest {
    pub messages: Vec<ChatMessage>,
    pub system: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ConverseRequest {
    /// `system` messages become the system prompt list; everything else stays
    /// in the turn list in order.
    pub fn from_conversation(messages: Vec<ChatMessage>, max_tokens: u32, temperature: f32) -> Self {
        let (system, messages): (Vec<_>, Vec<_>) = messages
            .into_iter()
            .partition(|message| message.role == "system");
        Self {
            messages,
            system: system.into_iter().map(|message| message.content).collect(),
            max_tokens,
            temperature,
        }
    }

    pub fn to_body(&self) -> Value {
        let messages: Vec<Value> = self
            .messages
            .iter()
            .map(|message| json!({ "role": message.role, "content": [{ "text": message.content }] }))
            .collect();
        let mut body = json!({
            "messages": messages,
            "inferenceConfig": {
                "maxTokens": self.max_tokens,
                "temperature": self.temperature,
            },
        });
        if !self.system.is_empty() {
            body["system"] = self
                .system
                .iter()
                .map(|text| json!({ "text": text }))
                .collect();
        }
        body
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("{kind}: {message}")]
    Exception { kind: String, message: String },
    #[error("malformed event stream: {0}")]
    Decode(String),
    #[error("request signing failed: {0}")]
    Signing(String),
}

impl From<UpstreamError> for RelayError {
    fn from(value: UpstreamError) -> Self {
        RelayError::UpstreamStream {
            message: value.to_string(),
        }
    }
}

pub trait ModelClient: Send + Sync + 'static {
    /// Cheap authenticated call proving the credentials are accepted.
    fn verify<'a>(&'a self, credentials: &'a Credentials) -> ClientFuture<'a, Result<(), UpstreamError>>;

    fn converse_stream<'a>(
        &'a self,
        credentials: &'a Credentials,
        request: ConverseRequest,
    ) -> ClientFuture<'a, Result<ChunkStream, UpstreamError>>;
}

/// Lets the credential chain reject candidates the model refuses.
pub struct ModelVerifier<'a>(pub &'a dyn ModelClient);

impl CredentialVerifier for ModelVerifier<'_> {
    fn verify<'a>(&'a self, credentials: &'a Credentials) -> SourceFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            self.0.verify(credentials).await.map_err(|err| match err {
                UpstreamError::Request(message) => SourceError::Unavailable(message),
                other => SourceError::Invalid(other.to_string()),
            })
        })
    }
}
