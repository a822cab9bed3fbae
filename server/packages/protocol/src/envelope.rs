use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::correlation::CorrelationId;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown envelope kind `{0}`")]
    UnknownKind(String),
    #[error("envelope is missing a `kind` string")]
    MissingKind,
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("`{kind}` envelope requires a correlation id")]
    MissingId { kind: EnvelopeKind },
    #[error("`{kind}` envelope requires payload field `{field}`")]
    MissingField {
        kind: EnvelopeKind,
        field: &'static str,
    },
    #[error("failed to write envelope: {0}")]
    Io(#[from] std::io::Error),
}

/// The closed set of messages that may cross the sandbox boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    Load,
    Loaded,
    RunCode,
    #[serde(alias = "python-ready")]
    CodeResult,
    WriteOutput,
    WriteError,
    InputRequest,
    InputResponse,
    LoadDependency,
    DependencyLoaded,
    Fault,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 11] = [
        EnvelopeKind::Load,
        EnvelopeKind::Loaded,
        EnvelopeKind::RunCode,
        EnvelopeKind::CodeResult,
        EnvelopeKind::WriteOutput,
        EnvelopeKind::WriteError,
        EnvelopeKind::InputRequest,
        EnvelopeKind::InputResponse,
        EnvelopeKind::LoadDependency,
        EnvelopeKind::DependencyLoaded,
        EnvelopeKind::Fault,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Load => "load",
            EnvelopeKind::Loaded => "loaded",
            EnvelopeKind::RunCode => "run-code",
            EnvelopeKind::CodeResult => "code-result",
            EnvelopeKind::WriteOutput => "write-output",
            EnvelopeKind::WriteError => "write-error",
            EnvelopeKind::InputRequest => "input-request",
            EnvelopeKind::InputResponse => "input-response",
            EnvelopeKind::LoadDependency => "load-dependency",
            EnvelopeKind::DependencyLoaded => "dependency-loaded",
            EnvelopeKind::Fault => "fault",
        }
    }

    /// Kinds that only make sense with a correlation id attached.
    pub fn requires_id(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::InputRequest | EnvelopeKind::InputResponse
        )
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "python-ready" {
            return Ok(EnvelopeKind::CodeResult);
        }
        EnvelopeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| ProtocolError::UnknownKind(value.to_string()))
    }
}

/// Who a `write-output` line speaks for. The terminal picks the look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputRole {
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            payload: Map::new(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn load(id: CorrelationId) -> Self {
        Self::new(EnvelopeKind::Load).with_id(id)
    }

    pub fn loaded(id: Option<CorrelationId>) -> Self {
        let envelope = Self::new(EnvelopeKind::Loaded);
        match id {
            Some(id) => envelope.with_id(id),
            None => envelope,
        }
    }

    pub fn run_code(id: CorrelationId, code: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::RunCode)
            .with_id(id)
            .with_field("code", code.into())
    }

    pub fn code_result(id: Option<CorrelationId>, ok: bool, value: Value) -> Self {
        let envelope = Self::new(EnvelopeKind::CodeResult)
            .with_field("ok", ok)
            .with_field("value", value);
        match id {
            Some(id) => envelope.with_id(id),
            None => envelope,
        }
    }

    pub fn write_output(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::WriteOutput).with_field("text", text.into())
    }

    pub fn write_output_as(role: OutputRole, text: impl Into<String>) -> Self {
        let envelope = Self::write_output(text);
        match serde_json::to_value(role) {
            Ok(role) => envelope.with_field("role", role),
            Err(_) => envelope,
        }
    }

    pub fn write_error(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::WriteError).with_field("text", text.into())
    }

    pub fn input_request(id: CorrelationId, prompt: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::InputRequest)
            .with_id(id)
            .with_field("prompt", prompt.into())
    }

    pub fn input_response(id: CorrelationId, value: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::InputResponse)
            .with_id(id)
            .with_field("value", value.into())
    }

    pub fn load_dependency(id: CorrelationId, name: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::LoadDependency)
            .with_id(id)
            .with_field("name", name.into())
    }

    pub fn dependency_loaded(id: Option<CorrelationId>, name: impl Into<String>) -> Self {
        let envelope = Self::new(EnvelopeKind::DependencyLoaded).with_field("name", name.into());
        match id {
            Some(id) => envelope.with_id(id),
            None => envelope,
        }
    }

    pub fn fault(message: impl Into<String>, trace: Option<String>) -> Self {
        let envelope = Self::new(EnvelopeKind::Fault).with_field("message", message.into());
        match trace {
            Some(trace) => envelope.with_field("trace", trace),
            None => envelope,
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Text carried by `write-output` / `write-error`.
    pub fn text(&self) -> Option<&str> {
        self.str_field("text")
    }

    pub fn role(&self) -> Option<OutputRole> {
        self.payload
            .get("role")
            .and_then(|role| OutputRole::deserialize(role).ok())
    }

    pub fn prompt(&self) -> Option<&str> {
        self.str_field("prompt")
    }

    pub fn value(&self) -> Option<&str> {
        self.str_field("value")
    }

    pub fn code(&self) -> Option<&str> {
        self.str_field("code")
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    pub fn message(&self) -> Option<&str> {
        self.str_field("message")
    }

    pub fn trace(&self) -> Option<&str> {
        self.str_field("trace")
    }

    /// `code-result` success flag; results without the flag count as success.
    pub fn ok(&self) -> bool {
        self.payload
            .get("ok")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Parse one envelope. Unknown kinds are rejected before any field is
    /// interpreted so they can never reach a handler.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let raw: Value = serde_json::from_str(line)?;
        let kind = raw
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingKind)?;
        EnvelopeKind::from_str(kind)?;
        let envelope: Envelope = serde_json::from_value(raw)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.kind.requires_id() && self.id.is_none() {
            return Err(ProtocolError::MissingId { kind: self.kind });
        }
        let required: &[&'static str] = match self.kind {
            EnvelopeKind::InputRequest => &["prompt"],
            EnvelopeKind::InputResponse => &["value"],
            EnvelopeKind::RunCode => &["code"],
            EnvelopeKind::WriteOutput | EnvelopeKind::WriteError => &["text"],
            EnvelopeKind::LoadDependency => &["name"],
            EnvelopeKind::Fault => &["message"],
            _ => &[],
        };
        for &field in required {
            if self.str_field(field).is_none() {
                return Err(ProtocolError::MissingField {
                    kind: self.kind,
                    field,
                });
            }
        }
        Ok(())
    }
}
