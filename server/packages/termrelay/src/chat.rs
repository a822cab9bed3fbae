//! The chat program: runs inside the sandbox and talks to the relay.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use termrelay_protocol::OutputRole;
use termrelay_sandbox::{ExecutionError, GuestIo, InitError, Interpreter, InterpreterFuture};
use thiserror::Error;

use crate::health::{health_client, health_url, probe_health};
use crate::model_client::ChatMessage;

pub const GREETING_REQUEST: &str = "\n\nIntroduce yourself to me in fewer than 150 words.";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const PROMPT: &str = ">>> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Error,
}

/// Incremental parser for `data:` lines that may be split across reads,
/// including in the middle of a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDeltaDecoder {
    buffer: Vec<u8>,
}

impl SseDeltaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(&['\n', '\r'][..]);
            if let Some(data) = line.strip_prefix("data:") {
                if let Some(event) = parse_data(data.trim()) {
                    events.push(event);
                }
            }
        }
        events
    }
}

fn parse_data(data: &str) -> Option<SseEvent> {
    match data {
        "[DONE]" => Some(SseEvent::Done),
        "[ERROR]" => Some(SseEvent::Error),
        _ => {
            let value: Value = match serde_json::from_str(data) {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping malformed sse data");
                    return None;
                }
            };
            value
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .filter(|content| !content.is_empty())
                .map(|content| SseEvent::Delta(content.to_string()))
        }
    }
}

/// In-memory history sent with every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    system_prompt: String,
    messages: Vec<ChatMessage>,
}

impl Conversation {
    /// Starts with the system prompt plus the greeting request as the first
    /// user turn.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        let opening = ChatMessage::new("user", format!("{system_prompt}{GREETING_REQUEST}"));
        Self {
            system_prompt,
            messages: vec![opening],
        }
    }

    /// Drop the greeting request from the first turn once it was answered.
    pub fn reset_system_prompt(&mut self) {
        if let Some(first) = self.messages.first_mut() {
            first.content = self.system_prompt.clone();
        }
    }

    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {detail}")]
    Status { status: u16, detail: String },
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub probe_attempts: u32,
    pub probe_backoff: Duration,
    /// Probe the relay's health in `prepare`. Off when the caller has
    /// already done so.
    pub probe_on_prepare: bool,
}

impl ChatOptions {
    /// Options for a relay the caller has just found healthy.
    pub fn probed() -> Self {
        Self {
            probe_on_prepare: false,
            ..Self::default()
        }
    }
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            probe_attempts: 10,
            probe_backoff: Duration::from_millis(500),
            probe_on_prepare: true,
        }
    }
}

/// Interpreter whose `run-code` payload is a system prompt. Greets, then
/// answers each `>>> ` line through the relay until `exit`.
#[derive(Debug, Clone)]
pub struct ChatInterpreter {
    client: reqwest::Client,
    base_url: String,
    options: ChatOptions,
}

impl ChatInterpreter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_options(base_url, ChatOptions::default())
    }

    pub fn with_options(base_url: impl Into<String>, options: ChatOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            options,
        }
    }

    async fn stream_reply(
        &self,
        conversation: &mut Conversation,
        io: &GuestIo,
    ) -> Result<(), ChatError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&json!({ "messages": conversation.messages() }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|value| value.get("detail").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(body);
            return Err(ChatError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        let mut decoder = SseDeltaDecoder::new();
        let mut body = response.bytes_stream();
        let mut reply = String::new();
        let mut first_chunk = true;
        while let Some(bytes) = body.next().await {
            for event in decoder.push(&bytes?) {
                match event {
                    SseEvent::Delta(content) => {
                        reply.push_str(&content);
                        let shown = if first_chunk {
                            first_chunk = false;
                            content.trim_start()
                        } else {
                            content.as_str()
                        };
                        io.write_stdout_as(OutputRole::Assistant, shown);
                    }
                    SseEvent::Done => conversation.push("assistant", std::mem::take(&mut reply)),
                    SseEvent::Error => io.write_stderr("\n[the model stream failed]\n"),
                }
            }
        }
        io.write_stdout("\n\n");
        Ok(())
    }
}

impl Interpreter for ChatInterpreter {
    fn name(&self) -> &str {
        "chat"
    }

    fn prepare(&self) -> InterpreterFuture<'_, Result<(), InitError>> {
        Box::pin(async move {
            if !self.options.probe_on_prepare {
                tracing::debug!(url = %self.base_url, "relay already probed");
                return Ok(());
            }
            let client = health_client();
            probe_health(
                &client,
                &health_url(&self.base_url),
                self.options.probe_attempts,
                self.options.probe_backoff,
            )
            .await
            .map(|_| ())
            .map_err(|err| InitError::Runtime {
                message: err.to_string(),
                trace: None,
            })
        })
    }

    fn install<'a>(&'a self, dependency: &'a str) -> InterpreterFuture<'a, Result<(), InitError>> {
        Box::pin(async move {
            tracing::debug!(dependency, "chat program has nothing to install");
            Ok(())
        })
    }

    fn execute(&self, code: String, io: GuestIo) -> InterpreterFuture<'_, Result<Value, ExecutionError>> {
        Box::pin(async move {
            let prompt = match code.trim() {
                "" => DEFAULT_SYSTEM_PROMPT,
                prompt => prompt,
            };
            let mut conversation = Conversation::new(prompt);

            io.write_stdout("\n");
            if let Err(err) = self.stream_reply(&mut conversation, &io).await {
                return Err(ExecutionError::raised(format!(
                    "Error during initial system prompt: {err}"
                )));
            }
            conversation.reset_system_prompt();

            loop {
                let line = io.input(PROMPT).await?;
                io.write_stdout("\n");
                if line.trim().eq_ignore_ascii_case("exit") {
                    io.write_stdout("Goodbye!\n");
                    break;
                }
                conversation.push("user", line);
                if let Err(err) = self.stream_reply(&mut conversation, &io).await {
                    tracing::warn!(error = %err, "chat turn failed");
                    io.write_stderr(format!("\nError: {err}\n"));
                }
            }
            Ok(Value::Null)
        })
    }
}
