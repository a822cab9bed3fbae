//! Forwards model output to an HTTP client as it arrives.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use termrelay_credentials::CredentialChain;
use termrelay_error::RelayError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{InvokeMode, RelayConfig};
use crate::model_client::{
    ChatMessage, ChunkStream, ConverseRequest, ModelClient, ModelVerifier, UpstreamError,
};

const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamChunk {
    pub sequence: u64,
    pub text: String,
    pub is_final: bool,
    /// Set only on a final chunk produced by an upstream failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    /// `data:` payload for this chunk: a delta object, `[DONE]` or `[ERROR]`.
    pub fn to_sse_data(&self) -> String {
        match (&self.error, self.is_final) {
            (Some(_), _) => "[ERROR]".to_string(),
            (None, true) => "[DONE]".to_string(),
            (None, false) => {
                json!({ "choices": [{ "delta": { "content": self.text } }] }).to_string()
            }
        }
    }

    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_sse_data())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub invoke_mode: InvokeMode,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            invoke_mode: config.invoke_mode,
        }
    }
}

/// One pump task per request, connected to the client by a bounded channel.
#[derive(Clone)]
pub struct StreamingRelay {
    client: Arc<dyn ModelClient>,
    credentials: Arc<CredentialChain>,
    settings: RelaySettings,
}

impl std::fmt::Debug for StreamingRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRelay")
            .field("credentials", &self.credentials)
            .field("settings", &self.settings)
            .finish()
    }
}

impl StreamingRelay {
    pub fn new(
        client: Arc<dyn ModelClient>,
        credentials: Arc<CredentialChain>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            client,
            credentials,
            settings,
        }
    }

    pub fn invoke_mode(&self) -> InvokeMode {
        self.settings.invoke_mode
    }

    pub fn credentials(&self) -> &CredentialChain {
        &self.credentials
    }

    /// Resolve credentials, open the upstream stream and start forwarding.
    /// Credential failure is returned before anything is produced; any later
    /// failure arrives as the final chunk.
    pub async fn stream(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<ReceiverStream<StreamChunk>, RelayError> {
        let verifier = ModelVerifier(self.client.as_ref());
        let credentials = self.credentials.resolve(&verifier).await?;
        let request = ConverseRequest::from_conversation(
            messages,
            self.settings.max_tokens,
            self.settings.temperature,
        );
        let upstream = self.client.converse_stream(&credentials, request).await;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(upstream, tx));
        Ok(ReceiverStream::new(rx))
    }

    /// Same frames as the streamed body, joined into one buffer.
    pub async fn collect(&self, messages: Vec<ChatMessage>) -> Result<String, RelayError> {
        let chunks = self.stream(messages).await?;
        Ok(chunks
            .map(|chunk| chunk.to_sse_frame())
            .collect::<Vec<_>>()
            .await
            .concat())
    }
}

async fn pump(upstream: Result<ChunkStream, UpstreamError>, tx: mpsc::Sender<StreamChunk>) {
    let mut sequence = 0u64;
    let mut upstream = match upstream {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::warn!(error = %err, "upstream stream failed to open");
            let _ = tx.send(error_chunk(sequence, err)).await;
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                cancelled(sequence);
                return;
            }
            next = upstream.next() => next,
        };
        let chunk = match next {
            Some(Ok(text)) if text.is_empty() => continue,
            Some(Ok(text)) => StreamChunk {
                sequence,
                text,
                is_final: false,
                error: None,
            },
            Some(Err(err)) => {
                tracing::warn!(error = %err, sequence, "upstream stream failed");
                let _ = tx.send(error_chunk(sequence, err)).await;
                return;
            }
            None => {
                let _ = tx
                    .send(StreamChunk {
                        sequence,
                        text: String::new(),
                        is_final: true,
                        error: None,
                    })
                    .await;
                tracing::debug!(chunks = sequence, "upstream stream completed");
                return;
            }
        };
        if tx.send(chunk).await.is_err() {
            cancelled(sequence);
            return;
        }
        sequence += 1;
    }
}

fn error_chunk(sequence: u64, err: UpstreamError) -> StreamChunk {
    let err = RelayError::from(err);
    StreamChunk {
        sequence,
        text: String::new(),
        is_final: true,
        error: Some(err.to_string()),
    }
}

fn cancelled(sequence: u64) {
    tracing::debug!(
        error = %RelayError::TransportCancelled,
        sequence,
        "client went away, dropping upstream stream"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use termrelay_credentials::StaticSource;

    use super::*;
    use crate::model_client::ScriptedModelClient;

    fn relay(client: ScriptedModelClient) -> (StreamingRelay, Arc<ScriptedModelClient>) {
        let client = Arc::new(client);
        let chain = CredentialChain::new().with_source(StaticSource::new("AKIDEXAMPLE", "secret"));
        let relay = StreamingRelay::new(
            client.clone(),
            Arc::new(chain),
            RelaySettings {
                max_tokens: 1024,
                temperature: 0.9,
                invoke_mode: InvokeMode::ResponseStream,
            },
        );
        (relay, client)
    }

    fn user(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::new("user", text)]
    }

    #[tokio::test]
    async fn forwards_chunks_in_order_then_finishes() {
        let (relay, _) = relay(ScriptedModelClient::new(["Hel", "lo, ", "world"]));
        let chunks: Vec<_> = relay.stream(user("hi")).await.expect("stream").collect().await;

        let texts: String = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
        assert_eq!(texts, "Hello, world");
        let sequences: Vec<_> = chunks.iter().map(|chunk| chunk.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        let last = chunks.last().expect("final chunk");
        assert!(last.is_final);
        assert!(last.text.is_empty());
        assert_eq!(last.error, None);
    }

    #[tokio::test]
    async fn upstream_failure_ends_with_an_error_chunk() {
        let (relay, _) = relay(ScriptedModelClient::new(["a", "b"]).failing_after(1, "throttled"));
        let chunks: Vec<_> = relay.stream(user("hi")).await.expect("stream").collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].to_sse_frame(), "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n");
        assert!(chunks[1].is_final);
        assert_eq!(chunks[1].to_sse_frame(), "data: [ERROR]\n\n");
        let error = chunks[1].error.as_deref().unwrap_or_default();
        assert!(error.starts_with("upstream stream error: "), "{error}");
        assert!(error.contains("throttled"), "{error}");
    }

    #[tokio::test]
    async fn open_failure_is_reported_as_a_chunk() {
        let (relay, _) = relay(ScriptedModelClient::new(["a"]).failing_to_open("down"));
        let body = relay.collect(user("hi")).await.expect("credentials resolve");
        assert_eq!(body, "data: [ERROR]\n\n");
    }

    #[tokio::test]
    async fn dropping_the_receiver_cancels_the_upstream() {
        let (relay, client) = relay(
            ScriptedModelClient::new(["tick"])
                .endless()
                .with_chunk_delay(Duration::from_millis(5)),
        );
        let mut chunks = relay.stream(user("hi")).await.expect("stream");
        chunks.next().await.expect("first chunk");
        chunks.next().await.expect("second chunk");
        drop(chunks);

        tokio::time::timeout(Duration::from_secs(5), client.observer().wait_cancelled())
            .await
            .expect("upstream dropped after disconnect");
        assert!(client.observer().delivered() < 1000);
    }

    #[tokio::test]
    async fn credentials_resolve_once_across_requests() {
        let (relay, client) = relay(ScriptedModelClient::new(["x"]));
        for _ in 0..3 {
            relay.collect(user("hi")).await.expect("relay");
        }
        assert_eq!(client.verify_calls(), 1);
        assert_eq!(client.requests().len(), 3);
    }
}
