use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream;
use futures::StreamExt;
use termrelay_credentials::Credentials;
use tokio::sync::Notify;

use super::{ChunkStream, ClientFuture, ConverseRequest, ModelClient, UpstreamError};

/// Watches the streams a [`ScriptedModelClient`] hands out.
#[derive(Debug, Clone, Default)]
pub struct StreamObserver {
    inner: Arc<ObserverState>,
}

#[derive(Debug, Default)]
struct ObserverState {
    opened: AtomicUsize,
    delivered: AtomicUsize,
    cancelled: AtomicBool,
    notify: Notify,
}

impl StreamObserver {
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> usize {
        self.inner.delivered.load(Ordering::SeqCst)
    }

    /// A stream was dropped before it ran to completion.
    pub fn cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn wait_cancelled(&self) {
        while !self.cancelled() {
            self.inner.notify.notified().await;
        }
    }
}

struct PlaybackGuard {
    observer: StreamObserver,
    completed: bool,
}

impl Drop for PlaybackGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.observer.inner.cancelled.store(true, Ordering::SeqCst);
            self.observer.inner.notify.notify_one();
        }
    }
}

struct Playback {
    chunks: Vec<String>,
    endless: bool,
    index: usize,
    fail_after: Option<(usize, String)>,
    delay: Duration,
    guard: PlaybackGuard,
    done: bool,
}

/// Model stand-in that plays back configured chunks. Used by tests and by
/// `termrelay server --mock`.
#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    chunks: Vec<String>,
    echo: bool,
    endless: bool,
    fail_after: Option<(usize, String)>,
    open_failure: Option<String>,
    chunk_delay: Duration,
    rejected_keys: HashSet<String>,
    verify_calls: AtomicUsize,
    requests: Mutex<Vec<ConverseRequest>>,
    observer: StreamObserver,
}

impl ScriptedModelClient {
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Replies by repeating the last user message back word by word.
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// Cycle through the chunks until the stream is dropped.
    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    /// Fail with an upstream exception once `count` chunks were delivered.
    pub fn failing_after(mut self, count: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((count, message.into()));
        self
    }

    pub fn failing_to_open(mut self, message: impl Into<String>) -> Self {
        self.open_failure = Some(message.into());
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// `verify` refuses credentials with this access key id.
    pub fn rejecting(mut self, access_key_id: impl Into<String>) -> Self {
        self.rejected_keys.insert(access_key_id.into());
        self
    }

    pub fn observer(&self) -> StreamObserver {
        self.observer.clone()
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ConverseRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn echo_chunks(request: &ConverseRequest) -> Vec<String> {
        let last = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.as_str())
            .unwrap_or_default();
        let mut chunks = vec!["You said:".to_string()];
        chunks.extend(last.split_whitespace().map(|word| format!(" {word}")));
        chunks
    }
}

impl ModelClient for ScriptedModelClient {
    fn verify<'a>(&'a self, credentials: &'a Credentials) -> ClientFuture<'a, Result<(), UpstreamError>> {
        Box::pin(async move {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            if self.rejected_keys.contains(&credentials.access_key_id) {
                return Err(UpstreamError::Status {
                    status: 403,
                    body: "UnrecognizedClientException".to_string(),
                });
            }
            Ok(())
        })
    }

    fn converse_stream<'a>(
        &'a self,
        _credentials: &'a Credentials,
        request: ConverseRequest,
    ) -> ClientFuture<'a, Result<ChunkStream, UpstreamError>> {
        Box::pin(async move {
            let chunks = if self.echo {
                Self::echo_chunks(&request)
            } else {
                self.chunks.clone()
            };
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request);
            }
            if let Some(message) = &self.open_failure {
                return Err(UpstreamError::Exception {
                    kind: "serviceUnavailableException".to_string(),
                    message: message.clone(),
                });
            }

            self.observer.inner.opened.fetch_add(1, Ordering::SeqCst);
            let playback = Playback {
                chunks,
                endless: self.endless,
                index: 0,
                fail_after: self.fail_after.clone(),
                delay: self.chunk_delay,
                guard: PlaybackGuard {
                    observer: self.observer.clone(),
                    completed: false,
                },
                done: false,
            };
            let chunks: ChunkStream = stream::unfold(playback, |mut playback| async move {
                if playback.done {
                    return None;
                }
                if let Some((after, message)) = &playback.fail_after {
                    if playback.index == *after {
                        let err = UpstreamError::Exception {
                            kind: "modelStreamErrorException".to_string(),
                            message: message.clone(),
                        };
                        playback.done = true;
                        playback.guard.completed = true;
                        return Some((Err(err), playback));
                    }
                }
                let next = if playback.endless && !playback.chunks.is_empty() {
                    Some(playback.chunks[playback.index % playback.chunks.len()].clone())
                } else {
                    playback.chunks.get(playback.index).cloned()
                };
                let Some(text) = next else {
                    playback.guard.completed = true;
                    return None;
                };
                if !playback.delay.is_zero() {
                    tokio::time::sleep(playback.delay).await;
                }
                playback.index += 1;
                playback
                    .guard
                    .observer
                    .inner
                    .delivered
                    .fetch_add(1, Ordering::SeqCst);
                Some((Ok(text), playback))
            })
            .boxed();
            Ok(chunks)
        })
    }
}
