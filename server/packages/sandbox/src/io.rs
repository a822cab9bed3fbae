use termrelay_protocol::{OutputRole, Resolution};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("input request cancelled")]
    Cancelled,
    #[error("sandbox is shutting down")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Requests from running guest code to the worker loop. Both output and
/// input go through one channel so the controller sees them in program order.
#[derive(Debug)]
pub enum GuestCall {
    Write {
        stream: OutputStream,
        text: String,
        role: Option<OutputRole>,
    },
    Input {
        prompt: String,
        reply: oneshot::Sender<Resolution<String>>,
    },
}

/// Redirected standard streams handed to an interpreter for one run.
#[derive(Clone, Debug)]
pub struct GuestIo {
    calls: mpsc::UnboundedSender<GuestCall>,
}

impl GuestIo {
    pub fn new(calls: mpsc::UnboundedSender<GuestCall>) -> Self {
        Self { calls }
    }

    pub fn write_stdout(&self, text: impl Into<String>) {
        self.write(OutputStream::Stdout, text.into(), None);
    }

    /// Stdout text tagged with the role it speaks for; styling is left to
    /// the terminal.
    pub fn write_stdout_as(&self, role: OutputRole, text: impl Into<String>) {
        self.write(OutputStream::Stdout, text.into(), Some(role));
    }

    pub fn write_stderr(&self, text: impl Into<String>) {
        self.write(OutputStream::Stderr, text.into(), None);
    }

    fn write(&self, stream: OutputStream, text: String, role: Option<OutputRole>) {
        if text.is_empty() {
            return;
        }
        if self.calls.send(GuestCall::Write { stream, text, role }).is_err() {
            tracing::debug!(stream = ?stream, "guest output after sandbox teardown dropped");
        }
    }

    /// Blocking input: suspends the guest until the controller answers the
    /// `input-request` this emits, or the sandbox is torn down.
    pub async fn input(&self, prompt: impl Into<String>) -> Result<String, InputError> {
        let (reply, rx) = oneshot::channel();
        self.calls
            .send(GuestCall::Input {
                prompt: prompt.into(),
                reply,
            })
            .map_err(|_| InputError::Closed)?;
        match rx.await {
            Ok(Resolution::Value(value)) => Ok(value),
            Ok(Resolution::Cancelled) | Err(_) => Err(InputError::Cancelled),
        }
    }
}
