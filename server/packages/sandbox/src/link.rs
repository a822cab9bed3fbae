use std::process::Stdio;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::StreamExt;
use termrelay_protocol::{read_envelopes, write_envelope, Envelope};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// The controller's end of a sandbox: envelopes in, envelopes out, and the
/// handle that destroys the execution context.
#[derive(Debug)]
pub struct SandboxLink {
    pub sender: mpsc::UnboundedSender<Envelope>,
    pub receiver: mpsc::UnboundedReceiver<Envelope>,
    pub teardown: SandboxTeardown,
}

/// The sandbox's end of an in-memory link.
#[derive(Debug)]
pub struct SandboxPeer {
    pub sender: mpsc::UnboundedSender<Envelope>,
    pub receiver: mpsc::UnboundedReceiver<Envelope>,
}

#[derive(Debug)]
pub enum SandboxTeardown {
    Thread(JoinHandle<()>),
    Process(Child),
    Detached,
}

impl SandboxLink {
    /// Two connected ends with nothing running behind them. Used to drive a
    /// controller from a hand-written sandbox.
    pub fn pair() -> (SandboxLink, SandboxPeer) {
        let (to_sandbox, from_controller) = mpsc::unbounded_channel();
        let (to_controller, from_sandbox) = mpsc::unbounded_channel();
        (
            SandboxLink {
                sender: to_sandbox,
                receiver: from_sandbox,
                teardown: SandboxTeardown::Detached,
            },
            SandboxPeer {
                sender: to_controller,
                receiver: from_controller,
            },
        )
    }

    /// Bridge a child process that speaks newline-delimited envelopes on its
    /// stdio. Child stderr is forwarded to the log; an unexpected exit is
    /// reported to the controller as a `fault`.
    pub fn spawn_child(mut command: Command) -> std::io::Result<SandboxLink> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or(0);
        tracing::info!(pid = pid, "sandbox process spawned");

        let missing = |what: &str| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, format!("sandbox {what} unavailable"))
        };
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (link, peer) = SandboxLink::pair();
        let SandboxPeer {
            sender: to_controller,
            receiver: mut from_controller,
        } = peer;

        tokio::spawn(async move {
            while let Some(envelope) = from_controller.recv().await {
                if let Err(err) = write_envelope(&mut stdin, &envelope).await {
                    tracing::warn!(pid = pid, error = %err, "sandbox stdin: write failed");
                    break;
                }
            }
            tracing::debug!(pid = pid, "sandbox stdin: closed");
        });

        tokio::spawn(async move {
            let mut envelopes = Box::pin(read_envelopes(BufReader::new(stdout)));
            while let Some(item) = envelopes.next().await {
                match item {
                    Ok(envelope) => {
                        if to_controller.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(pid = pid, error = %err, "sandbox stdout: rejected line");
                    }
                }
            }
            tracing::debug!(pid = pid, "sandbox stdout: stream ended");
            let _ = to_controller.send(Envelope::fault("sandbox process exited", None));
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(pid = pid, "sandbox stderr: {}", line);
            }
        });

        Ok(SandboxLink {
            teardown: SandboxTeardown::Process(child),
            ..link
        })
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Envelope>,
        mpsc::UnboundedReceiver<Envelope>,
        SandboxTeardown,
    ) {
        (self.sender, self.receiver, self.teardown)
    }
}

impl SandboxTeardown {
    /// Destroy the execution context. Callers drop their sender first so a
    /// worker thread sees its inbound channel close and unwinds on its own.
    pub async fn terminate(self) {
        match self {
            SandboxTeardown::Thread(handle) => {
                let join = tokio::task::spawn_blocking(move || handle.join());
                match tokio::time::timeout(TEARDOWN_GRACE, join).await {
                    Ok(Ok(Ok(()))) => tracing::debug!("sandbox thread joined"),
                    Ok(Ok(Err(_))) => tracing::error!("sandbox thread panicked"),
                    Ok(Err(err)) => tracing::error!(error = %err, "sandbox join task failed"),
                    Err(_) => tracing::warn!(
                        grace_ms = TEARDOWN_GRACE.as_millis() as u64,
                        "sandbox thread still busy after teardown, detaching"
                    ),
                }
            }
            SandboxTeardown::Process(mut child) => match child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                Err(_) => {
                    let _ = child.kill().await;
                }
            },
            SandboxTeardown::Detached => {}
        }
    }
}
