use std::collections::{BTreeSet, VecDeque};
use std::io::Write;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use termrelay_protocol::{
    CorrelationId, CorrelationRegistry, Dispatcher, Envelope, EnvelopeKind, OutputRole, Parked,
    Resolution,
};
use termrelay_sandbox::{SandboxEvent, SandboxLink, SandboxState, SandboxTeardown};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::loading::{LoadingIndicator, Tick, DEFAULT_INTERVAL};
use crate::surface::{KeyInput, OutputStyle, Terminal, TerminalError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("sandbox faulted: {message}")]
    Faulted { message: String },
    #[error("request cancelled by session teardown")]
    Cancelled,
    #[error("sandbox rejected the request: {message}")]
    Rejected { message: String },
    #[error("sandbox controller has stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Animate a loading indicator while the sandbox initializes.
    pub loading_indicator: bool,
    pub indicator_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            loading_indicator: true,
            indicator_interval: DEFAULT_INTERVAL,
        }
    }
}

/// Snapshot of the controller's view of its sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSession {
    pub state: SandboxState,
    pub pending_correlations: BTreeSet<CorrelationId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub ok: bool,
    pub value: Value,
}

#[derive(Debug, Clone)]
struct ControllerStatus {
    state: SandboxState,
    fault: Option<String>,
}

type LoadTicket = Shared<BoxFuture<'static, Resolution<Envelope>>>;

enum Command {
    Load {
        reply: oneshot::Sender<LoadTicket>,
    },
    RunCode {
        code: String,
        reply: oneshot::Sender<Result<Parked<Envelope>, ControllerError>>,
    },
    LoadDependency {
        name: String,
        reply: oneshot::Sender<Result<Parked<Envelope>, ControllerError>>,
    },
    Session {
        reply: oneshot::Sender<SandboxSession>,
    },
    Shutdown {
        reply: oneshot::Sender<SandboxSession>,
    },
}

/// Handle to the task that owns a sandbox session and its terminal.
///
/// Cloning the handle is cheap; the session task runs until every handle is
/// dropped, then hands the terminal back through the join handle returned
/// by [`SandboxController::spawn`].
#[derive(Debug, Clone)]
pub struct SandboxController {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ControllerStatus>,
}

impl SandboxController {
    pub fn spawn<W>(
        link: SandboxLink,
        terminal: Terminal<W>,
        keys: mpsc::UnboundedReceiver<KeyInput>,
        options: ControllerOptions,
    ) -> (SandboxController, JoinHandle<Terminal<W>>)
    where
        W: Write + Send + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ControllerStatus {
            state: SandboxState::Uninitialized,
            fault: None,
        });
        let (sender, receiver, teardown) = link.into_parts();
        let actor = SessionActor {
            terminal,
            keys: Some(keys),
            sandbox: Some(sender),
            teardown: Some(teardown),
            replies: CorrelationRegistry::new("controller"),
            state: SandboxState::Uninitialized,
            fault: None,
            status: status_tx,
            options,
            load: None,
            inputs: VecDeque::new(),
            indicator: None,
            ticker: None,
            held_loaded: None,
            running: None,
            teardown_pending: false,
        };
        let task = tokio::spawn(actor.run(command_rx, receiver));
        (SandboxController { commands, status }, task)
    }

    pub fn state(&self) -> SandboxState {
        self.status.borrow().state
    }

    /// Initialize the sandbox. Concurrent and repeated callers share one
    /// `load` and observe the same outcome.
    pub async fn load(&self) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Load { reply })?;
        let ticket = rx.await.map_err(|_| ControllerError::Stopped)?;
        match ticket.await {
            Resolution::Value(_) => Ok(()),
            Resolution::Cancelled => Err(self.closed_error()),
        }
    }

    pub async fn run_code(&self, code: impl Into<String>) -> Result<RunOutcome, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RunCode {
            code: code.into(),
            reply,
        })?;
        let envelope = self.await_reply(rx).await?;
        Ok(RunOutcome {
            ok: envelope.ok(),
            value: envelope.payload.get("value").cloned().unwrap_or(Value::Null),
        })
    }

    pub async fn load_dependency(&self, name: impl Into<String>) -> Result<(), ControllerError> {
        let name = name.into();
        let (reply, rx) = oneshot::channel();
        self.send(Command::LoadDependency {
            name: name.clone(),
            reply,
        })?;
        let envelope = self.await_reply(rx).await?;
        if envelope.ok() {
            Ok(())
        } else {
            Err(ControllerError::Rejected {
                message: format!("dependency `{name}` was not installed"),
            })
        }
    }

    pub async fn session(&self) -> Result<SandboxSession, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Session { reply })?;
        rx.await.map_err(|_| ControllerError::Stopped)
    }

    /// Tear the sandbox down, cancelling everything still pending. Returns
    /// the session as left behind.
    pub async fn shutdown(&self) -> Result<SandboxSession, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| ControllerError::Stopped)
    }

    fn send(&self, command: Command) -> Result<(), ControllerError> {
        self.commands
            .send(command)
            .map_err(|_| ControllerError::Stopped)
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<Result<Parked<Envelope>, ControllerError>>,
    ) -> Result<Envelope, ControllerError> {
        let parked = rx.await.map_err(|_| ControllerError::Stopped)??;
        match parked.wait().await {
            Resolution::Value(envelope) => Ok(envelope),
            Resolution::Cancelled => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> ControllerError {
        match &self.status.borrow().fault {
            Some(message) => ControllerError::Faulted {
                message: message.clone(),
            },
            None => ControllerError::Cancelled,
        }
    }
}

struct PendingInput {
    id: CorrelationId,
    prompt: String,
}

struct SessionActor<W> {
    terminal: Terminal<W>,
    keys: Option<mpsc::UnboundedReceiver<KeyInput>>,
    sandbox: Option<mpsc::UnboundedSender<Envelope>>,
    teardown: Option<SandboxTeardown>,
    replies: CorrelationRegistry<Envelope>,
    state: SandboxState,
    fault: Option<String>,
    status: watch::Sender<ControllerStatus>,
    options: ControllerOptions,
    load: Option<LoadTicket>,
    /// Input requests in arrival order; only the head is shown.
    inputs: VecDeque<PendingInput>,
    indicator: Option<LoadingIndicator>,
    ticker: Option<Interval>,
    /// `loaded` reply held back until the indicator finishes its cycle.
    held_loaded: Option<Envelope>,
    /// Request that moved the sandbox to `Running`; only its reply completes the run.
    running: Option<CorrelationId>,
    teardown_pending: bool,
}

async fn recv_or_park<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick_or_park(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<W> SessionActor<W>
where
    W: Write + Send + 'static,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        receiver: mpsc::UnboundedReceiver<Envelope>,
    ) -> Terminal<W> {
        let dispatcher = Self::dispatcher();
        let mut from_sandbox = Some(receiver);

        loop {
            tokio::select! {
                // Sandbox traffic first: output must be rendered before the
                // reply that follows it wakes a caller.
                biased;
                envelope = recv_or_park(&mut from_sandbox) => match envelope {
                    Some(envelope) => {
                        dispatcher.dispatch(&mut self, envelope);
                    }
                    None => {
                        from_sandbox = None;
                        if !self.state.is_terminal() && self.sandbox.is_some() {
                            self.on_fault_message("sandbox disconnected".to_string(), None);
                        }
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                key = recv_or_park(&mut self.keys), if !self.inputs.is_empty() => match key {
                    Some(key) => self.on_key(key),
                    None => {
                        self.keys = None;
                        tracing::info!("terminal input closed, ending session");
                        self.teardown_pending = true;
                    }
                },
                _ = tick_or_park(&mut self.ticker) => self.on_tick(),
            }

            if std::mem::take(&mut self.teardown_pending) {
                from_sandbox = None;
                self.teardown().await;
            }
        }

        self.teardown().await;
        self.terminal
    }

    fn dispatcher() -> Dispatcher<Self> {
        let mut dispatcher = Dispatcher::new("controller");
        dispatcher
            .register(EnvelopeKind::Loaded, Self::on_loaded)
            .register(EnvelopeKind::CodeResult, Self::on_reply)
            .register(EnvelopeKind::DependencyLoaded, Self::on_reply)
            .register(EnvelopeKind::WriteOutput, Self::on_output)
            .register(EnvelopeKind::WriteError, Self::on_output)
            .register(EnvelopeKind::InputRequest, Self::on_input_request)
            .register(EnvelopeKind::Fault, Self::on_fault);
        dispatcher
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Load { reply } => {
                let ticket = self.start_load();
                let _ = reply.send(ticket);
            }
            Command::RunCode { code, reply } => {
                let result = self.run_code(code);
                let _ = reply.send(result);
            }
            Command::LoadDependency { name, reply } => {
                let result = self.request_without_transition(|id| Envelope::load_dependency(id, name));
                let _ = reply.send(result);
            }
            Command::Session { reply } => {
                let _ = reply.send(self.session());
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(self.session());
            }
        }
    }

    fn start_load(&mut self) -> LoadTicket {
        if let Some(ticket) = &self.load {
            return ticket.clone();
        }
        let Some(sandbox) = self.sandbox.clone() else {
            return futures::future::ready(Resolution::Cancelled).boxed().shared();
        };
        let parked = self.replies.park();
        let id = parked.id();
        let ticket = parked.wait().boxed().shared();
        self.load = Some(ticket.clone());
        self.advance(SandboxEvent::Load);
        if self.options.loading_indicator {
            let mut ticker = tokio::time::interval(self.options.indicator_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.indicator = Some(LoadingIndicator::new(self.options.indicator_interval));
            self.ticker = Some(ticker);
        }
        tracing::debug!(id = id, "load sent");
        if sandbox.send(Envelope::load(id)).is_err() {
            self.teardown_pending = true;
        }
        ticket
    }

    /// At most one run is in flight; a second one is rejected without
    /// reaching the sandbox.
    fn run_code(&mut self, code: String) -> Result<Parked<Envelope>, ControllerError> {
        if self.state == SandboxState::Running {
            return Err(ControllerError::Rejected {
                message: "sandbox is busy running code".to_string(),
            });
        }
        let parked = self.request_without_transition(|id| Envelope::run_code(id, code))?;
        if self.state == SandboxState::Ready {
            self.running = Some(parked.id());
            self.advance(SandboxEvent::Run);
        }
        Ok(parked)
    }

    fn request_without_transition(
        &mut self,
        build: impl FnOnce(CorrelationId) -> Envelope,
    ) -> Result<Parked<Envelope>, ControllerError> {
        let Some(sandbox) = &self.sandbox else {
            return Err(self.closed_error());
        };
        let parked = self.replies.park();
        let envelope = build(parked.id());
        if sandbox.send(envelope).is_err() {
            self.teardown_pending = true;
        }
        Ok(parked)
    }

    fn on_loaded(&mut self, envelope: Envelope) -> Option<BoxFuture<'static, ()>> {
        if envelope.id.is_none() {
            return None;
        }
        self.advance(SandboxEvent::Loaded);
        match &mut self.indicator {
            Some(indicator) => {
                indicator.mark_ready();
                self.held_loaded = Some(envelope);
            }
            None => self.resolve(envelope),
        }
        None
    }

    fn on_reply(&mut self, envelope: Envelope) -> Option<BoxFuture<'static, ()>> {
        if envelope.kind == EnvelopeKind::CodeResult
            && envelope.id.is_some()
            && envelope.id == self.running
        {
            self.running = None;
            self.advance(SandboxEvent::Completed);
        }
        self.resolve(envelope);
        None
    }

    fn on_output(&mut self, envelope: Envelope) -> Option<BoxFuture<'static, ()>> {
        let style = match (envelope.kind, envelope.role()) {
            (EnvelopeKind::WriteError, _) => OutputStyle::Error,
            (_, Some(OutputRole::Assistant)) => OutputStyle::Assistant,
            (_, None) => OutputStyle::Normal,
        };
        self.render(envelope.text().unwrap_or_default(), style);
        None
    }

    fn on_input_request(&mut self, envelope: Envelope) -> Option<BoxFuture<'static, ()>> {
        let Some(id) = envelope.id else {
            return None;
        };
        let prompt = envelope.prompt().unwrap_or_default().to_string();
        self.inputs.push_back(PendingInput { id, prompt });
        if self.inputs.len() == 1 {
            self.show_head_prompt();
        } else {
            tracing::debug!(id = id, queued = self.inputs.len(), "input request queued");
        }
        None
    }

    fn on_fault(&mut self, envelope: Envelope) -> Option<BoxFuture<'static, ()>> {
        let message = envelope.message().unwrap_or("sandbox fault").to_string();
        if self.sandbox.is_none() {
            tracing::debug!(message = %message, "fault after teardown ignored");
            return None;
        }
        let trace = envelope.trace().map(str::to_string);
        self.on_fault_message(message, trace);
        None
    }

    fn on_fault_message(&mut self, message: String, trace: Option<String>) {
        tracing::error!(message = %message, "sandbox faulted");
        self.render(&format!("{message}\n"), OutputStyle::Error);
        if let Some(trace) = &trace {
            let mut trace = trace.clone();
            if !trace.ends_with('\n') {
                trace.push('\n');
            }
            self.render(&trace, OutputStyle::Muted);
        }
        self.advance(SandboxEvent::Fault);
        self.fault = Some(message);
        self.publish();
        self.teardown_pending = true;
    }

    fn on_key(&mut self, key: KeyInput) {
        match self.terminal.key(key) {
            Ok(Some(line)) => {
                let Some(head) = self.inputs.pop_front() else {
                    return;
                };
                if let Some(sandbox) = &self.sandbox {
                    if sandbox.send(Envelope::input_response(head.id, line)).is_err() {
                        self.teardown_pending = true;
                        return;
                    }
                }
                if !self.inputs.is_empty() {
                    self.show_head_prompt();
                }
            }
            Ok(None) => {}
            Err(TerminalError::Interrupted) => self.show_head_prompt(),
            Err(err) => tracing::warn!(error = %err, "terminal echo failed"),
        }
    }

    fn on_tick(&mut self) {
        let Some(indicator) = &mut self.indicator else {
            self.ticker = None;
            return;
        };
        match indicator.tick() {
            Tick::Frame(frame) => {
                if let Err(err) = self.terminal.status(frame) {
                    tracing::warn!(error = %err, "failed to draw loading indicator");
                }
            }
            Tick::Finished => {
                self.indicator = None;
                self.ticker = None;
                if let Err(err) = self.terminal.clear_status() {
                    tracing::warn!(error = %err, "failed to clear loading indicator");
                }
                if let Some(loaded) = self.held_loaded.take() {
                    self.resolve(loaded);
                }
            }
        }
    }

    fn show_head_prompt(&mut self) {
        let Some(head) = self.inputs.front() else {
            return;
        };
        if let Err(err) = self.terminal.prompt(&head.prompt) {
            tracing::warn!(error = %err, "failed to render input prompt");
        }
    }

    fn render(&mut self, text: &str, style: OutputStyle) {
        if let Err(err) = self.terminal.write(text, style) {
            tracing::warn!(error = %err, "failed to render sandbox output");
        }
    }

    fn resolve(&mut self, envelope: Envelope) {
        match envelope.id {
            Some(id) => {
                self.replies.resolve(id, envelope);
            }
            None => tracing::warn!(kind = %envelope.kind, "reply without correlation id dropped"),
        }
    }

    /// Destroy the execution context and wake everything still waiting.
    async fn teardown(&mut self) {
        self.sandbox = None;
        self.indicator = None;
        self.ticker = None;
        self.held_loaded = None;
        self.running = None;
        self.inputs.clear();
        let cancelled = self.replies.cancel_all();
        if !self.state.is_terminal() && self.teardown.is_some() {
            tracing::info!(state = %self.state, cancelled = cancelled, "sandbox session torn down");
        }
        if let Some(teardown) = self.teardown.take() {
            teardown.terminate().await;
        }
        self.publish();
    }

    fn session(&self) -> SandboxSession {
        SandboxSession {
            state: self.state,
            pending_correlations: self.replies.pending().into_iter().collect(),
        }
    }

    fn closed_error(&self) -> ControllerError {
        match &self.fault {
            Some(message) => ControllerError::Faulted {
                message: message.clone(),
            },
            None => ControllerError::Cancelled,
        }
    }

    fn advance(&mut self, event: SandboxEvent) {
        match self.state.transition(event) {
            Ok(next) => {
                self.state = next;
                self.publish();
            }
            Err(err) => tracing::debug!(error = %err, "controller state unchanged"),
        }
    }

    fn publish(&self) {
        self.status.send_replace(ControllerStatus {
            state: self.state,
            fault: self.fault.clone(),
        });
    }
}
