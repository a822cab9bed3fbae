use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use termrelay_error::RelayError;
use termrelay_protocol::{
    read_envelopes, write_envelope, CorrelationId, CorrelationRegistry, Dispatch, Dispatcher,
    Envelope, EnvelopeKind,
};
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::interpreter::{ExecutionError, InitError, Interpreter};
use crate::io::{GuestCall, GuestIo, OutputStream};
use crate::link::{SandboxLink, SandboxTeardown};
use crate::state::{SandboxEvent, SandboxState};

/// How long a stopping worker waits for guests it just cancelled to unwind.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub thread_name: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            thread_name: "sandbox-worker".to_string(),
        }
    }
}

/// Completion of deferred work started by a handler.
enum WorkerEvent {
    Initialized(Result<(), InitError>),
    Installed {
        id: Option<CorrelationId>,
        name: String,
        result: Result<(), InitError>,
    },
    Executed {
        id: Option<CorrelationId>,
        result: Result<Value, ExecutionError>,
    },
}

type WorkerDispatcher = Dispatcher<SandboxWorker, WorkerEvent>;

/// The sandbox side of the protocol. Owns the lifecycle state, the registry
/// of guests parked on input, and the single execution slot.
pub struct SandboxWorker {
    state: SandboxState,
    interpreter: Arc<dyn Interpreter>,
    outbound: mpsc::UnboundedSender<Envelope>,
    inputs: CorrelationRegistry<String>,
    load_waiters: Vec<Option<CorrelationId>>,
    guest_calls: mpsc::UnboundedSender<GuestCall>,
    loading_since: Option<Instant>,
}

impl SandboxWorker {
    pub fn new(
        interpreter: Arc<dyn Interpreter>,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> (Self, mpsc::UnboundedReceiver<GuestCall>) {
        let (guest_calls, guest_rx) = mpsc::unbounded_channel();
        let worker = Self {
            state: SandboxState::Uninitialized,
            interpreter,
            outbound,
            inputs: CorrelationRegistry::new("sandbox-input"),
            load_waiters: Vec::new(),
            guest_calls,
            loading_since: None,
        };
        (worker, guest_rx)
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Drive the worker until the controller drops its sender.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        mut guest_rx: mpsc::UnboundedReceiver<GuestCall>,
    ) {
        let dispatcher = Self::dispatcher();
        let mut tasks: JoinSet<WorkerEvent> = JoinSet::new();
        tracing::debug!(interpreter = self.interpreter.name(), "sandbox worker started");

        loop {
            tokio::select! {
                // Guest output is drained before completions so every write of
                // a run reaches the controller ahead of its `code-result`.
                biased;
                Some(call) = guest_rx.recv() => self.on_guest_call(call),
                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else {
                        break;
                    };
                    if self.state.is_terminal() {
                        self.reject_after_fault(&envelope);
                        continue;
                    }
                    if let Dispatch::Deferred(work) = dispatcher.dispatch(&mut self, envelope) {
                        tasks.spawn(work);
                    }
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(event) => {
                        if self.on_event(event) {
                            tasks.abort_all();
                        }
                    }
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => {
                        tracing::error!(error = %err, "sandbox task panicked");
                        self.fault(format!("sandbox task panicked: {err}"), None);
                        tasks.abort_all();
                    }
                },
            }
        }

        // Guests parked on input see `Cancelled` and finish before the
        // runtime goes away; anything still busy after the grace is aborted.
        let cancelled = self.inputs.cancel_all();
        let unwound = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok(WorkerEvent::Executed { id, result: Err(err) }) = joined {
                    tracing::debug!(id = ?id, error = %err, "run ended by shutdown");
                }
            }
        })
        .await
        .is_ok();
        tasks.abort_all();
        tracing::debug!(
            unwound = unwound,
            state = %self.state,
            cancelled_inputs = cancelled,
            "sandbox worker stopped"
        );
    }

    fn dispatcher() -> WorkerDispatcher {
        let mut dispatcher = WorkerDispatcher::new("sandbox");
        dispatcher
            .register(EnvelopeKind::Load, Self::on_load)
            .register(EnvelopeKind::RunCode, Self::on_run_code)
            .register(EnvelopeKind::LoadDependency, Self::on_load_dependency)
            .register(EnvelopeKind::InputResponse, Self::on_input_response);
        dispatcher
    }

    fn on_load(&mut self, envelope: Envelope) -> Option<BoxFuture<'static, WorkerEvent>> {
        match self.state {
            SandboxState::Uninitialized => {
                self.advance(SandboxEvent::Load);
                self.load_waiters.push(envelope.id);
                self.loading_since = Some(Instant::now());
                tracing::info!(interpreter = self.interpreter.name(), "sandbox loading");
                let interpreter = self.interpreter.clone();
                Some(async move { WorkerEvent::Initialized(interpreter.prepare().await) }.boxed())
            }
            SandboxState::Loading => {
                // Shares the initialization already in flight.
                self.load_waiters.push(envelope.id);
                None
            }
            _ => {
                self.emit(Envelope::loaded(envelope.id));
                None
            }
        }
    }

    fn on_run_code(&mut self, envelope: Envelope) -> Option<BoxFuture<'static, WorkerEvent>> {
        let id = envelope.id;
        if self.state != SandboxState::Ready {
            self.emit(Envelope::write_error(format!(
                "cannot run code while sandbox is {}\n",
                self.state
            )));
            self.emit(Envelope::code_result(id, false, Value::Null));
            return None;
        }
        self.advance(SandboxEvent::Run);

        let code = envelope.code().unwrap_or_default().to_string();
        let io = GuestIo::new(self.guest_calls.clone());
        let interpreter = self.interpreter.clone();
        tracing::debug!(id = ?id, bytes = code.len(), "sandbox run-code started");
        Some(
            async move {
                let result = interpreter.execute(code, io).await;
                WorkerEvent::Executed { id, result }
            }
            .boxed(),
        )
    }

    fn on_load_dependency(&mut self, envelope: Envelope) -> Option<BoxFuture<'static, WorkerEvent>> {
        let id = envelope.id;
        let name = envelope.name().unwrap_or_default().to_string();
        if self.state != SandboxState::Ready {
            tracing::warn!(state = %self.state, dependency = %name, "load-dependency outside ready state");
            self.emit(Envelope::dependency_loaded(id, name).with_field("ok", false));
            return None;
        }
        let interpreter = self.interpreter.clone();
        Some(
            async move {
                let result = interpreter.install(&name).await;
                WorkerEvent::Installed { id, name, result }
            }
            .boxed(),
        )
    }

    fn on_input_response(&mut self, envelope: Envelope) -> Option<BoxFuture<'static, WorkerEvent>> {
        match envelope.id {
            Some(id) => {
                let value = envelope.value().unwrap_or_default().to_string();
                self.inputs.resolve(id, value);
            }
            None => tracing::warn!("input-response without correlation id dropped"),
        }
        None
    }

    fn on_guest_call(&mut self, call: GuestCall) {
        match call {
            GuestCall::Write {
                stream: OutputStream::Stdout,
                text,
                role,
            } => self.emit(match role {
                Some(role) => Envelope::write_output_as(role, text),
                None => Envelope::write_output(text),
            }),
            GuestCall::Write {
                stream: OutputStream::Stderr,
                text,
                ..
            } => self.emit(Envelope::write_error(text)),
            GuestCall::Input { prompt, reply } => {
                let id = self.inputs.allocate();
                if let Err(err) = self.inputs.register(id, reply) {
                    tracing::error!(error = %err, "input correlation rejected");
                    return;
                }
                tracing::debug!(id = id, "guest parked on input");
                self.emit(Envelope::input_request(id, prompt));
            }
        }
    }

    /// Returns `true` when the event faulted the sandbox.
    fn on_event(&mut self, event: WorkerEvent) -> bool {
        match event {
            WorkerEvent::Initialized(Ok(())) => {
                self.advance(SandboxEvent::Loaded);
                let elapsed_ms = self
                    .loading_since
                    .take()
                    .map(|since| since.elapsed().as_millis() as u64)
                    .unwrap_or(0);
                tracing::info!(
                    elapsed_ms = elapsed_ms,
                    waiters = self.load_waiters.len(),
                    "sandbox ready"
                );
                for id in std::mem::take(&mut self.load_waiters) {
                    self.emit(Envelope::loaded(id));
                }
                false
            }
            WorkerEvent::Initialized(Err(err)) => {
                self.load_waiters.clear();
                self.report(err.into())
            }
            WorkerEvent::Installed {
                id,
                name,
                result: Ok(()),
            } => {
                tracing::info!(dependency = %name, "dependency installed");
                self.emit(Envelope::dependency_loaded(id, name));
                false
            }
            WorkerEvent::Installed {
                name,
                result: Err(err),
                ..
            } => {
                tracing::error!(dependency = %name, error = %err, "dependency install failed");
                self.report(err.into())
            }
            WorkerEvent::Executed { id, result } => {
                // Guests still parked on input belong to the run that just ended.
                self.inputs.cancel_all();
                match result {
                    Ok(value) => self.emit(Envelope::code_result(id, true, value)),
                    Err(err) => {
                        tracing::debug!(id = ?id, error = %err, "guest code raised");
                        self.report(err.into());
                        self.emit(Envelope::code_result(id, false, Value::Null));
                    }
                }
                self.advance(SandboxEvent::Completed);
                false
            }
        }
    }

    /// Session-fatal failures fault the sandbox; the rest are written to the
    /// guest's stderr. Returns `true` when the sandbox faulted.
    fn report(&mut self, err: RelayError) -> bool {
        let fatal = err.error_type().is_session_fatal();
        let (message, trace) = match err {
            RelayError::InitializationFault { message, trace }
            | RelayError::ExecutionFault { message, trace } => (message, trace),
            other => (other.to_string(), None),
        };
        if fatal {
            self.fault(message, trace);
        } else {
            let mut text = format!("{message}\n");
            if let Some(trace) = trace {
                text.push_str(&trace);
                if !trace.ends_with('\n') {
                    text.push('\n');
                }
            }
            self.emit(Envelope::write_error(text));
        }
        fatal
    }

    fn reject_after_fault(&self, envelope: &Envelope) {
        tracing::warn!(kind = %envelope.kind, id = ?envelope.id, "sandbox faulted, envelope dropped");
        if envelope.id.is_some() && envelope.kind != EnvelopeKind::InputResponse {
            self.emit(Envelope::fault("sandbox has faulted and must be recreated", None));
        }
    }

    fn fault(&mut self, message: String, trace: Option<String>) {
        tracing::error!(state = %self.state, message = %message, "sandbox faulted");
        self.advance(SandboxEvent::Fault);
        self.inputs.cancel_all();
        self.emit(Envelope::fault(message, trace));
    }

    fn advance(&mut self, event: SandboxEvent) {
        match self.state.transition(event) {
            Ok(next) => self.state = next,
            Err(err) => tracing::error!(error = %err, "illegal sandbox transition ignored"),
        }
    }

    fn emit(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            tracing::debug!("controller gone, sandbox output dropped");
        }
    }
}

/// Run a sandbox worker on its own OS thread with a single-threaded runtime.
pub fn spawn_thread(
    interpreter: Arc<dyn Interpreter>,
    options: WorkerOptions,
) -> std::io::Result<SandboxLink> {
    let (link, peer) = SandboxLink::pair();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let handle = std::thread::Builder::new()
        .name(options.thread_name)
        .spawn(move || {
            let (worker, guest_rx) = SandboxWorker::new(interpreter, peer.sender);
            runtime.block_on(worker.run(peer.receiver, guest_rx));
        })?;
    Ok(SandboxLink {
        teardown: SandboxTeardown::Thread(handle),
        ..link
    })
}

/// Run a sandbox worker in a child process (see [`serve_stdio`]).
pub fn spawn_process(command: Command) -> std::io::Result<SandboxLink> {
    SandboxLink::spawn_child(command)
}

/// Serve the envelope protocol over this process's stdin/stdout. Used as the
/// entry point of a process-isolated sandbox.
pub async fn serve_stdio(interpreter: Arc<dyn Interpreter>) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

    let reader = tokio::spawn(async move {
        let mut envelopes = Box::pin(read_envelopes(BufReader::new(tokio::io::stdin())));
        while let Some(item) = envelopes.next().await {
            match item {
                Ok(envelope) => {
                    if inbound_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!(error = %err, "stdin: rejected envelope"),
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(envelope) = outbound_rx.recv().await {
            if let Err(err) = write_envelope(&mut stdout, &envelope).await {
                tracing::warn!(error = %err, "stdout: write failed");
                break;
            }
        }
    });

    let (worker, guest_rx) = SandboxWorker::new(interpreter, outbound_tx);
    worker.run(inbound_rx, guest_rx).await;
    reader.abort();
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::task::JoinHandle;

    use super::*;
    use termrelay_protocol::OutputRole;

    use crate::io::InputError;
    use crate::testing::ScriptedInterpreter;

    struct Harness {
        to_worker: mpsc::UnboundedSender<Envelope>,
        from_worker: mpsc::UnboundedReceiver<Envelope>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(interpreter: Arc<dyn Interpreter>) -> Self {
            let (to_worker, inbound) = mpsc::unbounded_channel();
            let (outbound, from_worker) = mpsc::unbounded_channel();
            let (worker, guest_rx) = SandboxWorker::new(interpreter, outbound);
            let task = tokio::spawn(worker.run(inbound, guest_rx));
            Self {
                to_worker,
                from_worker,
                task,
            }
        }

        fn send(&self, envelope: Envelope) {
            self.to_worker.send(envelope).expect("worker alive");
        }

        async fn next(&mut self) -> Envelope {
            tokio::time::timeout(Duration::from_secs(5), self.from_worker.recv())
                .await
                .expect("timed out waiting for the sandbox")
                .expect("sandbox hung up")
        }

        async fn loaded(&mut self) {
            self.send(Envelope::load(1));
            let reply = self.next().await;
            assert_eq!(reply.kind, EnvelopeKind::Loaded);
        }
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_initialization() {
        let interpreter = ScriptedInterpreter::new()
            .with_prepare_delay(Duration::from_millis(20))
            .shared();
        let mut harness = Harness::start(interpreter.clone());

        harness.send(Envelope::load(1));
        harness.send(Envelope::load(2));
        assert_eq!(harness.next().await, Envelope::loaded(Some(1)));
        assert_eq!(harness.next().await, Envelope::loaded(Some(2)));

        harness.send(Envelope::load(3));
        assert_eq!(harness.next().await, Envelope::loaded(Some(3)));
        assert_eq!(interpreter.prepare_calls(), 1);
    }

    #[tokio::test]
    async fn guest_input_round_trips_through_the_controller() {
        let mut harness = Harness::start(ScriptedInterpreter::new().shared());
        harness.loaded().await;

        harness.send(Envelope::run_code(2, "input name Name?\nprint Hello, ${name}"));
        let request = harness.next().await;
        assert_eq!(request.kind, EnvelopeKind::InputRequest);
        assert_eq!(request.prompt(), Some("Name?"));
        let input_id = request.id.expect("input-request carries an id");

        harness.send(Envelope::input_response(input_id, "Ada"));
        assert_eq!(harness.next().await, Envelope::write_output("Hello, Ada\n"));
        let result = harness.next().await;
        assert_eq!(result.kind, EnvelopeKind::CodeResult);
        assert_eq!(result.id, Some(2));
        assert!(result.ok());
    }

    #[tokio::test]
    async fn raised_error_is_contained_to_its_run() {
        let mut harness = Harness::start(ScriptedInterpreter::new().shared());
        harness.loaded().await;

        harness.send(Envelope::run_code(2, "print before\nfail boom"));
        assert_eq!(harness.next().await, Envelope::write_output("before\n"));
        let error = harness.next().await;
        assert_eq!(error.kind, EnvelopeKind::WriteError);
        assert_eq!(error.text(), Some("boom\n  at line `fail boom`\n"));
        let result = harness.next().await;
        assert_eq!(result.id, Some(2));
        assert!(!result.ok());

        harness.send(Envelope::run_code(3, "return 7"));
        let result = harness.next().await;
        assert_eq!(result, Envelope::code_result(Some(3), true, json!(7)));
    }

    #[tokio::test]
    async fn run_before_load_is_refused() {
        let mut harness = Harness::start(ScriptedInterpreter::new().shared());
        harness.send(Envelope::run_code(5, "print hi"));
        assert_eq!(harness.next().await.kind, EnvelopeKind::WriteError);
        assert_eq!(
            harness.next().await,
            Envelope::code_result(Some(5), false, Value::Null)
        );
    }

    #[tokio::test]
    async fn initialization_failure_faults_the_session() {
        let mut harness =
            Harness::start(ScriptedInterpreter::new().failing_prepare("no runtime").shared());
        harness.send(Envelope::load(1));
        let fault = harness.next().await;
        assert_eq!(fault.kind, EnvelopeKind::Fault);
        assert!(fault.message().unwrap_or_default().contains("no runtime"));
        assert_eq!(fault.trace(), Some("  in prepare"));

        harness.send(Envelope::run_code(2, "print hi"));
        let rejected = harness.next().await;
        assert_eq!(rejected.kind, EnvelopeKind::Fault);
        assert!(rejected
            .message()
            .unwrap_or_default()
            .contains("must be recreated"));
    }

    #[tokio::test]
    async fn dependencies_install_on_request() {
        let interpreter = ScriptedInterpreter::new().with_installable("numpy").shared();
        let mut harness = Harness::start(interpreter.clone());
        harness.loaded().await;

        harness.send(Envelope::load_dependency(2, "numpy"));
        assert_eq!(
            harness.next().await,
            Envelope::dependency_loaded(Some(2), "numpy")
        );
        assert_eq!(interpreter.installed(), vec!["numpy".to_string()]);

        harness.send(Envelope::load_dependency(3, "left-pad"));
        assert_eq!(harness.next().await.kind, EnvelopeKind::Fault);
    }

    #[tokio::test]
    async fn worker_stops_when_the_controller_hangs_up() {
        let harness = Harness::start(ScriptedInterpreter::new().shared());
        let Harness { to_worker, task, .. } = harness;
        drop(to_worker);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker did not stop")
            .expect("worker panicked");
    }

    #[tokio::test]
    async fn hang_up_cancels_a_guest_parked_on_input() {
        let interpreter = ScriptedInterpreter::new().shared();
        let mut harness = Harness::start(interpreter.clone());
        harness.loaded().await;

        harness.send(Envelope::run_code(2, "input x Wait?\nprint never"));
        let request = harness.next().await;
        assert_eq!(request.kind, EnvelopeKind::InputRequest);
        assert_eq!(request.prompt(), Some("Wait?"));

        let Harness {
            to_worker,
            mut from_worker,
            task,
        } = harness;
        drop(to_worker);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker did not stop")
            .expect("worker panicked");

        assert_eq!(interpreter.input_failures(), vec![InputError::Cancelled]);
        while let Ok(envelope) = from_worker.try_recv() {
            assert_ne!(envelope, Envelope::write_output("never\n"));
        }
    }

    #[tokio::test]
    async fn output_roles_reach_the_controller() {
        let (outbound, mut from_worker) = mpsc::unbounded_channel();
        let (mut worker, mut guest_rx) =
            SandboxWorker::new(ScriptedInterpreter::new().shared(), outbound);

        let io = GuestIo::new(worker.guest_calls.clone());
        io.write_stdout("plain ");
        io.write_stdout_as(OutputRole::Assistant, "spoken");
        for _ in 0..2 {
            let call = guest_rx.recv().await.expect("guest call");
            worker.on_guest_call(call);
        }

        assert_eq!(from_worker.recv().await, Some(Envelope::write_output("plain ")));
        let spoken = from_worker.recv().await.expect("write-output");
        assert_eq!(spoken.text(), Some("spoken"));
        assert_eq!(spoken.role(), Some(OutputRole::Assistant));
    }

    #[tokio::test]
    async fn thread_sandbox_speaks_the_protocol() {
        let link = spawn_thread(ScriptedInterpreter::new().shared(), WorkerOptions::default())
            .expect("spawn sandbox thread");
        let (sender, mut receiver, teardown) = link.into_parts();

        sender.send(Envelope::load(1)).expect("send load");
        let reply = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out")
            .expect("sandbox hung up");
        assert_eq!(reply, Envelope::loaded(Some(1)));

        drop(sender);
        teardown.terminate().await;
    }
}
