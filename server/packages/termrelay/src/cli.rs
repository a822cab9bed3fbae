use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use termrelay_credentials::{CredentialChain, CredentialResolutionError, StaticSource};
use termrelay_sandbox::{
    serve_stdio, spawn_process, spawn_thread, Interpreter, ProcessInterpreter,
    ProcessInterpreterConfig, SandboxLink, WorkerOptions,
};
use termrelay_terminal::{
    ControllerError, ControllerOptions, KeyDecoder, KeyInput, SandboxController, Terminal,
};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::chat::{ChatInterpreter, ChatOptions};
use crate::config::{ConfigError, RelayConfig};
use crate::health::{health_client, health_url, keepalive, probe_health, ProbeError};
use crate::model_client::{HttpModelClient, ModelClient, ModelVerifier, ScriptedModelClient};
use crate::relay::{RelaySettings, StreamingRelay};
use crate::router::{build_router_with_state, AppState};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_URL: &str = "http://127.0.0.1:8000";
const STDIN_SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "termrelay", bin_name = "termrelay")]
#[command(about = "Sandboxed terminal client and streaming model relay", version)]
#[command(arg_required_else_help = true)]
pub struct TermrelayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay HTTP server.
    Server(ServerArgs),
    /// Open the terminal and run a program in a sandbox.
    Chat(ChatArgs),
    /// Check that a relay is healthy, optionally keeping it warm.
    Probe(ProbeArgs),
    /// Resolve model credentials and show which source won.
    Credentials,
    /// Serve the sandbox protocol on stdin/stdout.
    #[command(hide = true)]
    SandboxWorker(SandboxWorkerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// File served at /api/script and run by `termrelay chat`.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Echo user messages back instead of calling the hosted model.
    #[arg(long)]
    mock: bool,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    #[arg(long, default_value = DEFAULT_URL)]
    url: String,

    /// Run `--script` with this program instead of the chat program.
    #[arg(long, requires = "script")]
    interpreter: Option<PathBuf>,

    /// Local script to run instead of the relay's /api/script.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Host the sandbox in a child process rather than a thread.
    #[arg(long)]
    isolate_process: bool,

    #[arg(long)]
    no_indicator: bool,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[arg(long, default_value = DEFAULT_URL)]
    url: String,

    #[arg(long, default_value_t = 10)]
    attempts: u32,

    #[arg(long, default_value_t = 500)]
    backoff_ms: u64,

    /// Keep pinging at this interval until ctrl-c.
    #[arg(long)]
    keepalive_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct SandboxWorkerArgs {
    #[arg(long, conflicts_with = "interpreter")]
    url: Option<String>,

    #[arg(long)]
    interpreter: Option<PathBuf>,

    /// Skip the health probe; the parent already found the relay healthy.
    #[arg(long, conflicts_with = "interpreter")]
    no_probe: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Credentials(#[from] CredentialResolutionError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("program failed: {0}")]
    Program(String),
}

pub fn run_termrelay() -> Result<(), CliError> {
    let cli = TermrelayCli::parse();
    init_logging(&cli.command)?;
    run_command(&cli.command)
}

/// Logs always go to stderr; the terminal client owns stdout, so it only
/// logs warnings unless `RUST_LOG` says otherwise.
pub fn init_logging(command: &Command) -> Result<(), CliError> {
    let default_level = match command {
        Command::Chat(_) | Command::SandboxWorker(_) => "warn",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Chat(args) => run_chat(args),
        Command::Probe(args) => run_probe(args),
        Command::Credentials => run_credentials(),
        Command::SandboxWorker(args) => run_sandbox_worker(args),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let config = RelayConfig::from_env()?;
    let (client, chain): (Arc<dyn ModelClient>, CredentialChain) = if args.mock {
        (
            Arc::new(ScriptedModelClient::echo()),
            CredentialChain::new().with_source(StaticSource::new("mock", "mock")),
        )
    } else {
        (
            Arc::new(HttpModelClient::from_config(&config)),
            config.credential_chain(),
        )
    };
    let relay = StreamingRelay::new(client, Arc::new(chain), RelaySettings::from(&config));
    let mut state = AppState::new(relay).with_http_logging(config.log_http);
    if let Some(path) = &args.script {
        state = state.with_script(std::fs::read_to_string(path)?);
    }
    let (router, _state) = build_router_with_state(Arc::new(state));

    let addr = format!("{}:{}", args.host, args.port);
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            model = %config.model_id,
            mode = ?config.invoke_mode,
            mock = args.mock,
            "server listening"
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_chat(args: &ChatArgs) -> Result<(), CliError> {
    let runtime = build_runtime()?;
    let result = runtime.block_on(chat_session(args));
    // Blocking stdin reads cannot be cancelled; don't wait for them.
    runtime.shutdown_timeout(STDIN_SHUTDOWN_GRACE);
    result
}

async fn chat_session(args: &ChatArgs) -> Result<(), CliError> {
    let (link, code) = match &args.interpreter {
        Some(program) => {
            let path = args
                .script
                .as_ref()
                .ok_or_else(|| CliError::Program("--interpreter needs --script".to_string()))?;
            let code = tokio::fs::read_to_string(path).await?;
            let link = if args.isolate_process {
                spawn_process(worker_command(&["--interpreter".into(), program.clone().into()])?)?
            } else {
                let interpreter =
                    ProcessInterpreter::new(ProcessInterpreterConfig::program(program.clone()));
                spawn_thread(Arc::new(interpreter), WorkerOptions::default())?
            };
            (link, code)
        }
        None => {
            // The only health check of this session; the sandbox skips its own.
            let client = health_client();
            let defaults = ChatOptions::default();
            probe_health(
                &client,
                &health_url(&args.url),
                defaults.probe_attempts,
                defaults.probe_backoff,
            )
            .await?;
            let code = match &args.script {
                Some(path) => tokio::fs::read_to_string(path).await?,
                None => fetch_script(&client, &args.url).await?,
            };
            (chat_link(args)?, code)
        }
    };

    let (keys_tx, keys_rx) = mpsc::unbounded_channel();
    let stdin_task = tokio::spawn(forward_keys(keys_tx));
    // The OS tty is in cooked mode and echoes on its own.
    let terminal = Terminal::new(std::io::stdout()).with_echo(false);
    let options = ControllerOptions {
        loading_indicator: !args.no_indicator,
        ..ControllerOptions::default()
    };
    let (controller, session_task) = SandboxController::spawn(link, terminal, keys_rx, options);

    let outcome = run_program(&controller, code).await;
    if let Err(err) = controller.shutdown().await {
        tracing::debug!(error = %err, "session already closed");
    }
    drop(controller);
    stdin_task.abort();
    let _ = session_task.await;
    outcome
}

async fn run_program(controller: &SandboxController, code: String) -> Result<(), CliError> {
    controller.load().await?;
    let outcome = controller.run_code(code).await?;
    if outcome.ok {
        Ok(())
    } else {
        Err(CliError::Program(outcome.value.to_string()))
    }
}

fn chat_link(args: &ChatArgs) -> Result<SandboxLink, CliError> {
    if args.isolate_process {
        return Ok(spawn_process(worker_command(&[
            "--url".into(),
            args.url.clone().into(),
            "--no-probe".into(),
        ])?)?);
    }
    let interpreter: Arc<dyn Interpreter> =
        Arc::new(ChatInterpreter::with_options(&args.url, ChatOptions::probed()));
    Ok(spawn_thread(interpreter, WorkerOptions::default())?)
}

fn worker_command(extra: &[std::ffi::OsString]) -> Result<tokio::process::Command, CliError> {
    let mut command = tokio::process::Command::new(std::env::current_exe()?);
    command.arg("sandbox-worker").args(extra);
    Ok(command)
}

/// The relay's application script, or an empty payload when it has none.
async fn fetch_script(client: &reqwest::Client, base_url: &str) -> Result<String, CliError> {
    let response = client
        .get(format!("{}/api/script", base_url.trim_end_matches('/')))
        .send()
        .await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        tracing::info!("relay has no application script, using the default prompt");
        return Ok(String::new());
    }
    Ok(response.error_for_status()?.text().await?)
}

async fn forward_keys(keys: mpsc::UnboundedSender<KeyInput>) {
    let mut stdin = tokio::io::stdin();
    let mut decoder = KeyDecoder::new();
    let mut buf = [0u8; 1024];
    loop {
        let read = match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(error = %err, "stdin read failed");
                break;
            }
        };
        for key in decoder.feed(&buf[..read]) {
            if keys.send(key).is_err() {
                return;
            }
        }
    }
}

fn run_probe(args: &ProbeArgs) -> Result<(), CliError> {
    let runtime = build_runtime()?;
    runtime.block_on(async {
        let client = health_client();
        let url = health_url(&args.url);
        let report = probe_health(
            &client,
            &url,
            args.attempts,
            Duration::from_millis(args.backoff_ms),
        )
        .await?;
        println!(
            "{} is healthy (attempts: {})",
            report.service.as_deref().unwrap_or(&args.url),
            report.attempts
        );

        if let Some(secs) = args.keepalive_secs {
            let stats = keepalive(&client, &url, Duration::from_secs(secs.max(1)), async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
            println!("pings: {}, failures: {}", stats.pings, stats.failures);
        }
        Ok(())
    })
}

fn run_credentials() -> Result<(), CliError> {
    let config = RelayConfig::from_env()?;
    let client = HttpModelClient::from_config(&config);
    let chain = config.credential_chain();
    let runtime = build_runtime()?;
    let credentials = runtime.block_on(chain.resolve(&ModelVerifier(&client)))?;
    println!("{}", serde_json::to_string_pretty(&credentials.summary())?);
    Ok(())
}

fn run_sandbox_worker(args: &SandboxWorkerArgs) -> Result<(), CliError> {
    let interpreter: Arc<dyn Interpreter> = match (&args.interpreter, &args.url) {
        (Some(program), _) => Arc::new(ProcessInterpreter::new(ProcessInterpreterConfig::program(
            program.clone(),
        ))),
        (None, url) => {
            let options = if args.no_probe {
                ChatOptions::probed()
            } else {
                ChatOptions::default()
            };
            let url = url.as_deref().unwrap_or(DEFAULT_URL);
            Arc::new(ChatInterpreter::with_options(url, options))
        }
    };
    // One thread of control, same as an in-process sandbox.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve_stdio(interpreter));
    runtime.shutdown_timeout(STDIN_SHUTDOWN_GRACE);
    Ok(())
}
