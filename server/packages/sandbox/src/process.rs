use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;

use serde_json::Value;
use termrelay_protocol::{write_envelope, Envelope, EnvelopeKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, Command};

use crate::interpreter::{ExecutionError, InitError, Interpreter, InterpreterFuture};
use crate::io::GuestIo;

#[derive(Debug, Clone)]
pub struct ProcessInterpreterConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Arguments that make the program report its version; used to check the
    /// runtime is present.
    pub version_args: Vec<String>,
    /// Command prefix that installs one dependency, e.g. `python3 -m pip install`.
    pub installer: Option<Vec<String>>,
    /// Dependencies installed as part of loading.
    pub dependencies: Vec<String>,
    pub file_suffix: String,
}

impl ProcessInterpreterConfig {
    pub fn python() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["-u".to_string()],
            env: HashMap::new(),
            version_args: vec!["--version".to_string()],
            installer: Some(vec![
                "python3".to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                "--quiet".to_string(),
            ]),
            dependencies: Vec::new(),
            file_suffix: ".py".to_string(),
        }
    }

    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            version_args: vec!["--version".to_string()],
            installer: None,
            dependencies: Vec::new(),
            file_suffix: String::new(),
        }
    }
}

/// Runs each `run-code` payload as a script in a fresh interpreter process.
///
/// Child stdout lines that decode as envelopes are honoured (`write-output`,
/// `write-error`, `input-request`, `code-result`), which lets a guest ask for
/// input through the same protocol; any other stdout line is plain output.
/// Stderr lines are error output.
#[derive(Debug, Clone)]
pub struct ProcessInterpreter {
    config: ProcessInterpreterConfig,
    name: String,
}

impl ProcessInterpreter {
    pub fn new(config: ProcessInterpreterConfig) -> Self {
        let name = config.program.to_string_lossy().to_string();
        Self { config, name }
    }

    async fn run_checked(&self, program: &str, args: &[String]) -> Result<(), String> {
        let output = Command::new(program)
            .args(args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| format!("failed to start `{program}`: {err}"))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(if stderr.is_empty() {
            format!("`{program}` exited with {}", output.status)
        } else {
            stderr
        })
    }

    async fn install_one(&self, name: &str) -> Result<(), InitError> {
        let Some((program, prefix)) = self
            .config
            .installer
            .as_ref()
            .and_then(|installer| installer.split_first())
        else {
            return Err(InitError::Dependency {
                name: name.to_string(),
                message: "no installer configured".to_string(),
            });
        };
        let mut args = prefix.to_vec();
        args.push(name.to_string());
        self.run_checked(program, &args)
            .await
            .map_err(|message| InitError::Dependency {
                name: name.to_string(),
                message,
            })
    }

    async fn run_script(&self, code: String, io: GuestIo) -> Result<Value, ExecutionError> {
        let mut script = tempfile::Builder::new()
            .prefix("termrelay-")
            .suffix(&self.config.file_suffix)
            .tempfile()?;
        script.write_all(code.as_bytes())?;
        script.flush()?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(script.path())
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let missing = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "guest pipes unavailable");
        let mut stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        let stderr_io = io.clone();
        let stderr_loop = async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_io.write_stderr(format!("{line}\n"));
            }
        };

        let stdout_loop = async {
            let mut result = Value::Null;
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(value) = relay_guest_line(&line, &io, &mut stdin).await? {
                    result = value;
                }
            }
            Ok::<Value, ExecutionError>(result)
        };

        let (result, ()) = tokio::join!(stdout_loop, stderr_loop);
        let result = result?;
        let status = child.wait().await?;
        if !status.success() {
            return Err(ExecutionError::Raised {
                message: format!("{} exited with {status}", self.name),
                trace: None,
            });
        }
        Ok(result)
    }
}

/// Forward one guest stdout line. Returns the guest's result value when the
/// line was a `code-result`.
async fn relay_guest_line(
    line: &str,
    io: &GuestIo,
    stdin: &mut ChildStdin,
) -> Result<Option<Value>, ExecutionError> {
    let envelope = match Envelope::decode(line) {
        Ok(envelope) => envelope,
        Err(_) => {
            io.write_stdout(format!("{line}\n"));
            return Ok(None);
        }
    };
    match envelope.kind {
        EnvelopeKind::WriteOutput => match envelope.role() {
            Some(role) => io.write_stdout_as(role, envelope.text().unwrap_or_default()),
            None => io.write_stdout(envelope.text().unwrap_or_default()),
        },
        EnvelopeKind::WriteError => io.write_stderr(envelope.text().unwrap_or_default()),
        EnvelopeKind::InputRequest => {
            let value = io.input(envelope.prompt().unwrap_or_default()).await?;
            // Answer with the guest's own id; the controller-facing id is
            // allocated separately by the worker.
            let guest_id = envelope.id.unwrap_or_default();
            write_envelope(stdin, &Envelope::input_response(guest_id, value))
                .await
                .map_err(|err| ExecutionError::raised(format!("failed to answer guest input: {err}")))?;
        }
        EnvelopeKind::CodeResult => {
            return Ok(Some(
                envelope.payload.get("value").cloned().unwrap_or(Value::Null),
            ))
        }
        other => {
            tracing::warn!(kind = %other, "guest emitted an envelope it may not send");
        }
    }
    Ok(None)
}

impl Interpreter for ProcessInterpreter {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self) -> InterpreterFuture<'_, Result<(), InitError>> {
        Box::pin(async move {
            let program = self.config.program.to_string_lossy().to_string();
            self.run_checked(&program, &self.config.version_args)
                .await
                .map_err(|message| InitError::Runtime {
                    message,
                    trace: None,
                })?;
            for dependency in &self.config.dependencies {
                self.install_one(dependency).await?;
            }
            Ok(())
        })
    }

    fn install<'a>(&'a self, dependency: &'a str) -> InterpreterFuture<'a, Result<(), InitError>> {
        Box::pin(self.install_one(dependency))
    }

    fn execute(&self, code: String, io: GuestIo) -> InterpreterFuture<'_, Result<Value, ExecutionError>> {
        Box::pin(self.run_script(code, io))
    }
}
