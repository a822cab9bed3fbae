//! A deterministic interpreter for tests.
//!
//! Code is a line-oriented script:
//!
//! ```text
//! print Hello, ${name}
//! eprint warning
//! input name Name?
//! sleep 50
//! fail something broke
//! return 42
//! ```
//!
//! `${var}` expands to a value captured by an earlier `input`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::interpreter::{ExecutionError, InitError, Interpreter, InterpreterFuture};
use crate::io::{GuestIo, InputError};

#[derive(Debug, Default)]
pub struct ScriptedInterpreter {
    prepare_delay: Duration,
    prepare_failure: Option<String>,
    installable: HashSet<String>,
    prepare_calls: AtomicUsize,
    installed: Mutex<Vec<String>>,
    input_failures: Mutex<Vec<InputError>>,
}

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    pub fn failing_prepare(mut self, message: impl Into<String>) -> Self {
        self.prepare_failure = Some(message.into());
        self
    }

    pub fn with_installable(mut self, name: impl Into<String>) -> Self {
        self.installable.insert(name.into());
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn prepare_calls(&self) -> usize {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn installed(&self) -> Vec<String> {
        self.installed
            .lock()
            .map(|installed| installed.clone())
            .unwrap_or_default()
    }

    /// Errors `input` lines received instead of a value, in order.
    pub fn input_failures(&self) -> Vec<InputError> {
        self.input_failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_default()
    }
}

fn interpolate(text: &str, vars: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("${{{name}}}"), value);
    }
    out
}

async fn run_script(
    code: String,
    io: GuestIo,
    input_failures: &Mutex<Vec<InputError>>,
) -> Result<Value, ExecutionError> {
    let mut vars = HashMap::new();
    let mut result = Value::Null;
    for line in code.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let (op, rest) = line.split_once(' ').unwrap_or((line, ""));
        match op {
            "print" => io.write_stdout(format!("{}\n", interpolate(rest, &vars))),
            "eprint" => io.write_stderr(format!("{}\n", interpolate(rest, &vars))),
            "input" => {
                let (var, prompt) = rest.split_once(' ').unwrap_or((rest, ""));
                let value = match io.input(interpolate(prompt, &vars)).await {
                    Ok(value) => value,
                    Err(err) => {
                        if let Ok(mut failures) = input_failures.lock() {
                            failures.push(err.clone());
                        }
                        return Err(err.into());
                    }
                };
                vars.insert(var.to_string(), value);
            }
            "sleep" => {
                let ms = rest.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            "fail" => {
                return Err(ExecutionError::Raised {
                    message: interpolate(rest, &vars),
                    trace: Some(format!("  at line `{line}`")),
                })
            }
            "return" => {
                let rest = interpolate(rest, &vars);
                result = serde_json::from_str(&rest).unwrap_or(Value::String(rest));
            }
            other => return Err(ExecutionError::raised(format!("unknown instruction `{other}`"))),
        }
    }
    Ok(result)
}

impl Interpreter for ScriptedInterpreter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn prepare(&self) -> InterpreterFuture<'_, Result<(), InitError>> {
        Box::pin(async move {
            self.prepare_calls.fetch_add(1, Ordering::SeqCst);
            if !self.prepare_delay.is_zero() {
                tokio::time::sleep(self.prepare_delay).await;
            }
            match &self.prepare_failure {
                Some(message) => Err(InitError::Runtime {
                    message: message.clone(),
                    trace: Some("  in prepare".to_string()),
                }),
                None => Ok(()),
            }
        })
    }

    fn install<'a>(&'a self, dependency: &'a str) -> InterpreterFuture<'a, Result<(), InitError>> {
        Box::pin(async move {
            if !self.installable.contains(dependency) {
                return Err(InitError::Dependency {
                    name: dependency.to_string(),
                    message: "no such package".to_string(),
                });
            }
            if let Ok(mut installed) = self.installed.lock() {
                installed.push(dependency.to_string());
            }
            Ok(())
        })
    }

    fn execute(&self, code: String, io: GuestIo) -> InterpreterFuture<'_, Result<Value, ExecutionError>> {
        Box::pin(run_script(code, io, &self.input_failures))
    }
}
