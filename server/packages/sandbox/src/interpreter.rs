use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use termrelay_error::RelayError;
use thiserror::Error;

use crate::io::{GuestIo, InputError};

pub type InterpreterFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure to bring the runtime or one of its dependencies up. Fatal to the
/// sandbox session.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("runtime unavailable: {message}")]
    Runtime {
        message: String,
        trace: Option<String>,
    },
    #[error("failed to install dependency `{name}`: {message}")]
    Dependency { name: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InitError {
    pub fn trace(&self) -> Option<String> {
        match self {
            InitError::Runtime { trace, .. } => trace.clone(),
            _ => None,
        }
    }
}

/// Failure raised by guest code during one `run-code`. Contained to that run.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{message}")]
    Raised {
        message: String,
        trace: Option<String>,
    },
    #[error("input was cancelled")]
    InputCancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutionError {
    pub fn raised(message: impl Into<String>) -> Self {
        ExecutionError::Raised {
            message: message.into(),
            trace: None,
        }
    }

    pub fn trace(&self) -> Option<&str> {
        match self {
            ExecutionError::Raised { trace, .. } => trace.as_deref(),
            _ => None,
        }
    }
}

impl From<InitError> for RelayError {
    fn from(err: InitError) -> Self {
        RelayError::InitializationFault {
            trace: err.trace(),
            message: err.to_string(),
        }
    }
}

impl From<ExecutionError> for RelayError {
    fn from(err: ExecutionError) -> Self {
        RelayError::ExecutionFault {
            trace: err.trace().map(str::to_string),
            message: err.to_string(),
        }
    }
}

impl From<InputError> for ExecutionError {
    fn from(_: InputError) -> Self {
        ExecutionError::InputCancelled
    }
}

/// The code runtime hosted by a sandbox worker.
///
/// Implementations run on the worker's single thread of control. The only
/// place guest execution may park is [`GuestIo::input`]; everything else runs
/// to completion or to its own IO boundary.
pub trait Interpreter: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Bring the runtime up and install its required dependencies. Called at
    /// most once per sandbox.
    fn prepare(&self) -> InterpreterFuture<'_, Result<(), InitError>>;

    /// Install one additional dependency on request.
    fn install<'a>(&'a self, dependency: &'a str) -> InterpreterFuture<'a, Result<(), InitError>>;

    /// Execute `code` with redirected IO and return its result value.
    fn execute(&self, code: String, io: GuestIo) -> InterpreterFuture<'_, Result<Value, ExecutionError>>;
}
