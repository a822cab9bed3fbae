//! Execution sandbox: a single logical thread of control that runs
//! application code and talks to its controller only through envelopes.

pub mod interpreter;
pub mod io;
pub mod link;
pub mod process;
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod worker;

pub use interpreter::{ExecutionError, InitError, Interpreter, InterpreterFuture};
pub use io::{GuestCall, GuestIo, InputError, OutputStream};
pub use link::{SandboxLink, SandboxPeer, SandboxTeardown};
pub use process::{ProcessInterpreter, ProcessInterpreterConfig};
pub use state::{SandboxEvent, SandboxState, TransitionError};
pub use worker::{serve_stdio, spawn_process, spawn_thread, SandboxWorker, WorkerOptions};
