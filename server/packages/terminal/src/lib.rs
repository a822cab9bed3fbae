//! The terminal side of a session: a line-oriented surface, the loading
//! indicator and the controller that drives a sandbox over envelopes.

pub mod controller;
pub mod loading;
pub mod surface;

pub use controller::{
    ControllerError, ControllerOptions, RunOutcome, SandboxController, SandboxSession,
};
pub use loading::{LoadingIndicator, Tick};
pub use surface::{
    keys_from_bytes, KeyDecoder, KeyInput, LineBuffer, LineEdit, OutputStyle, Terminal,
    TerminalError,
};
