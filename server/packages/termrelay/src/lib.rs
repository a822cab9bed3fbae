//! Streaming relay between a hosted model and the sandboxed terminal, plus
//! the chat program that runs inside the sandbox and the `termrelay` CLI.

pub mod chat;
pub mod cli;
pub mod config;
pub mod health;
pub mod model_client;
pub mod relay;
pub mod router;

pub use config::{ConfigError, InvokeMode, RelayConfig};
pub use relay::{RelaySettings, StreamChunk, StreamingRelay};
pub use router::{build_router, build_router_with_state, ApiDoc, AppState};
