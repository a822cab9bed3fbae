//! Message protocol spoken between a terminal controller and its execution
//! sandbox: a closed set of envelope kinds, a typed dispatch table, the
//! correlation registry that pairs asynchronous requests with their replies,
//! and the newline-delimited JSON framing used when the two sides live in
//! different processes.

pub mod codec;
pub mod correlation;
pub mod dispatch;
pub mod envelope;

pub use codec::{read_envelopes, write_envelope};
pub use correlation::{CorrelationError, CorrelationId, CorrelationRegistry, Parked, Resolution};
pub use dispatch::{Dispatch, Dispatcher};
pub use envelope::{Envelope, EnvelopeKind, OutputRole, ProtocolError};
