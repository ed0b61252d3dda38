//! # mpyboard – Core
//!
//! Shared building blocks used by every transport crate:
//!
//! - **Types** – connection descriptors, transport addresses, line endings
//! - **Errors** – the `ReplError` type returned across the workspace
//! - **Line Buffer** – terminal line accumulation and control-sequence stripping
//! - **Status** – the connection state machine shared by serial and WebREPL
//! - **Retry** – exponential reconnect backoff

pub mod error;
pub mod line_buffer;
pub mod retry;
pub mod status;
pub mod types;

pub use error::{ReplError, ReplErrorKind, ReplResult};
pub use line_buffer::{LineBuffer, StreamDecoder};
pub use retry::{ReconnectPolicy, RetryDecision, RetryState};
pub use status::{ConsoleEvent, StatusMachine, Transition};
pub use types::*;
