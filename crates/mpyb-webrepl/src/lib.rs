//! # mpyboard – WebREPL
//!
//! MicroPython over the WebREPL WebSocket protocol:
//!
//! - **Transport** – sink/source seams, a `tokio-tungstenite` connector and an
//!   in-memory board for tests
//! - **Auth** – password prompt detection and one-shot submission
//! - **Connection** – lifecycle, command sink and reconnect with backoff

pub mod webrepl;
