//! # mpyboard
//!
//! Host side of the MicroPython board manager:
//!
//! - **Connection** – one handle over a serial or WebREPL connection
//! - **Registry** – add/update/remove connections and look them up
//! - **Config** – dashboard settings and the persisted connection list
//! - **Host** – settings, store and registry brought up together
//! - **CLI** – `clap` command line and its handlers
//! - **Logging** – `tracing-subscriber` setup for the binary

pub mod cli;
pub mod commands;
pub mod config;
pub mod connection;
pub mod host;
pub mod logging;
pub mod registry;

pub use connection::{DeviceConnection, TransportSet};
pub use host::{wait_until_ready, Host};
pub use registry::{ConnectionRegistry, RegistryAction, RegistryState};
