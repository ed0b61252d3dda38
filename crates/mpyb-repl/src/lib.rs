//! # mpyboard – REPL
//!
//! Everything that talks *to the interpreter* rather than to the wire:
//!
//! - **Correlator** – sentinel-framed request/response over the shared REPL stream
//! - **Literal** – Python literal to JSON decoding
//! - **Escape** – Python string escaping and `repr()` decoding
//! - **Files** – list / read / write / mkdir / rm / rmdir as REPL snippets
//! - **Monitor** – built-in system, GPIO, I2C and Wi-Fi snippets
//! - **Console** – per-connection status, display lines and event stream

pub mod repl;
