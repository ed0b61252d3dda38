//! # mpyboard – Serial
//!
//! MicroPython over a serial port (USB CDC or UART bridge):
//!
//! - **Transport** – `SerialTransport` trait, native `serialport` backend and
//!   an in-memory simulation that answers like a REPL
//! - **Port Discovery** – enumerate ports and reacquire a board by USB identity
//! - **Connection** – open/close lifecycle, read loop, command sink and
//!   one-shot auto-connect when a board is plugged in

pub mod serial;
