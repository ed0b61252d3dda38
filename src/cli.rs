use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "mpyboard",
    about = "Manage MicroPython boards over WebREPL and serial",
    author,
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Configuration directory (default: <platform config dir>/mpyboard).
    #[arg(long, global = true, env = "MPYBOARD_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Debug logging (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List saved connections.
    List {
        /// Print the list as JSON (for scripting).
        #[arg(long)]
        json: bool,
    },
    /// Save a new connection. Give either --url or --port.
    Add {
        #[arg(long)]
        name: String,
        /// WebREPL address, ws://host:8266 or wss://...
        #[arg(long, conflicts_with_all = ["port", "baud"])]
        url: Option<String>,
        /// Serial port name (e.g. /dev/ttyACM0, COM3).
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        baud: Option<u32>,
        /// Command terminator: none, lf, cr or crlf.
        #[arg(long, default_value = "cr")]
        line_ending: String,
        /// Prefix console lines with [HH:MM:SS].
        #[arg(long)]
        timestamps: bool,
    },
    /// Delete a saved connection.
    Remove { connection: String },
    /// Enumerate serial ports with their USB identity.
    Ports {
        #[arg(long)]
        json: bool,
    },
    /// Interactive console. Lines typed are sent as commands; `.clear`,
    /// `.reconnect` and `.interrupt` are handled locally.
    Console {
        connection: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Run a Python snippet and print its decoded result.
    Exec {
        connection: String,
        snippet: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// List a directory on the board.
    Ls {
        connection: String,
        #[arg(default_value = "/")]
        path: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Print a file from the board.
    Cat {
        connection: String,
        path: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Upload a local text file.
    Put {
        connection: String,
        local: PathBuf,
        remote: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    Mkdir {
        connection: String,
        path: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    Rm {
        connection: String,
        path: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    Rmdir {
        connection: String,
        path: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Run a monitoring script: system, gpio, i2c or wifi.
    Monitor {
        connection: String,
        script: String,
        #[command(flatten)]
        session: SessionArgs,
    },
}

/// Per-invocation overrides; none of these are saved.
#[derive(Debug, Clone, clap::Args)]
pub struct SessionArgs {
    /// WebREPL password.
    #[arg(long, env = "MPYBOARD_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// Serial port to use instead of the one found by USB identity.
    #[arg(long)]
    pub port: Option<String>,
}
