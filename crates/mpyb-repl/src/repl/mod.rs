//! REPL crate: sub-modules.

pub mod console;
pub mod correlator;
pub mod escape;
pub mod files;
pub mod literal;
pub mod monitor;
pub mod simulator;

pub use console::{ConsoleOptions, ReplConsole};
pub use correlator::{CommandRunner, CommandSink, Correlator};
pub use files::{FileEntry, FileKind, FileSystem};
pub use monitor::{extract_marker, run_monitor, MonitorScript};
pub use simulator::{ReplSimulator, SnippetHandler};
