//! Subscriber setup for the binary. Library crates log through the `log`
//! facade; the `tracing-log` bridge forwards those records here.

use mpyb_core::{ReplError, ReplResult};
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins unless `verbose` is set; the fallback level is `info`.
pub fn init_logging(verbose: bool) -> ReplResult<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    #[cfg(feature = "logs-json")]
    let result = builder.json().try_init();
    #[cfg(not(feature = "logs-json"))]
    let result = builder.try_init();

    result.map_err(|e| ReplError::internal(format!("Logging init failed: {}", e)))
}
