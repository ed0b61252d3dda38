//! In-memory stand-in for a MicroPython REPL, used by the simulated
//! transports.
//!
//! It echoes every line it receives, answers wrapped commands with
//! sentinel-framed output produced by a handler, and ends with a prompt.

use super::correlator::{end_sentinel, start_sentinel, unwrap_command};
use std::sync::Arc;

/// Maps a snippet to the text it would print.
pub type SnippetHandler = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Clone)]
pub struct ReplSimulator {
    handler: SnippetHandler,
    prompt: String,
}

impl ReplSimulator {
    pub fn new(handler: SnippetHandler) -> Self {
        Self {
            handler,
            prompt: ">>> ".to_string(),
        }
    }

    /// Every snippet prints `OK`.
    pub fn ok_only() -> Self {
        Self::new(Arc::new(|_| "OK".to_string()))
    }

    /// Device output for one received line, with `\r\n` line breaks.
    pub fn respond(&self, line: &str) -> String {
        let mut out = format!("{}\r\n", line);
        if let Some((id, snippet)) = unwrap_command(line) {
            out.push_str(&start_sentinel(&id));
            out.push_str("\r\n");
            let body = (self.handler)(&snippet);
            if !body.is_empty() {
                out.push_str(&body.replace('\n', "\r\n"));
                out.push_str("\r\n");
            }
            out.push_str(&end_sentinel(&id));
            out.push_str("\r\n");
        }
        out.push_str(&self.prompt);
        out
    }
}

impl std::fmt::Debug for ReplSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplSimulator")
            .field("prompt", &self.prompt)
            .finish()
    }
}
