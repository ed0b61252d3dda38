//! Sentinel-framed request/response correlation over an interactive REPL.
//!
//! A snippet is wrapped in a small program that prints `__START_<id>__`,
//! runs the snippet, and prints `__END_<id>__`. Incoming text is scanned for
//! the pair belonging to the active request; everything between them (minus
//! prompt chatter) is the response. Only one request is in flight per
//! connection; others wait in a FIFO queue.

use super::escape::{decode_repr, py_quote};
use super::literal::{is_bracketed, parse_literal};
use mpyb_core::{ReplError, ReplErrorKind, ReplResult};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_millis(10_000);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Seams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where wrapped commands are written. Implemented by each transport; the
/// implementation applies the connection's line-ending policy.
#[async_trait::async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(&self, line: &str) -> ReplResult<()>;
}

/// Anything that can run a snippet and hand back its decoded output.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `snippet` under the connection's configured command timeout.
    async fn execute_command(&self, snippet: &str) -> ReplResult<Value>;

    /// Run `snippet`, giving up on the response after `timeout`.
    async fn execute_command_with_timeout(
        &self,
        snippet: &str,
        timeout: Duration,
    ) -> ReplResult<Value>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Wire format
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `<unix-millis>_<6 alphanumerics>`
pub fn new_request_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

pub fn start_sentinel(id: &str) -> String {
    format!("__START_{}__", id)
}

pub fn end_sentinel(id: &str) -> String {
    format!("__END_{}__", id)
}

/// Build the single REPL line that runs `snippet` between sentinels.
///
/// The sentinel literals are split in the source so the echoed command
/// line never contains a complete sentinel.
pub fn wrap_command(id: &str, snippet: &str) -> String {
    let program = format!(
        "print('__START_' + '{id}__')\n\
         try:\n    exec({body})\n\
         except Exception as e:\n    print('ERROR:', repr(e))\n\
         print('__END_' + '{id}__')",
        id = id,
        body = py_quote(snippet),
    );
    format!("exec({})", py_quote(&program))
}

/// Inverse of [`wrap_command`]: recover `(id, snippet)` from a wire line.
/// Used by simulated devices.
pub fn unwrap_command(line: &str) -> Option<(String, String)> {
    let literal = line.trim().strip_prefix("exec(")?.strip_suffix(')')?;
    let program = decode_repr(literal).ok()?;
    let mut lines = program.lines();
    let id = lines
        .next()?
        .strip_prefix("print('__START_' + '")?
        .strip_suffix("__')")?
        .to_string();
    let snippet = lines
        .find_map(|l| l.trim().strip_prefix("exec("))?
        .strip_suffix(')')?;
    Some((id, decode_repr(snippet).ok()?))
}

fn is_chatter(line: &str, id: &str) -> bool {
    let t = line.trim_start();
    if t.starts_with('\'') || t.starts_with('"') {
        return false;
    }
    t.starts_with(">>>") || t.starts_with("...") || t.starts_with("===") || line.contains(id)
}

/// Find the payload between this request's sentinels in `buffer`.
///
/// Returns `None` until both sentinels have arrived.
pub fn extract_payload(buffer: &str, id: &str) -> Option<String> {
    let start = start_sentinel(id);
    let end = end_sentinel(id);
    let s = buffer.find(&start)? + start.len();
    let e = s + buffer[s..].find(&end)?;
    let region = &buffer[s..e];
    let body = match region.find('\n') {
        Some(nl) => &region[nl + 1..],
        None => "",
    };
    let kept: Vec<&str> = body
        .trim()
        .lines()
        .filter(|line| !is_chatter(line, id))
        .collect();
    Some(kept.join("\n").trim().to_string())
}

/// Bracketed payloads are parsed as Python literals; everything else (and
/// anything that fails to parse) is returned as a string.
pub fn decode_payload(payload: &str) -> Value {
    if is_bracketed(payload) {
        if let Ok(v) = parse_literal(payload) {
            return v;
        }
    }
    Value::String(payload.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Correlator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingCommand {
    id: String,
    buffer: String,
    reply: oneshot::Sender<ReplResult<Value>>,
    issued_at: Instant,
}

/// The in-flight slot, granted by the queue of one teardown epoch.
struct Slot {
    _permit: OwnedSemaphorePermit,
    epoch: u64,
}

pub struct Correlator {
    label: String,
    queue: Mutex<Arc<Semaphore>>,
    queue_timeout: Duration,
    pending: Mutex<Option<PendingCommand>>,
    seen_len: Mutex<usize>,
    /// Bumped by [`Correlator::reject_all`] together with the queue swap.
    epoch: AtomicU64,
}

impl Correlator {
    /// `label` prefixes log lines, e.g. `serial:3f2a...`.
    pub fn new(label: impl Into<String>, queue_timeout: Duration) -> Self {
        Self {
            label: label.into(),
            queue: Mutex::new(Arc::new(Semaphore::new(1))),
            queue_timeout,
            pending: Mutex::new(None),
            seen_len: Mutex::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    pub async fn active_request_id(&self) -> Option<String> {
        self.pending.lock().await.as_ref().map(|p| p.id.clone())
    }

    /// Send `snippet` through `sink` and wait for its framed response.
    pub async fn execute_command(
        &self,
        sink: &dyn CommandSink,
        snippet: &str,
        timeout: Duration,
    ) -> ReplResult<Value> {
        let slot = self.acquire_slot().await?;
        let id = new_request_id();
        let rx = self.install(&slot, &id).await?;

        log::debug!("[{}] -> request {}", self.label, id);
        if let Err(e) = sink.send_command(&wrap_command(&id, snippet)).await {
            log::warn!("[{}] send of request {} failed: {}", self.label, id, e);
            self.discard(&id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ReplError::queue_cleared()),
            Err(_) => {
                self.discard(&id).await;
                log::warn!("[{}] request {} timed out after {:?}", self.label, id, timeout);
                Err(ReplError::timeout(format!(
                    "Command timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn acquire_slot(&self) -> ReplResult<Slot> {
        let (queue, epoch) = {
            let queue = self.queue.lock().await;
            (queue.clone(), self.epoch.load(Ordering::SeqCst))
        };
        match tokio::time::timeout(self.queue_timeout, queue.acquire_owned()).await {
            Err(_) => {
                log::warn!("[{}] command waited {:?} in queue", self.label, self.queue_timeout);
                Err(ReplError::queue_timeout())
            }
            Ok(Err(_)) => Err(ReplError::queue_cleared()),
            Ok(Ok(permit)) => Ok(Slot {
                _permit: permit,
                epoch,
            }),
        }
    }

    /// Make `id` the active request unless a teardown ran after `slot`
    /// was granted.
    async fn install(
        &self,
        slot: &Slot,
        id: &str,
    ) -> ReplResult<oneshot::Receiver<ReplResult<Value>>> {
        let mut pending = self.pending.lock().await;
        if self.epoch.load(Ordering::SeqCst) != slot.epoch {
            log::debug!("[{}] request {} dropped by teardown", self.label, id);
            return Err(ReplError::queue_cleared());
        }
        let (tx, rx) = oneshot::channel();
        *pending = Some(PendingCommand {
            id: id.to_string(),
            buffer: String::new(),
            reply: tx,
            issued_at: Instant::now(),
        });
        Ok(rx)
    }

    /// Incremental variant: `chunk` is new text only.
    pub async fn feed(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut guard = self.pending.lock().await;
        let payload = match guard.as_mut() {
            None => return,
            Some(p) => {
                p.buffer.push_str(chunk);
                extract_payload(&p.buffer, &p.id)
            }
        };
        if let (Some(payload), Some(done)) = (payload, guard.take()) {
            log::debug!(
                "[{}] <- request {} resolved in {:?}",
                self.label,
                done.id,
                done.issued_at.elapsed()
            );
            // receiver gone means the caller already timed out
            let _ = done.reply.send(Ok(decode_payload(&payload)));
        }
    }

    /// Full-text variant: only the suffix beyond the previously seen length
    /// is new. A shorter text (cleared view) counts as entirely new.
    pub async fn process_message(&self, full_text: &str) {
        let fresh = {
            let mut seen = self.seen_len.lock().await;
            let fresh = if full_text.len() < *seen {
                full_text
            } else {
                full_text.get(*seen..).unwrap_or(full_text)
            };
            *seen = full_text.len();
            fresh.to_string()
        };
        self.feed(&fresh).await;
    }

    /// Reject the active command and every queued caller.
    pub async fn reject_all(&self, reason: &str) {
        {
            let mut queue = self.queue.lock().await;
            queue.close();
            *queue = Arc::new(Semaphore::new(1));
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(p) = self.pending.lock().await.take() {
            log::info!("[{}] rejecting request {}: {}", self.label, p.id, reason);
            let _ = p.reply.send(Err(ReplError::new(
                ReplErrorKind::QueueCleared,
                format!("Command queue cleared: {}", reason),
            )));
        }
        *self.seen_len.lock().await = 0;
    }

    async fn discard(&self, id: &str) {
        let mut guard = self.pending.lock().await;
        if guard.as_ref().map(|p| p.id == id).unwrap_or(false) {
            guard.take();
        }
    }
}
