//! Per-connection console state: status, display lines, correlator and the
//! event stream observed by hosts.

use super::correlator::{CommandSink, Correlator};
use mpyb_core::line_buffer::DEFAULT_MAX_LINES;
use mpyb_core::{
    ConnectionStatus, ConsoleEvent, LineBuffer, ReplResult, StatusMachine, Transition,
    TransportKind,
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct ConsoleOptions {
    pub max_lines: usize,
    pub show_timestamp: bool,
    pub command_timeout: Duration,
    pub queue_timeout: Duration,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_MAX_LINES,
            show_timestamp: false,
            command_timeout: super::correlator::DEFAULT_COMMAND_TIMEOUT,
            queue_timeout: super::correlator::DEFAULT_QUEUE_TIMEOUT,
        }
    }
}

pub struct ReplConsole {
    label: String,
    status: RwLock<StatusMachine>,
    lines: Mutex<LineBuffer>,
    correlator: Correlator,
    command_timeout: Duration,
    events: broadcast::Sender<ConsoleEvent>,
}

impl ReplConsole {
    pub fn new(
        kind: TransportKind,
        connection_id: &str,
        target: impl Into<String>,
        options: ConsoleOptions,
    ) -> Self {
        let label = format!("{}:{}", kind.label(), connection_id);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            correlator: Correlator::new(label.clone(), options.queue_timeout),
            label,
            status: RwLock::new(StatusMachine::new(kind, target)),
            lines: Mutex::new(LineBuffer::new(options.max_lines, options.show_timestamp)),
            command_timeout: options.command_timeout,
            events,
        }
    }

    /// Log prefix, `<transport>:<id>`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.status.read().await.current()
    }

    pub async fn set_target(&self, target: impl Into<String>) {
        self.status.write().await.set_target(target);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events.subscribe()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Apply a status transition, announce it and broadcast it.
    pub async fn set_status(&self, to: ConnectionStatus, reason: &str) -> ReplResult<Transition> {
        let transition = self.status.write().await.transition(to, reason)?;
        log::info!(
            "[{}] {} -> {}{}",
            self.label,
            transition.from,
            transition.to,
            if reason.is_empty() {
                String::new()
            } else {
                format!(" ({})", reason)
            }
        );
        if let Some(line) = &transition.system_line {
            self.system_line(line).await;
        }
        let _ = self.events.send(ConsoleEvent::StatusChanged {
            from: transition.from,
            to: transition.to,
        });
        Ok(transition)
    }

    /// Device output: display first, then the correlator.
    pub async fn ingest(&self, raw: &str) -> String {
        let clean = self.lines.lock().await.append(raw);
        if !clean.is_empty() {
            self.correlator.feed(&clean).await;
            let _ = self.events.send(ConsoleEvent::Output {
                text: clean.clone(),
            });
        }
        clean
    }

    pub async fn system_line(&self, message: &str) {
        self.lines.lock().await.push_system(message);
        let _ = self.events.send(ConsoleEvent::SystemLine {
            text: message.to_string(),
        });
    }

    /// Clears the view only; an in-flight command keeps its own buffer.
    pub async fn clear_output(&self) {
        self.lines.lock().await.clear();
        let _ = self.events.send(ConsoleEvent::Cleared);
    }

    pub async fn lines(&self) -> Vec<String> {
        self.lines.lock().await.lines()
    }

    pub async fn text(&self) -> String {
        self.lines.lock().await.text()
    }

    pub async fn set_show_timestamp(&self, on: bool) {
        self.lines.lock().await.set_show_timestamp(on);
    }

    pub async fn execute_via(&self, sink: &dyn CommandSink, snippet: &str) -> ReplResult<Value> {
        self.execute_with_timeout(sink, snippet, self.command_timeout)
            .await
    }

    pub async fn execute_with_timeout(
        &self,
        sink: &dyn CommandSink,
        snippet: &str,
        timeout: Duration,
    ) -> ReplResult<Value> {
        self.correlator.execute_command(sink, snippet, timeout).await
    }

    /// Reject everything pending on this console.
    pub async fn teardown(&self, reason: &str) {
        self.correlator.reject_all(reason).await;
    }
}
