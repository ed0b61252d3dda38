//! WebSocket plumbing for WebREPL.
//!
//! A link is a sink/source pair. `WsConnector` opens real sockets through
//! `tokio-tungstenite`; `SimulatedConnector` plays a password-protected
//! board in memory.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use mpyb_core::{types::validate_ws_url, ReplError, ReplErrorKind, ReplResult};
use mpyb_repl::repl::ReplSimulator;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Seams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait SocketSink: Send {
    /// One text frame.
    async fn send_text(&mut self, text: &str) -> ReplResult<()>;
    async fn close(&mut self) -> ReplResult<()>;
}

#[async_trait::async_trait]
pub trait SocketSource: Send {
    /// Next chunk of device text. `None` once the peer closed the socket.
    async fn next_text(&mut self) -> Option<ReplResult<String>>;
}

pub type SocketLink = (Box<dyn SocketSink>, Box<dyn SocketSource>);

#[async_trait::async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> ReplResult<SocketLink>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  tokio-tungstenite
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait::async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, url: &str) -> ReplResult<SocketLink> {
        validate_ws_url(url)?;
        log::info!("[webrepl] opening {}", url);
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ReplError::transport(format!("WebSocket connect failed: {}", e)))?;
        let (write, read) = ws_stream.split();
        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }
}

struct WsSink {
    write: SplitSink<WsStream, WsMessage>,
}

#[async_trait::async_trait]
impl SocketSink for WsSink {
    async fn send_text(&mut self, text: &str) -> ReplResult<()> {
        self.write
            .send(WsMessage::text(text.to_string()))
            .await
            .map_err(|e| ReplError::transport(format!("WebSocket send failed: {}", e)))
    }

    async fn close(&mut self) -> ReplResult<()> {
        self.write
            .close()
            .await
            .map_err(|e| ReplError::transport(format!("WebSocket close failed: {}", e)))
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait::async_trait]
impl SocketSource for WsSource {
    async fn next_text(&mut self) -> Option<ReplResult<String>> {
        while let Some(msg_result) = self.read.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.as_str().to_string())),
                Ok(WsMessage::Binary(data)) => {
                    return Some(Ok(String::from_utf8_lossy(&data).into_owned()))
                }
                Ok(WsMessage::Close(frame)) => {
                    log::debug!("[webrepl] close frame: {:?}", frame);
                    return None;
                }
                // tungstenite answers pings itself
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(ReplError::transport(format!(
                        "WebSocket error: {}",
                        e
                    ))))
                }
            }
        }
        None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated board
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const BANNER: &str = "\r\nWebREPL connected\r\n>>> ";

#[derive(Debug)]
enum SimFrame {
    Text(String),
    Close,
    Error(String),
}

#[derive(Debug, Default)]
struct DeviceState {
    authed: bool,
    pw_buf: String,
    line_buf: String,
}

/// In-memory WebREPL board. Every `connect` opens a fresh session that
/// asks for the password (when one is set) and then answers like a REPL.
pub struct SimulatedConnector {
    password: Option<String>,
    repl: ReplSimulator,
    close_on_denied: bool,
    fail_connects: AtomicU32,
    connects: AtomicU32,
    connect_delay_ms: AtomicU64,
    live: Arc<AtomicU32>,
    links: Mutex<Vec<mpsc::UnboundedSender<SimFrame>>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl SimulatedConnector {
    pub fn new(password: Option<&str>, repl: ReplSimulator) -> Arc<Self> {
        Self::build(password.map(|p| p.to_string()), repl, false)
    }

    /// Like a stock board: a wrong password ends the session.
    pub fn closing_on_denied(password: &str, repl: ReplSimulator) -> Arc<Self> {
        Self::build(Some(password.to_string()), repl, true)
    }

    fn build(password: Option<String>, repl: ReplSimulator, close_on_denied: bool) -> Arc<Self> {
        Arc::new(Self {
            password,
            repl,
            close_on_denied,
            fail_connects: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            connect_delay_ms: AtomicU64::new(0),
            live: Arc::new(AtomicU32::new(0)),
            links: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make every connect take `delay` before the socket opens.
    pub fn delay_connects(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sessions whose client side has not been closed or dropped.
    pub fn live_sessions(&self) -> u32 {
        self.live.load(Ordering::SeqCst)
    }

    /// Connection attempts seen, including failed ones.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// The board drops every open session.
    pub async fn drop_links(&self) {
        for tx in self.links.lock().await.drain(..) {
            let _ = tx.send(SimFrame::Close);
        }
    }

    /// Every open session fails with a socket error.
    pub async fn break_links(&self, reason: &str) {
        for tx in self.links.lock().await.drain(..) {
            let _ = tx.send(SimFrame::Error(reason.to_string()));
        }
    }

    /// Push unsolicited output to every open session.
    pub async fn emit(&self, text: &str) {
        for tx in self.links.lock().await.iter() {
            let _ = tx.send(SimFrame::Text(text.to_string()));
        }
    }

    /// Frames received from clients, in order.
    pub async fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl SocketConnector for SimulatedConnector {
    async fn connect(&self, url: &str) -> ReplResult<SocketLink> {
        validate_ws_url(url)?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let pending_failures = self.fail_connects.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_connects.store(pending_failures - 1, Ordering::SeqCst);
            return Err(ReplError::new(
                ReplErrorKind::ConnectionRefused,
                format!("WebSocket connect failed: connection refused ({})", url),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let greeting = match &self.password {
            Some(_) => "Password: ",
            None => BANNER,
        };
        let _ = tx.send(SimFrame::Text(greeting.to_string()));
        self.links.lock().await.push(tx.clone());
        self.live.fetch_add(1, Ordering::SeqCst);

        let sink = SimSink {
            password: self.password.clone(),
            repl: self.repl.clone(),
            close_on_denied: self.close_on_denied,
            state: DeviceState {
                authed: self.password.is_none(),
                ..Default::default()
            },
            to_client: tx,
            sent: self.sent.clone(),
            live: self.live.clone(),
            closed: false,
        };
        Ok((Box::new(sink), Box::new(SimSource { rx })))
    }
}

struct SimSink {
    password: Option<String>,
    repl: ReplSimulator,
    close_on_denied: bool,
    state: DeviceState,
    to_client: mpsc::UnboundedSender<SimFrame>,
    sent: Arc<Mutex<Vec<String>>>,
    live: Arc<AtomicU32>,
    closed: bool,
}

impl SimSink {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn reply(&self, text: String) -> ReplResult<()> {
        self.to_client
            .send(SimFrame::Text(text))
            .map_err(|_| ReplError::stream_closed("Simulated socket closed"))
    }
}

#[async_trait::async_trait]
impl SocketSink for SimSink {
    async fn send_text(&mut self, text: &str) -> ReplResult<()> {
        if self.closed {
            return Err(ReplError::stream_closed("Socket already closed"));
        }
        self.sent.lock().await.push(text.to_string());

        if !self.state.authed {
            self.state.pw_buf.push_str(text);
            if let Some(idx) = self.state.pw_buf.find('\r') {
                let attempt: String = self.state.pw_buf.drain(..=idx).collect();
                self.state.pw_buf.clear();
                if Some(attempt.trim_end_matches('\r')) == self.password.as_deref() {
                    self.state.authed = true;
                    self.reply(BANNER.to_string())?;
                } else if self.close_on_denied {
                    self.reply("\r\nAccess denied\r\n".to_string())?;
                    let _ = self.to_client.send(SimFrame::Close);
                } else {
                    self.reply("\r\nAccess denied\r\nPassword: ".to_string())?;
                }
            }
            return Ok(());
        }

        self.state.line_buf.push_str(text);
        while let Some(idx) = self.state.line_buf.find(['\r', '\n']) {
            let line: String = self.state.line_buf.drain(..idx).collect();
            self.state.line_buf.drain(..1);
            if line.is_empty() {
                continue;
            }
            let out = self.repl.respond(&line);
            self.reply(out)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> ReplResult<()> {
        self.release();
        Ok(())
    }
}

impl Drop for SimSink {
    fn drop(&mut self) {
        self.release();
    }
}

struct SimSource {
    rx: mpsc::UnboundedReceiver<SimFrame>,
}

#[async_trait::async_trait]
impl SocketSource for SimSource {
    async fn next_text(&mut self) -> Option<ReplResult<String>> {
        match self.rx.recv().await {
            Some(SimFrame::Text(text)) => Some(Ok(text)),
            Some(SimFrame::Error(reason)) => Some(Err(ReplError::transport(reason))),
            Some(SimFrame::Close) | None => None,
        }
    }
}
