//! One MicroPython device over WebREPL.
//!
//! Same shape as the serial connection plus two things serial does not
//! have: the password handshake and automatic reconnection with
//! exponential backoff after an unexpected close.

use crate::webrepl::auth::{AuthAction, AuthTracker};
use crate::webrepl::transport::{SocketConnector, SocketSink, SocketSource};
use futures_util::future::BoxFuture;
use mpyb_core::status::{give_up_line, retry_line};
use mpyb_core::types::validate_ws_url;
use mpyb_core::{
    ConnectionDescriptor, ConnectionStatus, ConsoleEvent, ReconnectPolicy, ReplError, ReplResult,
    RetryDecision, RetryState, TransportAddress, TransportKind,
};
use mpyb_repl::repl::{CommandRunner, CommandSink, ConsoleOptions, ReplConsole};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

const CLOSED_REASON: &str = "Conexão encerrada";
const USER_REASON: &str = "Desconectado pelo usuário";

struct SocketLinkState {
    sink: Arc<Mutex<Box<dyn SocketSink>>>,
    shutdown_tx: mpsc::Sender<()>,
    generation: u64,
}

pub struct WebReplConnection {
    id: String,
    descriptor: RwLock<ConnectionDescriptor>,
    console: ReplConsole,
    connector: Arc<dyn SocketConnector>,
    link: Mutex<Option<SocketLinkState>>,
    generation: AtomicU64,
    /// Bumped by every open and disconnect, under the link lock. A socket
    /// that opens after the value moved on is closed instead of installed.
    attempt: AtomicU64,
    auth: Mutex<AuthTracker>,
    /// Password for this session; starts from the descriptor, replaced by
    /// whatever the user types, dropped after a rejection.
    session_password: Mutex<Option<String>>,
    retry: Mutex<RetryState>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    manual_disconnect: AtomicBool,
    auth_failed: AtomicBool,
}

impl WebReplConnection {
    pub fn new(
        descriptor: ConnectionDescriptor,
        connector: Arc<dyn SocketConnector>,
        options: ConsoleOptions,
        policy: ReconnectPolicy,
    ) -> ReplResult<Arc<Self>> {
        if descriptor.kind() != TransportKind::Socket {
            return Err(ReplError::validation("Not a WebREPL connection descriptor"));
        }
        descriptor.validate()?;
        let mut options = options;
        options.show_timestamp = descriptor.display.show_timestamp;
        let console = ReplConsole::new(
            TransportKind::Socket,
            &descriptor.id,
            descriptor.target(),
            options,
        );
        Ok(Arc::new(Self {
            id: descriptor.id.clone(),
            session_password: Mutex::new(descriptor.password.clone()),
            descriptor: RwLock::new(descriptor),
            console,
            connector,
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            attempt: AtomicU64::new(0),
            auth: Mutex::new(AuthTracker::default()),
            retry: Mutex::new(RetryState::new(policy)),
            reconnect_timer: Mutex::new(None),
            manual_disconnect: AtomicBool::new(false),
            auth_failed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn console(&self) -> &ReplConsole {
        &self.console
    }

    pub async fn descriptor(&self) -> ConnectionDescriptor {
        self.descriptor.read().await.clone()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.console.status().await
    }

    pub async fn lines(&self) -> Vec<String> {
        self.console.lines().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.console.subscribe()
    }

    pub async fn clear_output(&self) {
        self.console.clear_output().await;
    }

    /// Snapshot of the reconnect bookkeeping.
    pub async fn retry_state(&self) -> RetryState {
        self.retry.lock().await.clone()
    }

    pub async fn update_descriptor(&self, updated: ConnectionDescriptor) -> ReplResult<()> {
        let mut current = self.descriptor.write().await;
        current.check_update(&updated)?;
        self.console
            .set_show_timestamp(updated.display.show_timestamp)
            .await;
        self.console.set_target(updated.target()).await;
        if updated.password.is_some() {
            *self.session_password.lock().await = updated.password.clone();
        }
        *current = updated;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// User-initiated connect. Cancels a pending retry and starts over.
    pub async fn connect(self: &Arc<Self>) -> ReplResult<()> {
        self.cancel_reconnect().await;
        self.retry.lock().await.reset();
        self.auth_failed.store(false, Ordering::SeqCst);
        self.open().await
    }

    /// Close the socket. No automatic reconnection follows.
    pub async fn disconnect(&self) -> ReplResult<()> {
        {
            let _link = self.link.lock().await;
            self.attempt.fetch_add(1, Ordering::SeqCst);
            self.manual_disconnect.store(true, Ordering::SeqCst);
        }
        self.cancel_reconnect().await;
        self.close_link().await;
        self.console.teardown(USER_REASON).await;
        if self.status().await != ConnectionStatus::Disconnected {
            self.mark(ConnectionStatus::Disconnected, USER_REASON).await;
        }
        Ok(())
    }

    /// Manual reconnect: backoff is reset and any pending timer cancelled.
    pub async fn reconnect(self: &Arc<Self>) -> ReplResult<()> {
        self.disconnect().await?;
        self.connect().await
    }

    async fn open(self: &Arc<Self>) -> ReplResult<()> {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let desc = self.descriptor().await;
        let url = match &desc.address {
            TransportAddress::Socket { url } => url.clone(),
            TransportAddress::Serial { .. } => {
                return Err(ReplError::validation("Not a WebREPL connection descriptor"))
            }
        };
        validate_ws_url(&url)?;

        if self.link.lock().await.is_some() {
            self.close_link().await;
            self.console.teardown("Reconectando").await;
            self.mark(ConnectionStatus::Disconnected, "Reconectando").await;
        } else if matches!(
            self.status().await,
            ConnectionStatus::Connecting | ConnectionStatus::Password
        ) {
            // an earlier attempt is still in flight; this one takes over
            self.mark(ConnectionStatus::Disconnected, "Reconectando").await;
        }

        {
            let _link = self.link.lock().await;
            if self.superseded(attempt) {
                return Err(ReplError::connect_cancelled());
            }
            self.manual_disconnect.store(false, Ordering::SeqCst);
            *self.auth.lock().await = AuthTracker::new(self.session_password.lock().await.clone());
            self.console.set_target(desc.target()).await;
            self.console
                .set_status(ConnectionStatus::Connecting, "")
                .await?;
        }

        let (mut sink, source) = match self.connector.connect(&url).await {
            Ok(link) => link,
            Err(_) if self.superseded(attempt) => return Err(ReplError::connect_cancelled()),
            Err(e) => {
                log::error!("[webrepl:{}] connect {} failed: {}", self.id, url, e);
                self.mark(ConnectionStatus::Error, &e.message).await;
                self.after_unexpected_close(ConnectionStatus::Connecting).await;
                return Err(e);
            }
        };

        let mut link = self.link.lock().await;
        if self.superseded(attempt) {
            drop(link);
            log::info!("[webrepl:{}] connect to {} superseded, closing", self.id, url);
            if let Err(e) = sink.close().await {
                log::warn!("[webrepl:{}] close failed: {}", self.id, e);
            }
            return Err(ReplError::connect_cancelled());
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        *link = Some(SocketLinkState {
            sink: Arc::new(Mutex::new(sink)),
            shutdown_tx,
            generation,
        });
        drop(link);
        tokio::spawn(read_loop(
            Arc::downgrade(self),
            source,
            generation,
            shutdown_rx,
        ));
        log::info!("[webrepl:{}] socket open to {}", self.id, url);
        Ok(())
    }

    fn superseded(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::SeqCst) != attempt
    }

    async fn close_link(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            self.generation.fetch_add(1, Ordering::SeqCst);
            let _ = link.shutdown_tx.try_send(());
            if let Err(e) = link.sink.lock().await.close().await {
                log::warn!("[webrepl:{}] close failed: {}", self.id, e);
            }
            log::debug!("[webrepl:{}] link {} closed", self.id, link.generation);
        }
    }

    /// The read loop of `generation` ended: `error` is `None` for a clean
    /// close by the peer.
    async fn on_link_closed(self: &Arc<Self>, generation: u64, error: Option<ReplError>) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let previous = self.status().await;
        self.close_link().await;
        let (status, reason) = match &error {
            Some(e) => (ConnectionStatus::Error, e.message.clone()),
            None => (ConnectionStatus::Disconnected, CLOSED_REASON.to_string()),
        };
        log::warn!("[webrepl:{}] link closed: {}", self.id, reason);
        self.console.teardown(&reason).await;
        if self.manual_disconnect.load(Ordering::SeqCst) {
            return;
        }
        self.mark(status, &reason).await;
        self.after_unexpected_close(previous).await;
    }

    /// Apply the reconnect policy when the link was lost from CONNECTING or
    /// CONNECTED.
    async fn after_unexpected_close(self: &Arc<Self>, previous: ConnectionStatus) {
        if !matches!(
            previous,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        ) {
            return;
        }
        if self.manual_disconnect.load(Ordering::SeqCst) || self.auth_failed.load(Ordering::SeqCst)
        {
            return;
        }
        let (decision, max_attempts) = {
            let mut retry = self.retry.lock().await;
            (retry.next_attempt(), retry.policy().max_attempts)
        };
        match decision {
            RetryDecision::Retry { attempt, delay } => {
                log::info!(
                    "[webrepl:{}] reconnect {}/{} in {:?}",
                    self.id,
                    attempt,
                    max_attempts,
                    delay
                );
                self.console
                    .system_line(&retry_line(attempt, max_attempts, delay))
                    .await;
                let weak = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(conn) = weak.upgrade() {
                        conn.retry.lock().await.fired();
                        if let Err(e) = conn.clone().retry_open().await {
                            log::warn!("[webrepl:{}] reconnect attempt failed: {}", conn.id, e);
                        }
                    }
                });
                *self.reconnect_timer.lock().await = Some(handle);
            }
            RetryDecision::GiveUp => {
                log::warn!("[webrepl:{}] giving up after {} attempts", self.id, max_attempts);
                self.console.system_line(&give_up_line(max_attempts)).await;
            }
            RetryDecision::AlreadyScheduled => {}
        }
    }

    /// Boxed so the timer task does not make `open` a recursive future type.
    fn retry_open(self: Arc<Self>) -> BoxFuture<'static, ReplResult<()>> {
        Box::pin(async move { self.open().await })
    }

    async fn cancel_reconnect(&self) {
        if let Some(handle) = self.reconnect_timer.lock().await.take() {
            handle.abort();
        }
        self.retry.lock().await.fired();
    }

    async fn mark(&self, status: ConnectionStatus, reason: &str) {
        if let Err(e) = self.console.set_status(status, reason).await {
            log::warn!("[webrepl:{}] {}", self.id, e);
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Inbound
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn on_text(&self, generation: u64, text: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let clean = self.console.ingest(text).await;
        let actions = self.auth.lock().await.observe(&clean);
        for action in actions {
            self.apply_auth(action).await;
        }
    }

    async fn apply_auth(&self, action: AuthAction) {
        let status = self.status().await;
        match action {
            AuthAction::SubmitPassword(password) => {
                if status == ConnectionStatus::Connecting {
                    self.mark(ConnectionStatus::Password, "").await;
                }
                log::debug!("[webrepl:{}] submitting stored password", self.id);
                if let Err(e) = self.send_data(&format!("{}\r", password)).await {
                    log::warn!("[webrepl:{}] password send failed: {}", self.id, e);
                }
            }
            AuthAction::AwaitUser => {
                if status == ConnectionStatus::Connecting {
                    self.mark(ConnectionStatus::Password, "").await;
                }
            }
            AuthAction::Authenticated => {
                self.auth_failed.store(false, Ordering::SeqCst);
                self.retry.lock().await.reset();
                self.mark(ConnectionStatus::Connected, "").await;
            }
            AuthAction::Rejected => {
                log::warn!("[webrepl:{}] password rejected", self.id);
                self.auth_failed.store(true, Ordering::SeqCst);
                *self.session_password.lock().await = None;
                self.mark(ConnectionStatus::Password, "").await;
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Outbound
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn current_sink(&self) -> ReplResult<Arc<Mutex<Box<dyn SocketSink>>>> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|l| l.sink.clone())
            .ok_or_else(ReplError::not_connected)
    }

    async fn send_frame(&self, text: &str) -> ReplResult<()> {
        let sink = self.current_sink().await?;
        log::debug!("[webrepl:{}] -> {} chars", self.id, text.len());
        let result = sink.lock().await.send_text(text).await;
        if let Err(e) = &result {
            log::warn!("[webrepl:{}] send failed: {}", self.id, e);
        }
        result
    }

    /// Send a line with the connection's line ending appended.
    pub async fn send_command(&self, text: &str) -> ReplResult<()> {
        let ending = self.descriptor.read().await.line_ending;
        self.send_frame(&format!("{}{}", text, ending.as_str())).await
    }

    /// Send raw text, no terminator.
    pub async fn send_data(&self, raw: &str) -> ReplResult<()> {
        self.send_frame(raw).await
    }

    /// Answer the password prompt with a password typed by the user.
    pub async fn send_password(&self, password: &str) -> ReplResult<()> {
        if self.status().await != ConnectionStatus::Password {
            return Err(ReplError::validation("No password prompt is pending"));
        }
        self.auth.lock().await.user_submitted(password);
        *self.session_password.lock().await = Some(password.to_string());
        self.auth_failed.store(false, Ordering::SeqCst);
        self.send_frame(&format!("{}\r", password)).await
    }
}

#[async_trait::async_trait]
impl CommandSink for WebReplConnection {
    async fn send_command(&self, line: &str) -> ReplResult<()> {
        WebReplConnection::send_command(self, line).await
    }
}

#[async_trait::async_trait]
impl CommandRunner for WebReplConnection {
    async fn execute_command(&self, snippet: &str) -> ReplResult<Value> {
        self.execute_command_with_timeout(snippet, self.console.command_timeout())
            .await
    }

    async fn execute_command_with_timeout(
        &self,
        snippet: &str,
        timeout: Duration,
    ) -> ReplResult<Value> {
        if self.status().await != ConnectionStatus::Connected {
            return Err(ReplError::not_connected());
        }
        self.console
            .execute_with_timeout(self, snippet, timeout)
            .await
    }
}

async fn read_loop(
    conn: Weak<WebReplConnection>,
    mut source: Box<dyn SocketSource>,
    generation: u64,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            next = source.next_text() => {
                let conn = match conn.upgrade() {
                    Some(c) => c,
                    None => break,
                };
                if conn.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                match next {
                    Some(Ok(text)) => conn.on_text(generation, &text).await,
                    Some(Err(e)) => {
                        conn.on_link_closed(generation, Some(e)).await;
                        break;
                    }
                    None => {
                        conn.on_link_closed(generation, None).await;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrepl::transport::SimulatedConnector;
    use mpyb_core::ReplErrorKind;
    use mpyb_repl::repl::ReplSimulator;
    use serde_json::json;

    const URL: &str = "ws://192.168.4.1:8266";

    fn descriptor(password: Option<&str>) -> ConnectionDescriptor {
        let d = ConnectionDescriptor::socket("esp32", URL);
        match password {
            Some(p) => d.with_password(p),
            None => d,
        }
    }

    fn connection(
        board: &Arc<SimulatedConnector>,
        password: Option<&str>,
    ) -> Arc<WebReplConnection> {
        connection_with_policy(board, password, ReconnectPolicy::default())
    }

    fn connection_with_policy(
        board: &Arc<SimulatedConnector>,
        password: Option<&str>,
        policy: ReconnectPolicy,
    ) -> Arc<WebReplConnection> {
        WebReplConnection::new(
            descriptor(password),
            board.clone(),
            ConsoleOptions::default(),
            policy,
        )
        .unwrap()
    }

    async fn wait_for_status(conn: &WebReplConnection, want: ConnectionStatus) {
        for _ in 0..400 {
            if conn.status().await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("status never became {}", want);
    }

    async fn wait_for_line(conn: &WebReplConnection, want: &str) {
        for _ in 0..400 {
            if conn.lines().await.iter().any(|l| l == want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("line {:?} never appeared in {:?}", want, conn.lines().await);
    }

    #[tokio::test]
    async fn test_stored_password_is_submitted_automatically() {
        let board = SimulatedConnector::new(Some("secret"), ReplSimulator::ok_only());
        let conn = connection(&board, Some("secret"));
        conn.connect().await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Connected).await;

        assert_eq!(board.sent_frames().await, vec!["secret\r"]);
        let lines = conn.lines().await;
        assert!(lines.contains(&format!("Conectando a {}...", URL)));
        assert!(lines.contains(&"Aguardando senha...".to_string()));
        assert!(lines.contains(&format!("Conectado a {}", URL)));
        let retry = conn.retry_state().await;
        assert_eq!(retry.attempts, 0);
        assert!(!retry.retrying);
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_prompt_without_password_waits_for_user() {
        let board = SimulatedConnector::new(Some("secret"), ReplSimulator::ok_only());
        let conn = connection(&board, None);
        conn.connect().await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Password).await;
        assert!(board.sent_frames().await.is_empty());

        conn.send_password("secret").await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Connected).await;
        assert_eq!(conn.execute_command("x = 1").await.unwrap(), json!("OK"));
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_password_stays_in_password_state() {
        let board = SimulatedConnector::new(Some("secret"), ReplSimulator::ok_only());
        let conn = connection(&board, Some("wrong"));
        conn.connect().await.unwrap();
        wait_for_line(&conn, "Senha incorreta. Digite a senha.").await;
        assert_eq!(conn.status().await, ConnectionStatus::Password);
        // the rejected password is not resent
        assert_eq!(board.sent_frames().await, vec!["wrong\r"]);

        conn.send_password("secret").await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Connected).await;
    }

    #[tokio::test]
    async fn test_denied_close_does_not_reconnect() {
        let board = SimulatedConnector::closing_on_denied("secret", ReplSimulator::ok_only());
        let conn = connection(&board, Some("wrong"));
        conn.connect().await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(board.connect_count(), 1);
        assert!(!conn.lines().await.iter().any(|l| l.starts_with("Tentativa")));
    }

    #[tokio::test]
    async fn test_send_password_requires_prompt() {
        let board = SimulatedConnector::new(None, ReplSimulator::ok_only());
        let conn = connection(&board, None);
        let err = conn.send_password("x").await.unwrap_err();
        assert!(err.is(ReplErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_command_before_connect_is_rejected() {
        let board = SimulatedConnector::new(None, ReplSimulator::ok_only());
        let conn = connection(&board, None);
        let err = conn.execute_command("1").await.unwrap_err();
        assert!(err.is(ReplErrorKind::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_backs_off_then_gives_up() {
        let board = SimulatedConnector::new(None, ReplSimulator::ok_only());
        let conn = connection(&board, None);
        conn.connect().await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Connected).await;

        board.fail_next_connects(10);
        board.drop_links().await;
        wait_for_line(&conn, "Tentativa 1/3 em 1s...").await;
        assert_eq!(board.connect_count(), 1);

        wait_for_line(&conn, "Tentativa 2/3 em 2s...").await;
        assert_eq!(board.connect_count(), 2);
        wait_for_line(&conn, "Tentativa 3/3 em 4s...").await;
        wait_for_line(
            &conn,
            "Reconexão automática falhou após 3 tentativas. Reconecte manualmente.",
        )
        .await;
        assert_eq!(board.connect_count(), 4);
        assert_eq!(conn.status().await, ConnectionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_succeeds_and_resets_backoff() {
        let board = SimulatedConnector::new(None, ReplSimulator::ok_only());
        let conn = connection(&board, None);
        conn.connect().await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Connected).await;

        board.drop_links().await;
        wait_for_line(&conn, "Tentativa 1/3 em 1s...").await;
        wait_for_status(&conn, ConnectionStatus::Connected).await;
        assert_eq!(board.connect_count(), 2);
        assert_eq!(conn.retry_state().await.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_cancels_pending_retry() {
        let board = SimulatedConnector::new(None, ReplSimulator::ok_only());
        let conn = connection(&board, None);
        conn.connect().await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Connected).await;

        board.drop_links().await;
        wait_for_line(&conn, "Tentativa 1/3 em 1s...").await;
        conn.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(board.connect_count(), 1);
        assert_eq!(conn.status().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_socket_error_marks_error_and_schedules_retry() {
        let board = SimulatedConnector::new(None, ReplSimulator::ok_only());
        let conn = connection(&board, None);
        conn.connect().await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Connected).await;

        board.break_links("reset by peer").await;
        wait_for_status(&conn, ConnectionStatus::Error).await;
        wait_for_line(&conn, "Tentativa 1/3 em 1s...").await;
        assert!(conn.lines().await.contains(&"Erro: reset by peer".to_string()));
        assert!(conn.retry_state().await.retrying);
        conn.disconnect().await.unwrap();
        assert!(!conn.retry_state().await.retrying);
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_closes_socket() {
        let board = SimulatedConnector::new(None, ReplSimulator::ok_only());
        board.delay_connects(Duration::from_millis(100));
        let conn = connection(&board, None);
        let c2 = conn.clone();
        let pending = tokio::spawn(async move { c2.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.status().await, ConnectionStatus::Connecting);

        conn.disconnect().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is(ReplErrorKind::NotConnected));
        assert_eq!(conn.status().await, ConnectionStatus::Disconnected);
        assert_eq!(board.live_sessions(), 0);
        let err = conn.send_command("1").await.unwrap_err();
        assert!(err.is(ReplErrorKind::NotConnected));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(board.connect_count(), 1);
        assert!(!conn.lines().await.iter().any(|l| l.starts_with("Tentativa")));
    }

    #[tokio::test]
    async fn test_failed_connect_after_disconnect_is_not_retried() {
        let board = SimulatedConnector::new(None, ReplSimulator::ok_only());
        board.delay_connects(Duration::from_millis(100));
        board.fail_next_connects(1);
        let conn = connection(&board, None);
        let c2 = conn.clone();
        let pending = tokio::spawn(async move { c2.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.disconnect().await.unwrap();
        assert!(pending.await.unwrap().is_err());
        assert_eq!(conn.status().await, ConnectionStatus::Disconnected);
        assert!(!conn.retry_state().await.retrying);
    }

    #[tokio::test]
    async fn test_manual_connect_overrides_running_retry() {
        let board = SimulatedConnector::new(None, ReplSimulator::ok_only());
        let conn = connection_with_policy(
            &board,
            None,
            ReconnectPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
            },
        );
        conn.connect().await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Connected).await;

        board.delay_connects(Duration::from_millis(100));
        board.drop_links().await;
        // the retry fires after 10ms and is still waiting on the socket
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.status().await, ConnectionStatus::Connecting);
        assert_eq!(board.connect_count(), 2);

        conn.connect().await.unwrap();
        wait_for_status(&conn, ConnectionStatus::Connected).await;
        assert_eq!(board.connect_count(), 3);
        assert_eq!(board.live_sessions(), 1);
        assert_eq!(conn.execute_command("x = 1").await.unwrap(), json!("OK"));

        conn.disconnect().await.unwrap();
        assert_eq!(board.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_update_rejects_serial_descriptor() {
        let board = SimulatedConnector::new(None, ReplSimulator::ok_only());
        let conn = connection(&board, None);
        let mut serial = ConnectionDescriptor::serial("esp32", Some("COM3".into()), 115200);
        serial.id = conn.id().to_string();
        let err = conn.update_descriptor(serial).await.unwrap_err();
        assert!(err.is(ReplErrorKind::Validation));
    }
}
