//! One MicroPython device over a serial port.
//!
//! The connection owns a read-loop task that feeds the console, writes go
//! straight to the transport. A generation counter marks which link is
//! current so results from a superseded read loop are dropped.

use crate::serial::transport::{SerialTransport, SerialTransportFactory};
use mpyb_core::{
    ConnectionDescriptor, ConnectionStatus, ConsoleEvent, ReplError, ReplResult, SerialIdentity,
    StreamDecoder, TransportAddress, TransportKind,
};
use mpyb_repl::repl::{CommandRunner, CommandSink, ConsoleOptions, ReplConsole};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

/// Pause between force-closing a held port and reopening it.
pub const REOPEN_DELAY: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 1024;

struct SerialLink {
    transport: Arc<dyn SerialTransport>,
    shutdown_tx: mpsc::Sender<()>,
    generation: u64,
}

pub struct SerialConnection {
    id: String,
    descriptor: RwLock<ConnectionDescriptor>,
    console: ReplConsole,
    factory: Arc<dyn SerialTransportFactory>,
    link: Mutex<Option<SerialLink>>,
    generation: AtomicU64,
    /// Bumped by every connect and disconnect; an open that returns to a
    /// different value was overtaken and must not install its link.
    attempt: AtomicU64,
    held_identity: Mutex<Option<SerialIdentity>>,
}

impl SerialConnection {
    pub fn new(
        descriptor: ConnectionDescriptor,
        factory: Arc<dyn SerialTransportFactory>,
        options: ConsoleOptions,
    ) -> ReplResult<Arc<Self>> {
        if descriptor.kind() != TransportKind::Serial {
            return Err(ReplError::validation("Not a serial connection descriptor"));
        }
        descriptor.validate()?;
        let mut options = options;
        options.show_timestamp = descriptor.display.show_timestamp;
        let console = ReplConsole::new(
            TransportKind::Serial,
            &descriptor.id,
            descriptor.target(),
            options,
        );
        Ok(Arc::new(Self {
            id: descriptor.id.clone(),
            descriptor: RwLock::new(descriptor),
            console,
            factory,
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            attempt: AtomicU64::new(0),
            held_identity: Mutex::new(None),
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

    /// Replace the descriptor. The transport kind cannot change.
    pub async fn update_descriptor(&self, updated: ConnectionDescriptor) -> ReplResult<()> {
        let mut current = self.descriptor.write().await;
        current.check_update(&updated)?;
        self.console
            .set_show_timestamp(updated.display.show_timestamp)
            .await;
        self.console.set_target(updated.target()).await;
        *current = updated;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Open the selected port and start reading.
    pub async fn connect(self: &Arc<Self>) -> ReplResult<()> {
        let desc = self.descriptor().await;
        let (port_name, baud_rate) = match &desc.address {
            TransportAddress::Serial {
                port_name,
                baud_rate,
                ..
            } => (port_name.clone(), *baud_rate),
            TransportAddress::Socket { .. } => {
                return Err(ReplError::validation("Not a serial connection descriptor"))
            }
        };
        let port_name = port_name
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ReplError::validation("No serial port selected"))?;
        desc.validate()?;
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;

        if self.link.lock().await.is_some() {
            log::info!("[serial:{}] closing held link before reopening", self.id);
            self.close_link().await;
            self.console.teardown("Porta reaberta").await;
            self.mark(ConnectionStatus::Disconnected, "Porta reaberta").await;
            tokio::time::sleep(REOPEN_DELAY).await;
        } else if self.status().await == ConnectionStatus::Connecting {
            // an earlier open is still in flight; this one takes over
            self.mark(ConnectionStatus::Disconnected, "Porta reaberta").await;
        }
        {
            // a disconnect bumps the attempt under this lock, so it cannot
            // slip between the check and CONNECTING
            let _link = self.link.lock().await;
            if self.attempt.load(Ordering::SeqCst) != attempt {
                return Err(ReplError::connect_cancelled());
            }
            self.console.set_target(desc.target()).await;
            self.console
                .set_status(ConnectionStatus::Connecting, "")
                .await?;
        }

        let transport = self.factory.create(&port_name).await;
        if let Err(e) = transport.open(baud_rate).await {
            if self.attempt.load(Ordering::SeqCst) != attempt {
                return Err(ReplError::connect_cancelled());
            }
            log::error!("[serial:{}] open {} failed: {}", self.id, port_name, e);
            self.mark(ConnectionStatus::Error, &e.message).await;
            return Err(e);
        }

        // checked and installed under the link lock so a disconnect either
        // sees the link or has already cancelled this attempt
        let mut link = self.link.lock().await;
        if self.attempt.load(Ordering::SeqCst) != attempt {
            drop(link);
            log::info!("[serial:{}] open of {} superseded, closing", self.id, port_name);
            if let Err(e) = transport.close().await {
                log::warn!("[serial:{}] close failed: {}", self.id, e);
            }
            return Err(ReplError::connect_cancelled());
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        *link = Some(SerialLink {
            transport: transport.clone(),
            shutdown_tx,
            generation,
        });
        tokio::spawn(read_loop(
            Arc::downgrade(self),
            transport,
            generation,
            shutdown_rx,
        ));

        log::info!("[serial:{}] connected to {} @ {}", self.id, port_name, baud_rate);
        let connected = self
            .console
            .set_status(ConnectionStatus::Connected, "")
            .await;
        drop(link);
        connected.map(|_| ())
    }

    /// Close the port. Safe to call repeatedly or mid-connect.
    pub async fn disconnect(&self) -> ReplResult<()> {
        {
            let _link = self.link.lock().await;
            self.attempt.fetch_add(1, Ordering::SeqCst);
        }
        self.close_link().await;
        self.console.teardown("Desconectado pelo usuário").await;
        if self.status().await != ConnectionStatus::Disconnected {
            self.mark(ConnectionStatus::Disconnected, "Desconectado pelo usuário")
                .await;
        }
        Ok(())
    }

    pub async fn reconnect(self: &Arc<Self>) -> ReplResult<()> {
        self.disconnect().await?;
        self.connect().await
    }

    /// A port became available. Connects automatically once per new USB
    /// identity; returns whether an attempt was made.
    pub async fn offer_port(
        self: &Arc<Self>,
        port_name: &str,
        identity: SerialIdentity,
    ) -> ReplResult<bool> {
        {
            let mut held = self.held_identity.lock().await;
            if *held == Some(identity) {
                return Ok(false);
            }
            *held = Some(identity);
        }
        {
            let mut desc = self.descriptor.write().await;
            if let TransportAddress::Serial {
                port_name: p,
                identity: id,
                ..
            } = &mut desc.address
            {
                *p = Some(port_name.to_string());
                *id = Some(identity);
            }
        }
        log::info!(
            "[serial:{}] auto-connecting to {} ({})",
            self.id,
            port_name,
            identity
        );
        self.connect().await.map(|_| true)
    }

    async fn close_link(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            // invalidate the read loop before it sees the closed port
            self.generation.fetch_add(1, Ordering::SeqCst);
            let _ = link.shutdown_tx.try_send(());
            if let Err(e) = link.transport.close().await {
                log::warn!("[serial:{}] close failed: {}", self.id, e);
            }
            log::debug!("[serial:{}] link {} closed", self.id, link.generation);
        }
    }

    /// The read loop of `generation` hit an error.
    async fn on_link_lost(&self, generation: u64, error: ReplError) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        log::warn!("[serial:{}] link lost: {}", self.id, error);
        self.close_link().await;
        self.console.teardown(&error.message).await;
        let status = if error.is(mpyb_core::ReplErrorKind::StreamClosed) {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Error
        };
        self.mark(status, &error.message).await;
    }

    async fn mark(&self, status: ConnectionStatus, reason: &str) {
        if let Err(e) = self.console.set_status(status, reason).await {
            log::warn!("[serial:{}] {}", self.id, e);
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  I/O
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn current_transport(&self) -> ReplResult<Arc<dyn SerialTransport>> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|l| l.transport.clone())
            .ok_or_else(ReplError::not_connected)
    }

    async fn write_all(&self, data: &[u8]) -> ReplResult<()> {
        let transport = self.current_transport().await?;
        log::debug!("[serial:{}] -> {} bytes", self.id, data.len());
        let result = match transport.write(data).await {
            Ok(_) => transport.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            log::warn!("[serial:{}] write failed: {}", self.id, e);
        }
        result
    }

    /// Send a line with the connection's line ending appended.
    pub async fn send_command(&self, text: &str) -> ReplResult<()> {
        let ending = self.descriptor.read().await.line_ending;
        let mut data = text.as_bytes().to_vec();
        data.extend_from_slice(ending.as_str().as_bytes());
        self.write_all(&data).await
    }

    /// Send raw text, no terminator.
    pub async fn send_data(&self, raw: &str) -> ReplResult<()> {
        self.write_all(raw.as_bytes()).await
    }
}

#[async_trait::async_trait]
impl CommandSink for SerialConnection {
    async fn send_command(&self, line: &str) -> ReplResult<()> {
        SerialConnection::send_command(self, line).await
    }
}

#[async_trait::async_trait]
impl CommandRunner for SerialConnection {
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
    conn: Weak<SerialConnection>,
    transport: Arc<dyn SerialTransport>,
    generation: u64,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut decoder = StreamDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = transport.read(&mut buf) => {
                let conn = match conn.upgrade() {
                    Some(c) => c,
                    None => break,
                };
                if conn.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                match result {
                    Ok(0) => {}
                    Ok(n) => {
                        let text = decoder.decode(&buf[..n]);
                        if !text.is_empty() {
                            conn.console.ingest(&text).await;
                        }
                    }
                    Err(e) => {
                        conn.on_link_lost(generation, e).await;
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
    use crate::serial::transport::SimulatedTransportFactory;
    use mpyb_core::ReplErrorKind;
    use mpyb_repl::repl::{FileSystem, ReplSimulator};
    use serde_json::json;

    fn descriptor(port: Option<&str>) -> ConnectionDescriptor {
        ConnectionDescriptor::serial("pico", port.map(|p| p.to_string()), 115200)
    }

    fn device() -> ReplSimulator {
        ReplSimulator::new(Arc::new(|snippet: &str| {
            if snippet.contains("ilistdir") {
                "main.py 0x8000 120\nlib 0x4000 0".to_string()
            } else {
                "OK".to_string()
            }
        }))
    }

    async fn wait_for_status(conn: &SerialConnection, want: ConnectionStatus) {
        for _ in 0..200 {
            if conn.status().await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("status never became {}", want);
    }

    #[tokio::test]
    async fn test_connect_without_port_is_rejected() {
        let factory = SimulatedTransportFactory::new(None);
        let conn =
            SerialConnection::new(descriptor(None), factory.clone(), ConsoleOptions::default())
                .unwrap();
        let err = conn.connect().await.unwrap_err();
        assert!(err.is(ReplErrorKind::Validation));
        assert_eq!(factory.created().await, 0);
        assert_eq!(conn.status().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_and_send_command_uses_line_ending() {
        let factory = SimulatedTransportFactory::new(None);
        let conn = SerialConnection::new(
            descriptor(Some("/dev/ttyACM0")),
            factory.clone(),
            ConsoleOptions::default(),
        )
        .unwrap();
        conn.connect().await.unwrap();
        assert_eq!(conn.status().await, ConnectionStatus::Connected);

        conn.send_command("print(1)").await.unwrap();
        conn.send_data("\x03").await.unwrap();
        let t = factory.transport("/dev/ttyACM0").await.unwrap();
        assert_eq!(t.drain_tx().await, b"print(1)\r\x03");

        let lines = conn.lines().await;
        assert!(lines.contains(&"Conectando a /dev/ttyACM0 @ 115200...".to_string()));
        assert!(lines.contains(&"Conectado a /dev/ttyACM0 @ 115200".to_string()));
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_output_reaches_console() {
        let factory = SimulatedTransportFactory::new(None);
        let conn = SerialConnection::new(
            descriptor(Some("COM3")),
            factory.clone(),
            ConsoleOptions::default(),
        )
        .unwrap();
        conn.connect().await.unwrap();
        let t = factory.transport("COM3").await.unwrap();
        t.inject_rx("MicroPython v1.22 on 2024-01-01\r\n>>> ".as_bytes()).await;
        for _ in 0..200 {
            if conn.lines().await.iter().any(|l| l.starts_with("MicroPython")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(conn
            .lines()
            .await
            .contains(&"MicroPython v1.22 on 2024-01-01".to_string()));
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_listing_over_serial() {
        let factory = SimulatedTransportFactory::new(Some(device()));
        let conn = SerialConnection::new(
            descriptor(Some("/dev/ttyUSB0")),
            factory,
            ConsoleOptions::default(),
        )
        .unwrap();
        conn.connect().await.unwrap();
        let entries = conn.list_files("/").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["main.py", "lib"]);
        assert!(entries[1].is_dir());
        assert_eq!(conn.execute_command("x = 1").await.unwrap(), json!("OK"));
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let factory = SimulatedTransportFactory::new(None);
        let conn = SerialConnection::new(
            descriptor(Some("COM3")),
            factory,
            ConsoleOptions::default(),
        )
        .unwrap();
        conn.disconnect().await.unwrap();
        conn.connect().await.unwrap();
        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        let closes = conn
            .lines()
            .await
            .iter()
            .filter(|l| l.starts_with("Desconectado"))
            .count();
        assert_eq!(closes, 1);
        assert!(conn.send_command("x").await.unwrap_err().is(ReplErrorKind::NotConnected));
    }

    #[tokio::test]
    async fn test_open_failure_sets_error() {
        let factory = SimulatedTransportFactory::new(None);
        let conn = SerialConnection::new(
            descriptor(Some("COM9")),
            factory.clone(),
            ConsoleOptions::default(),
        )
        .unwrap();
        let t = factory.create("COM9").await;
        drop(t);
        factory.transport("COM9").await.unwrap().fail_next_opens(1);
        assert!(conn.connect().await.is_err());
        assert_eq!(conn.status().await, ConnectionStatus::Error);
        conn.connect().await.unwrap();
        assert_eq!(conn.status().await, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_hang_up_rejects_pending_and_disconnects() {
        let factory = SimulatedTransportFactory::new(None);
        let conn = SerialConnection::new(
            descriptor(Some("COM3")),
            factory.clone(),
            ConsoleOptions::default(),
        )
        .unwrap();
        conn.connect().await.unwrap();
        let c2 = conn.clone();
        let pending = tokio::spawn(async move { c2.execute_command("import time").await });
        for _ in 0..200 {
            if conn.console().correlator().active_request_id().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        factory.transport("COM3").await.unwrap().hang_up();
        wait_for_status(&conn, ConnectionStatus::Disconnected).await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is(ReplErrorKind::QueueCleared));
    }

    #[tokio::test]
    async fn test_reconnect_while_connected_reopens() {
        let factory = SimulatedTransportFactory::new(None);
        let conn = SerialConnection::new(
            descriptor(Some("COM3")),
            factory.clone(),
            ConsoleOptions::default(),
        )
        .unwrap();
        conn.connect().await.unwrap();
        // second connect force-closes and reopens the held port
        conn.connect().await.unwrap();
        assert_eq!(conn.status().await, ConnectionStatus::Connected);
        assert!(factory.transport("COM3").await.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_offer_port_connects_once_per_identity() {
        let factory = SimulatedTransportFactory::new(None);
        let conn =
            SerialConnection::new(descriptor(None), factory.clone(), ConsoleOptions::default())
                .unwrap();
        let pico = SerialIdentity { vendor_id: 0x2E8A, product_id: 0x0005 };

        assert!(conn.offer_port("/dev/ttyACM0", pico).await.unwrap());
        assert_eq!(conn.status().await, ConnectionStatus::Connected);
        assert!(!conn.offer_port("/dev/ttyACM0", pico).await.unwrap());

        let esp = SerialIdentity { vendor_id: 0x10C4, product_id: 0xEA60 };
        assert!(conn.offer_port("/dev/ttyUSB0", esp).await.unwrap());
        assert_eq!(factory.created().await, 2);

        match conn.descriptor().await.address {
            TransportAddress::Serial { port_name, identity, .. } => {
                assert_eq!(port_name.as_deref(), Some("/dev/ttyUSB0"));
                assert_eq!(identity, Some(esp));
            }
            other => panic!("unexpected address {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_per_call_timeout_overrides_default() {
        // no device behind the port: nothing ever answers
        let factory = SimulatedTransportFactory::new(None);
        let conn =
            SerialConnection::new(descriptor(Some("COM5")), factory, ConsoleOptions::default())
                .unwrap();
        conn.connect().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = conn
            .execute_command_with_timeout("while True: pass", Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(err.is(ReplErrorKind::Timeout));
        assert_eq!(err.message, "Command timed out after 150ms");
        assert!(started.elapsed() < conn.console().command_timeout());
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_during_open_releases_port() {
        let factory = SimulatedTransportFactory::new(None);
        let conn = SerialConnection::new(
            descriptor(Some("COM3")),
            factory.clone(),
            ConsoleOptions::default(),
        )
        .unwrap();
        drop(factory.create("COM3").await);
        let t = factory.transport("COM3").await.unwrap();
        t.delay_opens(Duration::from_millis(100));

        let c2 = conn.clone();
        let connecting = tokio::spawn(async move { c2.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.status().await, ConnectionStatus::Connecting);
        conn.disconnect().await.unwrap();

        let err = connecting.await.unwrap().unwrap_err();
        assert!(err.is(ReplErrorKind::NotConnected));
        assert_eq!(conn.status().await, ConnectionStatus::Disconnected);
        assert!(!t.is_open());
        assert!(conn.send_command("x").await.unwrap_err().is(ReplErrorKind::NotConnected));

        t.delay_opens(Duration::ZERO);
        conn.connect().await.unwrap();
        assert_eq!(conn.status().await, ConnectionStatus::Connected);
        assert!(t.is_open());
    }

    #[tokio::test]
    async fn test_failed_open_after_disconnect_keeps_disconnected() {
        let factory = SimulatedTransportFactory::new(None);
        let conn = SerialConnection::new(
            descriptor(Some("COM4")),
            factory.clone(),
            ConsoleOptions::default(),
        )
        .unwrap();
        drop(factory.create("COM4").await);
        let t = factory.transport("COM4").await.unwrap();
        t.delay_opens(Duration::from_millis(100));
        t.fail_next_opens(1);

        let c2 = conn.clone();
        let connecting = tokio::spawn(async move { c2.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.disconnect().await.unwrap();

        assert!(connecting.await.unwrap().is_err());
        assert_eq!(conn.status().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_update_cannot_change_kind() {
        let factory = SimulatedTransportFactory::new(None);
        let desc = descriptor(Some("COM3"));
        let conn =
            SerialConnection::new(desc.clone(), factory, ConsoleOptions::default()).unwrap();
        let mut socket = ConnectionDescriptor::socket("pico", "ws://10.0.0.2:8266");
        socket.id = desc.id.clone();
        assert!(conn.update_descriptor(socket).await.is_err());

        let mut renamed = desc.clone();
        renamed.name = "bench pico".into();
        conn.update_descriptor(renamed).await.unwrap();
        assert_eq!(conn.descriptor().await.name, "bench pico");
    }
}
