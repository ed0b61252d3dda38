//! Transport-agnostic handle over one configured device.

use mpyb_core::{
    ConnectionDescriptor, ConnectionStatus, ConsoleEvent, ReconnectPolicy, ReplError, ReplResult,
    TransportKind,
};
use mpyb_repl::repl::{CommandRunner, ConsoleOptions, ReplConsole};
use mpyb_serial::serial::{SerialConnection, SerialTransportFactory};
use mpyb_webrepl::webrepl::{SocketConnector, WebReplConnection};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// What a registry needs to build connections of either kind.
#[derive(Clone)]
pub struct TransportSet {
    pub serial: Arc<dyn SerialTransportFactory>,
    pub socket: Arc<dyn SocketConnector>,
    pub console: ConsoleOptions,
    pub reconnect: ReconnectPolicy,
}

#[derive(Clone)]
pub enum DeviceConnection {
    Serial(Arc<SerialConnection>),
    Socket(Arc<WebReplConnection>),
}

impl DeviceConnection {
    pub fn build(descriptor: ConnectionDescriptor, transports: &TransportSet) -> ReplResult<Self> {
        match descriptor.kind() {
            TransportKind::Serial => Ok(Self::Serial(SerialConnection::new(
                descriptor,
                transports.serial.clone(),
                transports.console,
            )?)),
            TransportKind::Socket => Ok(Self::Socket(WebReplConnection::new(
                descriptor,
                transports.socket.clone(),
                transports.console,
                transports.reconnect,
            )?)),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Serial(c) => c.id(),
            Self::Socket(c) => c.id(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Serial(_) => TransportKind::Serial,
            Self::Socket(_) => TransportKind::Socket,
        }
    }

    pub fn console(&self) -> &ReplConsole {
        match self {
            Self::Serial(c) => c.console(),
            Self::Socket(c) => c.console(),
        }
    }

    pub async fn descriptor(&self) -> ConnectionDescriptor {
        match self {
            Self::Serial(c) => c.descriptor().await,
            Self::Socket(c) => c.descriptor().await,
        }
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.console().status().await
    }

    pub async fn lines(&self) -> Vec<String> {
        self.console().lines().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.console().subscribe()
    }

    pub async fn clear_output(&self) {
        self.console().clear_output().await;
    }

    pub async fn update_descriptor(&self, updated: ConnectionDescriptor) -> ReplResult<()> {
        match self {
            Self::Serial(c) => c.update_descriptor(updated).await,
            Self::Socket(c) => c.update_descriptor(updated).await,
        }
    }

    pub async fn connect(&self) -> ReplResult<()> {
        match self {
            Self::Serial(c) => c.connect().await,
            Self::Socket(c) => c.connect().await,
        }
    }

    pub async fn disconnect(&self) -> ReplResult<()> {
        match self {
            Self::Serial(c) => c.disconnect().await,
            Self::Socket(c) => c.disconnect().await,
        }
    }

    pub async fn reconnect(&self) -> ReplResult<()> {
        match self {
            Self::Serial(c) => c.reconnect().await,
            Self::Socket(c) => c.reconnect().await,
        }
    }

    pub async fn send_command(&self, text: &str) -> ReplResult<()> {
        match self {
            Self::Serial(c) => c.send_command(text).await,
            Self::Socket(c) => c.send_command(text).await,
        }
    }

    pub async fn send_data(&self, raw: &str) -> ReplResult<()> {
        match self {
            Self::Serial(c) => c.send_data(raw).await,
            Self::Socket(c) => c.send_data(raw).await,
        }
    }

    /// Answer a WebREPL password prompt.
    pub async fn send_password(&self, password: &str) -> ReplResult<()> {
        match self {
            Self::Socket(c) => c.send_password(password).await,
            Self::Serial(_) => Err(ReplError::validation(
                "Serial connections have no password prompt",
            )),
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for DeviceConnection {
    async fn execute_command(&self, snippet: &str) -> ReplResult<Value> {
        match self {
            Self::Serial(c) => c.execute_command(snippet).await,
            Self::Socket(c) => c.execute_command(snippet).await,
        }
    }

    async fn execute_command_with_timeout(
        &self,
        snippet: &str,
        timeout: Duration,
    ) -> ReplResult<Value> {
        match self {
            Self::Serial(c) => c.execute_command_with_timeout(snippet, timeout).await,
            Self::Socket(c) => c.execute_command_with_timeout(snippet, timeout).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpyb_core::ReplErrorKind;
    use mpyb_serial::serial::SimulatedTransportFactory;
    use mpyb_webrepl::webrepl::SimulatedConnector;
    use mpyb_repl::repl::ReplSimulator;

    fn transports() -> TransportSet {
        TransportSet {
            serial: SimulatedTransportFactory::new(None),
            socket: SimulatedConnector::new(None, ReplSimulator::ok_only()),
            console: ConsoleOptions::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    #[test]
    fn test_build_picks_transport_by_kind() {
        let t = transports();
        let serial = DeviceConnection::build(
            ConnectionDescriptor::serial("pico", Some("COM3".into()), 115200),
            &t,
        )
        .unwrap();
        assert_eq!(serial.kind(), TransportKind::Serial);
        let socket =
            DeviceConnection::build(ConnectionDescriptor::socket("esp", "ws://esp:8266"), &t)
                .unwrap();
        assert_eq!(socket.kind(), TransportKind::Socket);
    }

    #[test]
    fn test_build_rejects_bad_url() {
        let err = DeviceConnection::build(
            ConnectionDescriptor::socket("esp", "http://esp"),
            &transports(),
        )
        .err()
        .unwrap();
        assert!(err.is(ReplErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_serial_has_no_password_prompt() {
        let conn = DeviceConnection::build(
            ConnectionDescriptor::serial("pico", Some("COM3".into()), 115200),
            &transports(),
        )
        .unwrap();
        assert!(conn.send_password("x").await.unwrap_err().is(ReplErrorKind::Validation));
    }
}
