//! Host wiring: settings, the persisted connection list and the registry
//! brought up together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{reacquire_ports, ConnectionStore, DashboardSettings, SETTINGS_FILE};
use crate::connection::{DeviceConnection, TransportSet};
use crate::registry::{ConnectionRegistry, RegistryAction, RegistryState};
use mpyb_core::{ConnectionStatus, ConsoleEvent, ReplError, ReplErrorKind, ReplResult};
use mpyb_serial::serial::{list_ports, NativeTransportFactory, SerialTransportFactory};
use mpyb_webrepl::webrepl::{SocketConnector, WsConnector};

pub struct Host {
    config_dir: PathBuf,
    settings: DashboardSettings,
    store: ConnectionStore,
    registry: RegistryState,
}

impl Host {
    /// Open with the real serial and WebSocket backends.
    pub async fn open(config_dir: &Path) -> ReplResult<Self> {
        Self::open_with(config_dir, Arc::new(NativeTransportFactory), Arc::new(WsConnector)).await
    }

    pub async fn open_with(
        config_dir: &Path,
        serial: Arc<dyn SerialTransportFactory>,
        socket: Arc<dyn SocketConnector>,
    ) -> ReplResult<Self> {
        let settings = DashboardSettings::load(&config_dir.join(SETTINGS_FILE))?;
        let store = ConnectionStore::in_dir(config_dir);
        let mut descriptors = store.load()?;

        match list_ports().await {
            Ok(ports) => {
                reacquire_ports(&mut descriptors, &ports);
            }
            Err(e) => log::warn!("[host] port scan failed, serial ports not reacquired: {}", e),
        }

        let registry = ConnectionRegistry::new(TransportSet {
            serial,
            socket,
            console: settings.console_options(),
            reconnect: settings.reconnect_policy(),
        });
        for descriptor in descriptors {
            registry.apply(RegistryAction::Add(descriptor)).await?;
        }
        log::info!(
            "[host] {} connections loaded from {}",
            registry.len().await,
            store.path().display()
        );

        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            settings,
            store,
            registry,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn settings(&self) -> &DashboardSettings {
        &self.settings
    }

    pub fn registry(&self) -> &RegistryState {
        &self.registry
    }

    pub fn store(&self) -> &ConnectionStore {
        &self.store
    }

    /// Apply a registry action and persist the resulting list.
    pub async fn apply(&self, action: RegistryAction) -> ReplResult<()> {
        self.registry.apply(action).await?;
        self.store.save(&self.registry.descriptors().await)
    }
}

/// Wait until `conn` is usable for commands.
///
/// Fails on ERROR or DISCONNECTED, on a rejected password, on a password
/// prompt nobody can answer, and after `limit`.
pub async fn wait_until_ready(conn: &DeviceConnection, limit: Duration) -> ReplResult<()> {
    let mut events = conn.subscribe();
    let deadline = tokio::time::Instant::now() + limit;
    let mut rejected = false;
    loop {
        match conn.status().await {
            ConnectionStatus::Connected => return Ok(()),
            ConnectionStatus::Error | ConnectionStatus::Disconnected => {
                return Err(ReplError::new(
                    ReplErrorKind::ConnectionRefused,
                    last_system_line(conn).await,
                ))
            }
            ConnectionStatus::Password if rejected => {
                return Err(ReplError::new(
                    ReplErrorKind::AuthFailed,
                    "WebREPL rejected the password",
                ))
            }
            _ => {}
        }

        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => {
                let status = conn.status().await;
                if status == ConnectionStatus::Password {
                    return Err(ReplError::new(
                        ReplErrorKind::AuthFailed,
                        "WebREPL is asking for a password",
                    ));
                }
                return Err(ReplError::timeout(format!(
                    "Connection not ready after {:?} ({})",
                    limit, status
                )));
            }
            Ok(Ok(ConsoleEvent::StatusChanged {
                from: ConnectionStatus::Password,
                to: ConnectionStatus::Password,
            })) => rejected = true,
            Ok(Ok(_)) => {}
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                return Err(ReplError::internal("Console event stream closed"))
            }
        }
    }
}

async fn last_system_line(conn: &DeviceConnection) -> String {
    conn.lines()
        .await
        .into_iter()
        .rev()
        .find(|l| l.starts_with("Erro:") || l.starts_with("Desconectado:"))
        .unwrap_or_else(|| "Connection failed".to_string())
}
