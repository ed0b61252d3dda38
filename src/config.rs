//! # Persisted configuration
//!
//! Two JSON documents live under `<config dir>/mpyboard/`:
//!
//! - **micropython-connections.json** – the saved connection list. Passwords
//!   and serial port names are never written; serial entries keep the USB
//!   identity so the port can be found again on the next start.
//! - **settings.json** – [`DashboardSettings`], every field optional.
//!
//! A missing file means "nothing saved yet" and yields defaults. A file that
//! exists but does not parse is a configuration error.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mpyb_core::{
    default_baud_rate, ConnectionDescriptor, ReconnectPolicy, ReplError, ReplResult,
    TransportAddress,
};
use mpyb_repl::repl::ConsoleOptions;
use mpyb_serial::serial::{find_by_identity, PortInfo};

pub const APP_DIR: &str = "mpyboard";
/// Storage key of the connection list.
pub const CONNECTIONS_KEY: &str = "micropython-connections";
pub const SETTINGS_FILE: &str = "settings.json";

/// `<platform config dir>/mpyboard`.
pub fn default_config_dir() -> ReplResult<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .ok_or_else(|| ReplError::config("No configuration directory on this platform"))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> ReplResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)?;
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|e| ReplError::config(format!("{}: {}", path.display(), e)))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> ReplResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Dashboard settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardSettings {
    pub command_timeout_ms: u64,
    pub queue_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub initial_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub show_timestamps: bool,
    pub max_lines: usize,
    pub default_baud_rate: u32,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5000,
            queue_timeout_ms: 10_000,
            max_reconnect_attempts: 3,
            initial_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 10_000,
            show_timestamps: false,
            max_lines: 5000,
            default_baud_rate: default_baud_rate(),
        }
    }
}

impl DashboardSettings {
    /// Load from `path`; defaults when the file does not exist.
    pub fn load(path: &Path) -> ReplResult<Self> {
        let settings = read_json::<Self>(path)?.unwrap_or_default();
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> ReplResult<()> {
        self.validate()?;
        write_json(path, self)
    }

    pub fn validate(&self) -> ReplResult<()> {
        if self.command_timeout_ms == 0 || self.queue_timeout_ms == 0 {
            return Err(ReplError::config("Timeouts must be greater than zero"));
        }
        if self.max_lines == 0 {
            return Err(ReplError::config("maxLines must be greater than zero"));
        }
        if self.initial_reconnect_delay_ms > self.max_reconnect_delay_ms {
            return Err(ReplError::config(
                "initialReconnectDelayMs must not exceed maxReconnectDelayMs",
            ));
        }
        if self.default_baud_rate == 0 {
            return Err(ReplError::config("defaultBaudRate must be greater than zero"));
        }
        Ok(())
    }

    pub fn console_options(&self) -> ConsoleOptions {
        ConsoleOptions {
            max_lines: self.max_lines,
            show_timestamp: self.show_timestamps,
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            initial_delay: Duration::from_millis(self.initial_reconnect_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON file holding the saved connection descriptors.
#[derive(Debug, Clone)]
pub struct ConnectionStore {
    store_path: PathBuf,
}

impl ConnectionStore {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
        }
    }

    /// `<dir>/micropython-connections.json`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(format!("{}.json", CONNECTIONS_KEY)))
    }

    pub fn path(&self) -> &Path {
        &self.store_path
    }

    pub fn has_stored_data(&self) -> bool {
        self.store_path.exists()
    }

    /// Saved descriptors in their saved order; empty when nothing was saved.
    pub fn load(&self) -> ReplResult<Vec<ConnectionDescriptor>> {
        let descriptors: Vec<ConnectionDescriptor> =
            read_json(&self.store_path)?.unwrap_or_default();
        for d in &descriptors {
            d.validate()
                .map_err(|e| ReplError::config(format!("Connection '{}': {}", d.name, e)))?;
        }
        log::debug!(
            "[config] loaded {} connections from {}",
            descriptors.len(),
            self.store_path.display()
        );
        Ok(descriptors)
    }

    pub fn save(&self, descriptors: &[ConnectionDescriptor]) -> ReplResult<()> {
        write_json(&self.store_path, &descriptors)?;
        log::debug!(
            "[config] saved {} connections to {}",
            descriptors.len(),
            self.store_path.display()
        );
        Ok(())
    }
}

/// Point saved serial descriptors at the ports currently carrying their USB
/// identity. Returns how many were resolved; the rest keep no port and are
/// logged.
pub fn reacquire_ports(descriptors: &mut [ConnectionDescriptor], ports: &[PortInfo]) -> usize {
    let mut resolved = 0;
    for desc in descriptors.iter_mut() {
        let name = desc.name.clone();
        if let TransportAddress::Serial {
            port_name,
            identity: Some(identity),
            ..
        } = &mut desc.address
        {
            match find_by_identity(ports, *identity) {
                Some(port) => {
                    log::info!("[config] '{}' reacquired on {}", name, port.port_name);
                    *port_name = Some(port.port_name.clone());
                    resolved += 1;
                }
                None => {
                    log::warn!(
                        "[config] no port with identity {} for '{}'; select one manually",
                        identity,
                        name
                    );
                    *port_name = None;
                }
            }
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpyb_core::{LineEnding, ReplErrorKind, SerialIdentity};
    use mpyb_serial::serial::port_scanner::build_port_info;
    use tempfile::tempdir;

    fn pico() -> SerialIdentity {
        SerialIdentity { vendor_id: 0x2E8A, product_id: 0x0005 }
    }

    #[test]
    fn test_settings_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let s = DashboardSettings::load(&dir.path().join(SETTINGS_FILE)).unwrap();
        assert_eq!(s, DashboardSettings::default());
        assert_eq!(s.reconnect_policy(), ReconnectPolicy::default());
        assert_eq!(s.console_options().command_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_settings_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, r#"{"commandTimeoutMs": 2000, "showTimestamps": true}"#).unwrap();
        let s = DashboardSettings::load(&path).unwrap();
        assert_eq!(s.command_timeout_ms, 2000);
        assert!(s.show_timestamps);
        assert_eq!(s.max_lines, 5000);
        assert_eq!(s.default_baud_rate, 115200);
    }

    #[test]
    fn test_settings_malformed_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert!(DashboardSettings::load(&path).unwrap_err().is(ReplErrorKind::Config));

        fs::write(&path, r#"{"maxLines": 0}"#).unwrap();
        assert!(DashboardSettings::load(&path).unwrap_err().is(ReplErrorKind::Config));
    }

    #[test]
    fn test_settings_save_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let mut s = DashboardSettings::default();
        s.max_reconnect_attempts = 5;
        s.save(&path).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"maxReconnectAttempts\": 5"));
        assert_eq!(DashboardSettings::load(&path).unwrap(), s);
    }

    #[test]
    fn test_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = ConnectionStore::in_dir(dir.path());
        assert!(!store.has_stored_data());
        assert!(store.load().unwrap().is_empty());
        assert!(store.path().ends_with("micropython-connections.json"));
    }

    #[test]
    fn test_store_never_persists_secrets_or_port() {
        let dir = tempdir().unwrap();
        let store = ConnectionStore::in_dir(dir.path());
        let socket =
            ConnectionDescriptor::socket("esp32", "ws://192.168.4.1:8266").with_password("secret");
        let mut serial = ConnectionDescriptor::serial("pico", Some("/dev/ttyACM0".into()), 115200);
        serial.line_ending = LineEnding::CrLf;
        if let TransportAddress::Serial { identity, .. } = &mut serial.address {
            *identity = Some(pico());
        }
        store.save(&[socket.clone(), serial.clone()]).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("secret"));
        assert!(!raw.contains("ttyACM0"));

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, socket.id);
        assert_eq!(loaded[0].password, None);
        assert_eq!(loaded[1].line_ending, LineEnding::CrLf);
        match &loaded[1].address {
            TransportAddress::Serial { port_name, identity, baud_rate } => {
                assert_eq!(port_name, &None);
                assert_eq!(identity, &Some(pico()));
                assert_eq!(*baud_rate, 115200);
            }
            other => panic!("unexpected address {:?}", other),
        }
    }

    #[test]
    fn test_store_malformed_is_config_error() {
        let dir = tempdir().unwrap();
        let store = ConnectionStore::in_dir(dir.path());
        fs::write(store.path(), "[{\"id\": 3}]").unwrap();
        assert!(store.load().unwrap_err().is(ReplErrorKind::Config));
    }

    #[test]
    fn test_reacquire_by_identity() {
        let mut found = ConnectionDescriptor::serial("pico", None, 115200);
        if let TransportAddress::Serial { identity, .. } = &mut found.address {
            *identity = Some(pico());
        }
        let mut missing = ConnectionDescriptor::serial("esp", None, 115200);
        if let TransportAddress::Serial { identity, .. } = &mut missing.address {
            *identity = Some(SerialIdentity { vendor_id: 0x10C4, product_id: 0xEA60 });
        }
        let socket = ConnectionDescriptor::socket("net", "ws://10.0.0.2:8266");
        let mut all = vec![found, missing, socket];
        let ports = vec![build_port_info("/dev/ttyACM3", Some(pico()), None, None, None)];

        assert_eq!(reacquire_ports(&mut all, &ports), 1);
        match &all[0].address {
            TransportAddress::Serial { port_name, .. } => {
                assert_eq!(port_name.as_deref(), Some("/dev/ttyACM3"))
            }
            _ => unreachable!(),
        }
        match &all[1].address {
            TransportAddress::Serial { port_name, .. } => assert!(port_name.is_none()),
            _ => unreachable!(),
        }
    }
}
