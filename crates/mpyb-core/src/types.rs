//! Shared types: connection descriptors, transport addressing, status.

use crate::error::{ReplError, ReplResult};
use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// WebREPL only: the device is waiting for the password.
    Password,
    Disconnected,
    Error,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Password => "PASSWORD",
            Self::Disconnected => "DISCONNECTED",
            Self::Error => "ERROR",
        }
    }

    /// Whether a link is (being) held in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Password)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport addressing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// WebREPL over a WebSocket.
    Socket,
    Serial,
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Socket => "webrepl",
            Self::Serial => "serial",
        }
    }
}

/// USB identity of a serial adapter, persisted for port reacquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for SerialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Where a connection points to.
///
/// The serial port name is a live handle and is never serialized; only the
/// USB identity survives a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "camelCase")]
pub enum TransportAddress {
    Socket {
        url: String,
    },
    Serial {
        #[serde(skip)]
        port_name: Option<String>,
        #[serde(rename = "baudRate", default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default)]
        identity: Option<SerialIdentity>,
    },
}

pub fn default_baud_rate() -> u32 {
    115200
}

impl TransportAddress {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Socket { .. } => TransportKind::Socket,
            Self::Serial { .. } => TransportKind::Serial,
        }
    }
}

/// Terminator appended to commands on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LineEnding {
    None,
    Lf,
    /// The interpreter's native Enter key.
    Cr,
    CrLf,
}

impl Default for LineEnding {
    fn default() -> Self {
        Self::Cr
    }
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Lf => "\n",
            Self::Cr => "\r",
            Self::CrLf => "\r\n",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "lf" => Some(Self::Lf),
            "cr" => Some(Self::Cr),
            "crlf" => Some(Self::CrLf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayOptions {
    #[serde(default = "default_true")]
    pub auto_scroll: bool,
    #[serde(default)]
    pub show_timestamp: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            auto_scroll: true,
            show_timestamp: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection descriptor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One logical link to one device, as created by the user or loaded from
/// the connection store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub address: TransportAddress,
    /// Stored WebREPL password. Never persisted.
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(default)]
    pub line_ending: LineEnding,
    #[serde(default)]
    pub display: DisplayOptions,
}

impl ConnectionDescriptor {
    pub fn socket(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            address: TransportAddress::Socket { url: url.into() },
            password: None,
            line_ending: LineEnding::default(),
            display: DisplayOptions::default(),
        }
    }

    pub fn serial(name: impl Into<String>, port_name: Option<String>, baud_rate: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            address: TransportAddress::Serial {
                port_name,
                baud_rate,
                identity: None,
            },
            password: None,
            line_ending: LineEnding::default(),
            display: DisplayOptions::default(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.address.kind()
    }

    /// Human readable target used in system lines.
    pub fn target(&self) -> String {
        match &self.address {
            TransportAddress::Socket { url } => url.clone(),
            TransportAddress::Serial {
                port_name,
                baud_rate,
                ..
            } => format!(
                "{} @ {}",
                port_name.as_deref().unwrap_or("<sem porta>"),
                baud_rate
            ),
        }
    }

    /// Check the fields a user must fill in.
    pub fn validate(&self) -> ReplResult<()> {
        if self.id.trim().is_empty() {
            return Err(ReplError::validation("Connection id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(ReplError::validation("Connection name must not be empty"));
        }
        match &self.address {
            TransportAddress::Socket { url } => validate_ws_url(url),
            TransportAddress::Serial { baud_rate, .. } => {
                if *baud_rate == 0 {
                    Err(ReplError::validation("Baud rate must be greater than zero"))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// An update may change anything except the transport kind.
    pub fn check_update(&self, updated: &ConnectionDescriptor) -> ReplResult<()> {
        if self.id != updated.id {
            return Err(ReplError::validation("Connection id cannot change"));
        }
        if self.kind() != updated.kind() {
            return Err(ReplError::validation(
                "Transport kind is fixed; remove the connection and create a new one",
            ));
        }
        updated.validate()
    }
}

/// A WebREPL URL must be non-empty and use `ws://` or `wss://`.
pub fn validate_ws_url(url: &str) -> ReplResult<()> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ReplError::validation("WebREPL URL must not be empty"));
    }
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        return Err(ReplError::validation(format!(
            "WebREPL URL must start with ws:// or wss:// (got '{}')",
            url
        )));
    }
    if url.trim_start_matches("wss://").trim_start_matches("ws://").is_empty() {
        return Err(ReplError::validation("WebREPL URL is missing a host"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplErrorKind;

    #[test]
    fn status_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Password).unwrap(),
            "\"PASSWORD\""
        );
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn line_ending_defaults_to_cr() {
        assert_eq!(LineEnding::default().as_str(), "\r");
        assert_eq!(LineEnding::parse("CRLF"), Some(LineEnding::CrLf));
        assert_eq!(LineEnding::parse("bogus"), None);
    }

    #[test]
    fn socket_descriptor_never_persists_password() {
        let desc = ConnectionDescriptor::socket("esp32", "ws://192.168.4.1:8266")
            .with_password("secret");
        let json = serde_json::to_string(&desc).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"transport\":\"socket\""));

        let back: ConnectionDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.password, None);
        assert_eq!(back.address, desc.address);
    }

    #[test]
    fn serial_descriptor_drops_port_handle_but_keeps_identity() {
        let mut desc = ConnectionDescriptor::serial("pico", Some("/dev/ttyACM0".into()), 115200);
        if let TransportAddress::Serial { identity, .. } = &mut desc.address {
            *identity = Some(SerialIdentity {
                vendor_id: 0x2E8A,
                product_id: 0x0005,
            });
        }
        let json = serde_json::to_value(&desc).unwrap();
        assert!(json.get("portName").is_none());
        assert_eq!(json["baudRate"], 115200);
        assert_eq!(json["identity"]["vendorId"], 0x2E8A);

        let back: ConnectionDescriptor = serde_json::from_value(json).unwrap();
        match back.address {
            TransportAddress::Serial {
                port_name,
                identity,
                ..
            } => {
                assert_eq!(port_name, None);
                assert_eq!(identity.unwrap().product_id, 0x0005);
            }
            other => panic!("unexpected address {:?}", other),
        }
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let empty = ConnectionDescriptor::socket("x", "");
        assert!(empty.validate().unwrap_err().is(ReplErrorKind::Validation));
        let http = ConnectionDescriptor::socket("x", "http://10.0.0.2:8266");
        assert!(http.validate().is_err());
        let ok = ConnectionDescriptor::socket("x", "wss://device.local:8266");
        assert!(ok.validate().is_ok());
        let unnamed = ConnectionDescriptor::socket("  ", "ws://10.0.0.2:8266");
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn update_cannot_switch_transport_kind() {
        let socket = ConnectionDescriptor::socket("dev", "ws://10.0.0.2:8266");
        let mut serial = ConnectionDescriptor::serial("dev", None, 115200);
        serial.id = socket.id.clone();
        let err = socket.check_update(&serial).unwrap_err();
        assert!(err.message.contains("Transport kind"));

        let mut renamed = socket.clone();
        renamed.name = "renamed".into();
        assert!(socket.check_update(&renamed).is_ok());
    }
}
