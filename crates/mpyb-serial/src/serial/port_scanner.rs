//! Serial port discovery.
//!
//! Enumerates ports through `serialport`, keeps the USB identity of each
//! adapter and resolves a persisted identity back to a live port name.

use mpyb_core::{ReplError, ReplResult, SerialIdentity};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Known USB-serial adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known VID/PID pairs found on MicroPython boards.
#[derive(Debug, Clone)]
pub struct KnownAdapter {
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
}

pub fn known_adapters() -> Vec<KnownAdapter> {
    vec![
        // USB-UART bridges on ESP8266 / ESP32 dev boards
        KnownAdapter { vid: 0x10C4, pid: 0xEA60, manufacturer: "Silicon Labs", product: "CP2102" },
        KnownAdapter { vid: 0x1A86, pid: 0x7523, manufacturer: "WCH", product: "CH340" },
        KnownAdapter { vid: 0x1A86, pid: 0x55D4, manufacturer: "WCH", product: "CH9102" },
        KnownAdapter { vid: 0x0403, pid: 0x6001, manufacturer: "FTDI", product: "FT232R" },
        KnownAdapter { vid: 0x0403, pid: 0x6015, manufacturer: "FTDI", product: "FT-X Series" },
        // Native USB
        KnownAdapter { vid: 0x303A, pid: 0x1001, manufacturer: "Espressif", product: "ESP32-S2/S3 USB-JTAG" },
        KnownAdapter { vid: 0x303A, pid: 0x4001, manufacturer: "Espressif", product: "ESP32-S2 (MicroPython)" },
        KnownAdapter { vid: 0x2E8A, pid: 0x0005, manufacturer: "Raspberry Pi", product: "Pico (MicroPython)" },
        KnownAdapter { vid: 0x2E8A, pid: 0x000A, manufacturer: "Raspberry Pi", product: "Pico" },
        KnownAdapter { vid: 0xF055, pid: 0x9800, manufacturer: "MicroPython", product: "pyboard" },
        KnownAdapter { vid: 0x0483, pid: 0x5740, manufacturer: "STMicroelectronics", product: "STM32 VCP" },
    ]
}

pub fn lookup_adapter(vid: u16, pid: u16) -> Option<KnownAdapter> {
    known_adapters()
        .into_iter()
        .find(|a| a.vid == vid && a.pid == pid)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port info
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub port_name: String,
    /// Present for USB ports only.
    pub identity: Option<SerialIdentity>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub display_name: String,
}

pub fn build_port_info(
    port_name: &str,
    identity: Option<SerialIdentity>,
    manufacturer: Option<&str>,
    product: Option<&str>,
    serial_number: Option<&str>,
) -> PortInfo {
    let mut info = PortInfo {
        port_name: port_name.to_string(),
        identity,
        manufacturer: manufacturer.map(|s| s.to_string()),
        product: product.map(|s| s.to_string()),
        serial_number: serial_number.map(|s| s.to_string()),
        display_name: String::new(),
    };
    info.display_name = generate_display_name(&info);
    info
}

/// `<port> - <manufacturer> <product>` when anything is known about it.
pub fn generate_display_name(port: &PortInfo) -> String {
    if let Some(id) = port.identity {
        if let Some(adapter) = lookup_adapter(id.vendor_id, id.product_id) {
            return format!("{} - {} {}", port.port_name, adapter.manufacturer, adapter.product);
        }
    }
    match (&port.manufacturer, &port.product) {
        (Some(m), Some(p)) if !m.is_empty() && !p.is_empty() => {
            format!("{} - {} {}", port.port_name, m, p)
        }
        (_, Some(p)) if !p.is_empty() => format!("{} - {}", port.port_name, p),
        _ => port.port_name.clone(),
    }
}

fn from_serialport(info: serialport::SerialPortInfo) -> PortInfo {
    match info.port_type {
        serialport::SerialPortType::UsbPort(usb) => build_port_info(
            &info.port_name,
            Some(SerialIdentity {
                vendor_id: usb.vid,
                product_id: usb.pid,
            }),
            usb.manufacturer.as_deref(),
            usb.product.as_deref(),
            usb.serial_number.as_deref(),
        ),
        _ => build_port_info(&info.port_name, None, None, None, None),
    }
}

/// Enumerate the ports currently present on the system.
pub async fn list_ports() -> ReplResult<Vec<PortInfo>> {
    let ports = tokio::task::spawn_blocking(serialport::available_ports)
        .await
        .map_err(|e| ReplError::internal(format!("Port scan task failed: {}", e)))?
        .map_err(|e| ReplError::transport(format!("Failed to list serial ports: {}", e)))?;
    log::debug!("[serial] found {} ports", ports.len());
    Ok(ports.into_iter().map(from_serialport).collect())
}

/// First port carrying `identity`.
pub fn find_by_identity(ports: &[PortInfo], identity: SerialIdentity) -> Option<&PortInfo> {
    ports.iter().find(|p| p.identity == Some(identity))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pico() -> SerialIdentity {
        SerialIdentity { vendor_id: 0x2E8A, product_id: 0x0005 }
    }

    #[test]
    fn test_lookup_known_boards() {
        assert_eq!(lookup_adapter(0x10C4, 0xEA60).unwrap().product, "CP2102");
        assert!(lookup_adapter(0xFFFF, 0xFFFF).is_none());
    }

    #[test]
    fn test_display_name_known_adapter() {
        let info = build_port_info("/dev/ttyACM0", Some(pico()), None, None, None);
        assert_eq!(info.display_name, "/dev/ttyACM0 - Raspberry Pi Pico (MicroPython)");
    }

    #[test]
    fn test_display_name_falls_back_to_descriptors() {
        let id = SerialIdentity { vendor_id: 0x1234, product_id: 0x5678 };
        let info = build_port_info("COM5", Some(id), Some("Acme"), Some("Widget"), None);
        assert_eq!(info.display_name, "COM5 - Acme Widget");
        let bare = build_port_info("/dev/ttyS0", None, None, None, None);
        assert_eq!(bare.display_name, "/dev/ttyS0");
    }

    #[test]
    fn test_find_by_identity() {
        let ports = vec![
            build_port_info("/dev/ttyS0", None, None, None, None),
            build_port_info("/dev/ttyACM1", Some(pico()), None, None, None),
        ];
        assert_eq!(find_by_identity(&ports, pico()).unwrap().port_name, "/dev/ttyACM1");
        let other = SerialIdentity { vendor_id: 1, product_id: 2 };
        assert!(find_by_identity(&ports, other).is_none());
    }
}
