//! Built-in data-collection snippets.
//!
//! Each script prints a single marker line followed by a JSON document.
//! The markers are split in the source so an echoed command never looks
//! like a result.

use super::correlator::CommandRunner;
use mpyb_core::{ReplError, ReplResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MonitorScript {
    /// Heap, CPU frequency and (when available) temperature.
    System,
    Gpio,
    I2c,
    Wifi,
}

const SYSTEM_SCRIPT: &str = r#"import gc, machine, time, json
def _collect():
    try:
        m = {'memory': {'free': gc.mem_free(), 'allocated': gc.mem_alloc()}, 'freq': machine.freq(), 'timestamp': time.time()}
        try:
            if hasattr(machine, 'temperature'):
                m['temp'] = machine.temperature()
        except Exception:
            pass
        return m
    except Exception as e:
        return {'error': str(e), 'timestamp': time.time()}
print('__MONITOR' + '_DATA__' + json.dumps(_collect()))
"#;

const GPIO_SCRIPT: &str = r#"import json
from machine import Pin
def _collect():
    states = {}
    try:
        for n in [2, 4, 5, 16, 17, 18, 19, 21, 22, 23, 25, 26, 27, 32, 33]:
            try:
                states['pin_' + str(n)] = Pin(n, Pin.IN).value()
            except Exception:
                pass
    except Exception as e:
        return {'error': str(e)}
    return states
print('__GPIO' + '_STATE__' + json.dumps(_collect()))
"#;

const I2C_SCRIPT: &str = r#"import json
from machine import I2C, Pin
def _collect():
    found = []
    for bus, scl, sda in [(0, 22, 21), (1, 25, 26)]:
        try:
            for addr in I2C(bus, scl=Pin(scl), sda=Pin(sda)).scan():
                if addr not in found:
                    found.append(addr)
        except Exception:
            continue
    return found
print('__I2C' + '_DEVICES__' + json.dumps(_collect()))
"#;

const WIFI_SCRIPT: &str = r#"import json, network
def _collect():
    sec = {0: 'Open', 1: 'WEP', 2: 'WPA-PSK', 3: 'WPA2-PSK', 4: 'WPA/WPA2-PSK'}
    try:
        wlan = network.WLAN(network.STA_IF)
        wlan.active(True)
        out = []
        for net in wlan.scan():
            out.append({'ssid': net[0].decode('utf-8') if net[0] else '', 'bssid': ':'.join(['%02x' % b for b in net[1]]), 'channel': net[2], 'rssi': net[3], 'security': sec.get(net[4], 'Unknown')})
        return out
    except Exception as e:
        return {'error': str(e)}
print('__WIFI' + '_SCAN__' + json.dumps(_collect()))
"#;

impl MonitorScript {
    pub const ALL: [MonitorScript; 4] = [Self::System, Self::Gpio, Self::I2c, Self::Wifi];

    pub fn marker(&self) -> &'static str {
        match self {
            Self::System => "__MONITOR_DATA__",
            Self::Gpio => "__GPIO_STATE__",
            Self::I2c => "__I2C_DEVICES__",
            Self::Wifi => "__WIFI_SCAN__",
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            Self::System => SYSTEM_SCRIPT,
            Self::Gpio => GPIO_SCRIPT,
            Self::I2c => I2C_SCRIPT,
            Self::Wifi => WIFI_SCRIPT,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "system" | "sys" => Some(Self::System),
            "gpio" => Some(Self::Gpio),
            "i2c" => Some(Self::I2c),
            "wifi" => Some(Self::Wifi),
            _ => None,
        }
    }
}

/// Find the last `marker` line in `text` whose remainder is valid JSON.
pub fn extract_marker(text: &str, marker: &str) -> Option<Value> {
    text.lines().rev().find_map(|line| {
        let idx = line.find(marker)?;
        serde_json::from_str(line[idx + marker.len()..].trim()).ok()
    })
}

/// Run one script through the correlator and return its JSON document.
pub async fn run_monitor<R: CommandRunner + ?Sized>(
    runner: &R,
    script: MonitorScript,
) -> ReplResult<Value> {
    let out = runner.execute_command(script.source()).await?;
    let text = match &out {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if let Some(rest) = text.trim().strip_prefix("ERROR:") {
        return Err(ReplError::remote(rest.trim().to_string()));
    }
    extract_marker(&text, script.marker()).ok_or_else(|| {
        ReplError::protocol(format!("No {} line in monitor output", script.marker()))
    })
}
