//! Serial port transport abstraction.
//!
//! `NativeTransport` drives a real port through the `serialport` crate with
//! blocking I/O moved onto the blocking pool. `SimulatedTransport` keeps
//! everything in memory and can answer like a MicroPython REPL.

use mpyb_core::{ReplError, ReplResult};
use mpyb_repl::repl::ReplSimulator;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Per-read timeout of the native port. A timed-out read reports 0 bytes.
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Platform-agnostic serial port transport.
///
/// `read` returning `Ok(0)` means "nothing yet"; end of stream is reported
/// as a `StreamClosed` error.
#[async_trait::async_trait]
pub trait SerialTransport: Send + Sync {
    async fn open(&self, baud_rate: u32) -> ReplResult<()>;

    async fn close(&self) -> ReplResult<()>;

    async fn read(&self, buf: &mut [u8]) -> ReplResult<usize>;

    async fn write(&self, buf: &[u8]) -> ReplResult<usize>;

    async fn flush(&self) -> ReplResult<()>;

    fn is_open(&self) -> bool;

    fn port_name(&self) -> &str;
}

/// Creates a transport for a port name.
#[async_trait::async_trait]
pub trait SerialTransportFactory: Send + Sync {
    async fn create(&self, port_name: &str) -> Arc<dyn SerialTransport>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Native transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type PortHandle = Arc<Mutex<Option<Box<dyn serialport::SerialPort>>>>;

/// OS serial port. Reader and writer are separate handles (`try_clone`) so
/// a pending read never blocks a write.
pub struct NativeTransport {
    name: String,
    reader: PortHandle,
    writer: PortHandle,
    open: AtomicBool,
}

impl NativeTransport {
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            reader: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(None)),
            open: AtomicBool::new(false),
        })
    }
}

fn join_error(e: tokio::task::JoinError) -> ReplError {
    ReplError::internal(format!("Serial I/O task failed: {}", e))
}

#[async_trait::async_trait]
impl SerialTransport for NativeTransport {
    async fn open(&self, baud_rate: u32) -> ReplResult<()> {
        if self.open.load(Ordering::SeqCst) {
            return Err(ReplError::transport(format!("Port {} already open", self.name)));
        }
        let name = self.name.clone();
        let (reader, writer) = tokio::task::spawn_blocking(move || -> ReplResult<_> {
            let port = serialport::new(&name, baud_rate)
                .timeout(READ_TIMEOUT)
                .open()
                .map_err(|e| {
                    ReplError::transport(format!("Failed to open serial port {}: {}", name, e))
                })?;
            let writer = port.try_clone().map_err(|e| {
                ReplError::transport(format!("Failed to clone serial port {}: {}", name, e))
            })?;
            Ok((port, writer))
        })
        .await
        .map_err(join_error)??;

        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.open.store(true, Ordering::SeqCst);
        log::info!("[serial] opened {} at {} baud", self.name, baud_rate);
        Ok(())
    }

    async fn close(&self) -> ReplResult<()> {
        self.open.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();
        self.reader.lock().await.take();
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> ReplResult<usize> {
        let reader = self.reader.clone();
        let len = buf.len();
        let (n, data) = tokio::task::spawn_blocking(move || -> ReplResult<(usize, Vec<u8>)> {
            let mut guard = reader.blocking_lock();
            let port = guard.as_mut().ok_or_else(ReplError::not_connected)?;
            let mut tmp = vec![0u8; len];
            match port.read(&mut tmp) {
                Ok(0) => Err(ReplError::stream_closed("Serial port reported end of stream")),
                Ok(n) => Ok((n, tmp)),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok((0, tmp)),
                Err(e) => Err(ReplError::transport(format!("Serial read failed: {}", e))),
            }
        })
        .await
        .map_err(join_error)??;
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> ReplResult<usize> {
        let writer = self.writer.clone();
        let data = buf.to_vec();
        tokio::task::spawn_blocking(move || -> ReplResult<usize> {
            let mut guard = writer.blocking_lock();
            let port = guard.as_mut().ok_or_else(ReplError::not_connected)?;
            port.write_all(&data)
                .map_err(|e| ReplError::transport(format!("Serial write failed: {}", e)))?;
            Ok(data.len())
        })
        .await
        .map_err(join_error)?
    }

    async fn flush(&self) -> ReplResult<()> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.blocking_lock();
            match guard.as_mut() {
                Some(port) => port
                    .flush()
                    .map_err(|e| ReplError::transport(format!("Serial flush failed: {}", e))),
                None => Ok(()),
            }
        })
        .await
        .map_err(join_error)?
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

pub struct NativeTransportFactory;

#[async_trait::async_trait]
impl SerialTransportFactory for NativeTransportFactory {
    async fn create(&self, port_name: &str) -> Arc<dyn SerialTransport> {
        NativeTransport::new(port_name)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & offline use)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully in-memory transport. With a [`ReplSimulator`] attached, every
/// complete line written to it is answered like a device would.
pub struct SimulatedTransport {
    name: String,
    open: AtomicBool,
    hung_up: AtomicBool,
    baud_rate: AtomicU32,
    fail_opens: AtomicU32,
    open_delay_ms: AtomicU64,
    rx_buf: Mutex<VecDeque<u8>>,
    tx_buf: Mutex<Vec<u8>>,
    line_buf: Mutex<String>,
    rx_notify: Notify,
    device: Option<ReplSimulator>,
}

impl SimulatedTransport {
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Self::build(port_name.into(), None)
    }

    pub fn with_device(port_name: impl Into<String>, device: ReplSimulator) -> Arc<Self> {
        Self::build(port_name.into(), Some(device))
    }

    fn build(name: String, device: Option<ReplSimulator>) -> Arc<Self> {
        Arc::new(Self {
            name,
            open: AtomicBool::new(false),
            hung_up: AtomicBool::new(false),
            baud_rate: AtomicU32::new(0),
            fail_opens: AtomicU32::new(0),
            open_delay_ms: AtomicU64::new(0),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            tx_buf: Mutex::new(Vec::new()),
            line_buf: Mutex::new(String::new()),
            rx_notify: Notify::new(),
            device,
        })
    }

    /// Make the next `n` opens fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Make every open take `delay` before it completes.
    pub fn delay_opens(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Simulate the cable being pulled: pending and future reads fail.
    pub fn hang_up(&self) {
        self.hung_up.store(true, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::SeqCst)
    }

    /// Inject bytes into the receive buffer (simulate incoming data).
    pub async fn inject_rx(&self, data: &[u8]) {
        self.rx_buf.lock().await.extend(data);
        self.rx_notify.notify_waiters();
    }

    /// Drain everything written so far (for test assertions).
    pub async fn drain_tx(&self) -> Vec<u8> {
        std::mem::take(&mut *self.tx_buf.lock().await)
    }

    pub async fn tx_text(&self) -> String {
        String::from_utf8_lossy(&self.tx_buf.lock().await).into_owned()
    }

    async fn answer_complete_lines(&self, data: &[u8]) {
        let device = match &self.device {
            Some(d) => d,
            None => return,
        };
        let mut pending = self.line_buf.lock().await;
        pending.push_str(&String::from_utf8_lossy(data));
        while let Some(idx) = pending.find(['\r', '\n']) {
            let line: String = pending.drain(..=idx).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            let reply = device.respond(line);
            self.inject_rx(reply.as_bytes()).await;
        }
    }
}

#[async_trait::async_trait]
impl SerialTransport for SimulatedTransport {
    async fn open(&self, baud_rate: u32) -> ReplResult<()> {
        if self.open.load(Ordering::SeqCst) {
            return Err(ReplError::transport(format!("Port {} already open", self.name)));
        }
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(ReplError::transport(format!(
                "Failed to open serial port {}: device busy",
                self.name
            )));
        }
        self.baud_rate.store(baud_rate, Ordering::SeqCst);
        self.hung_up.store(false, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> ReplResult<()> {
        self.open.store(false, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> ReplResult<usize> {
        if self.hung_up.load(Ordering::SeqCst) {
            return Err(ReplError::stream_closed("Serial device disconnected"));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(ReplError::not_connected());
        }
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() {
            drop(rx);
            tokio::select! {
                _ = self.rx_notify.notified() => {},
                _ = tokio::time::sleep(READ_TIMEOUT) => {},
            }
            if self.hung_up.load(Ordering::SeqCst) {
                return Err(ReplError::stream_closed("Serial device disconnected"));
            }
            rx = self.rx_buf.lock().await;
        }
        let count = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    async fn write(&self, buf: &[u8]) -> ReplResult<usize> {
        if !self.open.load(Ordering::SeqCst) || self.hung_up.load(Ordering::SeqCst) {
            return Err(ReplError::transport("Port not open"));
        }
        self.tx_buf.lock().await.extend_from_slice(buf);
        self.answer_complete_lines(buf).await;
        Ok(buf.len())
    }

    async fn flush(&self) -> ReplResult<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

/// Hands out one [`SimulatedTransport`] per port name, all attached to the
/// same simulated device.
pub struct SimulatedTransportFactory {
    device: Option<ReplSimulator>,
    transports: Mutex<HashMap<String, Arc<SimulatedTransport>>>,
}

impl SimulatedTransportFactory {
    pub fn new(device: Option<ReplSimulator>) -> Arc<Self> {
        Arc::new(Self {
            device,
            transports: Mutex::new(HashMap::new()),
        })
    }

    /// The transport previously created for `port_name`.
    pub async fn transport(&self, port_name: &str) -> Option<Arc<SimulatedTransport>> {
        self.transports.lock().await.get(port_name).cloned()
    }

    pub async fn created(&self) -> usize {
        self.transports.lock().await.len()
    }

    async fn get_or_create(&self, port_name: &str) -> Arc<SimulatedTransport> {
        let mut map = self.transports.lock().await;
        map.entry(port_name.to_string())
            .or_insert_with(|| match &self.device {
                Some(d) => SimulatedTransport::with_device(port_name, d.clone()),
                None => SimulatedTransport::new(port_name),
            })
            .clone()
    }
}

#[async_trait::async_trait]
impl SerialTransportFactory for SimulatedTransportFactory {
    async fn create(&self, port_name: &str) -> Arc<dyn SerialTransport> {
        self.get_or_create(port_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_transport_open_close() {
        let t = SimulatedTransport::new("/dev/ttyUSB0");
        assert!(!t.is_open());
        t.open(115200).await.unwrap();
        assert!(t.is_open());
        assert_eq!(t.baud_rate(), 115200);
        assert!(t.open(115200).await.is_err());
        t.close().await.unwrap();
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn test_simulated_transport_write_read() {
        let t = SimulatedTransport::new("/dev/ttyUSB0");
        t.open(115200).await.unwrap();
        t.inject_rx(b"Hello").await;
        let mut buf = [0u8; 64];
        let n = t.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello");
    }

    #[tokio::test]
    async fn test_simulated_transport_read_times_out_with_zero() {
        let t = SimulatedTransport::new("/dev/ttyUSB0");
        t.open(115200).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(t.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_simulated_transport_errors() {
        let t = SimulatedTransport::new("/dev/ttyUSB0");
        let mut buf = [0u8; 8];
        assert!(t.read(&mut buf).await.is_err());
        assert!(t.write(b"x").await.is_err());

        t.fail_next_opens(1);
        assert!(t.open(9600).await.is_err());
        t.open(9600).await.unwrap();
        t.hang_up();
        let err = t.read(&mut buf).await.unwrap_err();
        assert!(err.is(mpyb_core::ReplErrorKind::StreamClosed));
    }

    #[tokio::test]
    async fn test_simulated_device_echoes_lines() {
        let t = SimulatedTransport::with_device("/dev/ttyACM0", ReplSimulator::ok_only());
        t.open(115200).await.unwrap();
        t.write(b"1+").await.unwrap();
        t.write(b"1\r").await.unwrap();
        let mut buf = [0u8; 64];
        let n = t.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"1+1\r\n>>> ");
        assert_eq!(t.drain_tx().await, b"1+1\r");
    }

    #[tokio::test]
    async fn test_factory_reuses_transport_per_port() {
        let f = SimulatedTransportFactory::new(None);
        let a = f.create("COM3").await;
        let b = f.create("COM3").await;
        assert_eq!(a.port_name(), b.port_name());
        assert_eq!(f.created().await, 1);
        assert!(f.transport("COM3").await.is_some());
        assert!(f.transport("COM4").await.is_none());
    }
}
