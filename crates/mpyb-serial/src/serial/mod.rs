//! Serial crate: sub-modules.

pub mod connection;
pub mod port_scanner;
pub mod transport;

pub use connection::SerialConnection;
pub use port_scanner::{find_by_identity, list_ports, PortInfo};
pub use transport::{
    NativeTransportFactory, SerialTransport, SerialTransportFactory, SimulatedTransport,
    SimulatedTransportFactory,
};
