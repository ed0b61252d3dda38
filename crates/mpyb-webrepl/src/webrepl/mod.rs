//! WebREPL crate: sub-modules.

pub mod auth;
pub mod connection;
pub mod transport;

pub use auth::{AuthAction, AuthTracker};
pub use connection::WebReplConnection;
pub use transport::{
    SimulatedConnector, SocketConnector, SocketLink, SocketSink, SocketSource, WsConnector,
};
