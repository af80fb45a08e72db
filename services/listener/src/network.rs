//! Interfaces to the socket and connection layer.
//!
//! The listener core never performs I/O itself. It consumes accepted sockets,
//! transport sockets and server connections through these traits and hands
//! the resulting connections to the surrounding server.

use std::any::Any;
use std::time::Duration;

use portcullis_networking::{is_loopback, Address};

/// Result of a filter step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Proceed to the next filter.
    Continue,
    /// Stop iterating until resumed by an external event.
    StopIteration,
}

/// An accepted socket that has not been turned into a connection yet.
///
/// Listener filters populate the detected transport protocol, requested server
/// name and application protocols; the filter chain lookup reads them.
pub trait ConnectionSocket: Any {
    fn local_address(&self) -> &Address;
    fn remote_address(&self) -> &Address;

    /// Transport protocol detected by a listener filter (`"tls"`, `"raw_buffer"`),
    /// or empty if none was detected.
    fn detected_transport_protocol(&self) -> &str;
    fn set_detected_transport_protocol(&mut self, protocol: &str);

    /// Requested server name, or empty.
    fn requested_server_name(&self) -> &str;
    fn set_requested_server_name(&mut self, server_name: &str);

    /// Application protocols offered by the client, in client preference order.
    fn requested_application_protocols(&self) -> &[String];
    fn set_requested_application_protocols(&mut self, protocols: Vec<String>);

    /// Whether the peer is on this host.
    ///
    /// This may be expensive; the lookup only calls it when a chain
    /// distinguishes local from external sources.
    fn is_local_connection(&self) -> bool {
        is_same_host(self.local_address(), self.remote_address())
    }

    fn is_open(&self) -> bool;
    fn close(&mut self);

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Loopback peers, non-IP peers and peers connecting from the local address
/// itself are on this host.
pub fn is_same_host(local: &Address, remote: &Address) -> bool {
    match remote.ip() {
        Some(ip) => is_loopback(ip) || local.ip() == Some(ip),
        None => true,
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// How a connection should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCloseType {
    /// Flush pending write data before closing.
    FlushWrite,
    /// Close immediately, dropping pending data.
    NoFlush,
}

/// Events a connection reports back to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    RemoteClose,
    LocalClose,
}

impl ConnectionEvent {
    pub fn is_close(&self) -> bool {
        matches!(self, ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose)
    }
}

/// A server connection created from a matched socket.
pub trait Connection {
    fn id(&self) -> u64;
    fn state(&self) -> ConnectionState;
    fn close(&mut self, close_type: ConnectionCloseType);

    /// Install a network filter. Filters run in installation order.
    fn add_filter(&mut self, filter: Box<dyn NetworkFilter>);

    /// Start the installed read filters. Returns false if no filters were installed.
    fn initialize_read_filters(&mut self) -> bool;

    fn set_buffer_limits(&mut self, limit: u32);
    fn no_delay(&mut self, enable: bool);
    fn set_transport_socket_connect_timeout(&mut self, _timeout: Duration) {}
}

/// A processing stage running on an established connection.
pub trait NetworkFilter {
    fn name(&self) -> &str;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Creates the network filters of a filter chain for each new connection.
pub trait NetworkFilterFactory: Send + Sync {
    fn name(&self) -> &str;
    fn create_filters(&self, connection: &mut dyn Connection);
}

/// Transport layer (raw bytes or TLS) wrapped around a connection.
pub trait TransportSocket {
    fn protocol(&self) -> &str;

    fn implements_secure_transport(&self) -> bool {
        false
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Creates the transport socket of a filter chain for each new connection.
pub trait TransportSocketFactory: Send + Sync {
    fn name(&self) -> &str;
    fn create_transport_socket(&self) -> Box<dyn TransportSocket>;

    fn implements_secure_transport(&self) -> bool {
        false
    }
}

/// Creates server connections from matched sockets.
pub trait ConnectionFactory {
    fn create_server_connection(
        &mut self,
        socket: Box<dyn ConnectionSocket>,
        transport_socket: Box<dyn TransportSocket>,
    ) -> Box<dyn Connection>;
}
