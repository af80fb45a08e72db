//! Accepted TCP sockets and the server connections built from them.
//!
//! Connections run their terminal network filter on a local task and report
//! back to the event loop through a channel, keyed by connection id.

use std::any::Any;
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

use portcullis_networking::Address;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::filters::{EchoFilter, TcpProxyFilter};
use crate::network::{
    Connection, ConnectionCloseType, ConnectionEvent, ConnectionFactory, ConnectionSocket,
    ConnectionState, NetworkFilter, TransportSocket,
};

/// Largest copy buffer a connection uses, whatever its buffer limit.
const MAX_COPY_BUFFER: usize = 64 * 1024;

/// Close notifications from connection tasks.
pub type ConnectionEvents = UnboundedSender<(u64, ConnectionEvent)>;

/// A TCP stream waiting in listener filters.
///
/// The stream is shared with peek tasks through a weak handle only, so the
/// socket stays its sole owner.
#[derive(Debug)]
pub struct AcceptedSocket {
    stream: Option<Rc<TcpStream>>,
    local: Address,
    remote: Address,
    transport_protocol: String,
    server_name: String,
    application_protocols: Vec<String>,
}

impl AcceptedSocket {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let local = stream.local_addr()?.into();
        let remote = stream.peer_addr()?.into();
        Ok(Self {
            stream: Some(Rc::new(stream)),
            local,
            remote,
            transport_protocol: String::new(),
            server_name: String::new(),
            application_protocols: Vec::new(),
        })
    }

    /// Handle for peeking without keeping the stream alive.
    pub fn stream_handle(&self) -> Weak<TcpStream> {
        self.stream.as_ref().map(Rc::downgrade).unwrap_or_default()
    }

    fn into_stream(self: Box<Self>) -> Option<TcpStream> {
        let this = *self;
        this.stream.and_then(|stream| Rc::try_unwrap(stream).ok())
    }
}

impl ConnectionSocket for AcceptedSocket {
    fn local_address(&self) -> &Address {
        &self.local
    }

    fn remote_address(&self) -> &Address {
        &self.remote
    }

    fn detected_transport_protocol(&self) -> &str {
        &self.transport_protocol
    }

    fn set_detected_transport_protocol(&mut self, protocol: &str) {
        self.transport_protocol = protocol.to_string();
    }

    fn requested_server_name(&self) -> &str {
        &self.server_name
    }

    fn set_requested_server_name(&mut self, server_name: &str) {
        self.server_name = server_name.to_string();
    }

    fn requested_application_protocols(&self) -> &[String] {
        &self.application_protocols
    }

    fn set_requested_application_protocols(&mut self, protocols: Vec<String>) {
        self.application_protocols = protocols;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A server connection over a TCP stream.
pub struct ServerConnection {
    id: u64,
    state: ConnectionState,
    stream: Option<TcpStream>,
    filters: Vec<Box<dyn NetworkFilter>>,
    buffer_limit: usize,
    events: ConnectionEvents,
    task: Option<AbortHandle>,
}

impl ServerConnection {
    fn new(id: u64, stream: Option<TcpStream>, events: ConnectionEvents) -> Self {
        let state = if stream.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        };
        Self {
            id,
            state,
            stream,
            filters: Vec::new(),
            buffer_limit: MAX_COPY_BUFFER,
            events,
            task: None,
        }
    }
}

impl Connection for ServerConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn close(&mut self, close_type: ConnectionCloseType) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!(connection_id = self.id, close_type = ?close_type, "Closing connection");
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.stream = None;
        self.state = ConnectionState::Closed;
    }

    fn add_filter(&mut self, filter: Box<dyn NetworkFilter>) {
        self.filters.push(filter);
    }

    /// Start the connection task. Must be called inside a `LocalSet`.
    fn initialize_read_filters(&mut self) -> bool {
        if self.filters.is_empty() {
            return false;
        }
        let Some(stream) = self.stream.take() else {
            return false;
        };
        let filters = std::mem::take(&mut self.filters);
        let handle = tokio::task::spawn_local(run_connection(
            self.id,
            stream,
            filters,
            self.buffer_limit,
            self.events.clone(),
        ));
        self.task = Some(handle.abort_handle());
        true
    }

    fn set_buffer_limits(&mut self, limit: u32) {
        self.buffer_limit = (limit as usize).clamp(1, MAX_COPY_BUFFER);
    }

    fn no_delay(&mut self, enable: bool) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.set_nodelay(enable) {
                debug!(connection_id = self.id, error = %e, "Failed to set TCP_NODELAY");
            }
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Creates [`ServerConnection`]s from [`AcceptedSocket`]s.
#[derive(Debug)]
pub struct TcpConnectionFactory {
    next_id: u64,
    events: ConnectionEvents,
}

impl TcpConnectionFactory {
    pub fn new(events: ConnectionEvents) -> Self {
        Self { next_id: 0, events }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn create_server_connection(
        &mut self,
        socket: Box<dyn ConnectionSocket>,
        transport_socket: Box<dyn TransportSocket>,
    ) -> Box<dyn Connection> {
        self.next_id += 1;
        let id = self.next_id;
        let stream = socket
            .into_any()
            .downcast::<AcceptedSocket>()
            .ok()
            .and_then(AcceptedSocket::into_stream);
        if stream.is_none() {
            warn!(connection_id = id, "Matched socket has no TCP stream");
        }
        debug!(
            connection_id = id,
            transport_socket = transport_socket.protocol(),
            "Created server connection"
        );
        Box::new(ServerConnection::new(id, stream, self.events.clone()))
    }
}

enum Terminal {
    Echo,
    Proxy(TcpProxyFilter),
}

/// The first filter that consumes the stream.
fn terminal_filter(filters: Vec<Box<dyn NetworkFilter>>) -> Option<Terminal> {
    for filter in filters {
        let filter = match filter.into_any().downcast::<EchoFilter>() {
            Ok(_) => return Some(Terminal::Echo),
            Err(filter) => filter,
        };
        if let Ok(proxy) = filter.downcast::<TcpProxyFilter>() {
            return Some(Terminal::Proxy(*proxy));
        }
    }
    None
}

async fn run_connection(
    id: u64,
    stream: TcpStream,
    filters: Vec<Box<dyn NetworkFilter>>,
    buffer_size: usize,
    events: ConnectionEvents,
) {
    let event = match serve(id, stream, filters, buffer_size).await {
        Ok(()) => ConnectionEvent::RemoteClose,
        Err(e) => {
            debug!(connection_id = id, error = %e, "Connection error");
            ConnectionEvent::LocalClose
        }
    };
    // The event loop may already be gone during shutdown.
    let _ = events.send((id, event));
}

async fn serve(
    id: u64,
    mut stream: TcpStream,
    filters: Vec<Box<dyn NetworkFilter>>,
    buffer_size: usize,
) -> io::Result<()> {
    match terminal_filter(filters) {
        Some(Terminal::Echo) => {
            let (mut read, mut write) = stream.split();
            let echoed = tokio::io::copy(&mut read, &mut write).await?;
            write.shutdown().await?;
            debug!(connection_id = id, bytes = echoed, "Echo finished");
            Ok(())
        }
        Some(Terminal::Proxy(proxy)) => {
            let mut upstream = connect_upstream(&proxy).await?;
            let (to_upstream, from_upstream) =
                proxy_bidirectional(&mut stream, &mut upstream, buffer_size, proxy.idle_timeout)
                    .await?;
            debug!(
                connection_id = id,
                upstream = %proxy.upstream,
                bytes_to_upstream = to_upstream,
                bytes_from_upstream = from_upstream,
                "Proxy finished"
            );
            Ok(())
        }
        None => Ok(()),
    }
}

async fn connect_upstream(proxy: &TcpProxyFilter) -> io::Result<TcpStream> {
    match tokio::time::timeout(proxy.connect_timeout, TcpStream::connect(proxy.upstream)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out", proxy.upstream),
        )),
    }
}

/// Proxy data bidirectionally between two streams.
///
/// Returns (bytes_to_b, bytes_from_b).
async fn proxy_bidirectional(
    a: &mut TcpStream,
    b: &mut TcpStream,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)> {
    let (mut a_read, mut a_write) = a.split();
    let (mut b_read, mut b_write) = b.split();

    let a_to_b = copy_half(&mut a_read, &mut b_write, buffer_size, idle_timeout);
    let b_to_a = copy_half(&mut b_read, &mut a_write, buffer_size, idle_timeout);
    let (a_result, b_result) = tokio::join!(a_to_b, b_to_a);

    // Report bytes transferred even if one direction errored.
    Ok((a_result.unwrap_or(0), b_result.unwrap_or(0)))
}

async fn copy_half<R, W>(
    read: &mut R,
    write: &mut W,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
) -> io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; buffer_size];
    loop {
        let read_result = match idle_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, read.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => read.read(&mut buf).await,
        };

        match read_result? {
            0 => break,
            n => {
                write.write_all(&buf[..n]).await?;
                total += n as u64;
            }
        }
    }
    write.shutdown().await?;
    Ok(total)
}
