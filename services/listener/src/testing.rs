//! In-memory fakes for sockets, connections, factories and listener filters.
//!
//! Compiled for unit tests and behind the `testing` feature, which the
//! integration tests under `tests/` enable through a dev-dependency. The
//! fakes record what the listener did to them behind `Rc` handles, so tests
//! can inspect a socket or connection after ownership moved into the listener.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portcullis_networking::Address;

use crate::error::{ConfigError, Result};
use crate::filter_chain::{BuildContext, FilterChain, FilterChainDescriptor, FilterChainFactoryBuilder};
use crate::init::InitTarget;
use crate::listener::{ListenerFilter, ListenerFilterFactory};
use crate::network::{
    is_same_host, Connection, ConnectionCloseType, ConnectionFactory, ConnectionSocket,
    ConnectionState, FilterStatus, NetworkFilter, NetworkFilterFactory, TransportSocket,
    TransportSocketFactory,
};

/// Accepted socket with settable inspection results.
pub struct FakeSocket {
    local: Address,
    remote: Address,
    transport_protocol: String,
    server_name: String,
    application_protocols: Vec<String>,
    is_local: Option<bool>,
    local_checks: Rc<Cell<usize>>,
    open: Rc<Cell<bool>>,
}

impl FakeSocket {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self::with_addresses(Address::Ip(local), Address::Ip(remote))
    }

    pub fn with_addresses(local: Address, remote: Address) -> Self {
        Self {
            local,
            remote,
            transport_protocol: String::new(),
            server_name: String::new(),
            application_protocols: Vec::new(),
            is_local: None,
            local_checks: Rc::new(Cell::new(0)),
            open: Rc::new(Cell::new(true)),
        }
    }

    pub fn with_server_name(mut self, server_name: &str) -> Self {
        self.server_name = server_name.to_string();
        self
    }

    pub fn with_transport_protocol(mut self, protocol: &str) -> Self {
        self.transport_protocol = protocol.to_string();
        self
    }

    pub fn with_application_protocols(mut self, protocols: &[&str]) -> Self {
        self.application_protocols = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Override the locality check result.
    pub fn with_local(mut self, is_local: bool) -> Self {
        self.is_local = Some(is_local);
        self
    }

    /// How often the locality check ran.
    pub fn local_connection_checks(&self) -> usize {
        self.local_checks.get()
    }

    /// Shared flag that stays readable after the socket moved away.
    pub fn open_flag(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.open)
    }
}

impl ConnectionSocket for FakeSocket {
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

    fn is_local_connection(&self) -> bool {
        self.local_checks.set(self.local_checks.get() + 1);
        self.is_local
            .unwrap_or_else(|| is_same_host(&self.local, &self.remote))
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }

    fn close(&mut self) {
        self.open.set(false);
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Debug, Default)]
struct FakeConnectionState {
    id: u64,
    state: Option<ConnectionState>,
    closes: Vec<ConnectionCloseType>,
    filters: Vec<String>,
    buffer_limit: Option<u32>,
    connect_timeout: Option<Duration>,
    server_name: String,
    transport_protocol: String,
    destroyed: bool,
}

/// Read-only view of a [`FakeConnection`], valid after it was dropped.
#[derive(Debug, Clone)]
pub struct FakeConnectionProbe {
    inner: Rc<RefCell<FakeConnectionState>>,
}

impl FakeConnectionProbe {
    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state.unwrap_or(ConnectionState::Open)
    }

    pub fn close_types(&self) -> Vec<ConnectionCloseType> {
        self.inner.borrow().closes.clone()
    }

    pub fn filter_names(&self) -> Vec<String> {
        self.inner.borrow().filters.clone()
    }

    pub fn buffer_limit(&self) -> Option<u32> {
        self.inner.borrow().buffer_limit
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.inner.borrow().connect_timeout
    }

    pub fn server_name(&self) -> String {
        self.inner.borrow().server_name.clone()
    }

    pub fn transport_protocol(&self) -> String {
        self.inner.borrow().transport_protocol.clone()
    }

    /// True once the listener dropped the connection.
    pub fn is_destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }
}

/// Server connection that records every call.
pub struct FakeConnection {
    inner: Rc<RefCell<FakeConnectionState>>,
}

impl Connection for FakeConnection {
    fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    fn state(&self) -> ConnectionState {
        self.inner.borrow().state.unwrap_or(ConnectionState::Open)
    }

    fn close(&mut self, close_type: ConnectionCloseType) {
        let mut inner = self.inner.borrow_mut();
        inner.closes.push(close_type);
        inner.state = Some(match close_type {
            ConnectionCloseType::NoFlush => ConnectionState::Closed,
            ConnectionCloseType::FlushWrite => ConnectionState::Closing,
        });
    }

    fn add_filter(&mut self, filter: Box<dyn NetworkFilter>) {
        self.inner.borrow_mut().filters.push(filter.name().to_string());
    }

    fn initialize_read_filters(&mut self) -> bool {
        !self.inner.borrow().filters.is_empty()
    }

    fn set_buffer_limits(&mut self, limit: u32) {
        self.inner.borrow_mut().buffer_limit = Some(limit);
    }

    fn no_delay(&mut self, _enable: bool) {}

    fn set_transport_socket_connect_timeout(&mut self, timeout: Duration) {
        self.inner.borrow_mut().connect_timeout = Some(timeout);
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.inner.borrow_mut().destroyed = true;
    }
}

/// Every connection a [`FakeConnectionFactory`] created, in order.
#[derive(Debug, Clone, Default)]
pub struct FakeConnectionLog {
    connections: Rc<RefCell<Vec<FakeConnectionProbe>>>,
}

impl FakeConnectionLog {
    pub fn len(&self) -> usize {
        self.connections.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<FakeConnectionProbe> {
        self.connections.borrow().get(index).cloned()
    }

    pub fn last(&self) -> Option<FakeConnectionProbe> {
        self.connections.borrow().last().cloned()
    }
}

/// Creates [`FakeConnection`]s with increasing ids.
#[derive(Debug, Default)]
pub struct FakeConnectionFactory {
    next_id: u64,
    log: FakeConnectionLog,
}

impl FakeConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> FakeConnectionLog {
        self.log.clone()
    }
}

impl ConnectionFactory for FakeConnectionFactory {
    fn create_server_connection(
        &mut self,
        socket: Box<dyn ConnectionSocket>,
        transport_socket: Box<dyn TransportSocket>,
    ) -> Box<dyn Connection> {
        self.next_id += 1;
        let inner = Rc::new(RefCell::new(FakeConnectionState {
            id: self.next_id,
            server_name: socket.requested_server_name().to_string(),
            transport_protocol: transport_socket.protocol().to_string(),
            ..Default::default()
        }));
        self.log.connections.borrow_mut().push(FakeConnectionProbe {
            inner: Rc::clone(&inner),
        });
        Box::new(FakeConnection { inner })
    }
}

/// Transport socket that only reports its protocol name.
#[derive(Debug)]
pub struct FakeTransportSocket {
    protocol: String,
}

impl TransportSocket for FakeTransportSocket {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Debug)]
pub struct FakeTransportSocketFactory {
    name: String,
}

impl FakeTransportSocketFactory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl TransportSocketFactory for FakeTransportSocketFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_transport_socket(&self) -> Box<dyn TransportSocket> {
        Box::new(FakeTransportSocket {
            protocol: self.name.clone(),
        })
    }
}

#[derive(Debug)]
pub struct FakeNetworkFilter {
    name: String,
}

impl NetworkFilter for FakeNetworkFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterBehavior {
    Install,
    Nothing,
    CloseConnection,
}

/// Network filter factory with a fixed behavior.
#[derive(Debug)]
pub struct FakeNetworkFilterFactory {
    name: String,
    behavior: FilterBehavior,
    created: Arc<AtomicUsize>,
}

impl FakeNetworkFilterFactory {
    /// Installs one filter named after the factory.
    pub fn new(name: &str) -> Self {
        Self::with_behavior(name, FilterBehavior::Install)
    }

    /// Installs nothing.
    pub fn empty(name: &str) -> Self {
        Self::with_behavior(name, FilterBehavior::Nothing)
    }

    /// Closes the connection instead of installing a filter.
    pub fn closing(name: &str) -> Self {
        Self::with_behavior(name, FilterBehavior::CloseConnection)
    }

    fn with_behavior(name: &str, behavior: FilterBehavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl NetworkFilterFactory for FakeNetworkFilterFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_filters(&self, connection: &mut dyn Connection) {
        self.created.fetch_add(1, Ordering::Relaxed);
        match self.behavior {
            FilterBehavior::Install => connection.add_filter(Box::new(FakeNetworkFilter {
                name: self.name.clone(),
            })),
            FilterBehavior::Nothing => {}
            FilterBehavior::CloseConnection => connection.close(ConnectionCloseType::NoFlush),
        }
    }
}

/// Builds chains from descriptors using the fake factories.
///
/// Filter names map to behaviors: `noop` installs nothing, `close` closes the
/// connection, anything else installs one filter of that name.
#[derive(Default)]
pub struct FakeChainBuilder {
    builds: Cell<usize>,
    fail_on: Option<String>,
    register_init_targets: bool,
    init_targets: RefCell<Vec<InitTarget>>,
}

impl FakeChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject descriptors with this chain name.
    pub fn fail_on(mut self, chain: &str) -> Self {
        self.fail_on = Some(chain.to_string());
        self
    }

    /// Register one init target per built chain.
    pub fn with_init_targets(mut self) -> Self {
        self.register_init_targets = true;
        self
    }

    pub fn build_count(&self) -> usize {
        self.builds.get()
    }

    pub fn take_init_targets(&self) -> Vec<InitTarget> {
        std::mem::take(&mut *self.init_targets.borrow_mut())
    }
}

impl FilterChainFactoryBuilder for FakeChainBuilder {
    fn build_filter_chain(
        &self,
        descriptor: &FilterChainDescriptor,
        context: &mut BuildContext<'_>,
    ) -> Result<FilterChain> {
        if self.fail_on.as_deref() == Some(descriptor.name.as_str()) {
            return Err(ConfigError::ChainBuild {
                listener: context.listener_name().to_string(),
                chain: descriptor.name.clone(),
                reason: "rejected by test builder".to_string(),
            });
        }
        self.builds.set(self.builds.get() + 1);

        if self.register_init_targets {
            let target = context.add_init_target(descriptor.name.clone());
            self.init_targets.borrow_mut().push(target);
        }

        let filters = descriptor
            .filters
            .iter()
            .map(|filter| -> Arc<dyn NetworkFilterFactory> {
                match filter.name.as_str() {
                    "noop" => Arc::new(FakeNetworkFilterFactory::empty("noop")),
                    "close" => Arc::new(FakeNetworkFilterFactory::closing("close")),
                    name => Arc::new(FakeNetworkFilterFactory::new(name)),
                }
            })
            .collect();
        let transport = Arc::new(FakeTransportSocketFactory::new(&descriptor.transport_socket.name));

        let mut chain = FilterChain::new(descriptor.name.clone(), transport, filters);
        if let Some(ms) = descriptor.transport_socket_connect_timeout_ms {
            chain = chain.with_transport_socket_connect_timeout(Duration::from_millis(ms));
        }
        Ok(chain)
    }
}

/// What a [`FakeListenerFilter`] does at a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeAction {
    Continue,
    Stop,
    /// Close the socket.
    Close,
    /// Set the requested server name, then continue.
    SetServerName(String),
}

impl FakeAction {
    fn apply(&self, socket: &mut dyn ConnectionSocket) -> FilterStatus {
        match self {
            FakeAction::Continue => FilterStatus::Continue,
            FakeAction::Stop => FilterStatus::StopIteration,
            FakeAction::Close => {
                socket.close();
                FilterStatus::StopIteration
            }
            FakeAction::SetServerName(name) => {
                socket.set_requested_server_name(name);
                FilterStatus::Continue
            }
        }
    }
}

/// Scripted listener filter.
#[derive(Debug)]
pub struct FakeListenerFilter {
    name: String,
    on_accept: FakeAction,
    on_data: Option<(usize, FakeAction)>,
    accept_calls: Rc<Cell<usize>>,
}

impl FakeListenerFilter {
    pub fn new(name: &str, on_accept: FakeAction) -> Self {
        Self {
            name: name.to_string(),
            on_accept,
            on_data: None,
            accept_calls: Rc::new(Cell::new(0)),
        }
    }

    /// Stop until at least `min_len` bytes are available, then apply `action`.
    pub fn on_data_after(mut self, min_len: usize, action: FakeAction) -> Self {
        self.on_data = Some((min_len, action));
        self
    }

    pub fn accept_calls(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.accept_calls)
    }
}

impl ListenerFilter for FakeListenerFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_accept(&mut self, socket: &mut dyn ConnectionSocket) -> FilterStatus {
        self.accept_calls.set(self.accept_calls.get() + 1);
        self.on_accept.apply(socket)
    }

    fn on_data(&mut self, socket: &mut dyn ConnectionSocket, data: &[u8]) -> FilterStatus {
        match &self.on_data {
            Some((min_len, action)) if data.len() >= *min_len => action.apply(socket),
            Some(_) => FilterStatus::StopIteration,
            None => FilterStatus::Continue,
        }
    }
}

/// Creates a [`FakeListenerFilter`] per socket.
#[derive(Debug)]
pub struct FakeListenerFilterFactory {
    name: String,
    on_accept: FakeAction,
    on_data: Option<(usize, FakeAction)>,
    created: Arc<AtomicUsize>,
}

impl FakeListenerFilterFactory {
    pub fn new(name: &str, on_accept: FakeAction) -> Self {
        Self {
            name: name.to_string(),
            on_accept,
            on_data: None,
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn on_data_after(mut self, min_len: usize, action: FakeAction) -> Self {
        self.on_data = Some((min_len, action));
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl ListenerFilterFactory for FakeListenerFilterFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_filter(&self) -> Box<dyn ListenerFilter> {
        self.created.fetch_add(1, Ordering::Relaxed);
        let mut filter = FakeListenerFilter::new(&self.name, self.on_accept.clone());
        if let Some((min_len, action)) = &self.on_data {
            filter = filter.on_data_after(*min_len, action.clone());
        }
        Box::new(filter)
    }
}
