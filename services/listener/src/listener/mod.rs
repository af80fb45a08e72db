//! Listener-side connection lifecycle.
//!
//! [`ActiveListener`] takes accepted sockets through the listener filter
//! pipeline, selects a filter chain for them, creates the server connection
//! and tracks it in a per-chain group until it closes. All of this runs on a
//! single event loop; objects that may still be on the stack of a callback
//! are handed to the [`Dispatcher`] for deferred deletion instead of being
//! dropped in place.

mod connections;
mod pipeline;
mod stream_info;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use portcullis_networking::Address;
use serde::Serialize;
use slab::Slab;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, LocalDispatcher};
use crate::error::Result;
use crate::filter_chain::{
    create_network_filter_chain, FilterChainDescriptor, FilterChainFactoryBuilder, FilterChainId,
    FilterChainRegistry, UpdateOutcome,
};
use crate::network::{
    ConnectionCloseType, ConnectionEvent, ConnectionFactory, ConnectionSocket, ConnectionState,
};

pub use connections::{ActiveConnection, ActiveConnections, ConnectionHandle, SocketId};
pub use pipeline::{ListenerFilter, ListenerFilterFactory, ListenerFilterPipeline, PipelineState};
pub use stream_info::{ResponseFlag, StreamInfo};

use connections::ActiveTcpSocket;

/// Default time a socket may spend in listener filters.
pub const DEFAULT_LISTENER_FILTERS_TIMEOUT: Duration = Duration::from_secs(15);

/// Default read buffer limit per connection.
pub const DEFAULT_PER_CONNECTION_BUFFER_LIMIT_BYTES: u32 = 1024 * 1024;

/// Configuration for a listener.
#[derive(Clone)]
pub struct ListenerConfig {
    /// Listener name, used in logs and errors.
    pub name: String,
    /// Address the listener is bound to.
    pub address: Address,
    /// Time a socket may spend in listener filters. Zero disables the timeout.
    pub listener_filters_timeout: Duration,
    /// Continue to filter chain matching instead of closing on timeout.
    pub continue_on_listener_filters_timeout: bool,
    pub per_connection_buffer_limit_bytes: u32,
    /// Listener filters, in execution order.
    pub listener_filters: Vec<Arc<dyn ListenerFilterFactory>>,
}

impl ListenerConfig {
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
            listener_filters_timeout: DEFAULT_LISTENER_FILTERS_TIMEOUT,
            continue_on_listener_filters_timeout: false,
            per_connection_buffer_limit_bytes: DEFAULT_PER_CONNECTION_BUFFER_LIMIT_BYTES,
            listener_filters: Vec::new(),
        }
    }

    pub fn with_listener_filter(mut self, factory: Arc<dyn ListenerFilterFactory>) -> Self {
        self.listener_filters.push(factory);
        self
    }
}

impl std::fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("listener_filters_timeout", &self.listener_filters_timeout)
            .field(
                "continue_on_listener_filters_timeout",
                &self.continue_on_listener_filters_timeout,
            )
            .field(
                "per_connection_buffer_limit_bytes",
                &self.per_connection_buffer_limit_bytes,
            )
            .field(
                "listener_filters",
                &self
                    .listener_filters
                    .iter()
                    .map(|f| f.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections created.
    pub downstream_cx_total: AtomicU64,
    /// Connections currently tracked.
    pub downstream_cx_active: AtomicU64,
    /// Total connections destroyed.
    pub downstream_cx_destroy: AtomicU64,
    /// Sockets currently waiting in listener filters.
    pub downstream_pre_cx_active: AtomicU64,
    /// Sockets that timed out in listener filters.
    pub downstream_pre_cx_timeout: AtomicU64,
    /// Sockets rejected by a listener filter.
    pub downstream_listener_filter_error: AtomicU64,
    /// Sockets no filter chain matched.
    pub no_filter_chain_match: AtomicU64,
    /// Accepted sockets plus connections not yet destroyed.
    pub num_connections: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStatsSnapshot {
    pub downstream_cx_total: u64,
    pub downstream_cx_active: u64,
    pub downstream_cx_destroy: u64,
    pub downstream_pre_cx_active: u64,
    pub downstream_pre_cx_timeout: u64,
    pub downstream_listener_filter_error: u64,
    pub no_filter_chain_match: u64,
    pub num_connections: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            downstream_cx_total: self.downstream_cx_total.load(Ordering::Relaxed),
            downstream_cx_active: self.downstream_cx_active.load(Ordering::Relaxed),
            downstream_cx_destroy: self.downstream_cx_destroy.load(Ordering::Relaxed),
            downstream_pre_cx_active: self.downstream_pre_cx_active.load(Ordering::Relaxed),
            downstream_pre_cx_timeout: self.downstream_pre_cx_timeout.load(Ordering::Relaxed),
            downstream_listener_filter_error: self
                .downstream_listener_filter_error
                .load(Ordering::Relaxed),
            no_filter_chain_match: self.no_filter_chain_match.load(Ordering::Relaxed),
            num_connections: self.num_connections.load(Ordering::Relaxed),
        }
    }
}

/// What became of a socket after a listener step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOutcome {
    /// Waiting in listener filters.
    Pending(SocketId),
    /// Matched and tracked as a connection.
    Connected(ConnectionHandle),
    /// Closed: rejected by a filter, timed out, unmatched, or its chain had
    /// no network filters.
    Closed,
    /// The socket id was unknown, typically because it already finished.
    Unknown,
}

/// Connection lifecycle core of one listener.
pub struct ActiveListener<D: Dispatcher = LocalDispatcher> {
    config: ListenerConfig,
    name: Arc<str>,
    registry: FilterChainRegistry,
    dispatcher: D,
    connection_factory: Box<dyn ConnectionFactory>,
    pending: Slab<ActiveTcpSocket>,
    connections_by_chain: HashMap<FilterChainId, ActiveConnections>,
    // Set while groups are being drained so that emptied groups stay in the
    // map until the drain removes them itself.
    is_deleting: bool,
    next_serial: u64,
    stats: Arc<ListenerStats>,
}

impl<D: Dispatcher> ActiveListener<D> {
    pub fn new(
        config: ListenerConfig,
        dispatcher: D,
        connection_factory: Box<dyn ConnectionFactory>,
    ) -> Self {
        let name: Arc<str> = Arc::from(config.name.as_str());
        Self {
            registry: FilterChainRegistry::new(config.name.clone()),
            name,
            config,
            dispatcher,
            connection_factory,
            pending: Slab::new(),
            connections_by_chain: HashMap::new(),
            is_deleting: false,
            next_serial: 1,
            stats: Arc::new(ListenerStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    pub fn registry(&self) -> &FilterChainRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    /// Apply a new filter chain batch.
    ///
    /// If the batch activates right away, connections on chains it no longer
    /// carries are drained before this returns.
    pub fn apply_filter_chains(
        &mut self,
        descriptors: &[FilterChainDescriptor],
        builder: &dyn FilterChainFactoryBuilder,
    ) -> Result<UpdateOutcome> {
        let outcome = match self.registry.begin_update(descriptors, builder) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(listener = %self.name, error = %e, "Rejected filter chain update");
                return Err(e);
            }
        };
        if let UpdateOutcome::Activated(activation) = &outcome {
            self.drain_filter_chains(&activation.removed_filter_chains);
        }
        Ok(outcome)
    }

    /// Activate generations whose init targets finished, draining whatever
    /// they removed. Returns the number of activations.
    pub fn dispatch_warmed(&mut self) -> usize {
        let activations = self.registry.dispatch_warmed();
        for activation in &activations {
            self.drain_filter_chains(&activation.removed_filter_chains);
        }
        activations.len()
    }

    /// Take ownership of a freshly accepted socket.
    pub fn on_accept(&mut self, mut socket: Box<dyn ConnectionSocket>) -> SocketOutcome {
        self.stats.num_connections.fetch_add(1, Ordering::Relaxed);

        let serial = self.next_serial();
        let entry = self.pending.vacant_entry();
        let id = SocketId {
            slot: entry.key(),
            serial,
        };

        let filters = self
            .config
            .listener_filters
            .iter()
            .map(|factory| factory.create_filter())
            .collect();
        let mut pipeline = ListenerFilterPipeline::new(filters);
        let state = pipeline.start(&mut *socket);

        debug!(
            listener = %self.name,
            socket = %id,
            remote = %socket.remote_address(),
            state = ?state,
            "Accepted socket"
        );

        let timeout = self.config.listener_filters_timeout;
        let deadline = (!timeout.is_zero()).then(|| self.dispatcher.now() + timeout);
        let active = ActiveTcpSocket::new(
            id,
            Arc::clone(&self.name),
            socket,
            pipeline,
            deadline,
            Arc::clone(&self.stats),
        );

        match state {
            PipelineState::Suspended => {
                entry.insert(active);
                self.stats
                    .downstream_pre_cx_active
                    .fetch_add(1, Ordering::Relaxed);
                SocketOutcome::Pending(id)
            }
            _ => self.finish_pipeline(active, state),
        }
    }

    /// Deliver readable bytes to a socket waiting in listener filters.
    pub fn on_socket_data(&mut self, id: SocketId, data: &[u8]) -> SocketOutcome {
        self.step_pending(id, |pipeline, socket| pipeline.on_data(socket, data))
    }

    /// Resume a socket whose suspended filter completed out of band.
    pub fn continue_socket(&mut self, id: SocketId, success: bool) -> SocketOutcome {
        self.step_pending(id, |pipeline, socket| pipeline.resume(socket, success))
    }

    /// Time out sockets whose listener filter deadline has passed.
    ///
    /// Returns what became of each expired socket.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<(SocketId, SocketOutcome)> {
        let expired: Vec<SocketId> = self
            .pending
            .iter()
            .filter(|(_, active)| active.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(_, active)| active.id())
            .collect();

        let continue_on_timeout = self.config.continue_on_listener_filters_timeout;
        let mut outcomes = Vec::with_capacity(expired.len());
        for id in expired {
            self.stats
                .downstream_pre_cx_timeout
                .fetch_add(1, Ordering::Relaxed);
            if let Some(active) = self.pending.get_mut(id.slot) {
                debug!(
                    listener = %self.name,
                    socket = %id,
                    filter = active.pipeline.current_filter().unwrap_or("-"),
                    continue_on_timeout = continue_on_timeout,
                    "Listener filter timed out"
                );
                if !continue_on_timeout {
                    active
                        .stream_info
                        .set_response_flag(ResponseFlag::ListenerFilterTimeout);
                    active.stream_info.set_details("listener_filter_timeout");
                }
            }
            let outcome = self.step_pending(id, |pipeline, socket| {
                pipeline.on_timeout(socket, continue_on_timeout)
            });
            outcomes.push((id, outcome));
        }
        outcomes
    }

    /// Whether a socket is still waiting in listener filters.
    pub fn is_pending(&self, id: SocketId) -> bool {
        self.pending
            .get(id.slot)
            .is_some_and(|active| active.id() == id)
    }

    /// Earliest listener filter deadline among pending sockets.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.pending
            .iter()
            .filter_map(|(_, active)| active.deadline)
            .min()
    }

    /// React to a connection event. Close events remove the record.
    pub fn on_connection_event(&mut self, handle: ConnectionHandle, event: ConnectionEvent) {
        if event.is_close() {
            self.remove_connection(handle);
        }
    }

    /// Detach a connection record and defer its destruction.
    ///
    /// Safe to call from inside the connection's own close callback: nothing
    /// is dropped until the dispatcher clears its deferred delete list.
    /// Returns false for a handle that no longer names a live record.
    pub fn remove_connection(&mut self, handle: ConnectionHandle) -> bool {
        let chain_id = handle.filter_chain();
        let Some(group) = self.connections_by_chain.get_mut(&chain_id) else {
            return false;
        };
        let Some(record) = group.remove(handle) else {
            return false;
        };

        debug!(
            listener = %self.name,
            connection_id = record.connection().id(),
            filter_chain = %group.filter_chain().name(),
            remaining = group.len(),
            "Removing connection"
        );
        let emptied = group.is_empty();
        self.dispatcher.deferred_delete(Box::new(record));

        if emptied && !self.is_deleting {
            if let Some(group) = self.connections_by_chain.remove(&chain_id) {
                self.dispatcher.deferred_delete(Box::new(group));
            }
        }
        true
    }

    /// Close every connection on the given chains and drop their groups.
    pub fn drain_filter_chains(&mut self, filter_chains: &[FilterChainId]) {
        let was_deleting = std::mem::replace(&mut self.is_deleting, true);

        for chain_id in filter_chains {
            let mut drained = 0usize;
            loop {
                let Some(group) = self.connections_by_chain.get_mut(chain_id) else {
                    break;
                };
                let Some(handle) = group.first() else {
                    break;
                };
                if let Some(record) = group.get_mut(handle) {
                    record.close(ConnectionCloseType::NoFlush);
                }
                self.remove_connection(handle);
                drained += 1;
            }

            if let Some(group) = self.connections_by_chain.remove(chain_id) {
                info!(
                    listener = %self.name,
                    filter_chain = %group.filter_chain().name(),
                    connections = drained,
                    "Drained filter chain"
                );
                self.dispatcher.deferred_delete(Box::new(group));
            }
        }

        self.is_deleting = was_deleting;
    }

    /// Close every pending socket and every connection.
    pub fn shutdown(&mut self) {
        let was_deleting = std::mem::replace(&mut self.is_deleting, true);

        for mut active in self.pending.drain() {
            active.close_socket();
            self.stats
                .downstream_pre_cx_active
                .fetch_sub(1, Ordering::Relaxed);
            self.dispatcher.deferred_delete(Box::new(active));
        }

        let chains: Vec<FilterChainId> = self.connections_by_chain.keys().copied().collect();
        self.drain_filter_chains(&chains);

        self.is_deleting = was_deleting;
        info!(listener = %self.name, "Listener shut down");
    }

    /// Live connections on one filter chain.
    pub fn chain_connection_count(&self, filter_chain: FilterChainId) -> usize {
        self.connections_by_chain
            .get(&filter_chain)
            .map(|group| group.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections_by_chain.values().map(|group| group.len()).sum()
    }

    pub fn pending_socket_count(&self) -> usize {
        self.pending.len()
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<&ActiveConnection> {
        self.connections_by_chain
            .get(&handle.filter_chain())?
            .get(handle)
    }

    /// Drop everything parked for deferred deletion.
    pub fn clear_deferred_delete_list(&mut self) -> usize {
        self.dispatcher.clear_deferred_delete_list()
    }

    fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    fn step_pending<F>(&mut self, id: SocketId, step: F) -> SocketOutcome
    where
        F: FnOnce(&mut ListenerFilterPipeline, &mut dyn ConnectionSocket) -> PipelineState,
    {
        let Some(active) = self.pending.get_mut(id.slot) else {
            return SocketOutcome::Unknown;
        };
        if active.id() != id {
            return SocketOutcome::Unknown;
        }
        let Some((pipeline, socket)) = active.parts() else {
            return SocketOutcome::Unknown;
        };

        match step(pipeline, socket) {
            PipelineState::Suspended | PipelineState::Running => SocketOutcome::Pending(id),
            state => {
                let active = self.pending.remove(id.slot);
                self.stats
                    .downstream_pre_cx_active
                    .fetch_sub(1, Ordering::Relaxed);
                self.finish_pipeline(active, state)
            }
        }
    }

    fn finish_pipeline(&mut self, active: ActiveTcpSocket, state: PipelineState) -> SocketOutcome {
        match state {
            PipelineState::Completed => self.on_pipeline_completed(active),
            _ => {
                if active.stream_info.response_flag().is_none() {
                    self.stats
                        .downstream_listener_filter_error
                        .fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    listener = %self.name,
                    socket = %active.id(),
                    "Listener filters closed the socket"
                );
                self.dispatcher.deferred_delete(Box::new(active));
                SocketOutcome::Closed
            }
        }
    }

    /// Match a socket that passed the listener filters and create its connection.
    fn on_pipeline_completed(&mut self, mut active: ActiveTcpSocket) -> SocketOutcome {
        let Some(mut socket) = active.take_socket() else {
            self.dispatcher.deferred_delete(Box::new(active));
            return SocketOutcome::Closed;
        };

        let Some(matched) = self.registry.lookup(&*socket) else {
            debug!(
                listener = %self.name,
                remote = %socket.remote_address(),
                server_name = socket.requested_server_name(),
                transport_protocol = socket.detected_transport_protocol(),
                "Closing connection: no matching filter chain found"
            );
            self.stats
                .no_filter_chain_match
                .fetch_add(1, Ordering::Relaxed);
            active
                .stream_info
                .set_response_flag(ResponseFlag::NoRouteFound);
            active.stream_info.set_details("filter_chain_not_found");
            socket.close();
            self.dispatcher.deferred_delete(Box::new(active));
            return SocketOutcome::Closed;
        };

        let chain = matched.filter_chain;
        let transport_socket = chain.transport_socket_factory().create_transport_socket();
        let mut connection = self
            .connection_factory
            .create_server_connection(socket, transport_socket);
        self.stats.downstream_cx_total.fetch_add(1, Ordering::Relaxed);
        active.stream_info.set_connection_id(connection.id());
        active.stream_info.set_filter_chain_name(chain.name());
        if let Some(timeout) = chain.transport_socket_connect_timeout() {
            connection.set_transport_socket_connect_timeout(timeout);
        }
        connection.set_buffer_limits(self.config.per_connection_buffer_limit_bytes);
        connection.no_delay(true);

        let has_filters =
            create_network_filter_chain(&mut *connection, chain.network_filter_factories());
        if !has_filters {
            debug!(
                listener = %self.name,
                connection_id = connection.id(),
                filter_chain = %chain.name(),
                "Closing connection: filter chain has no network filters"
            );
            connection.close(ConnectionCloseType::NoFlush);
        }

        if connection.state() == ConnectionState::Closed {
            self.dispatcher.deferred_delete(Box::new(active));
            return SocketOutcome::Closed;
        }

        let serial = self.next_serial();
        let listener = Arc::clone(&self.name);
        let group = self
            .connections_by_chain
            .entry(chain.id())
            .or_insert_with(|| ActiveConnections::new(Arc::clone(&chain), listener));
        let connection_id = connection.id();
        let handle = group.add(
            serial,
            connection,
            active.stream_info.clone(),
            matched.generation,
            Arc::clone(&self.stats),
        );

        self.stats.downstream_cx_active.fetch_add(1, Ordering::Relaxed);
        debug!(
            listener = %self.name,
            connection_id = connection_id,
            filter_chain = %chain.name(),
            chain_connections = group.len(),
            "New connection"
        );

        active.mark_connected();
        self.dispatcher.deferred_delete(Box::new(active));
        SocketOutcome::Connected(handle)
    }
}

impl<D: Dispatcher> Drop for ActiveListener<D> {
    fn drop(&mut self) {
        self.shutdown();
        self.dispatcher.clear_deferred_delete_list();
    }
}

impl<D: Dispatcher> std::fmt::Debug for ActiveListener<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveListener")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("pending", &self.pending.len())
            .field("connections", &self.connection_count())
            .finish()
    }
}
