//! Pending sockets, connection records and their per-chain groups.
//!
//! Records are addressed by a [`ConnectionHandle`] (chain, slab slot and a
//! serial) rather than by reference. A handle whose serial no longer matches
//! the slot's occupant refers to a record that is already gone, so late close
//! events for it are ignored.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use slab::Slab;
use tracing::debug;

use super::pipeline::ListenerFilterPipeline;
use super::stream_info::StreamInfo;
use super::ListenerStats;
use crate::dispatcher::DeferredDeletable;
use crate::filter_chain::{FilterChain, FilterChainId, MatchIndex};
use crate::network::{Connection, ConnectionCloseType, ConnectionSocket};

/// Identifies a live connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    filter_chain: FilterChainId,
    slot: usize,
    serial: u64,
}

impl ConnectionHandle {
    pub fn filter_chain(&self) -> FilterChainId {
        self.filter_chain
    }
}

/// Identifies a socket waiting in the listener filter pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId {
    pub(crate) slot: usize,
    pub(crate) serial: u64,
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serial)
    }
}

/// An accepted socket that has not become a connection yet.
pub struct ActiveTcpSocket {
    id: SocketId,
    listener: Arc<str>,
    socket: Option<Box<dyn ConnectionSocket>>,
    pub(crate) pipeline: ListenerFilterPipeline,
    pub(crate) deadline: Option<Instant>,
    pub(crate) stream_info: StreamInfo,
    stats: Arc<ListenerStats>,
    connected: bool,
}

impl ActiveTcpSocket {
    pub(crate) fn new(
        id: SocketId,
        listener: Arc<str>,
        socket: Box<dyn ConnectionSocket>,
        pipeline: ListenerFilterPipeline,
        deadline: Option<Instant>,
        stats: Arc<ListenerStats>,
    ) -> Self {
        let stream_info = StreamInfo::new(
            Instant::now(),
            socket.local_address().clone(),
            socket.remote_address().clone(),
        );
        Self {
            id,
            listener,
            socket: Some(socket),
            pipeline,
            deadline,
            stream_info,
            stats,
            connected: false,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Borrow the socket and pipeline together so a pipeline step can run.
    pub(crate) fn parts(
        &mut self,
    ) -> Option<(&mut ListenerFilterPipeline, &mut dyn ConnectionSocket)> {
        let socket = self.socket.as_deref_mut()?;
        Some((&mut self.pipeline, socket))
    }

    pub(crate) fn take_socket(&mut self) -> Option<Box<dyn ConnectionSocket>> {
        self.socket.take()
    }

    pub(crate) fn close_socket(&mut self) {
        if let Some(socket) = self.socket.as_deref_mut() {
            if socket.is_open() {
                socket.close();
            }
        }
    }

    /// The socket became a tracked connection, which now owns the access log.
    pub(crate) fn mark_connected(&mut self) {
        self.connected = true;
    }
}

impl DeferredDeletable for ActiveTcpSocket {
    fn label(&self) -> String {
        format!("socket {}", self.id)
    }
}

impl Drop for ActiveTcpSocket {
    fn drop(&mut self) {
        if !self.connected {
            self.stats.num_connections.fetch_sub(1, Ordering::Relaxed);
            self.stream_info.log(&self.listener);
        }
    }
}

/// One live connection bound to a filter chain.
pub struct ActiveConnection {
    handle: ConnectionHandle,
    listener: Arc<str>,
    connection: Box<dyn Connection>,
    stream_info: StreamInfo,
    // Keeps the generation this connection was matched against alive.
    generation: Arc<MatchIndex>,
    stats: Arc<ListenerStats>,
}

impl ActiveConnection {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn connection(&self) -> &dyn Connection {
        &*self.connection
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.stream_info
    }

    pub fn generation(&self) -> &Arc<MatchIndex> {
        &self.generation
    }

    pub(crate) fn close(&mut self, close_type: ConnectionCloseType) {
        self.connection.close(close_type);
    }
}

impl DeferredDeletable for ActiveConnection {
    fn label(&self) -> String {
        format!("connection {}", self.connection.id())
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.downstream_cx_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.downstream_cx_destroy.fetch_add(1, Ordering::Relaxed);
        self.stats.num_connections.fetch_sub(1, Ordering::Relaxed);
        self.stream_info.log(&self.listener);
    }
}

/// The live connections of one filter chain.
pub struct ActiveConnections {
    filter_chain: Arc<FilterChain>,
    listener: Arc<str>,
    connections: Slab<ActiveConnection>,
}

impl ActiveConnections {
    pub(crate) fn new(filter_chain: Arc<FilterChain>, listener: Arc<str>) -> Self {
        debug!(
            listener = %listener,
            filter_chain = %filter_chain.name(),
            "Creating connection group"
        );
        Self {
            filter_chain,
            listener,
            connections: Slab::new(),
        }
    }

    pub fn filter_chain(&self) -> &Arc<FilterChain> {
        &self.filter_chain
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub(crate) fn add(
        &mut self,
        serial: u64,
        connection: Box<dyn Connection>,
        stream_info: StreamInfo,
        generation: Arc<MatchIndex>,
        stats: Arc<ListenerStats>,
    ) -> ConnectionHandle {
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle {
            filter_chain: self.filter_chain.id(),
            slot: entry.key(),
            serial,
        };
        entry.insert(ActiveConnection {
            handle,
            listener: Arc::clone(&self.listener),
            connection,
            stream_info,
            generation,
            stats,
        });
        handle
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&ActiveConnection> {
        self.connections
            .get(handle.slot)
            .filter(|record| record.handle == handle)
    }

    pub(crate) fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut ActiveConnection> {
        self.connections
            .get_mut(handle.slot)
            .filter(|record| record.handle == handle)
    }

    /// Detach a record. The caller decides when it is dropped.
    pub(crate) fn remove(&mut self, handle: ConnectionHandle) -> Option<ActiveConnection> {
        self.get_mut(handle)?;
        Some(self.connections.remove(handle.slot))
    }

    pub(crate) fn first(&self) -> Option<ConnectionHandle> {
        self.connections.iter().next().map(|(_, record)| record.handle)
    }
}

impl DeferredDeletable for ActiveConnections {
    fn label(&self) -> String {
        format!("connection group {}", self.filter_chain.name())
    }
}

impl fmt::Debug for ActiveConnections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveConnections")
            .field("filter_chain", &self.filter_chain.name())
            .field("connections", &self.connections.len())
            .finish()
    }
}
