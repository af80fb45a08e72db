//! Filter chain matching and connection lifecycle for a network listener.
//!
//! An accepted socket runs through the listener filters, is matched against
//! the active generation of filter chains, and becomes a connection tracked
//! per chain until it closes or its chain is drained by a configuration
//! update.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter_chain;
pub mod init;
pub mod listener;
pub mod network;
pub mod server;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tls_inspector;

pub use dispatcher::{DeferredDeletable, Dispatcher, LocalDispatcher};
pub use error::{ConfigError, Result};
pub use filter_chain::{
    create_network_filter_chain, Activation, BuildContext, ConnectionSourceType, FactoryConfig,
    FilterChain, FilterChainDescriptor, FilterChainFactoryBuilder, FilterChainId,
    FilterChainRegistry, GenerationId, LookupResult, MatchCriteria, MatchIndex, UpdateOutcome,
};
pub use init::{InitManager, InitTarget};
pub use listener::{
    ActiveConnection, ActiveConnections, ActiveListener, ConnectionHandle, ListenerConfig,
    ListenerFilter, ListenerFilterFactory, ListenerFilterPipeline, ListenerStats,
    ListenerStatsSnapshot, PipelineState, ResponseFlag, SocketId, SocketOutcome, StreamInfo,
};
pub use network::{
    Connection, ConnectionCloseType, ConnectionEvent, ConnectionFactory, ConnectionSocket,
    ConnectionState, FilterStatus, NetworkFilter, NetworkFilterFactory, TransportSocket,
    TransportSocketFactory,
};
pub use tls_inspector::{TlsInspector, TlsInspectorFactory};
