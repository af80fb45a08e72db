//! Filter chains and the criteria that select them.
//!
//! A listener carries an ordered batch of [`FilterChainDescriptor`]s. Each one
//! pairs a [`MatchCriteria`] with the transport socket and network filters a
//! matching connection should run. The batch is compiled into a
//! [`MatchIndex`] generation and published through the [`FilterChainRegistry`].

mod index;
mod registry;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::init::{InitManager, InitTarget};
use crate::network::{Connection, NetworkFilterFactory, TransportSocketFactory};

pub use index::MatchIndex;
pub use registry::{Activation, FilterChainRegistry, LookupResult, UpdateOutcome};

/// Classification of the connection source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSourceType {
    /// Any source.
    #[default]
    Any,
    /// Loopback peers, or peers whose address equals the local address.
    #[serde(alias = "same_ip_or_loopback")]
    Local,
    /// Everything that is not local.
    External,
}

impl ConnectionSourceType {
    pub(crate) fn index(self) -> usize {
        match self {
            ConnectionSourceType::Any => 0,
            ConnectionSourceType::Local => 1,
            ConnectionSourceType::External => 2,
        }
    }
}

/// Attributes a socket must carry to be assigned a filter chain.
///
/// Empty fields match anything. Equality is structural and order sensitive:
/// two criteria listing the same server names in a different order are
/// distinct rules (and will then collide as overlapping).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchCriteria {
    /// Destination port; 0 matches any port without a more specific rule.
    pub destination_port: u16,
    /// Destination CIDR ranges.
    pub prefix_ranges: Vec<String>,
    /// Not implemented; must be empty.
    pub address_suffix: String,
    /// Not implemented; must be unset.
    pub suffix_len: Option<u32>,
    /// Exact names, or `*.suffix` wildcards.
    pub server_names: Vec<String>,
    /// Detected transport protocol such as `tls` or `raw_buffer`.
    pub transport_protocol: String,
    /// Application protocols such as `h2` or `http/1.1`.
    pub application_protocols: Vec<String>,
    pub source_type: ConnectionSourceType,
    /// Source CIDR ranges.
    pub source_prefix_ranges: Vec<String>,
    pub source_ports: Vec<u16>,
}

/// A named factory reference with its opaque configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryConfig {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl FactoryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: serde_json::Value::Null,
        }
    }

    /// Plaintext transport used when a chain configures none.
    pub fn raw_buffer() -> Self {
        Self::new("raw_buffer")
    }
}

/// One entry of a listener's filter chain batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterChainDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub filter_chain_match: MatchCriteria,
    #[serde(default = "FactoryConfig::raw_buffer")]
    pub transport_socket: FactoryConfig,
    #[serde(default)]
    pub filters: Vec<FactoryConfig>,
    /// Transport socket connect timeout in milliseconds.
    #[serde(default)]
    pub transport_socket_connect_timeout_ms: Option<u64>,
}

impl FilterChainDescriptor {
    pub fn new(name: impl Into<String>, filter_chain_match: MatchCriteria) -> Self {
        Self {
            name: name.into(),
            filter_chain_match,
            transport_socket: FactoryConfig::raw_buffer(),
            filters: Vec::new(),
            transport_socket_connect_timeout_ms: None,
        }
    }

    pub fn with_filter(mut self, filter: FactoryConfig) -> Self {
        self.filters.push(filter);
        self
    }

    /// SHA-256 of the canonical JSON of everything except the match criteria.
    ///
    /// `serde_json::Value` objects are ordered maps, so key order in the
    /// source file does not affect the digest.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "name": self.name,
            "transport_socket": self.transport_socket,
            "filters": self.filters,
            "transport_socket_connect_timeout_ms": self.transport_socket_connect_timeout_ms,
        });
        hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
    }

    pub(crate) fn reuse_key(&self) -> ReuseKey {
        ReuseKey {
            criteria: self.filter_chain_match.clone(),
            fingerprint: self.fingerprint(),
        }
    }
}

/// Identity under which a built chain may be carried into the next generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ReuseKey {
    criteria: MatchCriteria,
    fingerprint: String,
}

/// Process-unique identity of a built filter chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterChainId(u64);

impl FilterChainId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FilterChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fc-{}", self.0)
    }
}

/// Identity of one match index generation. Increases per registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(pub(crate) u64);

impl GenerationId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable, built filter chain.
pub struct FilterChain {
    id: FilterChainId,
    name: String,
    transport_socket_factory: Arc<dyn TransportSocketFactory>,
    network_filter_factories: Vec<Arc<dyn NetworkFilterFactory>>,
    transport_socket_connect_timeout: Option<Duration>,
}

impl FilterChain {
    pub fn new(
        name: impl Into<String>,
        transport_socket_factory: Arc<dyn TransportSocketFactory>,
        network_filter_factories: Vec<Arc<dyn NetworkFilterFactory>>,
    ) -> Self {
        Self {
            id: FilterChainId::next(),
            name: name.into(),
            transport_socket_factory,
            network_filter_factories,
            transport_socket_connect_timeout: None,
        }
    }

    pub fn with_transport_socket_connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport_socket_connect_timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> FilterChainId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport_socket_factory(&self) -> &Arc<dyn TransportSocketFactory> {
        &self.transport_socket_factory
    }

    pub fn network_filter_factories(&self) -> &[Arc<dyn NetworkFilterFactory>] {
        &self.network_filter_factories
    }

    pub fn transport_socket_connect_timeout(&self) -> Option<Duration> {
        self.transport_socket_connect_timeout
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("transport_socket", &self.transport_socket_factory.name())
            .field(
                "filters",
                &self
                    .network_filter_factories
                    .iter()
                    .map(|f| f.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// State available to a chain builder while a generation is being built.
pub struct BuildContext<'a> {
    listener: &'a str,
    init_manager: &'a mut InitManager,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(listener: &'a str, init_manager: &'a mut InitManager) -> Self {
        Self {
            listener,
            init_manager,
        }
    }

    pub fn listener_name(&self) -> &str {
        self.listener
    }

    /// Delay activation of the generation until the returned target is ready.
    pub fn add_init_target(&mut self, name: impl Into<String>) -> InitTarget {
        self.init_manager.add_target(name)
    }
}

/// Turns descriptors into built filter chains.
///
/// Implemented by the surrounding server, which owns the factory registry.
pub trait FilterChainFactoryBuilder {
    fn build_filter_chain(
        &self,
        descriptor: &FilterChainDescriptor,
        context: &mut BuildContext<'_>,
    ) -> Result<FilterChain>;
}

impl<F> FilterChainFactoryBuilder for F
where
    F: Fn(&FilterChainDescriptor, &mut BuildContext<'_>) -> Result<FilterChain>,
{
    fn build_filter_chain(
        &self,
        descriptor: &FilterChainDescriptor,
        context: &mut BuildContext<'_>,
    ) -> Result<FilterChain> {
        self(descriptor, context)
    }
}

/// Install a chain's network filters on a new connection.
///
/// Returns false when the factories produced no filter at all.
pub fn create_network_filter_chain(
    connection: &mut dyn Connection,
    factories: &[Arc<dyn NetworkFilterFactory>],
) -> bool {
    for factory in factories {
        factory.create_filters(connection);
    }
    connection.initialize_read_filters()
}
