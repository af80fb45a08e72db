//! Transport sockets and network filters compiled into the listener binary.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::filter_chain::{
    BuildContext, FactoryConfig, FilterChain, FilterChainDescriptor, FilterChainFactoryBuilder,
};
use crate::network::{
    Connection, NetworkFilter, NetworkFilterFactory, TransportSocket, TransportSocketFactory,
};

pub const RAW_BUFFER: &str = "raw_buffer";
pub const ECHO: &str = "echo";
pub const TCP_PROXY: &str = "tcp_proxy";

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Plaintext transport.
#[derive(Debug)]
pub struct RawBufferSocket;

impl TransportSocket for RawBufferSocket {
    fn protocol(&self) -> &str {
        RAW_BUFFER
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Debug)]
pub struct RawBufferSocketFactory;

impl TransportSocketFactory for RawBufferSocketFactory {
    fn name(&self) -> &str {
        RAW_BUFFER
    }

    fn create_transport_socket(&self) -> Box<dyn TransportSocket> {
        Box::new(RawBufferSocket)
    }
}

/// Writes every received byte back to the client.
#[derive(Debug)]
pub struct EchoFilter;

impl NetworkFilter for EchoFilter {
    fn name(&self) -> &str {
        ECHO
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Debug)]
pub struct EchoFilterFactory;

impl NetworkFilterFactory for EchoFilterFactory {
    fn name(&self) -> &str {
        ECHO
    }

    fn create_filters(&self, connection: &mut dyn Connection) {
        connection.add_filter(Box::new(EchoFilter));
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TcpProxyConfig {
    upstream: SocketAddr,
    #[serde(default)]
    connect_timeout_ms: Option<u64>,
    #[serde(default)]
    idle_timeout_ms: Option<u64>,
}

/// Forwards the connection to a fixed upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpProxyFilter {
    pub upstream: SocketAddr,
    pub connect_timeout: Duration,
    /// Close when neither side sent anything for this long.
    pub idle_timeout: Option<Duration>,
}

impl NetworkFilter for TcpProxyFilter {
    fn name(&self) -> &str {
        TCP_PROXY
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Debug)]
pub struct TcpProxyFilterFactory {
    filter: TcpProxyFilter,
}

impl TcpProxyFilterFactory {
    pub fn new(filter: TcpProxyFilter) -> Self {
        Self { filter }
    }
}

impl NetworkFilterFactory for TcpProxyFilterFactory {
    fn name(&self) -> &str {
        TCP_PROXY
    }

    fn create_filters(&self, connection: &mut dyn Connection) {
        connection.add_filter(Box::new(self.filter.clone()));
    }
}

/// Builds filter chains from the factories above, by name.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinChainBuilder;

impl BuiltinChainBuilder {
    fn transport_socket_factory(
        &self,
        config: &FactoryConfig,
    ) -> Result<Arc<dyn TransportSocketFactory>> {
        match config.name.as_str() {
            RAW_BUFFER => Ok(Arc::new(RawBufferSocketFactory)),
            name => Err(ConfigError::UnknownFactory {
                kind: "transport socket",
                name: name.to_string(),
            }),
        }
    }

    fn network_filter_factory(
        &self,
        config: &FactoryConfig,
        descriptor: &FilterChainDescriptor,
        context: &BuildContext<'_>,
    ) -> Result<Arc<dyn NetworkFilterFactory>> {
        match config.name.as_str() {
            ECHO => Ok(Arc::new(EchoFilterFactory)),
            TCP_PROXY => {
                let proxy: TcpProxyConfig = serde_json::from_value(config.config.clone())
                    .map_err(|e| ConfigError::ChainBuild {
                        listener: context.listener_name().to_string(),
                        chain: descriptor.name.clone(),
                        reason: format!("invalid tcp_proxy config: {e}"),
                    })?;
                Ok(Arc::new(TcpProxyFilterFactory::new(TcpProxyFilter {
                    upstream: proxy.upstream,
                    connect_timeout: proxy
                        .connect_timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
                    idle_timeout: proxy.idle_timeout_ms.map(Duration::from_millis),
                })))
            }
            name => Err(ConfigError::UnknownFactory {
                kind: "network filter",
                name: name.to_string(),
            }),
        }
    }
}

impl FilterChainFactoryBuilder for BuiltinChainBuilder {
    fn build_filter_chain(
        &self,
        descriptor: &FilterChainDescriptor,
        context: &mut BuildContext<'_>,
    ) -> Result<FilterChain> {
        let transport = self.transport_socket_factory(&descriptor.transport_socket)?;
        let filters = descriptor
            .filters
            .iter()
            .map(|filter| self.network_filter_factory(filter, descriptor, context))
            .collect::<Result<Vec<_>>>()?;

        let mut chain = FilterChain::new(descriptor.name.clone(), transport, filters);
        if let Some(ms) = descriptor.transport_socket_connect_timeout_ms {
            // A plaintext transport is connected as soon as it is accepted, so
            // there is no handshake for the deadline to bound.
            if chain.transport_socket_factory().name() == RAW_BUFFER {
                return Err(ConfigError::ChainBuild {
                    listener: context.listener_name().to_string(),
                    chain: descriptor.name.clone(),
                    reason: format!(
                        "transport_socket_connect_timeout_ms is not supported by the {RAW_BUFFER} transport socket"
                    ),
                });
            }
            chain = chain.with_transport_socket_connect_timeout(Duration::from_millis(ms));
        }
        Ok(chain)
    }
}
