//! Compiled filter chain lookup.
//!
//! A [`MatchIndex`] is one immutable generation of a listener's filter chains,
//! laid out as a cascade of maps in the order the lookup consults them:
//!
//! ```text
//! destination port -> destination IP trie -> server name -> transport protocol
//!   -> application protocol -> source type -> source IP trie -> source port -> chain
//! ```
//!
//! At every level the most specific key that is present wins and the lookup
//! commits to it. The catch-all key (port 0, empty string, the `/0` ranges) is
//! only consulted when no specific key is present.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use portcullis_networking::{AddressMatcher, CidrRange, NetworkError};
use tracing::debug;

use super::{
    BuildContext, ConnectionSourceType, FilterChain, FilterChainDescriptor,
    FilterChainFactoryBuilder, FilterChainId, GenerationId, ReuseKey,
};
use crate::error::{ConfigError, Result};
use crate::network::ConnectionSocket;

type SourcePorts = HashMap<u16, Arc<FilterChain>>;
type SourceTypes = [Option<AddressMatcher<SourcePorts>>; 3];
type ApplicationProtocols = HashMap<String, SourceTypes>;
type TransportProtocols = HashMap<String, ApplicationProtocols>;
type ServerNames = HashMap<String, TransportProtocols>;
type DestinationIps = AddressMatcher<ServerNames>;

// Mutable layout used while a batch is inserted. IP levels are keyed by the
// normalized range string, with "" standing for the catch-all.
type SourceIpsBuild = HashMap<String, SourcePorts>;
type SourceTypesBuild = [SourceIpsBuild; 3];
type ApplicationProtocolsBuild = HashMap<String, SourceTypesBuild>;
type TransportProtocolsBuild = HashMap<String, ApplicationProtocolsBuild>;
type ServerNamesBuild = HashMap<String, TransportProtocolsBuild>;
type DestinationIpsBuild = HashMap<String, ServerNamesBuild>;

/// One generation of compiled filter chains.
pub struct MatchIndex {
    generation: GenerationId,
    listener: String,
    destination_ports: HashMap<u16, DestinationIps>,
    chains: HashMap<ReuseKey, Arc<FilterChain>>,
    reused: usize,
}

/// Criteria of one descriptor after validation and normalization.
struct NormalizedMatch<'a> {
    destination_port: u16,
    destination_ips: Vec<String>,
    server_names: Vec<String>,
    transport_protocol: &'a str,
    application_protocols: Vec<&'a str>,
    source_type: ConnectionSourceType,
    source_ips: Vec<String>,
    source_ports: Vec<u16>,
}

impl MatchIndex {
    /// Compile an ordered batch of descriptors.
    ///
    /// Chains whose descriptor is unchanged from `previous` are carried over
    /// without calling the builder. The whole batch is rejected on the first
    /// error, and nothing built for it is published.
    pub fn build(
        generation: GenerationId,
        descriptors: &[FilterChainDescriptor],
        builder: &dyn FilterChainFactoryBuilder,
        previous: Option<&MatchIndex>,
        context: &mut BuildContext<'_>,
    ) -> Result<Self> {
        let listener = context.listener_name().to_string();
        let mut seen = HashSet::with_capacity(descriptors.len());
        let mut chains = HashMap::with_capacity(descriptors.len());
        let mut reused = 0;
        let mut layout: HashMap<u16, DestinationIpsBuild> = HashMap::new();

        for descriptor in descriptors {
            let criteria = &descriptor.filter_chain_match;
            if !seen.insert(criteria) {
                return Err(ConfigError::DuplicateMatchRule { listener });
            }

            let normalized = normalize(&listener, descriptor)?;

            let key = descriptor.reuse_key();
            let chain = match previous.and_then(|p| p.chains.get(&key)) {
                Some(existing) => {
                    reused += 1;
                    Arc::clone(existing)
                }
                None => Arc::new(builder.build_filter_chain(descriptor, context)?),
            };

            insert(layout.entry(normalized.destination_port).or_default(), &normalized, &chain)
                .map_err(|()| ConfigError::OverlappingMatchRule {
                    listener: listener.clone(),
                })?;
            chains.insert(key, chain);
        }

        let mut destination_ports = HashMap::with_capacity(layout.len());
        for (port, destination_ips) in layout {
            let compiled =
                compile_destination_ips(destination_ips).map_err(|e| match_error(&listener, e))?;
            destination_ports.insert(port, compiled);
        }

        debug!(
            listener = %listener,
            generation = %generation,
            filter_chains = chains.len(),
            reused = reused,
            "Built filter chain index"
        );

        Ok(Self {
            generation,
            listener,
            destination_ports,
            chains,
            reused,
        })
    }

    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    pub fn listener_name(&self) -> &str {
        &self.listener
    }

    /// Number of chains carried over from the previous generation.
    pub fn reused_count(&self) -> usize {
        self.reused
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn filter_chain_ids(&self) -> HashSet<FilterChainId> {
        self.chains.values().map(|chain| chain.id()).collect()
    }

    pub fn filter_chains(&self) -> impl Iterator<Item = &Arc<FilterChain>> {
        self.chains.values()
    }

    /// Select the filter chain for an accepted socket.
    pub fn find(&self, socket: &dyn ConnectionSocket) -> Option<&Arc<FilterChain>> {
        let local = socket.local_address();

        // Only IP sockets carry a port; everything else goes straight to port 0.
        if let Some(port) = local.port() {
            if let Some(destination_ips) = self.destination_ports.get(&port) {
                return find_for_destination_ip(destination_ips, socket);
            }
        }

        self.destination_ports
            .get(&0)
            .and_then(|destination_ips| find_for_destination_ip(destination_ips, socket))
    }
}

impl std::fmt::Debug for MatchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchIndex")
            .field("generation", &self.generation)
            .field("listener", &self.listener)
            .field("filter_chains", &self.chains.len())
            .field("reused", &self.reused)
            .finish()
    }
}

fn find_for_destination_ip<'a>(
    destination_ips: &'a DestinationIps,
    socket: &dyn ConnectionSocket,
) -> Option<&'a Arc<FilterChain>> {
    let address = socket.local_address().ip_or_placeholder();
    let server_names = destination_ips.get(address)?;
    find_for_server_name(server_names, socket)
}

fn find_for_server_name<'a>(
    server_names: &'a ServerNames,
    socket: &dyn ConnectionSocket,
) -> Option<&'a Arc<FilterChain>> {
    let server_name = socket.requested_server_name();

    if let Some(transports) = server_names.get(server_name) {
        return find_for_transport_protocol(transports, socket);
    }

    for suffix in wildcard_suffixes(server_name) {
        if let Some(transports) = server_names.get(suffix) {
            return find_for_transport_protocol(transports, socket);
        }
    }

    server_names
        .get("")
        .and_then(|transports| find_for_transport_protocol(transports, socket))
}

fn find_for_transport_protocol<'a>(
    transports: &'a TransportProtocols,
    socket: &dyn ConnectionSocket,
) -> Option<&'a Arc<FilterChain>> {
    let detected = socket.detected_transport_protocol();
    let protocols = transports.get(detected).or_else(|| transports.get(""))?;
    find_for_application_protocols(protocols, socket)
}

fn find_for_application_protocols<'a>(
    protocols: &'a ApplicationProtocols,
    socket: &dyn ConnectionSocket,
) -> Option<&'a Arc<FilterChain>> {
    let source_types = socket
        .requested_application_protocols()
        .iter()
        .find_map(|protocol| protocols.get(protocol.as_str()))
        .or_else(|| protocols.get(""))?;
    find_for_source_type(source_types, socket)
}

fn find_for_source_type<'a>(
    source_types: &'a SourceTypes,
    socket: &dyn ConnectionSocket,
) -> Option<&'a Arc<FilterChain>> {
    let local = source_types[ConnectionSourceType::Local.index()].as_ref();
    let external = source_types[ConnectionSourceType::External.index()].as_ref();

    // The locality check may be expensive; skip it unless a bucket needs it.
    if local.is_some() || external.is_some() {
        let bucket = if socket.is_local_connection() {
            local
        } else {
            external
        };
        if let Some(source_ips) = bucket {
            return find_for_source_ip_and_port(source_ips, socket);
        }
    }

    source_types[ConnectionSourceType::Any.index()]
        .as_ref()
        .and_then(|source_ips| find_for_source_ip_and_port(source_ips, socket))
}

fn find_for_source_ip_and_port<'a>(
    source_ips: &'a AddressMatcher<SourcePorts>,
    socket: &dyn ConnectionSocket,
) -> Option<&'a Arc<FilterChain>> {
    let remote = socket.remote_address();
    let ports = source_ips.get(remote.ip_or_placeholder())?;

    let port = remote.port().unwrap_or(0);
    if let Some(chain) = ports.get(&port) {
        return Some(chain);
    }
    if port != 0 {
        return ports.get(&0);
    }
    None
}

/// Wildcard keys to try for a server name, most specific first.
///
/// `www.a.example.com` yields `.a.example.com`, `.example.com` and `.com`.
fn wildcard_suffixes(server_name: &str) -> impl Iterator<Item = &str> {
    server_name
        .match_indices('.')
        .map(|(pos, _)| pos)
        .filter(move |&pos| pos >= 1 && pos + 1 < server_name.len())
        .map(move |pos| &server_name[pos..])
}

fn is_wildcard_server_name(name: &str) -> bool {
    name.starts_with("*.")
}

fn normalize<'a>(
    listener: &str,
    descriptor: &'a FilterChainDescriptor,
) -> Result<NormalizedMatch<'a>> {
    let criteria = &descriptor.filter_chain_match;

    if !criteria.address_suffix.is_empty() {
        return Err(ConfigError::UnimplementedField {
            listener: listener.to_string(),
            field: "address_suffix",
        });
    }
    if criteria.suffix_len.is_some() {
        return Err(ConfigError::UnimplementedField {
            listener: listener.to_string(),
            field: "suffix_len",
        });
    }

    let destination_ips = normalize_ranges(listener, &criteria.prefix_ranges)?;
    let source_ips = normalize_ranges(listener, &criteria.source_prefix_ranges)?;

    let mut server_names = Vec::with_capacity(criteria.server_names.len().max(1));
    for name in &criteria.server_names {
        if is_wildcard_server_name(name) {
            // Stored without the star so the lookup can probe ".suffix" keys.
            server_names.push(name[1..].to_string());
        } else if name.contains('*') {
            return Err(ConfigError::UnsupportedWildcard {
                listener: listener.to_string(),
                server_name: name.clone(),
            });
        } else {
            server_names.push(name.clone());
        }
    }
    if server_names.is_empty() {
        server_names.push(String::new());
    }

    let application_protocols = if criteria.application_protocols.is_empty() {
        vec![""]
    } else {
        criteria
            .application_protocols
            .iter()
            .map(String::as_str)
            .collect()
    };

    let source_ports = if criteria.source_ports.is_empty() {
        vec![0]
    } else {
        criteria.source_ports.clone()
    };

    Ok(NormalizedMatch {
        destination_port: criteria.destination_port,
        destination_ips,
        server_names,
        transport_protocol: &criteria.transport_protocol,
        application_protocols,
        source_type: criteria.source_type,
        source_ips,
        source_ports,
    })
}

fn normalize_ranges(listener: &str, ranges: &[String]) -> Result<Vec<String>> {
    if ranges.is_empty() {
        return Ok(vec![String::new()]);
    }
    ranges
        .iter()
        .map(|range| {
            CidrRange::parse(range)
                .map(|parsed| parsed.to_string())
                .map_err(|source| ConfigError::InvalidCidr {
                    listener: listener.to_string(),
                    source,
                })
        })
        .collect()
}

/// Expand one descriptor into every slot it covers. Fails if any final
/// source port slot is already taken.
fn insert(
    destination_ips: &mut DestinationIpsBuild,
    normalized: &NormalizedMatch<'_>,
    chain: &Arc<FilterChain>,
) -> std::result::Result<(), ()> {
    for destination_ip in &normalized.destination_ips {
        let server_names = destination_ips.entry(destination_ip.clone()).or_default();
        for server_name in &normalized.server_names {
            let application_protocols = server_names
                .entry(server_name.clone())
                .or_default()
                .entry(normalized.transport_protocol.to_string())
                .or_default();
            for application_protocol in &normalized.application_protocols {
                let source_types = application_protocols
                    .entry(application_protocol.to_string())
                    .or_default();
                let source_ips = &mut source_types[normalized.source_type.index()];
                for source_ip in &normalized.source_ips {
                    let ports = source_ips.entry(source_ip.clone()).or_default();
                    for port in &normalized.source_ports {
                        match ports.entry(*port) {
                            Entry::Occupied(_) => return Err(()),
                            Entry::Vacant(slot) => {
                                slot.insert(Arc::clone(chain));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn ranges_for_key(key: &str) -> std::result::Result<Vec<CidrRange>, NetworkError> {
    if key.is_empty() {
        Ok(vec![CidrRange::catch_all_v4(), CidrRange::catch_all_v6()])
    } else {
        Ok(vec![CidrRange::parse(key)?])
    }
}

fn compile_trie<B, T>(
    map: HashMap<String, B>,
    mut compile: impl FnMut(B) -> std::result::Result<T, NetworkError>,
) -> std::result::Result<AddressMatcher<T>, NetworkError> {
    let mut entries = Vec::with_capacity(map.len());
    for (key, value) in map {
        entries.push((compile(value)?, ranges_for_key(&key)?));
    }
    AddressMatcher::new(entries)
}

// Inner tries are compiled before the destination trie that holds them.
fn compile_destination_ips(
    destination_ips: DestinationIpsBuild,
) -> std::result::Result<DestinationIps, NetworkError> {
    compile_trie(destination_ips, |server_names| {
        let mut compiled = ServerNames::with_capacity(server_names.len());
        for (server_name, transports) in server_names {
            let mut compiled_transports = TransportProtocols::with_capacity(transports.len());
            for (transport, protocols) in transports {
                let mut compiled_protocols = ApplicationProtocols::with_capacity(protocols.len());
                for (protocol, source_types) in protocols {
                    compiled_protocols.insert(protocol, compile_source_types(source_types)?);
                }
                compiled_transports.insert(transport, compiled_protocols);
            }
            compiled.insert(server_name, compiled_transports);
        }
        Ok(compiled)
    })
}

fn compile_source_types(
    source_types: SourceTypesBuild,
) -> std::result::Result<SourceTypes, NetworkError> {
    let mut compiled: SourceTypes = [None, None, None];
    for (slot, source_ips) in compiled.iter_mut().zip(source_types) {
        if !source_ips.is_empty() {
            *slot = Some(compile_trie(source_ips, Ok)?);
        }
    }
    Ok(compiled)
}

fn match_error(listener: &str, error: NetworkError) -> ConfigError {
    match error {
        // "0.0.0.0/0" spelled out next to an empty range list lands on the
        // same prefix as the catch-all.
        NetworkError::DuplicatePrefix(_) => ConfigError::OverlappingMatchRule {
            listener: listener.to_string(),
        },
        other => ConfigError::InvalidCidr {
            listener: listener.to_string(),
            source: other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter_chain::{FactoryConfig, MatchCriteria};
    use crate::init::InitManager;
    use crate::testing::{FakeChainBuilder, FakeSocket};
    use portcullis_networking::Address;
    use std::net::SocketAddr;
    use tokio::sync::mpsc::unbounded_channel;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn descriptor(name: &str, criteria: MatchCriteria) -> FilterChainDescriptor {
        FilterChainDescriptor::new(name, criteria).with_filter(FactoryConfig::new("echo"))
    }

    fn build_with(
        builder: &FakeChainBuilder,
        descriptors: &[FilterChainDescriptor],
        previous: Option<&MatchIndex>,
    ) -> Result<MatchIndex> {
        let (tx, _rx) = unbounded_channel();
        let mut init = InitManager::new("test", GenerationId(1), tx);
        let mut context = BuildContext::new("test", &mut init);
        MatchIndex::build(GenerationId(1), descriptors, builder, previous, &mut context)
    }

    fn build(descriptors: &[FilterChainDescriptor]) -> Result<MatchIndex> {
        build_with(&FakeChainBuilder::new(), descriptors, None)
    }

    fn find<'a>(index: &'a MatchIndex, socket: &FakeSocket) -> Option<&'a str> {
        index.find(socket).map(|chain| chain.name())
    }

    fn sni(port: u16, names: &[&str]) -> MatchCriteria {
        MatchCriteria {
            destination_port: port,
            server_names: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn ranges(destination: &[&str]) -> MatchCriteria {
        MatchCriteria {
            prefix_ranges: destination.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_scenario_port_and_server_name() {
        let index = build(&[
            descriptor("one", sni(443, &["a.example.com"])),
            descriptor("two", sni(443, &[])),
        ])
        .unwrap();

        let exact = FakeSocket::new(addr("10.0.0.1:443"), addr("192.0.2.1:5000"))
            .with_server_name("a.example.com");
        assert_eq!(find(&index, &exact), Some("one"));

        let other = FakeSocket::new(addr("10.0.0.1:443"), addr("192.0.2.1:5000"))
            .with_server_name("other.example.com");
        assert_eq!(find(&index, &other), Some("two"));

        let wrong_port = FakeSocket::new(addr("10.0.0.1:8080"), addr("192.0.2.1:5000"));
        assert_eq!(find(&index, &wrong_port), None);
    }

    #[test]
    fn test_wildcard_precedence() {
        let socket = FakeSocket::new(addr("10.0.0.1:443"), addr("192.0.2.1:5000"))
            .with_server_name("www.a.b.example.com");

        let all = [
            descriptor("exact", sni(0, &["www.a.b.example.com"])),
            descriptor("wildcard", sni(0, &["*.b.example.com"])),
            descriptor("catch_all", sni(0, &[])),
        ];
        assert_eq!(find(&build(&all).unwrap(), &socket), Some("exact"));
        assert_eq!(find(&build(&all[1..]).unwrap(), &socket), Some("wildcard"));
        assert_eq!(find(&build(&all[2..]).unwrap(), &socket), Some("catch_all"));
    }

    #[test]
    fn test_longest_wildcard_wins() {
        let index = build(&[
            descriptor("short", sni(0, &["*.example.com"])),
            descriptor("long", sni(0, &["*.b.example.com"])),
        ])
        .unwrap();
        let local = addr("10.0.0.1:443");
        let remote = addr("192.0.2.1:5000");

        let socket = FakeSocket::new(local, remote).with_server_name("a.b.example.com");
        assert_eq!(find(&index, &socket), Some("long"));

        let socket = FakeSocket::new(local, remote).with_server_name("c.example.com");
        assert_eq!(find(&index, &socket), Some("short"));

        // A wildcard never matches the bare suffix itself.
        let socket = FakeSocket::new(local, remote).with_server_name("example.com");
        assert_eq!(find(&index, &socket), None);
    }

    #[test]
    fn test_wildcard_suffixes() {
        let suffixes: Vec<_> = wildcard_suffixes("www.a.example.com").collect();
        assert_eq!(suffixes, vec![".a.example.com", ".example.com", ".com"]);
        assert_eq!(wildcard_suffixes("").count(), 0);
        assert_eq!(wildcard_suffixes("com.").count(), 0);
        assert_eq!(wildcard_suffixes(".com").count(), 0);
    }

    #[test]
    fn test_port_zero_only_without_exact_port() {
        let index = build(&[
            descriptor("any_port", sni(0, &[])),
            descriptor("https", sni(443, &["secure.example.com"])),
        ])
        .unwrap();

        let on_80 = FakeSocket::new(addr("10.0.0.1:80"), addr("192.0.2.1:5000"));
        assert_eq!(find(&index, &on_80), Some("any_port"));

        // Port 443 has its own entry; the lookup commits to it and does not
        // fall back to port 0 when the server name misses there.
        let on_443 = FakeSocket::new(addr("10.0.0.1:443"), addr("192.0.2.1:5000"))
            .with_server_name("plain.example.com");
        assert_eq!(find(&index, &on_443), None);
    }

    #[test]
    fn test_destination_longest_prefix() {
        let index = build(&[
            descriptor("wide", ranges(&["10.0.0.0/8"])),
            descriptor("narrow", ranges(&["10.1.0.0/16"])),
            descriptor("v6", ranges(&["2001:db8::/32"])),
        ])
        .unwrap();

        let remote = addr("192.0.2.1:5000");
        let socket = |local: &str| FakeSocket::new(addr(local), remote);
        assert_eq!(find(&index, &socket("10.1.2.3:80")), Some("narrow"));
        assert_eq!(find(&index, &socket("10.2.2.3:80")), Some("wide"));
        assert_eq!(find(&index, &socket("[2001:db8::1]:80")), Some("v6"));
        assert_eq!(find(&index, &socket("172.16.0.1:80")), None);
    }

    #[test]
    fn test_transport_and_application_protocols() {
        let tls = |protocols: &[&str]| MatchCriteria {
            transport_protocol: "tls".into(),
            application_protocols: protocols.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let index = build(&[
            descriptor("h2", tls(&["h2"])),
            descriptor("http1", tls(&["http/1.1"])),
            descriptor("tls_any", tls(&[])),
            descriptor("plain", MatchCriteria::default()),
        ])
        .unwrap();

        let local = addr("10.0.0.1:443");
        let remote = addr("192.0.2.1:5000");

        // Client preference order decides between two configured protocols.
        let socket = FakeSocket::new(local, remote)
            .with_transport_protocol("tls")
            .with_application_protocols(&["http/1.1", "h2"]);
        assert_eq!(find(&index, &socket), Some("http1"));

        let socket = FakeSocket::new(local, remote)
            .with_transport_protocol("tls")
            .with_application_protocols(&["spdy/3", "h2"]);
        assert_eq!(find(&index, &socket), Some("h2"));

        let socket = FakeSocket::new(local, remote)
            .with_transport_protocol("tls")
            .with_application_protocols(&["spdy/3"]);
        assert_eq!(find(&index, &socket), Some("tls_any"));

        let socket = FakeSocket::new(local, remote).with_transport_protocol("raw_buffer");
        assert_eq!(find(&index, &socket), Some("plain"));
    }

    #[test]
    fn test_source_type_evaluated_lazily() {
        let index = build(&[descriptor("any", MatchCriteria::default())]).unwrap();
        let socket = FakeSocket::new(addr("10.0.0.1:80"), addr("192.0.2.1:5000"));
        assert_eq!(find(&index, &socket), Some("any"));
        assert_eq!(socket.local_connection_checks(), 0);

        let index = build(&[
            descriptor("any", MatchCriteria::default()),
            descriptor(
                "local",
                MatchCriteria {
                    source_type: ConnectionSourceType::Local,
                    ..Default::default()
                },
            ),
        ])
        .unwrap();

        let external = FakeSocket::new(addr("10.0.0.1:80"), addr("192.0.2.1:5000"));
        assert_eq!(find(&index, &external), Some("any"));
        assert_eq!(external.local_connection_checks(), 1);

        let loopback = FakeSocket::new(addr("127.0.0.1:80"), addr("127.0.0.1:5000"));
        assert_eq!(find(&index, &loopback), Some("local"));
    }

    #[test]
    fn test_external_bucket() {
        let index = build(&[descriptor(
            "external",
            MatchCriteria {
                source_type: ConnectionSourceType::External,
                ..Default::default()
            },
        )])
        .unwrap();

        let external = FakeSocket::new(addr("10.0.0.1:80"), addr("192.0.2.1:5000"));
        assert_eq!(find(&index, &external), Some("external"));

        let same_ip = FakeSocket::new(addr("10.0.0.1:80"), addr("10.0.0.1:5000"));
        assert_eq!(find(&index, &same_ip), None);
    }

    #[test]
    fn test_source_ip_and_port() {
        let index = build(&[
            descriptor(
                "trusted_port",
                MatchCriteria {
                    source_prefix_ranges: vec!["192.0.2.0/24".into()],
                    source_ports: vec![5000],
                    ..Default::default()
                },
            ),
            descriptor(
                "trusted",
                MatchCriteria {
                    source_prefix_ranges: vec!["192.0.2.0/24".into()],
                    ..Default::default()
                },
            ),
        ])
        .unwrap();

        let local = addr("10.0.0.1:80");
        let exact_port = FakeSocket::new(local, addr("192.0.2.9:5000"));
        assert_eq!(find(&index, &exact_port), Some("trusted_port"));
        let other_port = FakeSocket::new(local, addr("192.0.2.9:6000"));
        assert_eq!(find(&index, &other_port), Some("trusted"));
        let untrusted = FakeSocket::new(local, addr("198.51.100.1:5000"));
        assert_eq!(find(&index, &untrusted), None);
    }

    #[test]
    fn test_non_ip_addresses_use_placeholder() {
        let socket = FakeSocket::with_addresses(
            Address::Pipe("/tmp/listener.sock".into()),
            Address::Pipe("/tmp/client.sock".into()),
        );

        let index = build(&[descriptor("catch_all", MatchCriteria::default())]).unwrap();
        assert_eq!(find(&index, &socket), Some("catch_all"));

        let index = build(&[descriptor("port_only", sni(443, &[]))]).unwrap();
        assert_eq!(find(&index, &socket), None);
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let err = build(&[
            descriptor("a", sni(443, &["a.example.com"])),
            descriptor("b", sni(443, &["a.example.com"])),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateMatchRule { .. }));
        assert!(err.to_string().starts_with("error adding listener 'test'"));
    }

    #[test]
    fn test_overlapping_rule_rejected() {
        let err = build(&[
            descriptor("a", sni(443, &["a.example.com", "b.example.com"])),
            descriptor("b", sni(443, &["b.example.com"])),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::OverlappingMatchRule { .. }));

        // Reordered repeated fields are distinct criteria that collide.
        let err = build(&[
            descriptor("a", sni(0, &["a.example.com", "b.example.com"])),
            descriptor("b", sni(0, &["b.example.com", "a.example.com"])),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::OverlappingMatchRule { .. }));
    }

    #[test]
    fn test_explicit_catch_all_range_overlaps_empty_ranges() {
        let err = build(&[
            descriptor("implicit", MatchCriteria::default()),
            descriptor("explicit", ranges(&["0.0.0.0/0"])),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::OverlappingMatchRule { .. }));
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let err = build(&[descriptor(
            "bad",
            MatchCriteria {
                source_prefix_ranges: vec!["10.0.0.0/33".into()],
                ..Default::default()
            },
        )])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCidr { .. }));
    }

    #[test]
    fn test_partial_wildcard_rejected() {
        let err = build(&[descriptor("bad", sni(0, &["www.*.example.com"]))]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnsupportedWildcard {
                listener: "test".into(),
                server_name: "www.*.example.com".into(),
            }
        );
    }

    #[test]
    fn test_unimplemented_fields_rejected() {
        let err = build(&[descriptor(
            "suffix",
            MatchCriteria {
                address_suffix: "0.0.0.1".into(),
                ..Default::default()
            },
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnimplementedField {
                field: "address_suffix",
                ..
            }
        ));

        let err = build(&[descriptor(
            "suffix_len",
            MatchCriteria {
                suffix_len: Some(8),
                ..Default::default()
            },
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnimplementedField {
                field: "suffix_len",
                ..
            }
        ));
    }

    #[test]
    fn test_reuse_unchanged_chains() {
        let builder = FakeChainBuilder::new();
        let batch = vec![
            descriptor("one", sni(443, &["a.example.com"])),
            descriptor("two", sni(443, &[])),
        ];
        let first = build_with(&builder, &batch, None).unwrap();
        assert_eq!(builder.build_count(), 2);
        assert_eq!(first.reused_count(), 0);

        let second = build_with(&builder, &batch, Some(&first)).unwrap();
        assert_eq!(builder.build_count(), 2);
        assert_eq!(second.reused_count(), 2);
        assert_eq!(first.filter_chain_ids(), second.filter_chain_ids());

        // A changed filter list rebuilds only that chain.
        let mut changed = batch.clone();
        changed[1] = changed[1].clone().with_filter(FactoryConfig::new("echo"));
        let third = build_with(&builder, &changed, Some(&second)).unwrap();
        assert_eq!(builder.build_count(), 3);
        assert_eq!(third.reused_count(), 1);
        let kept = third
            .filter_chain_ids()
            .intersection(&second.filter_chain_ids())
            .count();
        assert_eq!(kept, 1);
    }

    #[test]
    fn test_builder_error_rejects_batch() {
        let builder = FakeChainBuilder::new().fail_on("broken");
        let err = build_with(
            &builder,
            &[
                descriptor("fine", sni(0, &[])),
                descriptor("broken", sni(443, &[])),
            ],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ChainBuild { .. }));
        assert!(!err.is_match_error());
    }

    #[test]
    fn test_every_rule_reachable() {
        let index = build(&[
            descriptor("a", sni(443, &["a.example.com"])),
            descriptor("b", sni(443, &["*.b.example.com"])),
            descriptor(
                "c",
                MatchCriteria {
                    destination_port: 443,
                    prefix_ranges: vec!["10.9.0.0/16".into()],
                    ..Default::default()
                },
            ),
            descriptor("d", sni(8443, &[])),
        ])
        .unwrap();
        assert_eq!(index.len(), 4);

        let remote = addr("192.0.2.1:5000");
        let cases = [
            (
                FakeSocket::new(addr("10.0.0.1:443"), remote).with_server_name("a.example.com"),
                "a",
            ),
            (
                FakeSocket::new(addr("10.0.0.1:443"), remote).with_server_name("x.b.example.com"),
                "b",
            ),
            (FakeSocket::new(addr("10.9.0.1:443"), remote), "c"),
            (FakeSocket::new(addr("10.0.0.1:8443"), remote), "d"),
        ];
        for (socket, expected) in &cases {
            assert_eq!(find(&index, socket), Some(*expected));
        }
    }
}
