//! TLS ClientHello inspection.
//!
//! A listener filter that waits for the ClientHello, which may span several
//! TLS handshake records, then records the detected transport protocol, the
//! SNI host name and the offered ALPN protocols on the socket so the filter
//! chain lookup can use them. Bytes are only peeked; the connection later
//! reads them again from the start.

use tracing::debug;

use crate::listener::{ListenerFilter, ListenerFilterFactory};
use crate::network::{ConnectionSocket, FilterStatus};

/// Name under which the inspector is registered.
pub const TLS_INSPECTOR: &str = "tls_inspector";

/// Maximum bytes to buffer while waiting for the ClientHello.
pub const DEFAULT_MAX_CLIENT_HELLO_BYTES: usize = 8192;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;

/// What a ClientHello offered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    /// Lowercased host name with any trailing dot removed.
    pub server_name: Option<String>,
    /// ALPN protocols in client preference order.
    pub application_protocols: Vec<String>,
}

/// Outcome of parsing the first bytes of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHelloParse {
    /// More bytes are needed.
    Incomplete,
    /// The stream does not start with a TLS handshake.
    NotTls,
    /// A TLS handshake whose ClientHello could not be parsed.
    Malformed,
    Found(ClientHello),
}

/// Parse a TLS ClientHello from the start of a stream.
///
/// TLS record:
/// - byte 0: content type (0x16 = handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
///
/// Handshake body: type (0x01), 3 byte length, client version, 32 byte
/// random, session id, cipher suites, compression methods, extensions.
///
/// The handshake may be fragmented over consecutive handshake records; their
/// payloads are joined until the declared handshake length is present.
pub fn parse_client_hello(data: &[u8]) -> ClientHelloParse {
    let mut handshake = Vec::new();
    let mut rest = data;
    let mut records = 0;

    loop {
        if rest.is_empty() {
            return ClientHelloParse::Incomplete;
        }
        if rest[0] != CONTENT_TYPE_HANDSHAKE {
            return if records == 0 {
                ClientHelloParse::NotTls
            } else {
                ClientHelloParse::Malformed
            };
        }
        if rest.len() < RECORD_HEADER_LEN {
            return ClientHelloParse::Incomplete;
        }
        if rest[1] != 0x03 {
            return if records == 0 {
                ClientHelloParse::NotTls
            } else {
                ClientHelloParse::Malformed
            };
        }

        let record_len = u16::from_be_bytes([rest[3], rest[4]]) as usize;
        if rest.len() < RECORD_HEADER_LEN + record_len {
            return ClientHelloParse::Incomplete;
        }
        // Handshake records never carry an empty fragment.
        if record_len == 0 {
            return ClientHelloParse::Malformed;
        }
        handshake.extend_from_slice(&rest[RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len]);
        rest = &rest[RECORD_HEADER_LEN + record_len..];
        records += 1;

        if handshake[0] != HANDSHAKE_CLIENT_HELLO {
            return ClientHelloParse::NotTls;
        }
        if handshake.len() < HANDSHAKE_HEADER_LEN {
            continue;
        }
        let Some(body_len) = Reader::new(&handshake[1..HANDSHAKE_HEADER_LEN]).u24() else {
            return ClientHelloParse::Malformed;
        };
        let total = HANDSHAKE_HEADER_LEN + body_len;
        if handshake.len() < total {
            continue;
        }
        return match parse_handshake(&handshake[..total]) {
            Some(hello) => ClientHelloParse::Found(hello),
            None => ClientHelloParse::Malformed,
        };
    }
}

/// Big-endian reader over a byte slice. Every read is bounds checked.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn u8(&mut self) -> Option<u8> {
        let value = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(value)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.bytes(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.bytes(3)?;
        Some(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        self.bytes(len).map(|_| ())
    }
}

fn parse_handshake(handshake: &[u8]) -> Option<ClientHello> {
    let mut reader = Reader::new(handshake);
    reader.skip(1)?;
    let body_len = reader.u24()?;
    let body = reader.bytes(body_len)?;

    let mut reader = Reader::new(body);
    // Client version and random.
    reader.skip(2 + 32)?;
    let session_id_len = reader.u8()? as usize;
    reader.skip(session_id_len)?;
    let cipher_suites_len = reader.u16()? as usize;
    reader.skip(cipher_suites_len)?;
    let compression_len = reader.u8()? as usize;
    reader.skip(compression_len)?;

    let mut hello = ClientHello::default();
    if reader.is_empty() {
        return Some(hello);
    }

    let extensions_len = reader.u16()? as usize;
    let mut extensions = Reader::new(reader.bytes(extensions_len)?);
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext_data = extensions.bytes(ext_len)?;
        match ext_type {
            EXT_SERVER_NAME => hello.server_name = parse_server_name(ext_data)?,
            EXT_ALPN => hello.application_protocols = parse_alpn(ext_data)?,
            _ => {}
        }
    }
    Some(hello)
}

/// SNI extension: 2 byte list length, then entries of name type (0 = host
/// name), 2 byte length and the name.
fn parse_server_name(data: &[u8]) -> Option<Option<String>> {
    let mut reader = Reader::new(data);
    let list_len = reader.u16()? as usize;
    let mut list = Reader::new(reader.bytes(list_len)?);
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.bytes(name_len)?;
        if name_type == 0 {
            let host = std::str::from_utf8(name).ok()?;
            return Some(Some(host.to_lowercase().trim_end_matches('.').to_string()));
        }
    }
    Some(None)
}

/// ALPN extension: 2 byte list length, then length-prefixed protocol names.
fn parse_alpn(data: &[u8]) -> Option<Vec<String>> {
    let mut reader = Reader::new(data);
    let list_len = reader.u16()? as usize;
    let mut list = Reader::new(reader.bytes(list_len)?);
    let mut protocols = Vec::new();
    while !list.is_empty() {
        let len = list.u8()? as usize;
        let protocol = list.bytes(len)?;
        protocols.push(String::from_utf8_lossy(protocol).into_owned());
    }
    Some(protocols)
}

/// Listener filter that fills in TLS details from the ClientHello.
#[derive(Debug)]
pub struct TlsInspector {
    max_client_hello_bytes: usize,
}

impl TlsInspector {
    pub fn new(max_client_hello_bytes: usize) -> Self {
        Self {
            max_client_hello_bytes,
        }
    }

    fn apply(&self, socket: &mut dyn ConnectionSocket, hello: ClientHello) {
        socket.set_detected_transport_protocol("tls");
        if let Some(server_name) = &hello.server_name {
            socket.set_requested_server_name(server_name);
        }
        if !hello.application_protocols.is_empty() {
            socket.set_requested_application_protocols(hello.application_protocols);
        }
    }
}

impl Default for TlsInspector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENT_HELLO_BYTES)
    }
}

impl ListenerFilter for TlsInspector {
    fn name(&self) -> &str {
        TLS_INSPECTOR
    }

    fn on_accept(&mut self, _socket: &mut dyn ConnectionSocket) -> FilterStatus {
        FilterStatus::StopIteration
    }

    fn on_data(&mut self, socket: &mut dyn ConnectionSocket, data: &[u8]) -> FilterStatus {
        let data = &data[..data.len().min(self.max_client_hello_bytes)];
        match parse_client_hello(data) {
            ClientHelloParse::Found(hello) => {
                debug!(
                    remote = %socket.remote_address(),
                    server_name = hello.server_name.as_deref().unwrap_or("-"),
                    alpn = ?hello.application_protocols,
                    "Parsed TLS ClientHello"
                );
                self.apply(socket, hello);
                FilterStatus::Continue
            }
            ClientHelloParse::NotTls => FilterStatus::Continue,
            ClientHelloParse::Malformed => {
                debug!(remote = %socket.remote_address(), "Malformed TLS ClientHello");
                socket.close();
                FilterStatus::StopIteration
            }
            ClientHelloParse::Incomplete if data.len() >= self.max_client_hello_bytes => {
                debug!(
                    remote = %socket.remote_address(),
                    max_bytes = self.max_client_hello_bytes,
                    "ClientHello too large"
                );
                socket.close();
                FilterStatus::StopIteration
            }
            ClientHelloParse::Incomplete => FilterStatus::StopIteration,
        }
    }
}

/// Creates a [`TlsInspector`] per socket.
#[derive(Debug, Clone)]
pub struct TlsInspectorFactory {
    max_client_hello_bytes: usize,
}

impl TlsInspectorFactory {
    pub fn new(max_client_hello_bytes: usize) -> Self {
        Self {
            max_client_hello_bytes,
        }
    }
}

impl Default for TlsInspectorFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENT_HELLO_BYTES)
    }
}

impl ListenerFilterFactory for TlsInspectorFactory {
    fn name(&self) -> &str {
        TLS_INSPECTOR
    }

    fn create_filter(&self) -> Box<dyn ListenerFilter> {
        Box::new(TlsInspector::new(self.max_client_hello_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSocket;

    /// Build a minimal TLS 1.2 ClientHello record.
    fn client_hello(server_name: Option<&str>, alpn: &[&str]) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = server_name {
            let name = name.as_bytes();
            let list_len = 3 + name.len();
            extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
            extensions.push(0);
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }
        if !alpn.is_empty() {
            let mut list = Vec::new();
            for protocol in alpn {
                list.push(protocol.len() as u8);
                list.extend_from_slice(protocol.as_bytes());
            }
            extensions.extend_from_slice(&EXT_ALPN.to_be_bytes());
            extensions.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(list.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&list);
        }

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    /// Re-frame a single-record ClientHello as two records split `at` bytes
    /// into the handshake.
    fn split_records(record: &[u8], at: usize) -> Vec<u8> {
        let handshake = &record[RECORD_HEADER_LEN..];
        let mut data = Vec::new();
        for fragment in [&handshake[..at], &handshake[at..]] {
            data.extend_from_slice(&[CONTENT_TYPE_HANDSHAKE, 0x03, 0x01]);
            data.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
            data.extend_from_slice(fragment);
        }
        data
    }

    fn socket() -> FakeSocket {
        FakeSocket::new(
            "10.0.0.1:443".parse().unwrap(),
            "192.0.2.1:40000".parse().unwrap(),
        )
    }

    #[test]
    fn test_parse_server_name_and_alpn() {
        let data = client_hello(Some("Example.COM."), &["h2", "http/1.1"]);
        let hello = match parse_client_hello(&data) {
            ClientHelloParse::Found(hello) => hello,
            other => panic!("expected ClientHello, got {other:?}"),
        };
        assert_eq!(hello.server_name.as_deref(), Some("example.com"));
        assert_eq!(hello.application_protocols, vec!["h2", "http/1.1"]);
    }

    #[test]
    fn test_parse_without_extensions() {
        let data = client_hello(None, &[]);
        assert_eq!(
            parse_client_hello(&data),
            ClientHelloParse::Found(ClientHello::default())
        );
    }

    #[test]
    fn test_parse_incomplete() {
        let data = client_hello(Some("example.com"), &[]);
        assert_eq!(parse_client_hello(&data[..3]), ClientHelloParse::Incomplete);
        assert_eq!(
            parse_client_hello(&data[..data.len() - 1]),
            ClientHelloParse::Incomplete
        );
    }

    #[test]
    fn test_parse_across_records() {
        let record = client_hello(Some("split.example.com"), &["h2"]);
        // Split inside the handshake header and inside the body.
        for at in [2, 40] {
            let data = split_records(&record, at);
            let hello = match parse_client_hello(&data) {
                ClientHelloParse::Found(hello) => hello,
                other => panic!("split at {at}: expected ClientHello, got {other:?}"),
            };
            assert_eq!(hello.server_name.as_deref(), Some("split.example.com"));
            assert_eq!(hello.application_protocols, vec!["h2"]);

            assert_eq!(
                parse_client_hello(&data[..data.len() - 1]),
                ClientHelloParse::Incomplete
            );
        }

        let mut socket = socket();
        let data = split_records(&record, 40);
        assert_eq!(
            TlsInspector::default().on_data(&mut socket, &data),
            FilterStatus::Continue
        );
        assert!(socket.is_open());
        assert_eq!(socket.requested_server_name(), "split.example.com");
    }

    #[test]
    fn test_parse_fragment_followed_by_other_content() {
        let record = client_hello(Some("example.com"), &[]);
        let mut data = split_records(&record, 40);
        // Turn the second record into application data.
        let second = RECORD_HEADER_LEN + 40;
        data[second] = 0x17;
        assert_eq!(parse_client_hello(&data), ClientHelloParse::Malformed);
    }

    #[test]
    fn test_parse_not_tls() {
        assert_eq!(
            parse_client_hello(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            ClientHelloParse::NotTls
        );
    }

    #[test]
    fn test_parse_malformed_extension_length() {
        let mut data = client_hello(Some("example.com"), &[]);
        // Claim a longer host name than the extension holds.
        let last = data.len() - "example.com".len() - 1;
        data[last] = 0xff;
        assert_eq!(parse_client_hello(&data), ClientHelloParse::Malformed);

        let mut socket = socket();
        TlsInspector::default().on_data(&mut socket, &data);
        assert!(!socket.is_open());
    }

    #[test]
    fn test_inspector_sets_socket_fields() {
        let mut socket = socket();
        let mut inspector = TlsInspector::default();
        assert_eq!(inspector.on_accept(&mut socket), FilterStatus::StopIteration);

        let data = client_hello(Some("api.example.com"), &["h2"]);
        assert_eq!(
            inspector.on_data(&mut socket, &data[..10]),
            FilterStatus::StopIteration
        );
        assert_eq!(inspector.on_data(&mut socket, &data), FilterStatus::Continue);
        assert_eq!(socket.detected_transport_protocol(), "tls");
        assert_eq!(socket.requested_server_name(), "api.example.com");
        assert_eq!(socket.requested_application_protocols(), &["h2".to_string()]);
    }

    #[test]
    fn test_inspector_passes_plaintext_through() {
        let mut socket = socket();
        let mut inspector = TlsInspector::default();
        assert_eq!(inspector.on_data(&mut socket, b"SSH-2.0-OpenSSH"), FilterStatus::Continue);
        assert_eq!(socket.detected_transport_protocol(), "");
        assert!(socket.is_open());
    }

    #[test]
    fn test_inspector_rejects_oversized_hello() {
        let mut socket = socket();
        let mut inspector = TlsInspector::new(64);
        let data = client_hello(Some("a-rather-long-host-name.example.com"), &["h2"]);
        assert!(data.len() > 64);
        inspector.on_data(&mut socket, &data);
        assert!(!socket.is_open());
    }
}
