//! Test harness for listener integration tests.
//!
//! Provides helpers to spawn TCP backends and a standalone listener on a
//! `LocalSet`, plus fake-driven helpers for exercising the listener core
//! without sockets.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use portcullis_listener::config::ListenerFile;
use portcullis_listener::server::Server;
use portcullis_listener::testing::{FakeConnectionFactory, FakeConnectionLog, FakeSocket};
use portcullis_listener::{
    ActiveListener, ConnectionHandle, FactoryConfig, FilterChainDescriptor, ListenerConfig,
    ListenerStats, LocalDispatcher, MatchCriteria, SocketId, SocketOutcome,
};
use portcullis_networking::Address;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend that answers every read with a fixed marker.
pub struct MarkerBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MarkerBackend {
    pub async fn spawn(marker: &str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let marker_bytes = marker.as_bytes().to_vec();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let response = marker_bytes.clone();
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(_) => {
                                                if stream.write_all(&response).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for MarkerBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A standalone listener running on the current `LocalSet`.
pub struct ListenerHandle {
    pub addr: SocketAddr,
    pub stats: Arc<ListenerStats>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ListenerHandle {
    /// Bind a listener described by `json` on an ephemeral port.
    ///
    /// Must be called from within `LocalSet::run_until`.
    pub async fn spawn(json: &str) -> anyhow::Result<Self> {
        let file = ListenerFile::parse(json)?;
        let server = Server::bind(file).await?;
        Ok(Self::start(server)?)
    }

    /// Like [`ListenerHandle::spawn`], reloading the file at `path`.
    pub async fn spawn_with_reload(path: &std::path::Path) -> anyhow::Result<Self> {
        let file = ListenerFile::load(path)?;
        let server = Server::bind(file)
            .await?
            .with_reload(path.to_path_buf(), Duration::from_millis(100));
        Ok(Self::start(server)?)
    }

    fn start(server: Server) -> io::Result<Self> {
        let addr = server.local_addr()?;
        let stats = Arc::clone(server.core().stats());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::task::spawn_local(server.run(async move {
            let _ = shutdown_rx.await;
        }));
        Ok(Self {
            addr,
            stats,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Stop the listener and wait for it to close everything.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        (&mut self.task).await?
    }

    /// Poll `check` against the listener stats until it holds.
    pub async fn wait_for(&self, check: impl Fn(&ListenerStats) -> bool) -> bool {
        tokio::time::timeout(TEST_TIMEOUT, async {
            while !check(&self.stats) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

/// Send `payload` and read until `expected_len` bytes arrived or the peer closed.
pub async fn roundtrip(
    stream: &mut TcpStream,
    payload: &[u8],
    expected_len: usize,
) -> io::Result<Vec<u8>> {
    stream.write_all(payload).await?;
    read_at_least(stream, expected_len).await
}

pub async fn read_at_least(stream: &mut TcpStream, expected_len: usize) -> io::Result<Vec<u8>> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while received.len() < expected_len {
        let n = tokio::time::timeout(TEST_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))??;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    Ok(received)
}

/// Whether the peer closes `stream` within the test timeout.
pub async fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    matches!(
        tokio::time::timeout(TEST_TIMEOUT, stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

/// A TLS 1.2 ClientHello record carrying SNI and ALPN extensions.
pub fn client_hello(server_name: &str, alpn: &[&str]) -> Vec<u8> {
    let mut extensions = Vec::new();

    let name = server_name.as_bytes();
    let list_len = 3 + name.len();
    extensions.extend_from_slice(&0u16.to_be_bytes());
    extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
    extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
    extensions.push(0);
    extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
    extensions.extend_from_slice(name);

    if !alpn.is_empty() {
        let mut list = Vec::new();
        for protocol in alpn {
            list.push(protocol.len() as u8);
            list.extend_from_slice(protocol.as_bytes());
        }
        extensions.extend_from_slice(&16u16.to_be_bytes());
        extensions.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
        extensions.extend_from_slice(&(list.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&list);
    }

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Listener core wired to fake connections.
pub fn fake_listener(config: ListenerConfig) -> (ActiveListener, FakeConnectionLog) {
    let factory = FakeConnectionFactory::new();
    let log = factory.log();
    (
        ActiveListener::new(config, LocalDispatcher::new(), Box::new(factory)),
        log,
    )
}

pub fn listener_config() -> ListenerConfig {
    ListenerConfig::new("edge", Address::Ip("10.0.0.1:443".parse().unwrap()))
}

/// A chain with one network filter named `filter`.
pub fn chain(name: &str, criteria: MatchCriteria, filter: &str) -> FilterChainDescriptor {
    FilterChainDescriptor::new(name, criteria).with_filter(FactoryConfig::new(filter))
}

pub fn socket(local: &str, remote: &str) -> FakeSocket {
    FakeSocket::new(local.parse().unwrap(), remote.parse().unwrap())
}

pub fn connected(outcome: SocketOutcome) -> ConnectionHandle {
    match outcome {
        SocketOutcome::Connected(handle) => handle,
        other => panic!("expected connection, got {other:?}"),
    }
}

pub fn pending(outcome: SocketOutcome) -> SocketId {
    match outcome {
        SocketOutcome::Pending(id) => id,
        other => panic!("expected pending socket, got {other:?}"),
    }
}
