//! Standalone TCP listener.
//!
//! Drives one [`ActiveListener`] from a single task: accepting sockets,
//! feeding peeked bytes to listener filters, firing listener filter timeouts,
//! relaying connection close events and reloading the listener file. The
//! deferred delete list is flushed once per loop turn.
//!
//! Everything here is `!Send` and must run inside a `tokio::task::LocalSet`.

mod connection;
mod filters;

use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Weak;
use std::task::Poll;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::ReadBuf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::config::ListenerFile;
use crate::dispatcher::LocalDispatcher;
use crate::filter_chain::UpdateOutcome;
use crate::listener::{ActiveListener, ConnectionHandle, SocketId, SocketOutcome};
use crate::network::ConnectionEvent;
use crate::tls_inspector::DEFAULT_MAX_CLIENT_HELLO_BYTES;

pub use connection::{AcceptedSocket, ConnectionEvents, ServerConnection, TcpConnectionFactory};
pub use filters::{
    BuiltinChainBuilder, EchoFilter, EchoFilterFactory, RawBufferSocket, RawBufferSocketFactory,
    TcpProxyFilter, TcpProxyFilterFactory, DEFAULT_CONNECT_TIMEOUT, ECHO, RAW_BUFFER, TCP_PROXY,
};

/// Wait between peeks that found no new bytes.
const PEEK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Delay after a failed accept to avoid a tight loop on persistent errors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum PeekEvent {
    Data(Vec<u8>),
    /// The peer closed or the read failed.
    Closed,
}

struct Peek {
    stream: Weak<TcpStream>,
    task: AbortHandle,
}

struct Reload {
    path: PathBuf,
    interval: Duration,
    digest: String,
}

/// One bound listener and the core that manages its sockets.
pub struct Server {
    listener: TcpListener,
    file: ListenerFile,
    core: ActiveListener,
    builder: BuiltinChainBuilder,
    reload: Option<Reload>,
    events_rx: UnboundedReceiver<(u64, ConnectionEvent)>,
    peek_tx: UnboundedSender<(SocketId, PeekEvent)>,
    peek_rx: UnboundedReceiver<(SocketId, PeekEvent)>,
    peeks: HashMap<SocketId, Peek>,
    connections: HashMap<u64, ConnectionHandle>,
}

impl Server {
    /// Bind the listener described by `file` and apply its filter chains.
    pub async fn bind(file: ListenerFile) -> Result<Self> {
        let config = file
            .listener_config()
            .context("Invalid listener configuration")?;
        let listener = TcpListener::bind(file.address)
            .await
            .with_context(|| format!("Failed to bind {}", file.address))?;

        let (events_tx, events_rx) = unbounded_channel();
        let (peek_tx, peek_rx) = unbounded_channel();
        let mut core = ActiveListener::new(
            config,
            LocalDispatcher::new(),
            Box::new(TcpConnectionFactory::new(events_tx)),
        );
        let builder = BuiltinChainBuilder;
        core.apply_filter_chains(&file.filter_chains, &builder)
            .context("Invalid filter chains")?;

        info!(
            listener = %file.name,
            bind_addr = %listener.local_addr()?,
            filter_chains = file.filter_chains.len(),
            "Listener bound"
        );

        Ok(Self {
            listener,
            file,
            core,
            builder,
            reload: None,
            events_rx,
            peek_tx,
            peek_rx,
            peeks: HashMap::new(),
            connections: HashMap::new(),
        })
    }

    /// Re-read `path` every `interval` and apply changed filter chains.
    ///
    /// The file as it is now counts as already applied.
    pub fn with_reload(mut self, path: PathBuf, interval: Duration) -> Self {
        let digest = std::fs::read(&path)
            .map(|contents| ListenerFile::digest(&contents))
            .unwrap_or_default();
        self.reload = Some(Reload {
            path,
            interval,
            digest,
        });
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn core(&self) -> &ActiveListener {
        &self.core
    }

    /// Serve until `shutdown` resolves, then close every socket and connection.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let reload_period = self
            .reload
            .as_ref()
            .map(|reload| reload.interval)
            .unwrap_or(Duration::from_secs(3600));
        let mut reload_tick = tokio::time::interval(reload_period);
        reload_tick.tick().await;

        info!(listener = %self.file.name, "Listener started");
        loop {
            let next_timeout = self.core.next_timeout();
            let deadline = tokio::time::Instant::from_std(next_timeout.unwrap_or_else(Instant::now));

            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.on_accept(stream),
                    Err(e) => {
                        error!(listener = %self.file.name, error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some((id, event)) = self.peek_rx.recv() => self.on_peek(id, event),
                Some((connection_id, event)) = self.events_rx.recv() => {
                    self.on_connection_event(connection_id, event);
                }
                _ = tokio::time::sleep_until(deadline), if next_timeout.is_some() => {
                    self.on_timeouts();
                }
                _ = reload_tick.tick(), if self.reload.is_some() => self.reload().await,
            }

            if self.core.dispatch_warmed() > 0 {
                self.forget_closed_connections();
            }
            self.core.clear_deferred_delete_list();
        }

        info!(listener = %self.file.name, "Listener stopping");
        for (_, peek) in self.peeks.drain() {
            peek.task.abort();
        }
        self.core.shutdown();
        self.core.clear_deferred_delete_list();
        Ok(())
    }

    fn on_accept(&mut self, stream: TcpStream) {
        let socket = match AcceptedSocket::new(stream) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(listener = %self.file.name, error = %e, "Dropping accepted socket");
                return;
            }
        };
        let stream = socket.stream_handle();
        match self.core.on_accept(Box::new(socket)) {
            SocketOutcome::Pending(id) => self.watch(id, stream, 0),
            outcome => self.track(outcome),
        }
    }

    fn on_peek(&mut self, id: SocketId, event: PeekEvent) {
        match event {
            PeekEvent::Data(data) => match self.core.on_socket_data(id, &data) {
                SocketOutcome::Pending(id) => {
                    if let Some(peek) = self.peeks.remove(&id) {
                        self.watch(id, peek.stream, data.len());
                    }
                }
                outcome => {
                    self.peeks.remove(&id);
                    self.track(outcome);
                }
            },
            PeekEvent::Closed => {
                self.peeks.remove(&id);
                debug!(listener = %self.file.name, socket = %id, "Peer closed during listener filters");
                self.core.continue_socket(id, false);
            }
        }
    }

    fn on_timeouts(&mut self) {
        for (id, outcome) in self.core.poll_timeouts(Instant::now()) {
            if let Some(peek) = self.peeks.remove(&id) {
                peek.task.abort();
            }
            self.track(outcome);
        }
    }

    fn on_connection_event(&mut self, connection_id: u64, event: ConnectionEvent) {
        if !event.is_close() {
            return;
        }
        if let Some(handle) = self.connections.remove(&connection_id) {
            self.core.on_connection_event(handle, event);
        }
    }

    /// Peek the stream until it holds more than `seen` bytes.
    fn watch(&mut self, id: SocketId, stream: Weak<TcpStream>, seen: usize) {
        let task = tokio::task::spawn_local(peek_socket(
            id,
            stream.clone(),
            seen,
            self.peek_tx.clone(),
        ));
        if let Some(previous) = self.peeks.insert(
            id,
            Peek {
                stream,
                task: task.abort_handle(),
            },
        ) {
            previous.task.abort();
        }
    }

    fn track(&mut self, outcome: SocketOutcome) {
        if let SocketOutcome::Connected(handle) = outcome {
            if let Some(record) = self.core.connection(handle) {
                self.connections.insert(record.connection().id(), handle);
            }
        }
    }

    /// Drop handles of connections a drain closed.
    fn forget_closed_connections(&mut self) {
        let core = &self.core;
        self.connections
            .retain(|_, handle| core.connection(*handle).is_some());
    }

    async fn reload(&mut self) {
        let Some(reload) = self.reload.as_mut() else {
            return;
        };
        let contents = match tokio::fs::read(&reload.path).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %reload.path.display(), error = %e, "Failed to read listener file");
                return;
            }
        };
        let digest = ListenerFile::digest(&contents);
        if digest == reload.digest {
            return;
        }
        reload.digest = digest;

        let file = match std::str::from_utf8(&contents)
            .context("Listener file is not UTF-8")
            .and_then(ListenerFile::parse)
        {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %reload.path.display(), error = %e, "Ignoring invalid listener file");
                return;
            }
        };

        if file.name != self.file.name
            || file.address != self.file.address
            || file.listener_filters != self.file.listener_filters
        {
            warn!(
                listener = %self.file.name,
                "Listener name, address and listener filters only change on restart"
            );
        }

        match self.core.apply_filter_chains(&file.filter_chains, &self.builder) {
            Ok(UpdateOutcome::Activated(activation)) => {
                info!(
                    listener = %self.file.name,
                    generation = %activation.generation,
                    drained_filter_chains = activation.removed_filter_chains.len(),
                    "Reloaded filter chains"
                );
                self.forget_closed_connections();
            }
            Ok(UpdateOutcome::Warming { generation, .. }) => {
                info!(listener = %self.file.name, generation = %generation, "Filter chains warming");
            }
            // Already logged by the listener; the active generation keeps serving.
            Err(_) => return,
        }
        self.file.filter_chains = file.filter_chains;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.file.name)
            .field("core", &self.core)
            .field("peeks", &self.peeks.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}

/// Peek at a pending socket and report once it holds more than `seen` bytes.
///
/// Only a weak handle is kept so that the listener can close or take the
/// stream at any time; the task ends quietly once the stream is gone.
async fn peek_socket(
    id: SocketId,
    stream: Weak<TcpStream>,
    seen: usize,
    tx: UnboundedSender<(SocketId, PeekEvent)>,
) {
    let mut buf = vec![0u8; DEFAULT_MAX_CLIENT_HELLO_BYTES.max(seen + 1)];
    loop {
        let peeked = poll_fn(|cx| {
            let Some(stream) = stream.upgrade() else {
                return Poll::Ready(None);
            };
            let mut read_buf = ReadBuf::new(&mut buf);
            stream.poll_peek(cx, &mut read_buf).map(Some)
        })
        .await;

        let event = match peeked {
            None => return,
            Some(Ok(0)) | Some(Err(_)) => PeekEvent::Closed,
            Some(Ok(n)) if n > seen => PeekEvent::Data(buf[..n].to_vec()),
            Some(Ok(_)) => {
                tokio::time::sleep(PEEK_RETRY_INTERVAL).await;
                continue;
            }
        };
        let _ = tx.send((id, event));
        return;
    }
}
