//! TCP listener and connection handling.
//!
//! This module binds the RUDICS port, accepts connections, classifies each
//! one by its prefix and relays it to the matching backend.
//!
//! - One task per accepted connection, sharing only read-only config
//! - Accept errors are logged and never stop the loop
//! - Rejected or unfinished classifications never open an upstream

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::classifier::{escape_prefix, ClassifierConfig, ClassifyResult, PrefixClassifier, Route};
use super::connection::{Connection, UpstreamLink};
use super::relay::{relay, Direction, RelayConfig};
use super::upstream::{Backends, UpstreamConnector};
use crate::error::ForwardError;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default listen backlog.
pub const DEFAULT_LISTEN_BACKLOG: u32 = 1024;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Pending connection queue length.
    pub backlog: u32,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Backend for each route.
    pub backends: Backends,
    /// Prefix classification settings.
    pub classifier: ClassifierConfig,
    /// Relay settings.
    pub relay: RelayConfig,
    /// Timeout for backend connects.
    pub connect_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr, backends: Backends) -> Self {
        Self {
            bind_addr,
            backlog: DEFAULT_LISTEN_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            backends,
            classifier: ClassifierConfig::default(),
            relay: RelayConfig::default(),
            connect_timeout: None,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections refused due to max limit.
    pub connections_over_limit: AtomicU64,
    /// Connections classified to route A.
    pub route_a: AtomicU64,
    /// Connections classified to route B.
    pub route_b: AtomicU64,
    /// Connections whose prefix matched no route.
    pub classification_rejected: AtomicU64,
    /// Connections that closed, failed or timed out before classification.
    pub classification_incomplete: AtomicU64,
    /// Backend connection successes.
    pub upstream_connected: AtomicU64,
    /// Backend connection failures.
    pub upstream_failed: AtomicU64,
    /// Bytes relayed to backends, prefix included.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed from backends.
    pub bytes_from_upstream: AtomicU64,
}

/// The RUDICS listener.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Prefix classifier.
    classifier: PrefixClassifier,
    /// Backend connector.
    connector: UpstreamConnector,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listening socket.
    ///
    /// Fails with `ForwardError::Bind`, which callers treat as fatal.
    pub async fn bind(config: ListenerConfig) -> Result<Self, ForwardError> {
        let listener = bind_socket(config.bind_addr, config.backlog).map_err(|source| {
            ForwardError::Bind {
                addr: config.bind_addr,
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            classifier: PrefixClassifier::with_config(config.classifier.clone()),
            connector: UpstreamConnector::with_timeout(
                config.backends.clone(),
                config.connect_timeout,
            ),
            listener,
            config,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections. Never returns
    /// unless the local address cannot be read.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_over_limit
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection refused: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);
                    info!(peer_addr = %peer_addr, "Incoming connection");

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                if e.is_expected() {
                                    debug!(
                                        reason = e.reason_code(),
                                        error = %e,
                                        "Connection ended"
                                    );
                                } else {
                                    warn!(
                                        reason = e.reason_code(),
                                        error = %e,
                                        "Connection error"
                                    );
                                }
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            info!("Connection closed");
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    let e = ForwardError::Accept(e);
                    error!(reason = e.reason_code(), error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection from classification to close.
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ForwardError> {
        let mut conn = Connection::new(peer_addr);

        let result = self
            .classifier
            .classify(&mut client, conn.prefix_buffer())
            .await;
        let classification = match result {
            ClassifyResult::Decided(classification) => classification,
            ClassifyResult::Closed { bytes_read } => {
                self.stats
                    .classification_incomplete
                    .fetch_add(1, Ordering::Relaxed);
                conn.close();
                return Err(ForwardError::ClassificationIncomplete { bytes_read });
            }
            ClassifyResult::Timeout => {
                self.stats
                    .classification_incomplete
                    .fetch_add(1, Ordering::Relaxed);
                conn.close();
                return Err(ForwardError::ClassificationTimeout);
            }
            ClassifyResult::IoError { kind, message } => {
                self.stats
                    .classification_incomplete
                    .fetch_add(1, Ordering::Relaxed);
                conn.close();
                return Err(ForwardError::Io(io::Error::new(kind, message)));
            }
        };

        let prefix = escape_prefix(conn.prefix_buffer());
        conn.classify(classification).map_err(io::Error::other)?;

        let route = match conn.route() {
            Some(route) => route,
            None => {
                self.stats
                    .classification_rejected
                    .fetch_add(1, Ordering::Relaxed);
                info!(prefix = %prefix, "Unknown connection, closing");
                return Err(ForwardError::ClassificationRejected { prefix });
            }
        };

        match route {
            Route::A => self.stats.route_a.fetch_add(1, Ordering::Relaxed),
            Route::B => self.stats.route_b.fetch_add(1, Ordering::Relaxed),
        };
        info!(route = %route, protocol = route.protocol(), "Connection classified");

        let prefix_bytes = conn.take_prefix();
        let upstream = match self.connector.connect(route, &prefix_bytes).await {
            Ok(stream) => {
                self.stats.upstream_connected.fetch_add(1, Ordering::Relaxed);
                stream
            }
            Err(e) => {
                self.stats.upstream_failed.fetch_add(1, Ordering::Relaxed);
                conn.close();
                return Err(e);
            }
        };
        self.stats
            .bytes_to_upstream
            .fetch_add(prefix_bytes.len() as u64, Ordering::Relaxed);

        if let Err(e) = client.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on client");
        }

        let backend = self.connector.backends().get(route).to_string();
        debug!(backend_addr = %backend, "Connected to backend");
        conn.attach_upstream(UpstreamLink {
            stream: upstream,
            route,
            backend,
        })
        .map_err(io::Error::other)?;

        let summary = match conn.upstream_mut() {
            Some(link) => relay(&mut client, &mut link.stream, &self.config.relay).await,
            None => return Ok(()),
        };
        conn.close();
        drop(client);

        self.stats
            .bytes_to_upstream
            .fetch_add(summary.bytes_to_upstream, Ordering::Relaxed);
        self.stats
            .bytes_from_upstream
            .fetch_add(summary.bytes_from_upstream, Ordering::Relaxed);

        let closed_by = match summary.finished {
            Some(Direction::ToUpstream) => "client",
            Some(Direction::FromUpstream) => "backend",
            None => "idle_timeout",
        };
        debug!(
            bytes_to_upstream = summary.bytes_to_upstream + prefix_bytes.len() as u64,
            bytes_from_upstream = summary.bytes_from_upstream,
            closed_by,
            "Relay finished"
        );

        match summary.error {
            Some(e) => Err(ForwardError::RelayIo(e)),
            None => Ok(()),
        }
    }
}

/// Bind a listening socket with `SO_REUSEADDR`.
fn bind_socket(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}
