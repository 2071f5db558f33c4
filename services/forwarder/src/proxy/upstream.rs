//! Backend destinations and the upstream connector.
//!
//! Each route has exactly one static backend. A failed connect is terminal
//! for the connection that asked for it; nothing is retried.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::classifier::Route;
use crate::error::ForwardError;

/// A backend endpoint as (host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    /// Hostname or IP literal, resolved on every connect.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Backend {
    /// Create a new backend endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Backends for the two routes. Read-only after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backends {
    /// Destination for `Route::A` (PPP).
    pub route_a: Backend,
    /// Destination for `Route::B` (Goby).
    pub route_b: Backend,
}

impl Backends {
    /// Backend for a route.
    pub fn get(&self, route: Route) -> &Backend {
        match route {
            Route::A => &self.route_a,
            Route::B => &self.route_b,
        }
    }
}

/// Opens backend connections for classified clients.
pub struct UpstreamConnector {
    backends: Backends,
    connect_timeout: Option<Duration>,
}

impl UpstreamConnector {
    /// Create a connector without a connect timeout.
    pub fn new(backends: Backends) -> Self {
        Self::with_timeout(backends, None)
    }

    /// Create a connector with an optional connect timeout.
    pub fn with_timeout(backends: Backends, connect_timeout: Option<Duration>) -> Self {
        Self {
            backends,
            connect_timeout,
        }
    }

    /// Configured backends.
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Connect to the backend for `route` and send `prefix` first.
    ///
    /// The prefix is written in full before the stream is returned, so it
    /// reaches the backend ahead of anything relayed later.
    pub async fn connect(&self, route: Route, prefix: &[u8]) -> Result<TcpStream, ForwardError> {
        let backend = self.backends.get(route);

        let mut stream = match self.try_connect(backend).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    route = %route,
                    backend_addr = %backend,
                    error = %e,
                    "Backend connection failed"
                );
                return Err(ForwardError::UpstreamConnect {
                    route,
                    backend: backend.to_string(),
                    source: e,
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on upstream");
        }

        if !prefix.is_empty() {
            stream
                .write_all(prefix)
                .await
                .map_err(ForwardError::RelayIo)?;
            debug!(
                route = %route,
                bytes = prefix.len(),
                "Forwarded buffered prefix"
            );
        }

        Ok(stream)
    }

    /// Attempt to connect to a specific backend.
    async fn try_connect(&self, backend: &Backend) -> io::Result<TcpStream> {
        debug!(backend_addr = %backend, "Connecting to backend");

        let connect = TcpStream::connect((backend.host.as_str(), backend.port));
        match self.connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            },
            None => connect.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn backends(a: Backend, b: Backend) -> Backends {
        Backends {
            route_a: a,
            route_b: b,
        }
    }

    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(Backend::new("127.0.0.1", 40001).to_string(), "127.0.0.1:40001");
        assert_eq!(Backend::new("::1", 40002).to_string(), "[::1]:40002");
        assert_eq!(Backend::new("localhost", 1).to_string(), "localhost:1");
    }

    #[test]
    fn test_backends_by_route() {
        let backends = backends(Backend::new("ppp.local", 40002), Backend::new("goby.local", 40001));
        assert_eq!(backends.get(Route::A).host, "ppp.local");
        assert_eq!(backends.get(Route::B).port, 40001);
    }

    #[tokio::test]
    async fn test_connect_sends_prefix_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = UpstreamConnector::new(backends(
            Backend::new("127.0.0.1", port),
            Backend::new("127.0.0.1", dead_port().await),
        ));

        let (connected, accepted) =
            tokio::join!(connector.connect(Route::A, b"~abc"), listener.accept());
        let mut upstream = connected.unwrap();
        let (mut backend_side, _) = accepted.unwrap();

        upstream.write_all(b"def").await.unwrap();
        drop(upstream);

        let mut received = Vec::new();
        backend_side.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"~abcdef");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = UpstreamConnector::with_timeout(
            backends(
                Backend::new("127.0.0.1", dead_port().await),
                Backend::new("127.0.0.1", dead_port().await),
            ),
            Some(Duration::from_secs(2)),
        );

        let err = connector.connect(Route::B, b"goby").await.unwrap_err();
        assert_eq!(err.reason_code(), "upstream_connect_failed");
    }
}
