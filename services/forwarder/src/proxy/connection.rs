//! Per-connection state.
//!
//! A `Connection` is owned by the task serving one accepted socket and moves
//! through `Classifying -> Relaying -> Closed`. Its classification leaves
//! `Unknown` at most once, and it owns at most one `UpstreamLink`, created
//! only for a routable classification.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use super::classifier::{Classification, Route};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading the prefix.
    Classifying,
    /// Bytes flow both ways between client and backend.
    Relaying,
    /// Both sockets are closed.
    Closed,
}

/// Invalid state transition on a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The connection was already classified.
    #[error("connection already classified as {0:?}")]
    AlreadyClassified(Classification),
    /// `Unknown` is not a classification outcome.
    #[error("classification must be conclusive")]
    Inconclusive,
    /// Upstream may only be attached to a routed connection.
    #[error("connection is not routable ({0:?})")]
    NotRoutable(Classification),
    /// An upstream link is already attached.
    #[error("upstream link already attached")]
    UpstreamAttached,
}

/// Backend-facing side of a routed connection.
#[derive(Debug)]
pub struct UpstreamLink {
    /// Socket to the backend.
    pub stream: TcpStream,
    /// Route this link serves.
    pub route: Route,
    /// Backend address, as configured.
    pub backend: String,
}

/// Client-facing side of an accepted connection and its state.
#[derive(Debug)]
pub struct Connection {
    peer_addr: SocketAddr,
    state: ConnectionState,
    classification: Classification,
    prefix: Vec<u8>,
    upstream: Option<UpstreamLink>,
}

impl Connection {
    /// Start tracking a freshly accepted connection.
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            state: ConnectionState::Classifying,
            classification: Classification::Unknown,
            prefix: Vec::new(),
            upstream: None,
        }
    }

    /// Remote address of the client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current classification.
    pub fn classification(&self) -> Classification {
        self.classification
    }

    /// Route chosen for this connection, if any.
    pub fn route(&self) -> Option<Route> {
        self.classification.route()
    }

    /// Buffer the classifier reads the prefix into.
    pub fn prefix_buffer(&mut self) -> &mut Vec<u8> {
        &mut self.prefix
    }

    /// Record the classifier's decision. Allowed exactly once.
    ///
    /// The bytes in the prefix buffer are kept for forwarding. A rejected
    /// connection is closed and its prefix discarded.
    pub fn classify(&mut self, classification: Classification) -> Result<(), TransitionError> {
        if self.classification.is_conclusive() {
            return Err(TransitionError::AlreadyClassified(self.classification));
        }
        if !classification.is_conclusive() {
            return Err(TransitionError::Inconclusive);
        }

        self.classification = classification;
        if classification == Classification::Rejected {
            self.close();
        }
        Ok(())
    }

    /// Hand over the bytes received while classifying. Empty after the first call.
    pub fn take_prefix(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.prefix)
    }

    /// Attach the backend link and enter `Relaying`.
    pub fn attach_upstream(&mut self, link: UpstreamLink) -> Result<(), TransitionError> {
        if self.classification.route().is_none() {
            return Err(TransitionError::NotRoutable(self.classification));
        }
        if self.upstream.is_some() {
            return Err(TransitionError::UpstreamAttached);
        }

        self.upstream = Some(link);
        self.state = ConnectionState::Relaying;
        Ok(())
    }

    /// Borrow the upstream link, if attached.
    pub fn upstream_mut(&mut self) -> Option<&mut UpstreamLink> {
        self.upstream.as_mut()
    }

    /// Drop the upstream socket and mark the connection closed.
    ///
    /// The client socket is owned by the caller and dropped alongside.
    pub fn close(&mut self) {
        self.upstream = None;
        self.prefix.clear();
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn peer() -> SocketAddr {
        "192.0.2.10:5555".parse().unwrap()
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_new_connection() {
        let conn = Connection::new(peer());
        assert_eq!(conn.state(), ConnectionState::Classifying);
        assert_eq!(conn.classification(), Classification::Unknown);
        assert_eq!(conn.route(), None);
    }

    #[test]
    fn test_classify_once() {
        let mut conn = Connection::new(peer());
        conn.classify(Classification::RouteB).unwrap();
        assert_eq!(conn.route(), Some(Route::B));

        let err = conn.classify(Classification::RouteA).unwrap_err();
        assert_eq!(
            err,
            TransitionError::AlreadyClassified(Classification::RouteB)
        );
        assert_eq!(conn.route(), Some(Route::B));
    }

    #[test]
    fn test_classify_unknown_is_invalid() {
        let mut conn = Connection::new(peer());
        assert_eq!(
            conn.classify(Classification::Unknown),
            Err(TransitionError::Inconclusive)
        );
        assert_eq!(conn.state(), ConnectionState::Classifying);
    }

    #[test]
    fn test_rejected_closes() {
        let mut conn = Connection::new(peer());
        conn.prefix_buffer().extend_from_slice(b"hello");
        conn.classify(Classification::Rejected).unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.take_prefix().is_empty());
    }

    #[test]
    fn test_take_prefix_once() {
        let mut conn = Connection::new(peer());
        conn.prefix_buffer().extend_from_slice(b"~abc");
        conn.classify(Classification::RouteA).unwrap();

        assert_eq!(conn.take_prefix(), b"~abc");
        assert!(conn.take_prefix().is_empty());
    }

    #[tokio::test]
    async fn test_attach_upstream() {
        let (stream, _peer) = connected_pair().await;
        let mut conn = Connection::new(peer());
        conn.classify(Classification::RouteA).unwrap();

        conn.attach_upstream(UpstreamLink {
            stream,
            route: Route::A,
            backend: "127.0.0.1:40002".to_string(),
        })
        .unwrap();
        assert_eq!(conn.state(), ConnectionState::Relaying);
        assert!(conn.upstream_mut().is_some());

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.upstream_mut().is_none());
    }

    #[tokio::test]
    async fn test_attach_requires_route() {
        let (stream, _peer) = connected_pair().await;
        let mut conn = Connection::new(peer());

        let err = conn
            .attach_upstream(UpstreamLink {
                stream,
                route: Route::A,
                backend: "127.0.0.1:40002".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, TransitionError::NotRoutable(Classification::Unknown));
    }
}
