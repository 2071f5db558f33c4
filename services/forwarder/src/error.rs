//! Error types for the forwarder.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::proxy::Route;

/// Forwarder errors with standardized reason codes.
///
/// Only `Bind` is fatal. Everything else is scoped to a single connection and
/// resolved by closing that connection's sockets.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Could not bind the listening socket.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A single accept attempt failed.
    #[error("accept_failed: {0}")]
    Accept(#[source] io::Error),

    /// The connection prefix matched neither route.
    #[error("classification_rejected: prefix {prefix}")]
    ClassificationRejected { prefix: String },

    /// The peer closed before enough bytes arrived to classify.
    #[error("classification_incomplete: {bytes_read} bytes before close")]
    ClassificationIncomplete { bytes_read: usize },

    /// Classification did not finish within the configured timeout.
    #[error("classification_timeout")]
    ClassificationTimeout,

    /// Could not connect to the backend of a resolved route.
    #[error("upstream_connect_failed: {route} via {backend}: {source}")]
    UpstreamConnect {
        route: Route,
        backend: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failure while relaying.
    #[error("relay_io_failed: {0}")]
    RelayIo(#[source] io::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ForwardError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ForwardError::Bind { .. } => "bind_failed",
            ForwardError::Accept(_) => "accept_failed",
            ForwardError::ClassificationRejected { .. } => "classification_rejected",
            ForwardError::ClassificationIncomplete { .. } => "classification_incomplete",
            ForwardError::ClassificationTimeout => "classification_timeout",
            ForwardError::UpstreamConnect { .. } => "upstream_connect_failed",
            ForwardError::RelayIo(_) => "relay_io_failed",
            ForwardError::Io(_) => "io_error",
        }
    }

    /// Whether this is a normal outcome for a connection rather than a fault.
    ///
    /// Expected outcomes are logged at debug level.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ForwardError::ClassificationRejected { .. }
                | ForwardError::ClassificationIncomplete { .. }
        )
    }
}
