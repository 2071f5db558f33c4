//! Prefix-routed TCP forwarding.
//!
//! This module provides:
//! - TCP listener management
//! - Prefix classification of new connections
//! - Upstream connects to the two static backends
//! - Bidirectional relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Prefix Classifier -> Upstream Connector -> Backend A (PPP)
//!                              |                                 -> Backend B (Goby)
//!                          Rejected -> close
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Backend, Backends, Listener, ListenerConfig};
//!
//! let backends = Backends {
//!     route_a: Backend::new("127.0.0.1", 40002),
//!     route_b: Backend::new("127.0.0.1", 40001),
//! };
//! let config = ListenerConfig::new("0.0.0.0:40000".parse()?, backends);
//! let listener = Arc::new(Listener::bind(config).await?);
//! listener.run().await?;
//! ```

mod classifier;
mod connection;
mod listener;
mod relay;
mod upstream;

pub use classifier::{
    classify_prefix, escape_prefix, Classification, ClassifierConfig, ClassifyResult,
    PrefixClassifier, PrefixPolicy, Route, DEFAULT_BUFFERED_MIN_BYTES, GOBY_MAGIC,
    MAX_PREFIX_BYTES, PPP_FLAG,
};
pub use connection::{Connection, ConnectionState, TransitionError, UpstreamLink};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_LISTEN_BACKLOG, DEFAULT_MAX_CONNECTIONS,
};
pub use relay::{pump, relay, Activity, Direction, RelayConfig, RelaySummary, DEFAULT_READ_BUFFER_SIZE};
pub use upstream::{Backend, Backends, UpstreamConnector};
