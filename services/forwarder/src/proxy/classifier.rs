//! Prefix classification of inbound RUDICS connections.
//!
//! A connection is routed by its earliest bytes:
//! - first byte `~` (PPP framing flag) routes to backend A
//! - first four bytes `goby` route to backend B
//! - anything else is rejected
//!
//! The rule is evaluated at most once per connection. Everything read while
//! classifying is kept in the caller's buffer so it can be forwarded upstream.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Marker byte that opens a PPP frame.
pub const PPP_FLAG: u8 = b'~';

/// Literal that opens a Goby session.
pub const GOBY_MAGIC: &[u8; 4] = b"goby";

/// Hard cap on bytes held before a decision is made.
pub const MAX_PREFIX_BYTES: usize = 4096;

/// Threshold used by the buffered policy unless configured otherwise.
pub const DEFAULT_BUFFERED_MIN_BYTES: usize = 10;

/// Default size of a single read while classifying.
pub const DEFAULT_CLASSIFY_READ_SIZE: usize = 64;

/// Backend a classified connection is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// PPP traffic.
    A,
    /// Goby traffic.
    B,
}

impl Route {
    /// Protocol carried on this route.
    pub fn protocol(&self) -> &'static str {
        match self {
            Route::A => "ppp",
            Route::B => "goby",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::A => f.write_str("route_a"),
            Route::B => f.write_str("route_b"),
        }
    }
}

/// Classification state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Classification {
    /// Not enough bytes to decide yet.
    #[default]
    Unknown,
    /// Forward to backend A.
    RouteA,
    /// Forward to backend B.
    RouteB,
    /// No backend accepts this prefix. Terminal.
    Rejected,
}

impl Classification {
    /// The route for a routable classification.
    pub fn route(&self) -> Option<Route> {
        match self {
            Classification::RouteA => Some(Route::A),
            Classification::RouteB => Some(Route::B),
            Classification::Unknown | Classification::Rejected => None,
        }
    }

    /// Whether the prefix rule has produced a final answer.
    pub fn is_conclusive(&self) -> bool {
        !matches!(self, Classification::Unknown)
    }
}

/// Apply the prefix rule to the bytes received so far.
///
/// Returns `Unknown` only while the input is empty or still a strict prefix
/// of `goby`. Once the result is conclusive, appending bytes never changes it.
pub fn classify_prefix(data: &[u8]) -> Classification {
    match data.first() {
        None => Classification::Unknown,
        Some(&PPP_FLAG) => Classification::RouteA,
        Some(_) if data.len() < GOBY_MAGIC.len() => {
            if GOBY_MAGIC.starts_with(data) {
                Classification::Unknown
            } else {
                Classification::Rejected
            }
        }
        Some(_) if data[..GOBY_MAGIC.len()] == GOBY_MAGIC[..] => Classification::RouteB,
        Some(_) => Classification::Rejected,
    }
}

/// When the prefix rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixPolicy {
    /// Evaluate after every read and stop at the first conclusive answer.
    Immediate,
    /// Accumulate at least `min_bytes` before evaluating once.
    Buffered { min_bytes: usize },
}

impl PrefixPolicy {
    /// Build a policy from its configuration name.
    ///
    /// `min_bytes` only applies to `buffered` and is clamped so the rule is
    /// always conclusive and the buffer stays bounded.
    pub fn from_name(name: &str, min_bytes: usize) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "immediate" => Some(Self::Immediate),
            "buffered" => Some(Self::Buffered {
                min_bytes: min_bytes.clamp(GOBY_MAGIC.len(), MAX_PREFIX_BYTES),
            }),
            _ => None,
        }
    }

    /// Configuration name of this policy.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Buffered { .. } => "buffered",
        }
    }
}

impl Default for PrefixPolicy {
    fn default() -> Self {
        Self::Immediate
    }
}

/// Result of classifying a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifyResult {
    /// The rule produced a conclusive classification.
    Decided(Classification),
    /// Peer closed before the prefix was conclusive.
    Closed { bytes_read: usize },
    /// Timeout while waiting for enough data.
    Timeout,
    /// I/O error during read.
    IoError { kind: io::ErrorKind, message: String },
}

/// Configuration for prefix classification.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// When to evaluate the rule.
    pub policy: PrefixPolicy,
    /// Maximum time to wait for a conclusive prefix.
    pub timeout: Option<Duration>,
    /// Bytes requested per read.
    pub read_size: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            policy: PrefixPolicy::default(),
            timeout: None,
            read_size: DEFAULT_CLASSIFY_READ_SIZE,
        }
    }
}

/// Reads the prefix of a connection and classifies it.
#[derive(Debug, Clone)]
pub struct PrefixClassifier {
    config: ClassifierConfig,
}

impl PrefixClassifier {
    /// Create a classifier with default configuration.
    pub fn new() -> Self {
        Self {
            config: ClassifierConfig::default(),
        }
    }

    /// Create a classifier with custom configuration.
    pub fn with_config(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Get the classifier configuration.
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify a stream, reading into the provided buffer.
    ///
    /// On `Decided` the buffer holds every byte read so far, in order. The
    /// caller must forward them before relaying.
    pub async fn classify<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> ClassifyResult {
        buffer.clear();

        let result = match self.config.timeout {
            Some(limit) => {
                let outcome = timeout(limit, self.read_prefix(stream, buffer)).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(bytes_read = buffer.len(), "Classification timeout");
                        ClassifyResult::Timeout
                    }
                }
            }
            None => self.read_prefix(stream, buffer).await,
        };

        if let ClassifyResult::Decided(classification) = &result {
            debug!(
                classification = ?classification,
                first_bytes = %escape_prefix(buffer),
                "First message from connection"
            );
        }

        result
    }

    async fn read_prefix<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> ClassifyResult {
        let mut chunk = vec![0u8; self.config.read_size.max(1)];

        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) if is_peer_close(&e) => {
                    return ClassifyResult::Closed {
                        bytes_read: buffer.len(),
                    };
                }
                Err(e) => {
                    return ClassifyResult::IoError {
                        kind: e.kind(),
                        message: e.to_string(),
                    };
                }
            };
            if n == 0 {
                return ClassifyResult::Closed {
                    bytes_read: buffer.len(),
                };
            }
            buffer.extend_from_slice(&chunk[..n]);

            match self.config.policy {
                PrefixPolicy::Immediate => {
                    let classification = classify_prefix(buffer);
                    if classification.is_conclusive() {
                        return ClassifyResult::Decided(classification);
                    }
                }
                PrefixPolicy::Buffered { min_bytes } => {
                    if buffer.len() >= min_bytes {
                        return ClassifyResult::Decided(classify_prefix(buffer));
                    }
                }
            }

            if buffer.len() >= MAX_PREFIX_BYTES {
                return ClassifyResult::Decided(Classification::Rejected);
            }
        }
    }
}

/// Errors that mean the client went away.
fn is_peer_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

impl Default for PrefixClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Printable form of a prefix for logs, capped at 64 bytes.
pub fn escape_prefix(data: &[u8]) -> String {
    let shown = &data[..data.len().min(64)];
    let mut out = shown.escape_ascii().to_string();
    if data.len() > shown.len() {
        out.push_str("...");
    }
    out
}
