//! Bidirectional byte relay between a client and its backend.
//!
//! Bytes are forwarded as soon as they are read, unchanged and in order.
//! The first direction to finish, by EOF or error, ends the relay for both,
//! so a vanished peer never leaves the other socket open. With an idle
//! timeout set, the relay also ends once neither direction has moved data
//! for that long.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Default size of each relay read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bytes per read, per direction.
    pub buffer_size: usize,
    /// End the relay after this long without data in either direction.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_READ_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

/// Direction of a byte flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    ToUpstream,
    /// Backend to client.
    FromUpstream,
}

/// Outcome of a finished relay.
#[derive(Debug)]
pub struct RelaySummary {
    /// Bytes written to the backend.
    pub bytes_to_upstream: u64,
    /// Bytes written to the client.
    pub bytes_from_upstream: u64,
    /// Direction that finished first, `None` if the idle timeout fired.
    pub finished: Option<Direction>,
    /// Error that ended the relay, if it did not end on EOF.
    pub error: Option<io::Error>,
}

/// Last time either direction of a relay moved data.
///
/// Shared by both pumps of one connection.
#[derive(Debug)]
pub struct Activity {
    start: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    /// Start the clock now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    /// Record that data just moved.
    pub fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Instant of the most recent activity.
    pub fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_millis.load(Ordering::Relaxed))
    }

    /// Resolve once nothing has moved for `limit`.
    pub async fn idle(&self, limit: Duration) {
        loop {
            let deadline = self.last() + limit;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay between `client` and `upstream` until either side closes or fails,
/// or until neither direction has moved data for the idle timeout.
///
/// Both streams are left for the caller to drop, which closes them.
pub async fn relay(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    config: &RelayConfig,
) -> RelaySummary {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let activity = Activity::new();
    let mut bytes_to_upstream = 0u64;
    let mut bytes_from_upstream = 0u64;

    let (finished, result) = {
        let to_upstream = pump(
            &mut client_read,
            &mut upstream_write,
            config.buffer_size,
            &activity,
            &mut bytes_to_upstream,
        );
        let from_upstream = pump(
            &mut upstream_read,
            &mut client_write,
            config.buffer_size,
            &activity,
            &mut bytes_from_upstream,
        );
        let idle_limit = config.idle_timeout.unwrap_or(Duration::MAX);

        tokio::select! {
            result = to_upstream => (Some(Direction::ToUpstream), result),
            result = from_upstream => (Some(Direction::FromUpstream), result),
            _ = activity.idle(idle_limit), if config.idle_timeout.is_some() => (
                None,
                Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            ),
        }
    };

    RelaySummary {
        bytes_to_upstream,
        bytes_from_upstream,
        finished,
        error: result.err(),
    }
}

/// Copy from `reader` to `writer` until EOF, then shut the writer down.
///
/// `total` is updated after every chunk so the count survives cancellation.
/// Each chunk read also touches `activity`.
pub async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    activity: &Activity,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        match reader.read(&mut buf).await? {
            0 => break,
            n => {
                activity.touch();
                writer.write_all(&buf[..n]).await?;
                *total += n as u64;
                activity.touch();
            }
        }
    }
    writer.shutdown().await
}
