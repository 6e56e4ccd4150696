//! Connection Relay
//!
//! Pumps bytes between an accepted connection and its dialed destination,
//! one independent copy per direction.

use bytes::BytesMut;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffer size for each copy direction
const BUFFER_SIZE: usize = 64 * 1024; // 64KB

/// Outcome of one copy direction
#[derive(Debug, Default)]
pub struct DirectionReport {
    /// Bytes written to the destination side of this direction
    pub bytes: u64,

    /// Error that ended the direction, if it did not end at end-of-stream
    pub error: Option<io::Error>,
}

impl DirectionReport {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a relay session
#[derive(Debug, Default)]
pub struct RelayReport {
    pub client_to_destination: DirectionReport,
    pub destination_to_client: DirectionReport,
}

impl RelayReport {
    pub fn total_bytes(&self) -> u64 {
        self.client_to_destination.bytes + self.destination_to_client.bytes
    }

    pub fn is_clean(&self) -> bool {
        self.client_to_destination.is_clean() && self.destination_to_client.is_clean()
    }
}

impl fmt::Display for RelayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes up, {} bytes down",
            self.client_to_destination.bytes, self.destination_to_client.bytes
        )
    }
}

/// Relay `client` and `destination` until both directions are exhausted.
///
/// Each direction half-closes its writer when its reader ends, so the far
/// side sees end-of-stream. One direction failing does not stop the other.
/// The idle timeout covers the session as a whole: it fires only once
/// neither direction has moved a byte for that long, and then ends both.
/// Both endpoints are dropped when this returns.
pub async fn relay<A, B>(
    client: A,
    destination: B,
    idle_timeout: Option<Duration>,
    shutdown: &CancellationToken,
) -> RelayReport
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (destination_read, destination_write) = tokio::io::split(destination);

    let session = Session::new(shutdown);

    let pumps = async {
        let reports = tokio::join!(
            pump(client_read, destination_write, &session),
            pump(destination_read, client_write, &session),
        );
        // Stops the idle watchdog
        session.ended.cancel();
        reports
    };
    let ((client_to_destination, destination_to_client), ()) =
        tokio::join!(pumps, session.watch_idle(idle_timeout));

    log_direction("client -> destination", &client_to_destination);
    log_direction("destination -> client", &destination_to_client);

    RelayReport {
        client_to_destination,
        destination_to_client,
    }
}

/// State shared by both directions of one relay
struct Session {
    /// Cancelled on shutdown, on idle expiry, or once both pumps are done
    ended: CancellationToken,
    timed_out: AtomicBool,
    started: Instant,
    /// Milliseconds since `started` at the last byte moved in either direction
    last_activity: AtomicU64,
}

impl Session {
    fn new(shutdown: &CancellationToken) -> Self {
        Self {
            ended: shutdown.child_token(),
            timed_out: AtomicBool::new(false),
            started: Instant::now(),
            last_activity: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Sleep until the session has been idle for `limit`, then end it
    async fn watch_idle(&self, limit: Option<Duration>) {
        let Some(limit) = limit else {
            return;
        };

        loop {
            let idle = self.idle_for();
            if idle >= limit {
                debug!("Relay idle for {:?}, closing", idle);
                self.timed_out.store(true, Ordering::Relaxed);
                self.ended.cancel();
                return;
            }

            tokio::select! {
                _ = self.ended.cancelled() => return,
                _ = tokio::time::sleep(limit - idle) => {}
            }
        }
    }

    /// Why the session ended early
    fn end_error(&self) -> io::Error {
        if self.timed_out.load(Ordering::Relaxed) {
            io::Error::new(io::ErrorKind::TimedOut, "idle timeout")
        } else {
            io::Error::new(io::ErrorKind::Interrupted, "relay cancelled")
        }
    }
}

fn log_direction(direction: &str, report: &DirectionReport) {
    match &report.error {
        None => debug!("Copied {} bytes {}", report.bytes, direction),
        Some(e) if e.kind() == io::ErrorKind::Interrupted => {
            debug!("Copied {} bytes {} before shutdown", report.bytes, direction)
        }
        Some(e) if e.kind() == io::ErrorKind::TimedOut => {
            debug!("Copied {} bytes {} before idle timeout", report.bytes, direction)
        }
        Some(e) => warn!("Copied {} bytes {} before error: {}", report.bytes, direction, e),
    }
}

/// Copy one direction until end-of-stream, error, or the session ends
async fn pump<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    session: &Session,
) -> DirectionReport
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);
    let mut bytes = 0u64;

    let error = loop {
        buf.clear();

        let read = tokio::select! {
            _ = session.ended.cancelled() => break Some(session.end_error()),
            result = reader.read_buf(&mut buf) => result,
        };

        let n = match read {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e),
        };
        session.touch();

        let written = tokio::select! {
            _ = session.ended.cancelled() => break Some(session.end_error()),
            result = writer.write_all(&buf[..n]) => result,
        };

        match written {
            Ok(()) => {
                bytes += n as u64;
                session.touch();
            }
            Err(e) => break Some(e),
        }
    };

    // Both sides are dropped together when the session ends early
    if session.ended.is_cancelled() {
        return DirectionReport { bytes, error };
    }

    // Propagate end-of-stream; the far side may already be gone
    if let Err(e) = writer.shutdown().await {
        debug!("Half-close failed: {}", e);
    }

    DirectionReport { bytes, error }
}
