//! Bidirectional data relay with configurable metrics.
//!
//! Each direction is driven as an independent poll-based state machine within
//! a single future, so back-pressure on one direction never stalls the other.
//! The relay ends as soon as either direction reaches EOF or fails: the
//! caller then drops both streams, which closes them.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant as TokioInstant;

/// Trait for recording relay metrics.
pub trait RelayMetrics {
    /// Record bytes copied from inbound to outbound.
    fn record_inbound(&self, bytes: u64);
    /// Record bytes copied from outbound back to inbound.
    fn record_outbound(&self, bytes: u64);
}

/// No-op metrics implementation for cases where metrics aren't needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl RelayMetrics for NoOpMetrics {
    #[inline]
    fn record_inbound(&self, _bytes: u64) {}
    #[inline]
    fn record_outbound(&self, _bytes: u64) {}
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The inbound side reached EOF.
    Inbound,
    /// The outbound side reached EOF.
    Outbound,
    /// Neither side moved data within the idle timeout.
    IdleTimeout,
}

/// Progress of one copy direction.
enum Phase {
    Read,
    /// Writing `buf[pos..len]`.
    Write { pos: usize, len: usize },
    /// Flushing `len` bytes just written.
    Flush { len: usize },
    /// Source hit EOF; shutting down the sink's write half.
    Shutdown,
}

/// What one poll of a direction produced.
enum Progress {
    /// `n` bytes reached the sink.
    Copied(usize),
    /// Source reached EOF and the sink was shut down.
    Eof,
}

/// One direction of the relay: read from a source, write to a sink.
struct Direction {
    buf: Box<[u8]>,
    phase: Phase,
}

impl Direction {
    fn new(buffer_size: usize) -> Self {
        Self {
            buf: vec![0u8; buffer_size.max(1)].into_boxed_slice(),
            phase: Phase::Read,
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        source: &mut R,
        sink: &mut W,
    ) -> Poll<io::Result<Progress>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            match self.phase {
                Phase::Read => {
                    let mut read_buf = ReadBuf::new(&mut self.buf);
                    ready!(Pin::new(&mut *source).poll_read(cx, &mut read_buf))?;
                    let len = read_buf.filled().len();
                    self.phase = if len == 0 {
                        Phase::Shutdown
                    } else {
                        Phase::Write { pos: 0, len }
                    };
                }
                Phase::Write { pos, len } => {
                    let n = ready!(Pin::new(&mut *sink).poll_write(cx, &self.buf[pos..len]))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    self.phase = if pos + n < len {
                        Phase::Write { pos: pos + n, len }
                    } else {
                        Phase::Flush { len }
                    };
                }
                Phase::Flush { len } => {
                    ready!(Pin::new(&mut *sink).poll_flush(cx))?;
                    self.phase = Phase::Read;
                    return Poll::Ready(Ok(Progress::Copied(len)));
                }
                Phase::Shutdown => {
                    // The peer may already be gone; the direction ends either way.
                    let _ = ready!(Pin::new(&mut *sink).poll_shutdown(cx));
                    return Poll::Ready(Ok(Progress::Eof));
                }
            }
        }
    }
}

/// Outcome of one wake-up of the relay.
enum Tick {
    Moved,
    Ended(RelayEnd),
}

/// Bidirectional relay that stops when the first direction ends.
///
/// Both directions run concurrently within a single task. When one side
/// reaches EOF its peer's write half is shut down and the relay returns;
/// dropping the streams afterwards closes the other direction too, so no
/// half-open pair is left behind. A non-EOF error from either direction is
/// returned as `Err`.
///
/// # Arguments
///
/// * `inbound` - The accepted stream
/// * `outbound` - The dialled stream
/// * `idle_timeout` - Optional limit on time without any data transfer
/// * `buffer_size` - Size of each direction's read buffer
/// * `metrics` - Metrics recorder for tracking bytes transferred
pub async fn relay_bidirectional<A, B, M>(
    inbound: A,
    outbound: B,
    idle_timeout: Option<Duration>,
    buffer_size: usize,
    metrics: &M,
) -> io::Result<RelayEnd>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    M: RelayMetrics + ?Sized,
{
    let (mut inbound_rd, mut inbound_wr) = tokio::io::split(inbound);
    let (mut outbound_rd, mut outbound_wr) = tokio::io::split(outbound);
    let mut upstream = Direction::new(buffer_size);
    let mut downstream = Direction::new(buffer_size);

    let deadline = tokio::time::sleep(idle_timeout.unwrap_or_default());
    tokio::pin!(deadline);

    loop {
        let tick = std::future::poll_fn(|cx| -> Poll<io::Result<Tick>> {
            let mut moved = false;

            if let Poll::Ready(progress) =
                upstream.poll_copy(cx, &mut inbound_rd, &mut outbound_wr)
            {
                match progress? {
                    Progress::Copied(n) => {
                        metrics.record_inbound(n as u64);
                        moved = true;
                    }
                    Progress::Eof => return Poll::Ready(Ok(Tick::Ended(RelayEnd::Inbound))),
                }
            }
            if let Poll::Ready(progress) =
                downstream.poll_copy(cx, &mut outbound_rd, &mut inbound_wr)
            {
                match progress? {
                    Progress::Copied(n) => {
                        metrics.record_outbound(n as u64);
                        moved = true;
                    }
                    Progress::Eof => return Poll::Ready(Ok(Tick::Ended(RelayEnd::Outbound))),
                }
            }

            if moved {
                Poll::Ready(Ok(Tick::Moved))
            } else {
                Poll::Pending
            }
        });

        tokio::select! {
            tick = tick => match tick? {
                Tick::Moved => {
                    if let Some(timeout) = idle_timeout {
                        deadline.as_mut().reset(TokioInstant::now() + timeout);
                    }
                }
                Tick::Ended(end) => return Ok(end),
            },
            _ = &mut deadline, if idle_timeout.is_some() => return Ok(RelayEnd::IdleTimeout),
        }
    }
}
