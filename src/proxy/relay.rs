//! One-directional byte copy between the two legs of a pair.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ForwardError;
use crate::proxy::pair::{CloseReason, ConnectionPair};
use crate::shutdown::ShutdownSignal;

/// Read size per iteration
pub const BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client -> backend
    Inbound,
    /// backend -> client
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("external->internal"),
            Direction::Outbound => f.write_str("internal->external"),
        }
    }
}

/// Why a relay stopped
#[derive(Debug)]
pub enum RelayEnd {
    /// Source returned a zero-length read
    Eof,
    /// Read or write failed
    Failed(ForwardError),
    /// The other direction closed the pair first
    PairClosed,
    /// Shutdown sweep
    Swept,
}

#[derive(Debug)]
pub struct RelayReport {
    pub direction: Direction,
    pub bytes: u64,
    pub end: RelayEnd,
}

/// Copies bytes from `source` to `sink` until EOF, error, pair close or sweep.
///
/// The relay does not own the pair; it only asks the pair to close. The
/// socket halves it holds are dropped when `run` returns.
pub struct Relay<R, W> {
    direction: Direction,
    source: R,
    sink: W,
    pair: Arc<ConnectionPair>,
    shutdown: ShutdownSignal,
}

impl<R, W> Relay<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        direction: Direction,
        source: R,
        sink: W,
        pair: Arc<ConnectionPair>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            direction,
            source,
            sink,
            pair,
            shutdown,
        }
    }

    pub async fn run(self) -> RelayReport {
        let Relay {
            direction,
            mut source,
            mut sink,
            pair,
            shutdown,
        } = self;

        let mut bytes = 0u64;
        let end = tokio::select! {
            res = pump(&mut source, &mut sink, &mut bytes) => match res {
                Ok(()) => RelayEnd::Eof,
                Err(source) => RelayEnd::Failed(ForwardError::Relay { direction, source }),
            },
            _ = pair.closed() => RelayEnd::PairClosed,
            _ = shutdown.swept() => RelayEnd::Swept,
        };

        match &end {
            RelayEnd::Eof => {
                pair.close(CloseReason::Eof(direction));
            }
            RelayEnd::Failed(e) => {
                tracing::debug!(pair = pair.id(), %direction, error = %e, "Relay error");
                pair.close(CloseReason::Error(direction));
            }
            RelayEnd::Swept => {
                pair.close(CloseReason::Shutdown);
            }
            RelayEnd::PairClosed => {}
        }

        tracing::trace!(pair = pair.id(), %direction, bytes, "Relay finished");

        RelayReport {
            direction,
            bytes,
            end,
        }
    }
}

/// Copy loop. A chunk is written in full before the next read. `Ok` means EOF.
async fn pump<R, W>(source: &mut R, sink: &mut W, bytes: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        buf.clear();
        let n = match source.read_buf(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        // write_all loops over short writes
        sink.write_all(&buf[..n]).await?;
        sink.flush().await?;
        *bytes += n as u64;
    }
}
