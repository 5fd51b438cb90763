//! External/internal socket coupling for one client session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::proxy::relay::{Direction, Relay, RelayReport};
use crate::shutdown::ShutdownSignal;

/// Why a pair was closed; recorded by whichever caller closed it first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A side finished sending
    Eof(Direction),
    /// Read or write failed in this direction
    Error(Direction),
    /// Shutdown sweep
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof(d) => write!(f, "eof ({})", d),
            CloseReason::Error(d) => write!(f, "error ({})", d),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// One client session: the accepted external socket and the dialed internal one.
///
/// Both relays of the pair share it through an `Arc`. The close guard is a
/// watch channel holding the close reason: the first `close` call stores a
/// reason and wakes the relays, later calls see it already set and return
/// `false`. The sockets themselves are owned as split halves by the two
/// relays and are released exactly once, when both relays have returned.
pub struct ConnectionPair {
    id: u64,
    rule: Arc<str>,
    peer: Option<SocketAddr>,
    backend: Option<SocketAddr>,
    opened_at: Instant,
    close_guard: watch::Sender<Option<CloseReason>>,
}

#[derive(Debug)]
pub struct PairReport {
    pub id: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
    pub reason: Option<CloseReason>,
    pub duration: Duration,
}

impl ConnectionPair {
    pub fn new(id: u64, rule: Arc<str>, peer: SocketAddr, backend: SocketAddr) -> Self {
        let (close_guard, _) = watch::channel(None);
        Self {
            id,
            rule,
            peer: Some(peer),
            backend: Some(backend),
            opened_at: Instant::now(),
            close_guard,
        }
    }

    /// A pair not bound to real sockets, for driving relays over in-memory pipes.
    pub fn detached(id: u64, rule: &str) -> Self {
        let (close_guard, _) = watch::channel(None);
        Self {
            id,
            rule: Arc::from(rule),
            peer: None,
            backend: None,
            opened_at: Instant::now(),
            close_guard,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn backend(&self) -> Option<SocketAddr> {
        self.backend
    }

    pub fn is_closed(&self) -> bool {
        self.close_guard.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_guard.borrow()
    }

    /// Fire the close guard. Only the first caller gets `true`.
    pub fn close(&self, reason: CloseReason) -> bool {
        let fired = self.close_guard.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        });
        if fired {
            debug!(pair = self.id, rule = %self.rule, %reason, "Closing connection pair");
        }
        fired
    }

    /// Resolves once the pair has been closed by anyone.
    pub async fn closed(&self) {
        let mut rx = self.close_guard.subscribe();
        if rx.wait_for(|reason| reason.is_some()).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Run both relays until the pair is closed. Consumes the sockets.
    pub async fn run(
        self: Arc<Self>,
        external: TcpStream,
        internal: TcpStream,
        shutdown: ShutdownSignal,
    ) -> PairReport {
        let (ext_read, ext_write) = external.into_split();
        let (int_read, int_write) = internal.into_split();

        let inbound = tokio::spawn(
            Relay::new(
                Direction::Inbound,
                ext_read,
                int_write,
                Arc::clone(&self),
                shutdown.clone(),
            )
            .run(),
        );
        let outbound = tokio::spawn(
            Relay::new(
                Direction::Outbound,
                int_read,
                ext_write,
                Arc::clone(&self),
                shutdown,
            )
            .run(),
        );

        let bytes_to_backend = self.join_relay(Direction::Inbound, inbound).await;
        let bytes_from_backend = self.join_relay(Direction::Outbound, outbound).await;

        PairReport {
            id: self.id,
            bytes_to_backend,
            bytes_from_backend,
            reason: self.close_reason(),
            duration: self.opened_at.elapsed(),
        }
    }

    async fn join_relay(&self, direction: Direction, handle: JoinHandle<RelayReport>) -> u64 {
        match handle.await {
            Ok(report) => report.bytes,
            Err(e) => {
                // a panicked relay still has to release the other direction
                error!(pair = self.id, %direction, error = %e, "Relay task failed");
                self.close(CloseReason::Error(direction));
                0
            }
        }
    }
}

impl fmt::Debug for ConnectionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPair")
            .field("id", &self.id)
            .field("rule", &self.rule)
            .field("peer", &self.peer)
            .field("backend", &self.backend)
            .field("closed", &self.close_reason())
            .finish()
    }
}
