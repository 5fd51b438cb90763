//! Accept loop for one forwarding rule.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{ForwardingRule, Settings, DEFAULT_CONNECT_TIMEOUT};
use crate::error::{ForwardError, Result};
use crate::proxy::pair::ConnectionPair;
use crate::shutdown::ShutdownSignal;

/// Pending-connection queue length for each listening socket.
pub const BACKLOG: u32 = 1024;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Per-listener knobs
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub bind_addr: IpAddr,
    pub connect_timeout: Duration,
}

impl ListenerSettings {
    pub fn new(bind_addr: IpAddr) -> Self {
        Self {
            bind_addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl From<&Settings> for ListenerSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            bind_addr: settings.bind_addr,
            connect_timeout: settings.connect_timeout,
        }
    }
}

/// Counters for one listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub accepted: AtomicU64,
    pub active: AtomicU64,
    pub dial_failures: AtomicU64,
    pub pairs_closed: AtomicU64,
    pub bytes_to_backend: AtomicU64,
    pub bytes_from_backend: AtomicU64,
}

/// Owns the listening socket for one rule.
pub struct Listener {
    rule: Arc<ForwardingRule>,
    rule_name: Arc<str>,
    listener: TcpListener,
    settings: ListenerSettings,
    shutdown: ShutdownSignal,
    stats: Arc<ListenerStats>,
    next_pair_id: AtomicU64,
}

impl Listener {
    /// Bind `rule.external_port` on the configured address with `SO_REUSEADDR`.
    pub async fn bind(
        rule: ForwardingRule,
        settings: ListenerSettings,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let addr = SocketAddr::new(settings.bind_addr, rule.external_port);
        let listener = open_listener(addr).map_err(|source| ForwardError::Bind {
            rule: rule.name.clone(),
            port: rule.external_port,
            source,
        })?;

        let local_addr = listener.local_addr().map_err(|source| ForwardError::Bind {
            rule: rule.name.clone(),
            port: rule.external_port,
            source,
        })?;

        info!(
            rule = %rule.name,
            listen = %local_addr,
            backend = %rule.backend(),
            "Listener bound"
        );

        Ok(Self {
            rule_name: Arc::from(rule.name.as_str()),
            rule: Arc::new(rule),
            listener,
            settings,
            shutdown,
            stats: Arc::new(ListenerStats::default()),
            next_pair_id: AtomicU64::new(1),
        })
    }

    pub fn rule(&self) -> &ForwardingRule {
        &self.rule
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept until shutdown, then close the socket and wait for in-flight pairs.
    pub async fn run(self) {
        let Listener {
            rule,
            rule_name,
            listener,
            settings,
            shutdown,
            stats,
            next_pair_id,
        } = self;

        let mut pairs = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.stopped() => break,

                Some(joined) = pairs.join_next(), if !pairs.is_empty() => {
                    if let Err(e) = joined {
                        error!(rule = %rule_name, error = %e, "Connection task failed");
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((external, peer)) => {
                        stats.accepted.fetch_add(1, Ordering::Relaxed);
                        let session = Session {
                            id: next_pair_id.fetch_add(1, Ordering::Relaxed),
                            rule: Arc::clone(&rule),
                            rule_name: Arc::clone(&rule_name),
                            connect_timeout: settings.connect_timeout,
                            shutdown: shutdown.clone(),
                            stats: Arc::clone(&stats),
                        };
                        let span = tracing::info_span!("pair", rule = %rule_name, id = session.id, %peer);
                        pairs.spawn(session.handle(external, peer).instrument(span));
                    }
                    Err(e) => {
                        error!(rule = %rule_name, error = %e, "Accept error");
                        if stopped_during_backoff(&shutdown, ACCEPT_RETRY_DELAY).await {
                            break;
                        }
                    }
                },
            }
        }

        drop(listener);
        info!(
            rule = %rule_name,
            in_flight = pairs.len(),
            "Listener closed"
        );

        while let Some(joined) = pairs.join_next().await {
            if let Err(e) = joined {
                error!(rule = %rule_name, error = %e, "Connection task failed");
            }
        }

        debug!(
            rule = %rule_name,
            accepted = stats.accepted.load(Ordering::Relaxed),
            dial_failures = stats.dial_failures.load(Ordering::Relaxed),
            "Listener drained"
        );
    }
}

/// Sleep `delay` unless shutdown arrives first; `true` means stop.
async fn stopped_during_backoff(shutdown: &ShutdownSignal, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.stopped() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn open_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// Everything one accepted connection needs, moved into its task.
struct Session {
    id: u64,
    rule: Arc<ForwardingRule>,
    rule_name: Arc<str>,
    connect_timeout: Duration,
    shutdown: ShutdownSignal,
    stats: Arc<ListenerStats>,
}

impl Session {
    async fn handle(self, external: TcpStream, peer: SocketAddr) {
        let internal = match self.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Backend dial failed, dropping client");
                // dropping `external` closes the client socket
                drop(external);
                return;
            }
        };

        external.set_nodelay(true).ok();
        internal.set_nodelay(true).ok();

        let backend = match internal.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Backend connection lost before relaying");
                return;
            }
        };

        self.stats.active.fetch_add(1, Ordering::Relaxed);
        debug!(%backend, "Connection pair opened");

        let pair = Arc::new(ConnectionPair::new(
            self.id,
            Arc::clone(&self.rule_name),
            peer,
            backend,
        ));
        let report = Arc::clone(&pair)
            .run(external, internal, self.shutdown.clone())
            .await;

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.pairs_closed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_to_backend
            .fetch_add(report.bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(report.bytes_from_backend, Ordering::Relaxed);

        info!(
            backend = ?pair.backend(),
            client = ?pair.peer(),
            bytes_to_backend = report.bytes_to_backend,
            bytes_from_backend = report.bytes_from_backend,
            reason = ?report.reason,
            duration_ms = report.duration.as_millis() as u64,
            "Connection pair closed"
        );
    }

    async fn dial(&self) -> Result<TcpStream> {
        let backend = self.rule.backend();
        match timeout(self.connect_timeout, TcpStream::connect(&backend)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ForwardError::Dial {
                rule: self.rule.name.clone(),
                backend,
                source,
            }),
            Err(_) => Err(ForwardError::DialTimeout {
                rule: self.rule.name.clone(),
                backend,
                timeout: self.connect_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownController;

    #[tokio::test]
    async fn bind_reports_rule_on_conflict() {
        let controller = ShutdownController::new();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let rule = ForwardingRule::new("dup", "127.0.0.1", 9, port);
        let settings = ListenerSettings::new("127.0.0.1".parse().unwrap());
        let err = Listener::bind(rule, settings, controller.signal())
            .await
            .err()
            .expect("port is already listening");

        match err {
            ForwardError::Bind { rule, port: p, .. } => {
                assert_eq!(rule, "dup");
                assert_eq!(p, port);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn ephemeral_port_binds() {
        let controller = ShutdownController::new();
        let rule = ForwardingRule::new("any", "127.0.0.1", 9, 0);
        let settings = ListenerSettings::new("127.0.0.1".parse().unwrap());
        let listener = Listener::bind(rule, settings, controller.signal())
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert_eq!(listener.rule().name, "any");
    }

    #[tokio::test]
    async fn accept_backoff_sleeps_while_running() {
        let controller = ShutdownController::new();
        let signal = controller.signal();
        let started = std::time::Instant::now();
        assert!(!stopped_during_backoff(&signal, Duration::from_millis(50)).await);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn accept_backoff_cut_short_by_shutdown() {
        let controller = ShutdownController::new();
        let signal = controller.signal();
        let stopper = {
            let controller = controller.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                controller.stop();
            })
        };

        let backoff = timeout(
            Duration::from_secs(2),
            stopped_during_backoff(&signal, Duration::from_secs(60)),
        )
        .await
        .expect("backoff ignored shutdown");
        assert!(backoff);
        stopper.await.unwrap();
    }
}
