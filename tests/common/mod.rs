#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use portfwd::config::{ForwardingRule, Settings, ShutdownPolicy};
use portfwd::{Forwarder, ShutdownController};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(3);

/// Backend that hands every accepted stream to the test.
pub struct Backend {
    pub addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<TcpStream>,
    task: JoinHandle<()>,
}

impl Backend {
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap()).await
    }

    pub async fn start_on(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if tx.send(stream).is_err() {
                    break;
                }
            }
        });
        Self { addr, conns, task }
    }

    pub async fn next(&mut self) -> TcpStream {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("backend never saw a connection")
            .expect("backend accept loop ended")
    }

    /// Stop accepting; the port starts refusing connections.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

pub fn settings(policy: ShutdownPolicy) -> Settings {
    Settings {
        bind_addr: "127.0.0.1".parse().unwrap(),
        connect_timeout: Duration::from_secs(1),
        shutdown_policy: policy,
        drain_timeout: Duration::from_millis(500),
        ..Settings::default()
    }
}

pub fn rule(name: &str, backend: SocketAddr) -> ForwardingRule {
    ForwardingRule::new(name, backend.ip().to_string(), backend.port(), 0)
}

pub struct Running {
    pub controller: ShutdownController,
    pub addrs: Vec<(String, SocketAddr)>,
    pub stats: Vec<(String, std::sync::Arc<portfwd::server::ListenerStats>)>,
    pub task: JoinHandle<()>,
}

impl Running {
    pub fn addr(&self, rule: &str) -> SocketAddr {
        self.addrs
            .iter()
            .find(|(name, _)| name == rule)
            .map(|(_, addr)| *addr)
            .expect("no listener for rule")
    }

    pub fn stats(&self, rule: &str) -> std::sync::Arc<portfwd::server::ListenerStats> {
        self.stats
            .iter()
            .find(|(name, _)| name == rule)
            .map(|(_, s)| s.clone())
            .expect("no listener for rule")
    }
}

pub async fn spawn_forwarder(rules: &[ForwardingRule], settings: Settings) -> Running {
    let controller = ShutdownController::new();
    let forwarder = Forwarder::bind(rules, &settings, &controller).await.unwrap();
    let addrs = forwarder.local_addrs();
    let stats = addrs
        .iter()
        .filter_map(|(name, _)| forwarder.stats(name).map(|s| (name.clone(), s)))
        .collect();
    let task = tokio::spawn(forwarder.run(controller.clone()));
    Running {
        controller,
        addrs,
        stats,
        task,
    }
}

/// Read until EOF or error; `true` if the peer closed within `WAIT`.
pub async fn closed_within(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match timeout(WAIT, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) => false,
        Err(_) => false,
    }
}

pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
