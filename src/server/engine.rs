//! Runs one listener per rule and applies the shutdown policy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{ForwardingRule, Settings, ShutdownPolicy};
use crate::error::{ForwardError, Result};
use crate::server::listener::{Listener, ListenerSettings, ListenerStats};
use crate::shutdown::ShutdownController;

/// A bound set of listeners, ready to run.
pub struct Forwarder {
    listeners: Vec<Listener>,
    failed: Vec<ForwardError>,
    policy: ShutdownPolicy,
    drain_timeout: Duration,
}

impl Forwarder {
    /// Bind every rule. A rule that fails to bind is logged and skipped;
    /// binding fails as a whole only when no rule could be bound.
    pub async fn bind(
        rules: &[ForwardingRule],
        settings: &Settings,
        controller: &ShutdownController,
    ) -> Result<Self> {
        let listener_settings = ListenerSettings::from(settings);
        let mut listeners = Vec::with_capacity(rules.len());
        let mut failed = Vec::new();

        for rule in rules {
            match Listener::bind(rule.clone(), listener_settings.clone(), controller.signal()).await
            {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    error!(rule = %rule.name, error = %e, "Failed to start listener");
                    failed.push(e);
                }
            }
        }

        if listeners.is_empty() {
            return Err(failed.pop().unwrap_or(ForwardError::NoListeners));
        }

        Ok(Self {
            listeners,
            failed,
            policy: settings.shutdown_policy,
            drain_timeout: settings.drain_timeout,
        })
    }

    /// `(rule name, bound address)` for each running listener.
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok().map(|addr| (l.rule().name.clone(), addr)))
            .collect()
    }

    pub fn local_addr(&self, rule: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.rule().name == rule)
            .and_then(|l| l.local_addr().ok())
    }

    pub fn stats(&self, rule: &str) -> Option<Arc<ListenerStats>> {
        self.listeners
            .iter()
            .find(|l| l.rule().name == rule)
            .map(|l| l.stats())
    }

    /// Errors of the rules that could not be bound.
    pub fn failed(&self) -> &[ForwardError] {
        &self.failed
    }

    /// Run until `controller` stops, then drain or sweep the open pairs.
    pub async fn run(self, controller: ShutdownController) {
        let signal = controller.signal();
        let mut tasks = JoinSet::new();
        for listener in self.listeners {
            tasks.spawn(listener.run());
        }

        info!(listeners = tasks.len(), "Forwarder running");
        signal.stopped().await;

        match self.policy {
            ShutdownPolicy::Force => controller.sweep(),
            ShutdownPolicy::Drain => {
                let drained = tokio::time::timeout(self.drain_timeout, join_all(&mut tasks)).await;
                if drained.is_err() {
                    warn!(
                        timeout_ms = self.drain_timeout.as_millis() as u64,
                        "Drain timeout elapsed"
                    );
                    controller.sweep();
                }
            }
        }

        join_all(&mut tasks).await;
        info!("Forwarder stopped");
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Listener task failed");
        }
    }
}
