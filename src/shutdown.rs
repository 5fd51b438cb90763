//! Process-wide stop decision.
//!
//! A [`ShutdownController`] moves once from `Running` to `Stopping`. Every
//! listener and relay holds a [`ShutdownSignal`] and wakes on the
//! transition instead of polling a flag. A second, separate step, the
//! sweep, force-closes established connection pairs.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping,
}

#[derive(Debug)]
struct Inner {
    state: watch::Sender<ShutdownState>,
    sweep: watch::Sender<bool>,
}

/// Owner side of the stop decision
#[derive(Debug, Clone)]
pub struct ShutdownController {
    inner: Arc<Inner>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        let (sweep, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { state, sweep }),
        }
    }

    /// Handle given to listeners and relays.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            state: self.inner.state.subscribe(),
            sweep: self.inner.sweep.subscribe(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.inner.state.borrow()
    }

    /// Transition to `Stopping`. Returns `false` if already stopping.
    pub fn stop(&self) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Stopping;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Shutdown started, listeners stopping");
        }
        changed
    }

    /// Force-close every established pair. Implies `stop`.
    pub fn sweep(&self) {
        self.stop();
        let changed = self.inner.sweep.send_if_modified(|swept| {
            let was = *swept;
            *swept = true;
            !was
        });
        if changed {
            info!("Closing remaining connection pairs");
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of the stop decision
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state: watch::Receiver<ShutdownState>,
    sweep: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_stopping(&self) -> bool {
        *self.state.borrow() == ShutdownState::Stopping
    }

    /// Resolves once the controller is `Stopping`.
    pub async fn stopped(&self) {
        let mut rx = self.state.clone();
        if rx.wait_for(|s| *s == ShutdownState::Stopping).await.is_err() {
            // controller gone without stopping: never fires
            std::future::pending::<()>().await;
        }
    }

    /// Resolves once a sweep has been requested.
    pub async fn swept(&self) {
        let mut rx = self.sweep.clone();
        if rx.wait_for(|swept| *swept).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Termination signals, registered up front so none is missed between
/// startup and the first wait.
#[cfg(unix)]
pub struct Termination {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Termination {
    pub fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for SIGINT or SIGTERM.
    pub async fn wait(mut self) -> std::io::Result<()> {
        tokio::select! {
            _ = self.interrupt.recv() => info!("Interrupt received"),
            _ = self.terminate.recv() => info!("Terminate signal received"),
        }
        Ok(())
    }
}

#[cfg(not(unix))]
pub struct Termination;

#[cfg(not(unix))]
impl Termination {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn wait(self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Interrupt received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn stop_transitions_once() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), ShutdownState::Running);
        assert!(controller.stop());
        assert!(!controller.stop());
        assert_eq!(controller.state(), ShutdownState::Stopping);
    }

    #[tokio::test]
    async fn signal_wakes_on_stop() {
        let controller = ShutdownController::new();
        let signal = controller.signal();
        assert!(!signal.is_stopping());

        let waiter = tokio::spawn(async move { signal.stopped().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.stop();

        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stopped() did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn late_subscriber_sees_stopping() {
        let controller = ShutdownController::new();
        controller.stop();
        let signal = controller.signal();
        assert!(signal.is_stopping());
        timeout(Duration::from_millis(100), signal.stopped())
            .await
            .expect("already stopping");
    }

    #[tokio::test]
    async fn sweep_implies_stop() {
        let controller = ShutdownController::new();
        let signal = controller.signal();
        controller.sweep();
        assert!(signal.is_stopping());
        timeout(Duration::from_millis(100), signal.swept())
            .await
            .expect("sweep observed");
    }

    #[tokio::test]
    async fn dropped_controller_does_not_fire() {
        let controller = ShutdownController::new();
        let signal = controller.signal();
        drop(controller);
        assert!(timeout(Duration::from_millis(50), signal.stopped()).await.is_err());
    }
}
