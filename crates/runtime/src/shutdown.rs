//! Shutdown state machine: RUNNING -> DRAINING -> STOPPED.
//!
//! Signal handlers only call [`ShutdownCoordinator::signal`]. Draining and the
//! final flush run on the runtime's own task, never inside a handler.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownState::Running => "running",
            ShutdownState::Draining => "draining",
            ShutdownState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: Mutex<ShutdownState>,
    token: CancellationToken,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ShutdownState::Running),
            token: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ShutdownState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token cancelled when draining begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> ShutdownState {
        *self.lock()
    }

    /// Request shutdown. Only the first call has any effect; it returns
    /// `true` and moves the state to DRAINING.
    pub fn signal(&self) -> bool {
        let mut state = self.lock();
        if *state != ShutdownState::Running {
            debug!(state = %*state, "shutdown already requested");
            return false;
        }
        *state = ShutdownState::Draining;
        drop(state);
        info!("Shutdown requested, draining");
        self.token.cancel();
        true
    }

    /// Mark the final flush as done. Returns `false` if the state was not
    /// DRAINING.
    pub fn mark_stopped(&self) -> bool {
        let mut state = self.lock();
        if *state != ShutdownState::Draining {
            return false;
        }
        *state = ShutdownState::Stopped;
        info!("Shutdown complete");
        true
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Resolve once shutdown has been requested.
    pub async fn requested(&self) {
        self.token.cancelled().await;
    }

    /// Wait for SIGINT or SIGTERM and request shutdown. Returns early if
    /// shutdown is requested some other way.
    pub async fn listen_for_signals(&self) {
        tokio::select! {
            _ = os_signal() => {
                self.signal();
            }
            _ = self.token.cancelled() => {}
        }
    }
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (elsewhere).
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to register signal handlers, falling back to ctrl_c");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl_c");
        std::future::pending::<()>().await;
    }
}
