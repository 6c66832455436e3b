//! Drain coordination for process shutdown.
//!
//! Every risky async operation (task dispatch, reclamation cycle, admission) runs through
//! [`ShutdownCoordinator::run`]. Once [`ShutdownCoordinator::drain`] has been called, new
//! operations are refused with [`FleetError::ShutdownInProgress`] and the drain resolves after
//! every already-admitted operation has settled. In-flight work is never cancelled.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, Copy, Default)]
struct DrainState {
    draining: bool,
    in_flight: usize,
}

/// Built once at startup and cloned into every service that needs it.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<watch::Sender<DrainState>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DrainState::default());
        Self {
            state: Arc::new(tx),
        }
    }

    /// Runs `action` to completion while tracking it.
    ///
    /// The future is not polled at all when draining has already started.
    pub async fn run<F, T>(&self, action: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _token = self.track()?;
        action.await
    }

    /// Stops admitting work and waits for everything currently tracked to settle.
    pub async fn drain(&self) {
        self.state.send_modify(|s| s.draining = true);

        let pending = self.in_flight();
        tracing::info!(in_flight = pending, "shutdown initiated, waiting for tracked actions");

        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.in_flight == 0).await;

        tracing::info!("all tracked actions settled");
    }

    pub fn is_draining(&self) -> bool {
        self.state.borrow().draining
    }

    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight
    }

    fn track(&self) -> Result<ShutdownToken> {
        let mut admitted = false;
        // The draining check and the increment happen under the same lock, so an action is
        // either refused or counted by the drain that follows.
        self.state.send_if_modified(|s| {
            if s.draining {
                return false;
            }
            s.in_flight += 1;
            admitted = true;
            true
        });

        if !admitted {
            tracing::warn!("refusing new action, shutdown in progress");
            return Err(FleetError::ShutdownInProgress);
        }

        Ok(ShutdownToken {
            state: self.state.clone(),
        })
    }
}

/// Released when the tracked action settles, including on cancellation or panic.
struct ShutdownToken {
    state: Arc<watch::Sender<DrainState>>,
}

impl Drop for ShutdownToken {
    fn drop(&mut self) {
        self.state
            .send_modify(|s| s.in_flight = s.in_flight.saturating_sub(1));
    }
}
