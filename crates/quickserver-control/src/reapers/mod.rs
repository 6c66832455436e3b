//! Periodic reclamation policies.
//!
//! Each policy decides evict/warn/keep per instance from a snapshot of the fleet, runs on its
//! own timer and keeps going when a single instance fails. Failures are collected and raised
//! as one [`FleetError::Reclamation`] at the end of the cycle. The policies use disjoint
//! criteria but may still race on the same instance; every delete they issue is idempotent.

pub mod credit;
pub mod empty;
pub mod long_running;
pub mod pending;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quickserver_types::{Instance, OwnerId};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{FleetError, Result};
use crate::ports::{HealthProbe, Notifier, ProbeQuery};
use crate::shutdown::ShutdownCoordinator;

pub use credit::CreditExhaustionReaper;
pub use empty::EmptyServerReaper;
pub use long_running::LongRunningServerReaper;
pub use pending::PendingServerReaper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Evict,
    Warn,
    Keep,
}

#[async_trait]
pub trait ReclamationPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn period(&self) -> Duration;
    async fn run_cycle(&self) -> Result<()>;
}

/// Runs one cycle under the shutdown coordinator and logs the outcome.
pub async fn run_once(policy: &dyn ReclamationPolicy, shutdown: &ShutdownCoordinator) -> Result<()> {
    let name = policy.name();
    tracing::debug!(policy = name, "reclamation cycle starting");

    let result = shutdown.run(policy.run_cycle()).await;
    match &result {
        Ok(()) => tracing::debug!(policy = name, "reclamation cycle completed"),
        Err(FleetError::ShutdownInProgress) => {
            tracing::info!(policy = name, "shutdown in progress, skipping reclamation cycle")
        }
        Err(err) => tracing::error!(policy = name, error = %err, "reclamation cycle failed"),
    }
    result
}

pub struct PolicyHandle {
    name: &'static str,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl PolicyHandle {
    /// Stops the timer. A cycle already running is allowed to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.handle.await {
            tracing::error!(policy = self.name, %err, "reclamation loop ended abnormally");
        }
    }
}

/// Spawns `policy` on its own interval. The first cycle runs immediately.
pub fn spawn(policy: Arc<dyn ReclamationPolicy>, shutdown: ShutdownCoordinator) -> PolicyHandle {
    let name = policy.name();
    let period = policy.period();
    let (stop, mut stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = interval.tick() => {
                    let _ = run_once(policy.as_ref(), &shutdown).await;
                }
            }
        }
    });

    tracing::info!(policy = name, period_secs = period.as_secs(), "reclamation loop started");
    PolicyHandle { name, stop, handle }
}

/// Per-instance failures of one cycle.
pub(crate) struct Failures {
    policy: &'static str,
    items: Vec<String>,
}

impl Failures {
    pub(crate) fn new(policy: &'static str) -> Self {
        Self {
            policy,
            items: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, instance: &Instance, step: &str, err: FleetError) {
        tracing::error!(
            policy = self.policy,
            instance_id = %instance.id,
            owner_id = %instance.owner_id,
            step,
            error = %err,
            "reclamation step failed"
        );
        self.items.push(format!("{} ({step}): {err}", instance.id));
    }

    pub(crate) fn into_result(self) -> Result<()> {
        if self.items.is_empty() {
            return Ok(());
        }
        Err(FleetError::Reclamation {
            policy: self.policy,
            failures: self.items,
        })
    }
}

/// Broadcasts `message` on the instance's console.
pub(crate) async fn say(
    probe: &dyn HealthProbe,
    instance: &Instance,
    message: &str,
    timeout: Duration,
) -> Result<()> {
    let Some((rcon, password)) = instance.rcon() else {
        return Err(FleetError::internal(format!(
            "instance {} has no console endpoint",
            instance.id
        )));
    };
    probe
        .query(ProbeQuery {
            host: rcon.host.clone(),
            port: rcon.port,
            password: password.to_string(),
            command: format!("say {message}"),
            timeout,
        })
        .await?;
    Ok(())
}

/// Console notice that must not block the action that follows it.
pub(crate) async fn say_best_effort(
    probe: &dyn HealthProbe,
    instance: &Instance,
    message: &str,
    timeout: Duration,
) {
    if let Err(err) = say(probe, instance, message, timeout).await {
        tracing::debug!(instance_id = %instance.id, error = %err, "in-band notice not delivered");
    }
}

/// Direct message to the owner; owners can block these, so failures are dropped.
pub(crate) async fn notify_best_effort(notifier: &dyn Notifier, owner: &OwnerId, message: &str) {
    if let Err(err) = notifier.notify(owner, message).await {
        tracing::debug!(owner_id = %owner, error = %err, "owner notification not delivered");
    }
}
