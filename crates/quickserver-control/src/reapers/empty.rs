//! Evicts ready instances nobody has been playing on.
//!
//! Eviction reads the activity written by the previous cycle; probing then updates activity
//! for the next one. An unreachable instance counts as empty, so a crashed server cannot keep
//! its slot forever, but repeated failures never restart a countdown that is already running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use quickserver_types::{Activity, Instance, InstanceId, InstanceStatus, OwnerId};

use super::{Failures, ReclamationPolicy, Verdict, notify_best_effort};
use crate::config::IdleThresholds;
use crate::error::{FleetError, Result};
use crate::ports::{ActivityRepository, FleetRepository, HealthProbe, Notifier, ProbeQuery};
use crate::probe::parse_status;
use crate::task_queue::{TaskCallbacks, TaskQueue};
use crate::terminate::{DELETE_INSTANCE_TASK, DELETE_RETRY_POLICY, DeleteInstancePayload};

pub const NAME: &str = "empty_server_reaper";

/// Evict once the instance has been empty for at least its variant's idle threshold.
pub fn decide(activity: Option<&Activity>, threshold: Duration, now: DateTime<Utc>) -> Verdict {
    let Some(empty_since) = activity.and_then(|a| a.empty_since) else {
        return Verdict::Keep;
    };
    let empty_for = now.signed_duration_since(empty_since);
    match chrono::Duration::from_std(threshold) {
        Ok(threshold) if empty_for >= threshold => Verdict::Evict,
        _ => Verdict::Keep,
    }
}

/// Activity after a probe. `players` is `None` when the probe failed.
pub fn next_activity(
    instance_id: InstanceId,
    previous: Option<&Activity>,
    players: Option<u32>,
    now: DateTime<Utc>,
) -> Activity {
    let empty_since = previous.and_then(|a| a.empty_since);
    let empty_since = match players {
        Some(0) | None => empty_since.or(Some(now)),
        Some(_) => None,
    };
    Activity {
        instance_id,
        empty_since,
        last_checked_at: now,
    }
}

pub struct EmptyServerReaper {
    fleet: Arc<dyn FleetRepository>,
    activity: Arc<dyn ActivityRepository>,
    probe: Arc<dyn HealthProbe>,
    notifier: Arc<dyn Notifier>,
    queue: TaskQueue,
    idle: IdleThresholds,
    probe_timeout: Duration,
    period: Duration,
}

impl EmptyServerReaper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fleet: Arc<dyn FleetRepository>,
        activity: Arc<dyn ActivityRepository>,
        probe: Arc<dyn HealthProbe>,
        notifier: Arc<dyn Notifier>,
        queue: TaskQueue,
        idle: IdleThresholds,
        probe_timeout: Duration,
        period: Duration,
    ) -> Self {
        Self {
            fleet,
            activity,
            probe,
            notifier,
            queue,
            idle,
            probe_timeout,
            period,
        }
    }

    fn enqueue_delete(&self, instance: &Instance, threshold: Duration) -> Result<()> {
        let minutes = threshold.as_secs() / 60;
        let payload = serde_json::to_value(DeleteInstancePayload {
            instance_id: instance.id,
            reason: Some(format!("empty for {minutes} minutes")),
        })
        .map_err(|err| FleetError::Internal(err.into()))?;

        if self.queue.is_queued(DELETE_INSTANCE_TASK, &payload) {
            tracing::debug!(instance_id = %instance.id, "delete already queued");
            return Ok(());
        }

        let notifier = self.notifier.clone();
        let owner: OwnerId = instance.owner_id.clone();
        let instance_id = instance.id;
        let callbacks = TaskCallbacks::new()
            .on_success(move |result| async move {
                if result.get("deleted").and_then(|v| v.as_bool()) == Some(true) {
                    let message = format!(
                        "Your server {instance_id} has been terminated due to inactivity for {minutes} minutes."
                    );
                    notify_best_effort(notifier.as_ref(), &owner, &message).await;
                }
            })
            .on_error(move |err| async move {
                tracing::error!(
                    instance_id = %instance_id,
                    error = %err,
                    "giving up on deleting idle instance"
                );
            });

        let task_id = self.queue.enqueue(
            DELETE_INSTANCE_TASK,
            payload,
            callbacks,
            Some(DELETE_RETRY_POLICY),
        );
        tracing::info!(
            instance_id = %instance.id,
            owner_id = %instance.owner_id,
            %task_id,
            idle_minutes = minutes,
            "evicting idle instance"
        );
        Ok(())
    }

    async fn player_count(&self, instance: &Instance) -> Result<u32> {
        let (rcon, password) = instance.rcon().ok_or_else(|| {
            FleetError::internal(format!("instance {} has no console endpoint", instance.id))
        })?;
        let transcript = self
            .probe
            .query(ProbeQuery {
                host: rcon.host.clone(),
                port: rcon.port,
                password: password.to_string(),
                command: "status".to_string(),
                timeout: self.probe_timeout,
            })
            .await?;
        Ok(parse_status(&transcript).player_count)
    }

    async fn refresh(&self, instance: &Instance, previous: Option<&Activity>) -> Result<()> {
        let players = match self.player_count(instance).await {
            Ok(count) => Some(count),
            Err(err) => {
                tracing::warn!(
                    instance_id = %instance.id,
                    error = %err,
                    "status probe failed, treating instance as empty"
                );
                None
            }
        };
        let next = next_activity(instance.id, previous, players, Utc::now());

        match (previous.and_then(|a| a.empty_since), next.empty_since) {
            (None, Some(_)) => tracing::info!(instance_id = %instance.id, "instance is empty"),
            (Some(_), None) => tracing::info!(instance_id = %instance.id, "instance is not empty"),
            _ => {}
        }

        // Another policy may have deleted the instance while we were probing.
        if self.fleet.find_by_id(instance.id).await?.is_none() {
            tracing::debug!(instance_id = %instance.id, "instance gone, not recording activity");
            return Ok(());
        }
        self.activity.upsert(&next).await
    }
}

#[async_trait]
impl ReclamationPolicy for EmptyServerReaper {
    fn name(&self) -> &'static str {
        NAME
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_cycle(&self) -> Result<()> {
        let instances = self.fleet.list_all(Some(InstanceStatus::Ready)).await?;
        let activities: HashMap<InstanceId, Activity> = self
            .activity
            .list_all()
            .await?
            .into_iter()
            .map(|a| (a.instance_id, a))
            .collect();
        let now = Utc::now();
        let mut failures = Failures::new(NAME);

        let mut to_probe = Vec::new();
        for instance in &instances {
            let previous = activities.get(&instance.id);
            let threshold = self.idle.for_variant(&instance.variant);
            match decide(previous, threshold, now) {
                Verdict::Evict => {
                    if let Err(err) = self.enqueue_delete(instance, threshold) {
                        failures.record(instance, "enqueue delete", err);
                    }
                }
                Verdict::Warn | Verdict::Keep => to_probe.push((instance, previous)),
            }
        }

        let results = join_all(
            to_probe
                .iter()
                .map(|(instance, previous)| self.refresh(instance, *previous)),
        )
        .await;
        for ((instance, _), result) in to_probe.iter().zip(results) {
            if let Err(err) = result {
                failures.record(instance, "record activity", err);
            }
        }

        failures.into_result()
    }
}
