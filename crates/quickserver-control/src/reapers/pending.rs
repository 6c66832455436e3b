//! Removes instances stuck in `pending`: provisioning crashed, hung or failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quickserver_types::{Instance, InstanceStatus};

use super::{Failures, ReclamationPolicy, Verdict, notify_best_effort};
use crate::error::Result;
use crate::ports::{FleetRepository, Notifier};
use crate::terminate::InstanceTerminator;

pub const NAME: &str = "pending_server_reaper";

pub fn decide(instance: &Instance, max_age: Duration, now: DateTime<Utc>) -> Verdict {
    if instance.status != InstanceStatus::Pending {
        return Verdict::Keep;
    }
    match chrono::Duration::from_std(max_age) {
        Ok(max_age) if instance.age(now) >= max_age => Verdict::Evict,
        _ => Verdict::Keep,
    }
}

pub struct PendingServerReaper {
    fleet: Arc<dyn FleetRepository>,
    terminator: InstanceTerminator,
    notifier: Arc<dyn Notifier>,
    max_age: Duration,
    period: Duration,
}

impl PendingServerReaper {
    pub fn new(
        fleet: Arc<dyn FleetRepository>,
        terminator: InstanceTerminator,
        notifier: Arc<dyn Notifier>,
        max_age: Duration,
        period: Duration,
    ) -> Self {
        Self {
            fleet,
            terminator,
            notifier,
            max_age,
            period,
        }
    }
}

#[async_trait]
impl ReclamationPolicy for PendingServerReaper {
    fn name(&self) -> &'static str {
        NAME
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_cycle(&self) -> Result<()> {
        let now = Utc::now();
        let minutes = self.max_age.as_secs() / 60;
        let reason = format!("stuck in pending for over {minutes} minutes");
        let mut failures = Failures::new(NAME);

        for instance in self.fleet.list_all(Some(InstanceStatus::Pending)).await? {
            if decide(&instance, self.max_age, now) != Verdict::Evict {
                continue;
            }

            match self.terminator.delete_instance(instance.id, &reason).await {
                Ok(true) => {
                    let message = format!(
                        "Your server {} was terminated after being stuck in pending for over {minutes} minutes.",
                        instance.id
                    );
                    notify_best_effort(self.notifier.as_ref(), &instance.owner_id, &message).await;
                }
                Ok(false) => {}
                Err(err) => failures.record(&instance, "terminate", err),
            }
        }

        failures.into_result()
    }
}
