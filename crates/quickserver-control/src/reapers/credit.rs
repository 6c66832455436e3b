//! Stops instances whose owner ran out of credits. Only spawned when billing is enabled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use quickserver_types::{Instance, InstanceStatus, OwnerId};

use super::{Failures, ReclamationPolicy, Verdict, notify_best_effort, say, say_best_effort};
use crate::error::Result;
use crate::ports::{CreditLedger, FleetRepository, HealthProbe, Notifier};
use crate::terminate::InstanceTerminator;

pub const NAME: &str = "credit_exhaustion_reaper";

/// `<= 0` evicts, `(0, low_threshold]` warns.
pub fn decide(balance: i64, low_threshold: i64) -> Verdict {
    if balance <= 0 {
        Verdict::Evict
    } else if balance <= low_threshold {
        Verdict::Warn
    } else {
        Verdict::Keep
    }
}

pub struct CreditExhaustionReaper {
    fleet: Arc<dyn FleetRepository>,
    terminator: InstanceTerminator,
    credits: Arc<dyn CreditLedger>,
    probe: Arc<dyn HealthProbe>,
    notifier: Arc<dyn Notifier>,
    low_threshold: i64,
    probe_timeout: Duration,
    period: Duration,
}

impl CreditExhaustionReaper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fleet: Arc<dyn FleetRepository>,
        terminator: InstanceTerminator,
        credits: Arc<dyn CreditLedger>,
        probe: Arc<dyn HealthProbe>,
        notifier: Arc<dyn Notifier>,
        low_threshold: i64,
        probe_timeout: Duration,
        period: Duration,
    ) -> Self {
        Self {
            fleet,
            terminator,
            credits,
            probe,
            notifier,
            low_threshold,
            probe_timeout,
            period,
        }
    }

    async fn warn(&self, instance: &Instance, balance: i64) -> Result<()> {
        let message = format!(
            "You have only {balance} credits left. The server will be terminated if you run out of credits."
        );
        say(self.probe.as_ref(), instance, &message, self.probe_timeout).await
    }

    async fn evict(&self, instance: &Instance) -> Result<()> {
        say_best_effort(
            self.probe.as_ref(),
            instance,
            "Your server is being terminated due to lack of credits.",
            self.probe_timeout,
        )
        .await;

        if self
            .terminator
            .delete_instance(instance.id, "owner ran out of credits")
            .await?
        {
            let message = format!(
                "Your server {} has been terminated because you ran out of credits.",
                instance.id
            );
            notify_best_effort(self.notifier.as_ref(), &instance.owner_id, &message).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ReclamationPolicy for CreditExhaustionReaper {
    fn name(&self) -> &'static str {
        NAME
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_cycle(&self) -> Result<()> {
        // Pending instances have no console yet; the pending reaper owns them.
        let instances = self.fleet.list_all(Some(InstanceStatus::Ready)).await?;
        let mut failures = Failures::new(NAME);

        let mut balances: HashMap<OwnerId, i64> = HashMap::new();
        let mut warned = Vec::new();
        let mut evicted = Vec::new();
        for instance in &instances {
            let balance = match balances.get(&instance.owner_id) {
                Some(balance) => *balance,
                None => match self.credits.balance(&instance.owner_id).await {
                    Ok(balance) => {
                        balances.insert(instance.owner_id.clone(), balance);
                        balance
                    }
                    Err(err) => {
                        failures.record(instance, "read balance", err);
                        continue;
                    }
                },
            };
            match decide(balance, self.low_threshold) {
                Verdict::Evict => evicted.push(instance),
                Verdict::Warn => warned.push((instance, balance)),
                Verdict::Keep => {}
            }
        }

        let (warn_results, evict_results) = tokio::join!(
            join_all(warned.iter().map(|(i, balance)| self.warn(i, *balance))),
            join_all(evicted.iter().map(|i| self.evict(i))),
        );

        for ((instance, _), result) in warned.iter().zip(warn_results) {
            if let Err(err) = result {
                failures.record(instance, "warn", err);
            }
        }
        for (instance, result) in evicted.iter().zip(evict_results) {
            if let Err(err) = result {
                failures.record(instance, "terminate", err);
            }
        }
        failures.into_result()
    }
}
