//! Caps how long a single instance may run.
//!
//! Inside the warning window the players get a console warning every cycle. Past the hard
//! limit they get a final notice and the instance is terminated. Warnings and terminations run
//! concurrently; a failure on one instance is recorded and does not hold up the others.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use quickserver_types::Instance;

use super::{Failures, ReclamationPolicy, Verdict, say, say_best_effort};
use crate::error::Result;
use crate::ports::{FleetRepository, HealthProbe};
use crate::terminate::InstanceTerminator;

pub const NAME: &str = "long_running_server_reaper";

/// `[warn_after, max_age)` warns, `>= max_age` evicts.
pub fn decide(
    instance: &Instance,
    warn_after: Duration,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Verdict {
    let age = instance.age(now);
    let at_least = |limit: Duration| chrono::Duration::from_std(limit).is_ok_and(|l| age >= l);
    if at_least(max_age) {
        Verdict::Evict
    } else if at_least(warn_after) {
        Verdict::Warn
    } else {
        Verdict::Keep
    }
}

pub struct LongRunningServerReaper {
    fleet: Arc<dyn FleetRepository>,
    terminator: InstanceTerminator,
    probe: Arc<dyn HealthProbe>,
    warn_after: Duration,
    max_age: Duration,
    probe_timeout: Duration,
    period: Duration,
}

impl LongRunningServerReaper {
    pub fn new(
        fleet: Arc<dyn FleetRepository>,
        terminator: InstanceTerminator,
        probe: Arc<dyn HealthProbe>,
        warn_after: Duration,
        max_age: Duration,
        probe_timeout: Duration,
        period: Duration,
    ) -> Self {
        Self {
            fleet,
            terminator,
            probe,
            warn_after,
            max_age,
            probe_timeout,
            period,
        }
    }

    fn max_hours(&self) -> u64 {
        self.max_age.as_secs() / 3600
    }

    async fn warn(&self, instance: &Instance) -> Result<()> {
        let message = format!(
            "The server has been running for too long and will be automatically terminated when it reaches {} hours",
            self.max_hours()
        );
        say(self.probe.as_ref(), instance, &message, self.probe_timeout).await?;
        tracing::info!(instance_id = %instance.id, "long-running instance warned");
        Ok(())
    }

    async fn evict(&self, instance: &Instance) -> Result<()> {
        say_best_effort(
            self.probe.as_ref(),
            instance,
            "The server has been running for too long and is now being terminated.",
            self.probe_timeout,
        )
        .await;
        let reason = format!("exceeded {} hours of runtime", self.max_hours());
        self.terminator.delete_instance(instance.id, &reason).await?;
        Ok(())
    }
}

#[async_trait]
impl ReclamationPolicy for LongRunningServerReaper {
    fn name(&self) -> &'static str {
        NAME
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn run_cycle(&self) -> Result<()> {
        let now = Utc::now();
        let instances = self.fleet.list_all(None).await?;

        let mut warned = Vec::new();
        let mut evicted = Vec::new();
        for instance in &instances {
            match decide(instance, self.warn_after, self.max_age, now) {
                Verdict::Evict => evicted.push(instance),
                Verdict::Warn => warned.push(instance),
                Verdict::Keep => {}
            }
        }

        let (warn_results, evict_results) = tokio::join!(
            join_all(warned.iter().map(|i| self.warn(i))),
            join_all(evicted.iter().map(|i| self.evict(i))),
        );

        let mut failures = Failures::new(NAME);
        for (instance, result) in warned.iter().zip(warn_results) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetError;
    use crate::testing::*;

    const HOUR: u64 = 3600;

    struct Harness {
        fleet: Arc<MemoryFleet>,
        probe: Arc<FakeProbe>,
        provisioner: Arc<FakeProvisioner>,
        reaper: LongRunningServerReaper,
    }

    fn harness() -> Harness {
        let fleet = MemoryFleet::new();
        let probe = FakeProbe::new();
        let provisioner = FakeProvisioner::new();
        let terminator = InstanceTerminator::new(
            fleet.clone(),
            MemoryActivity::new(),
            provisioner.clone(),
            RecordingEventLog::new(),
        );
        let reaper = LongRunningServerReaper::new(
            fleet.clone(),
            terminator,
            probe.clone(),
            Duration::from_secs(9 * HOUR),
            Duration::from_secs(10 * HOUR),
            Duration::from_secs(5),
            Duration::from_secs(30 * 60),
        );
        Harness {
            fleet,
            probe,
            provisioner,
            reaper,
        }
    }

    #[test]
    fn window_boundaries() {
        let now = Utc::now();
        let aged = |minutes: i64| ready_instance("u", "h", now - chrono::Duration::minutes(minutes));
        let warn = Duration::from_secs(9 * HOUR);
        let max = Duration::from_secs(10 * HOUR);

        assert_eq!(decide(&aged(8 * 60 + 59), warn, max, now), Verdict::Keep);
        assert_eq!(decide(&aged(9 * 60), warn, max, now), Verdict::Warn);
        assert_eq!(decide(&aged(9 * 60 + 59), warn, max, now), Verdict::Warn);
        assert_eq!(decide(&aged(10 * 60), warn, max, now), Verdict::Evict);
    }

    #[tokio::test]
    async fn warns_inside_the_window_and_evicts_past_the_limit() {
        let h = harness();
        let warned = ready_instance("u1", "10.0.0.1", minutes_ago(9 * 60 + 30));
        let evicted = ready_instance("u2", "10.0.0.2", minutes_ago(10 * 60 + 6));
        let young = ready_instance("u3", "10.0.0.3", minutes_ago(60));
        for i in [&warned, &evicted, &young] {
            h.fleet.insert(i.clone()).await;
            h.probe.answer(&i.endpoints.as_ref().unwrap().rcon.host, "");
        }

        h.reaper.run_cycle().await.unwrap();

        let to_warned = h.probe.commands_to("10.0.0.1");
        assert_eq!(to_warned.len(), 1);
        assert!(to_warned[0].contains("will be automatically terminated when it reaches 10 hours"));
        assert!(h.fleet.get(warned.id).await.is_some());

        let to_evicted = h.probe.commands_to("10.0.0.2");
        assert_eq!(to_evicted.len(), 1);
        assert!(to_evicted[0].contains("is now being terminated"));
        assert!(h.fleet.get(evicted.id).await.is_none());
        assert_eq!(h.provisioner.destroyed(), vec![evicted.id]);

        assert!(h.probe.commands_to("10.0.0.3").is_empty());
        assert!(h.fleet.get(young.id).await.is_some());
    }

    #[tokio::test]
    async fn unreachable_console_does_not_block_termination() {
        let h = harness();
        let evicted = ready_instance("u2", "10.0.0.2", minutes_ago(11 * 60));
        h.fleet.insert(evicted.clone()).await;

        h.reaper.run_cycle().await.unwrap();
        assert!(h.fleet.get(evicted.id).await.is_none());
    }

    #[tokio::test]
    async fn failed_warning_is_reported_after_the_rest_completes() {
        let h = harness();
        let warned = ready_instance("u1", "10.0.0.1", minutes_ago(9 * 60 + 30));
        let evicted = ready_instance("u2", "10.0.0.2", minutes_ago(10 * 60 + 6));
        h.fleet.insert(warned.clone()).await;
        h.fleet.insert(evicted.clone()).await;

        let err = h.reaper.run_cycle().await.unwrap_err();

        match err {
            FleetError::Reclamation { policy, failures } => {
                assert_eq!(policy, NAME);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains(&warned.id.to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.fleet.get(evicted.id).await.is_none());
    }
}
