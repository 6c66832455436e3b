//! Instance teardown shared by user termination, the reapers and the delete tasks.
//!
//! Order matters: the provisioner goes first so a failed destroy leaves the row in place for
//! the next attempt. Every step is idempotent, so racing reapers converge on "gone".

use std::sync::Arc;

use async_trait::async_trait;
use quickserver_types::{Instance, InstanceId, OwnerId};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit;
use crate::error::{FleetError, Result};
use crate::ports::{ActivityRepository, EventLog, FleetRepository, Provisioner};
use crate::task_queue::{RetryPolicy, TaskPayload, TaskProcessor};

pub const DELETE_INSTANCE_TASK: &str = "delete-instance";

/// Deferred deletes keep retrying for roughly an hour before giving up.
pub const DELETE_RETRY_POLICY: RetryPolicy = RetryPolicy {
    max_retries: 10,
    initial_delay_ms: 60_000,
    max_delay_ms: 600_000,
    backoff_multiplier: 2.0,
};

#[derive(Clone)]
pub struct InstanceTerminator {
    fleet: Arc<dyn FleetRepository>,
    activity: Arc<dyn ActivityRepository>,
    provisioner: Arc<dyn Provisioner>,
    events: Arc<dyn EventLog>,
}

impl InstanceTerminator {
    pub fn new(
        fleet: Arc<dyn FleetRepository>,
        activity: Arc<dyn ActivityRepository>,
        provisioner: Arc<dyn Provisioner>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            fleet,
            activity,
            provisioner,
            events,
        }
    }

    pub async fn terminate(&self, instance: &Instance, reason: &str) -> Result<()> {
        self.provisioner
            .destroy(instance.id, &instance.region)
            .await?;
        self.fleet.delete(instance.id).await?;
        self.activity.delete(instance.id).await?;

        tracing::info!(
            instance_id = %instance.id,
            owner_id = %instance.owner_id,
            region = %instance.region,
            reason,
            "instance terminated"
        );
        audit::record(
            self.events.as_ref(),
            instance.owner_id.as_str(),
            format!("Instance {} in {} terminated: {reason}.", instance.id, instance.region),
        )
        .await;
        Ok(())
    }

    /// Returns `false` when the instance was already gone.
    pub async fn delete_instance(&self, id: InstanceId, reason: &str) -> Result<bool> {
        let Some(instance) = self.fleet.find_by_id(id).await? else {
            tracing::debug!(instance_id = %id, "instance already deleted, nothing to do");
            return Ok(false);
        };
        self.terminate(&instance, reason).await?;
        Ok(true)
    }

    /// Explicit termination requested by the owner.
    pub async fn delete_for_owner(&self, owner: &OwnerId) -> Result<Vec<InstanceId>> {
        let instances = self.fleet.list_by_owner(owner).await?;
        if instances.is_empty() {
            audit::record(
                self.events.as_ref(),
                owner.as_str(),
                "Owner tried to terminate a server but has none.",
            )
            .await;
            return Err(FleetError::user("You don't have any server to terminate."));
        }

        let mut deleted = Vec::with_capacity(instances.len());
        for instance in &instances {
            self.terminate(instance, "terminated by its owner").await?;
            deleted.push(instance.id);
        }
        Ok(deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteInstancePayload {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub reason: Option<String>,
}

fn decode<T: for<'de> Deserialize<'de>>(task_type: &str, payload: TaskPayload) -> Result<T> {
    serde_json::from_value(payload).map_err(|err| {
        FleetError::Internal(anyhow::Error::new(err).context(format!("decode {task_type} payload")))
    })
}

pub struct DeleteInstanceProcessor {
    terminator: InstanceTerminator,
}

impl DeleteInstanceProcessor {
    pub fn new(terminator: InstanceTerminator) -> Arc<Self> {
        Arc::new(Self { terminator })
    }
}

#[async_trait]
impl TaskProcessor for DeleteInstanceProcessor {
    async fn process(&self, payload: TaskPayload) -> Result<TaskPayload> {
        let payload: DeleteInstancePayload = decode(DELETE_INSTANCE_TASK, payload)?;
        let reason = payload.reason.as_deref().unwrap_or("deleted by background task");
        let deleted = self
            .terminator
            .delete_instance(payload.instance_id, reason)
            .await?;
        Ok(json!({ "instance_id": payload.instance_id, "deleted": deleted }))
    }
}
