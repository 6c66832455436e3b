//! Collaborator interfaces the controller depends on.
//!
//! Repository deletes are idempotent: deleting a row that is already gone succeeds.
//! Several reclamation loops may race to remove the same instance.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use quickserver_types::{
    Activity, DeployedInstance, FleetEvent, Instance, InstanceId, InstanceStatus, OwnerId,
};

use crate::error::Result;

#[async_trait]
pub trait FleetRepository: Send + Sync {
    async fn upsert(&self, instance: &Instance) -> Result<()>;
    async fn delete(&self, id: InstanceId) -> Result<()>;
    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Instance>>;
    async fn list_all(&self, status: Option<InstanceStatus>) -> Result<Vec<Instance>>;
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Instance>>;
    /// Opens a transaction. Dropping it without [`FleetTransaction::commit`] rolls back.
    async fn begin(&self) -> Result<Box<dyn FleetTransaction>>;
}

#[async_trait]
pub trait FleetTransaction: Send {
    /// Locks the row for the rest of the transaction when it exists.
    async fn find_by_id(&mut self, id: InstanceId) -> Result<Option<Instance>>;
    async fn list_by_owner(&mut self, owner: &OwnerId) -> Result<Vec<Instance>>;
    async fn upsert(&mut self, instance: &Instance) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait ActivityRepository: Send + Sync {
    async fn upsert(&self, activity: &Activity) -> Result<()>;
    async fn delete(&self, id: InstanceId) -> Result<()>;
    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Activity>>;
    async fn list_all(&self) -> Result<Vec<Activity>>;
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeployRequest {
    pub instance_id: InstanceId,
    pub region: String,
    pub variant: String,
    pub owner_id: OwnerId,
    /// Game-platform identity that receives admin rights on the instance.
    pub owner_identity: String,
    pub guild_id: Option<String>,
    pub overrides: BTreeMap<String, String>,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn deploy(&self, request: DeployRequest) -> Result<DeployedInstance>;
    /// Tears down the backing resources. Destroying an unknown instance succeeds.
    async fn destroy(&self, id: InstanceId, region: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeQuery {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub command: String,
    pub timeout: Duration,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Runs `command` and returns the raw transcript. Timeouts are errors.
    async fn query(&self, query: ProbeQuery) -> Result<String>;
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn balance(&self, owner: &OwnerId) -> Result<i64>;
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: FleetEvent) -> Result<()>;
}

/// Best-effort direct message to an owner. Callers swallow failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, owner: &OwnerId, message: &str) -> Result<()>;
}

#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn external_identity(&self, owner: &OwnerId) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ban {
    pub reason: Option<String>,
}

#[async_trait]
pub trait BanList: Send + Sync {
    /// A ban on either the owner's game identity or the owner id applies.
    async fn find_ban(&self, owner: &OwnerId, identity: &str) -> Result<Option<Ban>>;
}

#[async_trait]
pub trait GuildSettings: Send + Sync {
    async fn overrides(&self, guild_id: &str) -> Result<BTreeMap<String, String>>;
}
