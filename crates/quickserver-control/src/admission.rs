//! Admission: reserve the owner's single slot, then provision.
//!
//! The pending row is committed before the provisioner is called, so an instance that crashes
//! or hangs mid-deploy still leaves a record for the pending reaper to clean up. Promotion to
//! `ready` only happens while that row still exists.

use std::collections::BTreeMap;
use std::sync::Arc;

use quickserver_types::{Instance, OwnerId};

use crate::audit;
use crate::error::{FleetError, Result};
use crate::ports::{
    BanList, CreditLedger, DeployRequest, EventLog, FleetRepository, GuildSettings,
    OwnerDirectory, Provisioner,
};
use crate::shutdown::ShutdownCoordinator;

pub const MISSING_IDENTITY_MESSAGE: &str = "Before creating a server, please link your game account. \
It is required to give you admin access to the server.";
pub const INSUFFICIENT_CREDITS_MESSAGE: &str =
    "You have insufficient credits to start a server.";
pub const ALREADY_RUNNING_MESSAGE: &str =
    "You already have a server running. Please terminate it before creating a new one.";
pub const RECLAIMED_DURING_DEPLOY_MESSAGE: &str =
    "Your server took too long to start and was cleaned up. Please try again.";

fn banned_message(reason: Option<&str>) -> String {
    format!(
        "You are banned and cannot create servers. Reason: {}",
        reason.unwrap_or("No reason provided")
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub region: String,
    pub variant: String,
    pub owner_id: OwnerId,
    pub guild_id: Option<String>,
}

#[derive(Clone)]
pub struct AdmissionController {
    fleet: Arc<dyn FleetRepository>,
    provisioner: Arc<dyn Provisioner>,
    credits: Arc<dyn CreditLedger>,
    owners: Arc<dyn OwnerDirectory>,
    bans: Arc<dyn BanList>,
    guilds: Arc<dyn GuildSettings>,
    events: Arc<dyn EventLog>,
    shutdown: ShutdownCoordinator,
    billing_enabled: bool,
}

impl AdmissionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fleet: Arc<dyn FleetRepository>,
        provisioner: Arc<dyn Provisioner>,
        credits: Arc<dyn CreditLedger>,
        owners: Arc<dyn OwnerDirectory>,
        bans: Arc<dyn BanList>,
        guilds: Arc<dyn GuildSettings>,
        events: Arc<dyn EventLog>,
        shutdown: ShutdownCoordinator,
        billing_enabled: bool,
    ) -> Self {
        Self {
            fleet,
            provisioner,
            credits,
            owners,
            bans,
            guilds,
            events,
            shutdown,
            billing_enabled,
        }
    }

    pub async fn execute(&self, request: AdmissionRequest) -> Result<Instance> {
        let owner_id = request.owner_id.clone();
        let result = self.shutdown.run(self.admit(request)).await;
        if let Err(err) = &result {
            tracing::warn!(
                owner_id = %owner_id,
                error = %err,
                kind = err.as_label(),
                "instance admission failed"
            );
        }
        result
    }

    async fn admit(&self, request: AdmissionRequest) -> Result<Instance> {
        let owner = &request.owner_id;

        let Some(identity) = self.owners.external_identity(owner).await? else {
            return Err(FleetError::user(MISSING_IDENTITY_MESSAGE));
        };

        if let Some(ban) = self.bans.find_ban(owner, &identity).await? {
            tracing::warn!(
                owner_id = %owner,
                identity = %identity,
                reason = ban.reason.as_deref().unwrap_or("none"),
                "banned owner tried to create an instance"
            );
            return Err(FleetError::user(banned_message(ban.reason.as_deref())));
        }

        if self.billing_enabled {
            let balance = self.credits.balance(owner).await?;
            if balance <= 0 {
                audit::record(
                    self.events.as_ref(),
                    owner.as_str(),
                    "Owner tried to create a server but has no credits.",
                )
                .await;
                return Err(FleetError::user(INSUFFICIENT_CREDITS_MESSAGE));
            }
        }

        let pending = Instance::pending(
            owner.clone(),
            request.region.clone(),
            request.variant.clone(),
            request.guild_id.clone(),
        );
        self.reserve(&pending).await?;
        tracing::info!(
            instance_id = %pending.id,
            owner_id = %owner,
            region = %pending.region,
            variant = %pending.variant,
            "instance slot reserved"
        );

        let overrides = match request.guild_id.as_deref() {
            Some(guild_id) => self.guilds.overrides(guild_id).await?,
            None => BTreeMap::new(),
        };

        // On failure the pending row stays behind for the pending reaper.
        let deployed = self
            .provisioner
            .deploy(DeployRequest {
                instance_id: pending.id,
                region: pending.region.clone(),
                variant: pending.variant.clone(),
                owner_id: owner.clone(),
                owner_identity: identity,
                guild_id: request.guild_id.clone(),
                overrides,
            })
            .await?;

        let ready = pending.into_ready(deployed);
        if !self.promote(&ready).await? {
            tracing::warn!(
                instance_id = %ready.id,
                owner_id = %owner,
                "pending row reclaimed during deploy, destroying the new instance"
            );
            if let Err(err) = self.provisioner.destroy(ready.id, &ready.region).await {
                tracing::error!(
                    instance_id = %ready.id,
                    region = %ready.region,
                    error = %err,
                    "failed to destroy an instance reclaimed during deploy"
                );
            }
            return Err(FleetError::user(RECLAIMED_DURING_DEPLOY_MESSAGE));
        }

        audit::record(
            self.events.as_ref(),
            owner.as_str(),
            format!(
                "Owner created a server in region {} with variant {}.",
                ready.region, ready.variant
            ),
        )
        .await;
        tracing::info!(instance_id = %ready.id, owner_id = %owner, "instance ready");
        Ok(ready)
    }

    /// Replaces the pending row with `ready`. Returns `false` when the row is gone.
    async fn promote(&self, ready: &Instance) -> Result<bool> {
        let mut txn = self.fleet.begin().await?;
        if txn.find_by_id(ready.id).await?.is_none() {
            return Ok(false);
        }
        txn.upsert(ready).await?;
        txn.commit().await?;
        Ok(true)
    }

    /// Re-checks the one-active-instance rule and writes the pending row in one transaction.
    async fn reserve(&self, pending: &Instance) -> Result<()> {
        let mut txn = self.fleet.begin().await?;

        let active = txn
            .list_by_owner(&pending.owner_id)
            .await?
            .into_iter()
            .filter(Instance::is_active)
            .count();
        if active > 0 {
            // Dropping the transaction rolls it back.
            return Err(FleetError::user(ALREADY_RUNNING_MESSAGE));
        }

        txn.upsert(pending).await?;
        txn.commit().await
    }
}
