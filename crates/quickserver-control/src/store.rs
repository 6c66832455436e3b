//! sea-orm backed implementations of the repository ports.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use quickserver_db::entities::{
    fleet_events, guild_parameters, instance_activity, instances, owner_bans, owners,
};
use quickserver_types::{
    Activity, Credentials, Endpoint, FleetEvent, Instance, InstanceId, InstanceStatus,
    NetworkEndpoints, OwnerId,
};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};

use crate::admission::ALREADY_RUNNING_MESSAGE;
use crate::error::{FleetError, Result};
use crate::ports::{
    ActivityRepository, Ban, BanList, CreditLedger, EventLog, FleetRepository, FleetTransaction,
    GuildSettings, OwnerDirectory,
};

#[derive(Clone)]
pub struct SeaStore {
    db: Arc<DatabaseConnection>,
}

impl SeaStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

/// The only unique index besides primary keys is the one-active-instance-per-owner index.
fn map_instance_write(err: DbErr) -> FleetError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(detail)) => {
            tracing::debug!(%detail, "one-active-instance index rejected write");
            FleetError::user(ALREADY_RUNNING_MESSAGE)
        }
        _ => FleetError::Store(err),
    }
}

fn port(raw: Option<i32>) -> Option<u16> {
    raw.and_then(|p| u16::try_from(p).ok())
}

fn endpoint(host: Option<String>, port_raw: Option<i32>) -> Option<Endpoint> {
    Some(Endpoint::new(host?, port(port_raw)?))
}

pub(crate) fn instance_from_model(model: instances::Model) -> Result<Instance> {
    let status = InstanceStatus::parse(&model.status).ok_or_else(|| {
        FleetError::internal(format!(
            "instance {} has unknown status {:?}",
            model.id, model.status
        ))
    })?;

    let endpoints = match (
        endpoint(model.game_host, model.game_port),
        endpoint(model.rcon_host, model.rcon_port),
    ) {
        (Some(game), Some(rcon)) => Some(NetworkEndpoints {
            game,
            spectator: endpoint(model.tv_host, model.tv_port),
            rcon,
        }),
        _ => None,
    };
    let credentials = match (model.server_password, model.rcon_password) {
        (Some(server_password), Some(rcon_password)) => Some(Credentials {
            server_password,
            rcon_password,
            spectator_password: model.tv_password,
        }),
        _ => None,
    };

    Ok(Instance {
        id: InstanceId(model.id),
        owner_id: OwnerId::new(model.owner_id),
        status,
        region: model.region,
        variant: model.variant,
        guild_id: model.guild_id,
        endpoints,
        credentials,
        created_at: model.created_at.with_timezone(&Utc),
    })
}

pub(crate) fn instance_to_active(instance: &Instance) -> instances::ActiveModel {
    let endpoints = instance.endpoints.as_ref();
    let spectator = endpoints.and_then(|e| e.spectator.as_ref());
    let credentials = instance.credentials.as_ref();

    instances::ActiveModel {
        id: Set(instance.id.0),
        owner_id: Set(instance.owner_id.as_str().to_string()),
        status: Set(instance.status.as_str().to_string()),
        region: Set(instance.region.clone()),
        variant: Set(instance.variant.clone()),
        guild_id: Set(instance.guild_id.clone()),
        game_host: Set(endpoints.map(|e| e.game.host.clone())),
        game_port: Set(endpoints.map(|e| i32::from(e.game.port))),
        tv_host: Set(spectator.map(|s| s.host.clone())),
        tv_port: Set(spectator.map(|s| i32::from(s.port))),
        rcon_host: Set(endpoints.map(|e| e.rcon.host.clone())),
        rcon_port: Set(endpoints.map(|e| i32::from(e.rcon.port))),
        server_password: Set(credentials.map(|c| c.server_password.clone())),
        rcon_password: Set(credentials.map(|c| c.rcon_password.clone())),
        tv_password: Set(credentials.and_then(|c| c.spectator_password.clone())),
        created_at: Set(instance.created_at.into()),
        updated_at: Set(Utc::now().into()),
    }
}

async fn upsert_instance<C: ConnectionTrait>(db: &C, instance: &Instance) -> Result<()> {
    instances::Entity::insert(instance_to_active(instance))
        .on_conflict(
            OnConflict::column(instances::Column::Id)
                .update_columns([
                    instances::Column::Status,
                    instances::Column::GameHost,
                    instances::Column::GamePort,
                    instances::Column::TvHost,
                    instances::Column::TvPort,
                    instances::Column::RconHost,
                    instances::Column::RconPort,
                    instances::Column::ServerPassword,
                    instances::Column::RconPassword,
                    instances::Column::TvPassword,
                    instances::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(db)
        .await
        .map_err(map_instance_write)?;
    Ok(())
}

async fn instances_of<C: ConnectionTrait>(db: &C, owner: &OwnerId) -> Result<Vec<Instance>> {
    instances::Entity::find()
        .filter(instances::Column::OwnerId.eq(owner.as_str()))
        .order_by_asc(instances::Column::CreatedAt)
        .all(db)
        .await?
        .into_iter()
        .map(instance_from_model)
        .collect()
}

#[async_trait]
impl FleetRepository for SeaStore {
    async fn upsert(&self, instance: &Instance) -> Result<()> {
        upsert_instance(&*self.db, instance).await
    }

    async fn delete(&self, id: InstanceId) -> Result<()> {
        instances::Entity::delete_by_id(id.0).exec(&*self.db).await?;
        Ok(())
    }

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Instance>> {
        instances::Entity::find_by_id(id.0)
            .one(&*self.db)
            .await?
            .map(instance_from_model)
            .transpose()
    }

    async fn list_all(&self, status: Option<InstanceStatus>) -> Result<Vec<Instance>> {
        let mut query = instances::Entity::find().order_by_asc(instances::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(instances::Column::Status.eq(status.as_str()));
        }
        query
            .all(&*self.db)
            .await?
            .into_iter()
            .map(instance_from_model)
            .collect()
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Instance>> {
        instances_of(&*self.db, owner).await
    }

    async fn begin(&self) -> Result<Box<dyn FleetTransaction>> {
        let txn = self.db.begin().await?;
        Ok(Box::new(SeaFleetTransaction { txn }))
    }
}

/// Rolled back by sea-orm when dropped uncommitted.
struct SeaFleetTransaction {
    txn: DatabaseTransaction,
}

#[async_trait]
impl FleetTransaction for SeaFleetTransaction {
    async fn find_by_id(&mut self, id: InstanceId) -> Result<Option<Instance>> {
        instances::Entity::find_by_id(id.0)
            .lock_exclusive()
            .one(&self.txn)
            .await?
            .map(instance_from_model)
            .transpose()
    }

    async fn list_by_owner(&mut self, owner: &OwnerId) -> Result<Vec<Instance>> {
        instances_of(&self.txn, owner).await
    }

    async fn upsert(&mut self, instance: &Instance) -> Result<()> {
        upsert_instance(&self.txn, instance).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.txn.commit().await.map_err(map_instance_write)
    }
}

fn activity_from_model(model: instance_activity::Model) -> Activity {
    Activity {
        instance_id: InstanceId(model.instance_id),
        empty_since: model.empty_since.map(|t| t.with_timezone(&Utc)),
        last_checked_at: model.last_checked_at.with_timezone(&Utc),
    }
}

#[async_trait]
impl ActivityRepository for SeaStore {
    async fn upsert(&self, activity: &Activity) -> Result<()> {
        let model = instance_activity::ActiveModel {
            instance_id: Set(activity.instance_id.0),
            empty_since: Set(activity.empty_since.map(Into::into)),
            last_checked_at: Set(activity.last_checked_at.into()),
        };
        let result = instance_activity::Entity::insert(model)
            .on_conflict(
                OnConflict::column(instance_activity::Column::InstanceId)
                    .update_columns([
                        instance_activity::Column::EmptySince,
                        instance_activity::Column::LastCheckedAt,
                    ])
                    .to_owned(),
            )
            .exec(&*self.db)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if matches!(err.sql_err(), Some(SqlErr::ForeignKeyConstraintViolation(_))) => {
                tracing::debug!(
                    instance_id = %activity.instance_id,
                    "instance deleted concurrently, activity not recorded"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, id: InstanceId) -> Result<()> {
        instance_activity::Entity::delete_by_id(id.0)
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Activity>> {
        Ok(instance_activity::Entity::find_by_id(id.0)
            .one(&*self.db)
            .await?
            .map(activity_from_model))
    }

    async fn list_all(&self) -> Result<Vec<Activity>> {
        Ok(instance_activity::Entity::find()
            .all(&*self.db)
            .await?
            .into_iter()
            .map(activity_from_model)
            .collect())
    }
}

#[async_trait]
impl CreditLedger for SeaStore {
    async fn balance(&self, owner: &OwnerId) -> Result<i64> {
        Ok(owners::Entity::find_by_id(owner.as_str().to_string())
            .one(&*self.db)
            .await?
            .map(|o| o.credits)
            .unwrap_or(0))
    }
}

#[async_trait]
impl OwnerDirectory for SeaStore {
    async fn external_identity(&self, owner: &OwnerId) -> Result<Option<String>> {
        Ok(owners::Entity::find_by_id(owner.as_str().to_string())
            .one(&*self.db)
            .await?
            .and_then(|o| o.external_identity)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()))
    }
}

#[async_trait]
impl BanList for SeaStore {
    async fn find_ban(&self, owner: &OwnerId, identity: &str) -> Result<Option<Ban>> {
        Ok(owner_bans::Entity::find()
            .filter(
                Condition::any()
                    .add(owner_bans::Column::ExternalIdentity.eq(identity))
                    .add(owner_bans::Column::OwnerId.eq(owner.as_str())),
            )
            .one(&*self.db)
            .await?
            .map(|ban| Ban { reason: ban.reason }))
    }
}

/// Flattens a JSON object into string overrides. Non-string scalars keep their JSON text.
pub(crate) fn overrides_from_json(value: &serde_json::Value) -> BTreeMap<String, String> {
    let Some(object) = value.as_object() else {
        return BTreeMap::new();
    };
    object
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => return None,
                other => other.to_string(),
            };
            Some((key.clone(), value))
        })
        .collect()
}

#[async_trait]
impl GuildSettings for SeaStore {
    async fn overrides(&self, guild_id: &str) -> Result<BTreeMap<String, String>> {
        Ok(guild_parameters::Entity::find_by_id(guild_id.to_string())
            .one(&*self.db)
            .await?
            .map(|g| overrides_from_json(&g.overrides))
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventLog for SeaStore {
    async fn append(&self, event: FleetEvent) -> Result<()> {
        let model = fleet_events::ActiveModel {
            id: Set(uuid::Uuid::new_v4()),
            actor_id: Set(event.actor_id),
            message: Set(event.message),
            created_at: Set(event.created_at.into()),
        };
        fleet_events::Entity::insert(model).exec(&*self.db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{minutes_ago, pending_instance, ready_instance};

    fn round_trip(instance: &Instance) -> Instance {
        let active = instance_to_active(instance);
        let model = instances::Model {
            id: active.id.unwrap(),
            owner_id: active.owner_id.unwrap(),
            status: active.status.unwrap(),
            region: active.region.unwrap(),
            variant: active.variant.unwrap(),
            guild_id: active.guild_id.unwrap(),
            game_host: active.game_host.unwrap(),
            game_port: active.game_port.unwrap(),
            tv_host: active.tv_host.unwrap(),
            tv_port: active.tv_port.unwrap(),
            rcon_host: active.rcon_host.unwrap(),
            rcon_port: active.rcon_port.unwrap(),
            server_password: active.server_password.unwrap(),
            rcon_password: active.rcon_password.unwrap(),
            tv_password: active.tv_password.unwrap(),
            created_at: active.created_at.unwrap(),
            updated_at: active.updated_at.unwrap(),
        };
        instance_from_model(model).unwrap()
    }

    #[test]
    fn ready_rows_keep_endpoints_and_credentials() {
        let instance = ready_instance("u1", "10.0.0.1", minutes_ago(5));
        assert_eq!(round_trip(&instance), instance);
    }

    #[test]
    fn pending_rows_have_no_endpoints() {
        let instance = pending_instance("u1", minutes_ago(5));
        let back = round_trip(&instance);
        assert_eq!(back.status, InstanceStatus::Pending);
        assert!(back.endpoints.is_none());
        assert!(back.credentials.is_none());
    }

    #[test]
    fn unknown_status_is_an_error() {
        let instance = pending_instance("u1", minutes_ago(5));
        let mut active = instance_to_active(&instance);
        active.status = Set("terminating".into());
        let model = instances::Model {
            id: active.id.unwrap(),
            owner_id: active.owner_id.unwrap(),
            status: active.status.unwrap(),
            region: active.region.unwrap(),
            variant: active.variant.unwrap(),
            guild_id: None,
            game_host: None,
            game_port: None,
            tv_host: None,
            tv_port: None,
            rcon_host: None,
            rcon_port: None,
            server_password: None,
            rcon_password: None,
            tv_password: None,
            created_at: active.created_at.unwrap(),
            updated_at: active.updated_at.unwrap(),
        };
        assert!(instance_from_model(model).is_err());
    }

    #[test]
    fn guild_overrides_flatten_to_strings() {
        let overrides = overrides_from_json(&json!({
            "MAP": "cp_badlands",
            "MAX_PLAYERS": 24,
            "SV_CHEATS": false,
            "UNSET": null,
        }));
        assert_eq!(overrides.get("MAP").map(String::as_str), Some("cp_badlands"));
        assert_eq!(overrides.get("MAX_PLAYERS").map(String::as_str), Some("24"));
        assert_eq!(overrides.get("SV_CHEATS").map(String::as_str), Some("false"));
        assert!(!overrides.contains_key("UNSET"));
        assert!(overrides_from_json(&json!(["not", "an", "object"])).is_empty());
    }
}
