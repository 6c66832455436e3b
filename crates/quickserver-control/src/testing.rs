//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quickserver_types::{
    Activity, Credentials, DeployedInstance, Endpoint, FleetEvent, Instance, InstanceId,
    InstanceStatus, NetworkEndpoints, OwnerId,
};
use tokio::sync::{Notify, OwnedMutexGuard};

use crate::error::{FleetError, Result};
use crate::ports::{
    ActivityRepository, Ban, BanList, CreditLedger, DeployRequest, EventLog, FleetRepository,
    FleetTransaction, GuildSettings, HealthProbe, Notifier, OwnerDirectory, ProbeQuery,
    Provisioner,
};

type Rows = BTreeMap<InstanceId, Instance>;

#[derive(Default)]
pub struct MemoryFleet {
    rows: Arc<tokio::sync::Mutex<Rows>>,
    upserts: Arc<AtomicUsize>,
    frozen_listing: Mutex<Option<Vec<Instance>>>,
}

impl MemoryFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, instance: Instance) {
        self.rows.lock().await.insert(instance.id, instance);
    }

    pub async fn all(&self) -> Vec<Instance> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, id: InstanceId) -> Option<Instance> {
        self.rows.lock().await.get(&id).cloned()
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Makes `list_all` keep returning the current rows, as a snapshot taken by a racing
    /// reader would.
    pub async fn freeze_listing(&self) {
        let rows = self.all().await;
        *self.frozen_listing.lock().unwrap() = Some(rows);
    }
}

#[async_trait]
impl FleetRepository for MemoryFleet {
    async fn upsert(&self, instance: &Instance) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().await.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn delete(&self, id: InstanceId) -> Result<()> {
        self.rows.lock().await.remove(&id);
        Ok(())
    }

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Instance>> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn list_all(&self, status: Option<InstanceStatus>) -> Result<Vec<Instance>> {
        let frozen = self.frozen_listing.lock().unwrap().clone();
        let rows = match frozen {
            Some(rows) => rows,
            None => self.all().await,
        };
        Ok(rows
            .into_iter()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .collect())
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Instance>> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|i| &i.owner_id == owner)
            .cloned()
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn FleetTransaction>> {
        // Holding the table lock for the whole transaction serializes admissions.
        let guard = self.rows.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTxn {
            guard,
            staged,
            upserts: self.upserts.clone(),
        }))
    }
}

struct MemoryTxn {
    guard: OwnedMutexGuard<Rows>,
    staged: Rows,
    upserts: Arc<AtomicUsize>,
}

#[async_trait]
impl FleetTransaction for MemoryTxn {
    async fn find_by_id(&mut self, id: InstanceId) -> Result<Option<Instance>> {
        Ok(self.staged.get(&id).cloned())
    }

    async fn list_by_owner(&mut self, owner: &OwnerId) -> Result<Vec<Instance>> {
        Ok(self
            .staged
            .values()
            .filter(|i| &i.owner_id == owner)
            .cloned()
            .collect())
    }

    async fn upsert(&mut self, instance: &Instance) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.staged.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTxn {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryActivity {
    rows: Mutex<BTreeMap<InstanceId, Activity>>,
}

impl MemoryActivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, id: InstanceId) -> Option<Activity> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    pub fn set(&self, activity: Activity) {
        self.rows.lock().unwrap().insert(activity.instance_id, activity);
    }
}

#[async_trait]
impl ActivityRepository for MemoryActivity {
    async fn upsert(&self, activity: &Activity) -> Result<()> {
        self.set(activity.clone());
        Ok(())
    }

    async fn delete(&self, id: InstanceId) -> Result<()> {
        self.rows.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Activity>> {
        Ok(self.get(id))
    }

    async fn list_all(&self) -> Result<Vec<Activity>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }
}

#[derive(Default)]
pub struct FakeProvisioner {
    pub deploys: Mutex<Vec<DeployRequest>>,
    pub destroys: Mutex<Vec<InstanceId>>,
    fail_deploy: Mutex<Option<fn() -> FleetError>>,
    gate: Mutex<Option<Arc<Notify>>>,
    fail_destroy: Mutex<HashSet<InstanceId>>,
}

impl FakeProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_deploys_with(&self, make: fn() -> FleetError) {
        *self.fail_deploy.lock().unwrap() = Some(make);
    }

    /// Deploys block until the returned handle is notified.
    pub fn hold_deploys(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fail_destroy_of(&self, id: InstanceId) {
        self.fail_destroy.lock().unwrap().insert(id);
    }

    pub fn destroyed(&self) -> Vec<InstanceId> {
        self.destroys.lock().unwrap().clone()
    }

    pub fn deploy_count(&self) -> usize {
        self.deploys.lock().unwrap().len()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn deploy(&self, request: DeployRequest) -> Result<DeployedInstance> {
        self.deploys.lock().unwrap().push(request);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        // Give concurrent admissions a chance to interleave.
        tokio::task::yield_now().await;
        if let Some(make) = *self.fail_deploy.lock().unwrap() {
            return Err(make());
        }
        Ok(deployed("10.0.0.10"))
    }

    async fn destroy(&self, id: InstanceId, _region: &str) -> Result<()> {
        if self.fail_destroy.lock().unwrap().contains(&id) {
            return Err(FleetError::internal(format!("destroy {id} failed")));
        }
        self.destroys.lock().unwrap().push(id);
        Ok(())
    }
}

/// Scripted probe: answers per host, fails for unknown hosts.
#[derive(Default)]
pub struct FakeProbe {
    transcripts: Mutex<HashMap<String, String>>,
    pub queries: Mutex<Vec<(String, String)>>,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, host: &str, transcript: &str) {
        self.transcripts
            .lock()
            .unwrap()
            .insert(host.to_string(), transcript.to_string());
    }

    pub fn commands_to(&self, host: &str) -> Vec<String> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn query(&self, query: ProbeQuery) -> Result<String> {
        self.queries
            .lock()
            .unwrap()
            .push((query.host.clone(), query.command.clone()));
        self.transcripts
            .lock()
            .unwrap()
            .get(&query.host)
            .cloned()
            .ok_or_else(|| {
                FleetError::internal(format!(
                    "rcon query to {}:{} timed out after {}ms",
                    query.host,
                    query.port,
                    query.timeout.as_millis()
                ))
            })
    }
}

#[derive(Default)]
pub struct FakeLedger {
    balances: Mutex<HashMap<OwnerId, i64>>,
    pub lookups: AtomicUsize,
}

impl FakeLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, owner: &str, balance: i64) {
        self.balances
            .lock()
            .unwrap()
            .insert(OwnerId::new(owner), balance);
    }
}

#[async_trait]
impl CreditLedger for FakeLedger {
    async fn balance(&self, owner: &OwnerId) -> Result<i64> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.balances.lock().unwrap().get(owner).copied().unwrap_or(0))
    }
}

#[derive(Default)]
pub struct RecordingEventLog {
    pub events: Mutex<Vec<FleetEvent>>,
}

impl RecordingEventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }
}

#[async_trait]
impl EventLog for RecordingEventLog {
    async fn append(&self, event: FleetEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(OwnerId, String)>>,
    pub failing: std::sync::atomic::AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let n = Self::default();
        n.failing.store(true, Ordering::SeqCst);
        Arc::new(n)
    }

    pub fn sent_to(&self, owner: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| o.as_str() == owner)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, owner: &OwnerId, message: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FleetError::internal("cannot send direct messages to this user"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((owner.clone(), message.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    identities: Mutex<HashMap<OwnerId, String>>,
}

impl FakeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, owner: &str, identity: &str) {
        self.identities
            .lock()
            .unwrap()
            .insert(OwnerId::new(owner), identity.to_string());
    }
}

#[async_trait]
impl OwnerDirectory for FakeDirectory {
    async fn external_identity(&self, owner: &OwnerId) -> Result<Option<String>> {
        Ok(self.identities.lock().unwrap().get(owner).cloned())
    }
}

/// Bans keyed by game identity or owner id.
#[derive(Default)]
pub struct FakeBans {
    bans: Mutex<HashMap<String, Option<String>>>,
}

impl FakeBans {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ban(&self, key: &str, reason: Option<&str>) {
        self.bans
            .lock()
            .unwrap()
            .insert(key.to_string(), reason.map(str::to_string));
    }
}

#[async_trait]
impl BanList for FakeBans {
    async fn find_ban(&self, owner: &OwnerId, identity: &str) -> Result<Option<Ban>> {
        let bans = self.bans.lock().unwrap();
        Ok(bans
            .get(identity)
            .or_else(|| bans.get(owner.as_str()))
            .map(|reason| Ban {
                reason: reason.clone(),
            }))
    }
}

#[derive(Default)]
pub struct FakeGuilds {
    overrides: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl FakeGuilds {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, guild: &str, key: &str, value: &str) {
        self.overrides
            .lock()
            .unwrap()
            .entry(guild.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl GuildSettings for FakeGuilds {
    async fn overrides(&self, guild_id: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .overrides
            .lock()
            .unwrap()
            .get(guild_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn deployed(host: &str) -> DeployedInstance {
    DeployedInstance {
        endpoints: NetworkEndpoints {
            game: Endpoint::new(host, 27015),
            spectator: Some(Endpoint::new(host, 27020)),
            rcon: Endpoint::new(host, 27015),
        },
        credentials: Credentials {
            server_password: "server-pw".into(),
            rcon_password: "rcon-pw".into(),
            spectator_password: Some("tv-pw".into()),
        },
    }
}

pub fn ready_instance(owner: &str, host: &str, created_at: DateTime<Utc>) -> Instance {
    let mut instance = Instance::pending(OwnerId::new(owner), "us-east", "casual", None)
        .into_ready(deployed(host));
    instance.created_at = created_at;
    instance
}

pub fn pending_instance(owner: &str, created_at: DateTime<Utc>) -> Instance {
    let mut instance = Instance::pending(OwnerId::new(owner), "us-east", "casual", None);
    instance.created_at = created_at;
    instance
}

pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(minutes)
}
