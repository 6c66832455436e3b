use std::fmt;

use chrono::{DateTime, Utc};

/// Stable identifier of a fleet instance. Assigned by admission, before provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct InstanceId(pub uuid::Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity that created and controls an instance (a chat-platform user id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Ready,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Ready => "ready",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(InstanceStatus::Pending),
            "ready" => Some(InstanceStatus::Ready),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NetworkEndpoints {
    /// Where players connect.
    pub game: Endpoint,
    /// Spectator relay, when the variant runs one.
    pub spectator: Option<Endpoint>,
    /// Remote console used by health probes and in-band messages.
    pub rcon: Endpoint,
}

#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    pub server_password: String,
    pub rcon_password: String,
    pub spectator_password: Option<String>,
}

// Keep secrets out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server_password", &"<redacted>")
            .field("rcon_password", &"<redacted>")
            .field(
                "spectator_password",
                &self.spectator_password.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// What a provisioner hands back once an instance is reachable.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeployedInstance {
    pub endpoints: NetworkEndpoints,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub owner_id: OwnerId,
    pub status: InstanceStatus,
    pub region: String,
    pub variant: String,
    pub guild_id: Option<String>,
    /// `None` while pending.
    pub endpoints: Option<NetworkEndpoints>,
    /// `None` while pending.
    pub credentials: Option<Credentials>,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    /// Placeholder row written by admission before provisioning starts.
    pub fn pending(
        owner_id: OwnerId,
        region: impl Into<String>,
        variant: impl Into<String>,
        guild_id: Option<String>,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            owner_id,
            status: InstanceStatus::Pending,
            region: region.into(),
            variant: variant.into(),
            guild_id,
            endpoints: None,
            credentials: None,
            created_at: Utc::now(),
        }
    }

    pub fn into_ready(self, deployed: DeployedInstance) -> Self {
        Self {
            status: InstanceStatus::Ready,
            endpoints: Some(deployed.endpoints),
            credentials: Some(deployed.credentials),
            ..self
        }
    }

    /// Pending and ready instances both hold the owner's admission slot.
    pub fn is_active(&self) -> bool {
        matches!(self.status, InstanceStatus::Pending | InstanceStatus::Ready)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }

    /// RCON endpoint and password, when the instance has been provisioned.
    pub fn rcon(&self) -> Option<(&Endpoint, &str)> {
        let endpoints = self.endpoints.as_ref()?;
        let credentials = self.credentials.as_ref()?;
        Some((&endpoints.rcon, credentials.rcon_password.as_str()))
    }
}

/// Occupancy tracking row, one per instance.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Activity {
    pub instance_id: InstanceId,
    pub empty_since: Option<DateTime<Utc>>,
    pub last_checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FleetEvent {
    pub message: String,
    pub actor_id: String,
    pub created_at: DateTime<Utc>,
}

impl FleetEvent {
    pub fn new(message: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            actor_id: actor_id.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_unique() {
        assert_ne!(InstanceId::new(), InstanceId::new());
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(InstanceStatus::parse(" Ready "), Some(InstanceStatus::Ready));
        assert_eq!(InstanceStatus::parse("pending"), Some(InstanceStatus::Pending));
        assert_eq!(InstanceStatus::parse("terminating"), None);
    }

    #[test]
    fn promotion_keeps_identity_and_fills_endpoints() {
        let pending = Instance::pending(OwnerId::new("u1"), "us-east", "casual", None);
        let id = pending.id;
        assert!(pending.rcon().is_none());

        let ready = pending.into_ready(DeployedInstance {
            endpoints: NetworkEndpoints {
                game: Endpoint::new("10.0.0.1", 27015),
                spectator: None,
                rcon: Endpoint::new("10.0.0.1", 27015),
            },
            credentials: Credentials {
                server_password: "pw".into(),
                rcon_password: "rcon".into(),
                spectator_password: None,
            },
        });

        assert_eq!(ready.id, id);
        assert_eq!(ready.status, InstanceStatus::Ready);
        assert!(ready.is_active());
        let (rcon, password) = ready.rcon().unwrap();
        assert_eq!(rcon.to_string(), "10.0.0.1:27015");
        assert_eq!(password, "rcon");
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let c = Credentials {
            server_password: "hunter2".into(),
            rcon_password: "swordfish".into(),
            spectator_password: Some("tv".into()),
        };
        let rendered = format!("{c:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("swordfish"));
    }
}
