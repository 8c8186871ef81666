use crate::JsonMap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Kind of client attached to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// Executes tasks directly.
    Worker,
    /// Plans and delegates; also executes optimizer tasks.
    Supervisor,
    /// A conversational channel adapter (e.g. a chat bot).
    Gateway,
}

impl ClientType {
    /// Lowercase name used in subjects.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Worker => "worker",
            ClientType::Supervisor => "supervisor",
            ClientType::Gateway => "gateway",
        }
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "worker" => Ok(ClientType::Worker),
            "supervisor" => Ok(ClientType::Supervisor),
            "gateway" => Ok(ClientType::Gateway),
            other => Err(format!("unknown client type '{other}'")),
        }
    }
}

/// Availability of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    /// Ready to accept a task.
    #[default]
    Idle,
    /// Currently executing a task.
    Busy,
}

/// A registered worker, supervisor or gateway channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Unique id chosen by the client.
    pub client_id: String,
    /// Worker, supervisor or gateway.
    pub client_type: ClientType,
    /// Idle or busy, as last reported or reserved.
    pub status: ClientStatus,
    /// Free-form capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Remote desktop viewer URL, for desktop workers.
    #[serde(default)]
    pub novnc_url: Option<String>,
    /// Extra client data; `desktop: true` marks durable desktop workers.
    #[serde(default)]
    pub metadata: JsonMap,
    /// Refreshed by every heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// When the client first registered with this instance.
    pub registered_at: DateTime<Utc>,
}

impl Connection {
    /// A fresh idle connection stamped with the current time.
    pub fn new(client_id: impl Into<String>, client_type: ClientType) -> Self {
        let now = Utc::now();
        Self {
            client_id: client_id.into(),
            client_type,
            status: ClientStatus::Idle,
            capabilities: Vec::new(),
            novnc_url: None,
            metadata: JsonMap::new(),
            last_heartbeat: now,
            registered_at: now,
        }
    }

    /// Ready to take a task.
    pub fn is_idle(&self) -> bool {
        self.status == ClientStatus::Idle
    }

    /// Whether the last heartbeat is older than `max_age` at `now`.
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > max_age
    }

    /// Whether this connection came from the durable desktop-worker table.
    pub fn is_desktop(&self) -> bool {
        self.metadata
            .get("desktop")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// A worker with a remote desktop, persisted so it survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesktopWorker {
    /// Id the worker registers and heartbeats under.
    pub client_id: String,
    /// Remote desktop viewer URL.
    #[serde(default)]
    pub novnc_url: Option<String>,
    /// Capability tags copied into the live connection.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Extra data copied into the live connection.
    #[serde(default)]
    pub metadata: JsonMap,
    /// First time the worker was stored.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last time the stored definition changed.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl DesktopWorker {
    /// A worker definition with empty optional fields, stamped now.
    pub fn new(client_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            client_id: client_id.into(),
            novnc_url: None,
            capabilities: Vec::new(),
            metadata: JsonMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The registry entry this desktop worker maps to.
    pub fn to_connection(&self) -> Connection {
        let mut conn = Connection::new(self.client_id.clone(), ClientType::Worker);
        conn.capabilities = self.capabilities.clone();
        conn.novnc_url = self.novnc_url.clone();
        conn.metadata = self.metadata.clone();
        conn.metadata
            .insert("desktop".to_string(), serde_json::Value::Bool(true));
        conn
    }
}
