use chrono::{Duration, Utc};
use conductor_core::protocol::{RegisterPayload, RosterUpdate};
use conductor_core::{ClientStatus, ClientType, Connection, JsonMap};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Everything needed to (re-)register a client.
#[derive(Debug, Clone)]
pub struct RegisterInput {
    /// Client id, unique across the fleet.
    pub client_id: String,
    /// Role the client plays.
    pub client_type: ClientType,
    /// Initial status.
    pub status: ClientStatus,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
    /// Live desktop URL, if the client exposes one.
    pub novnc_url: Option<String>,
    /// Free-form client metadata.
    pub metadata: JsonMap,
}

impl RegisterInput {
    /// Idle client with no capabilities or metadata.
    pub fn new(client_id: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            client_id: client_id.into(),
            client_type,
            status: ClientStatus::Idle,
            capabilities: Vec::new(),
            novnc_url: None,
            metadata: JsonMap::new(),
        }
    }

    /// Build from a decoded register payload.
    pub fn from_payload(client_type: ClientType, payload: RegisterPayload) -> Self {
        Self {
            client_id: payload.client_id,
            client_type,
            status: payload.status.unwrap_or_default(),
            capabilities: payload.capabilities,
            novnc_url: payload.novnc_url,
            metadata: payload.metadata,
        }
    }
}

impl From<Connection> for RegisterInput {
    fn from(conn: Connection) -> Self {
        Self {
            client_id: conn.client_id,
            client_type: conn.client_type,
            status: conn.status,
            capabilities: conn.capabilities,
            novnc_url: conn.novnc_url,
            metadata: conn.metadata,
        }
    }
}

/// Fields a heartbeat may carry besides the client id.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    /// New status, if the client reported one.
    pub status: Option<ClientStatus>,
    /// Required to auto-register a client the registry does not know.
    pub client_type: Option<ClientType>,
    /// Replaces the stored desktop URL when present.
    pub novnc_url: Option<String>,
}

/// Outcome of [`Registry::update_heartbeat`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatOutcome {
    /// A known client was refreshed.
    Refreshed {
        /// Connection after the refresh.
        connection: Connection,
        /// `true` when the heartbeat moved it between idle and busy.
        status_changed: bool,
    },
    /// The client was unknown and the heartbeat carried a type.
    Created(Connection),
    /// Unknown client, no type: nothing was stored.
    Ignored,
}

impl HeartbeatOutcome {
    /// Connection stored by the heartbeat, if any.
    pub fn connection(&self) -> Option<&Connection> {
        match self {
            HeartbeatOutcome::Refreshed { connection, .. } => Some(connection),
            HeartbeatOutcome::Created(connection) => Some(connection),
            HeartbeatOutcome::Ignored => None,
        }
    }

    /// Whether the roster visible to the UI changed.
    pub fn roster_changed(&self) -> bool {
        match self {
            HeartbeatOutcome::Refreshed { status_changed, .. } => *status_changed,
            HeartbeatOutcome::Created(_) => true,
            HeartbeatOutcome::Ignored => false,
        }
    }
}

/// In-memory view of every connected worker, supervisor and gateway.
///
/// A client id maps to at most one [`Connection`]. The lock is never held
/// across an `.await`.
#[derive(Default)]
pub struct Registry {
    clients: RwLock<HashMap<String, Connection>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the connection for `input.client_id`.
    pub fn register(&self, input: RegisterInput) -> Connection {
        let mut conn = Connection::new(input.client_id, input.client_type);
        conn.status = input.status;
        conn.capabilities = input.capabilities;
        conn.novnc_url = input.novnc_url;
        conn.metadata = input.metadata;

        let replaced = self
            .clients
            .write()
            .insert(conn.client_id.clone(), conn.clone())
            .is_some();
        info!(
            client_id = %conn.client_id,
            client_type = %conn.client_type,
            replaced,
            "Client registered"
        );
        conn
    }

    /// Refresh a client's heartbeat, auto-registering it when the update
    /// names a client type.
    pub fn update_heartbeat(&self, client_id: &str, update: HeartbeatUpdate) -> HeartbeatOutcome {
        let mut clients = self.clients.write();
        if let Some(conn) = clients.get_mut(client_id) {
            let previous = conn.status;
            conn.last_heartbeat = Utc::now();
            if let Some(status) = update.status {
                conn.status = status;
            }
            if update.novnc_url.is_some() {
                conn.novnc_url = update.novnc_url;
            }
            return HeartbeatOutcome::Refreshed {
                status_changed: previous != conn.status,
                connection: conn.clone(),
            };
        }

        let Some(client_type) = update.client_type else {
            debug!(client_id, "Heartbeat from unknown client without a type, ignoring");
            return HeartbeatOutcome::Ignored;
        };
        let mut conn = Connection::new(client_id, client_type);
        conn.status = update.status.unwrap_or_default();
        conn.novnc_url = update.novnc_url;
        clients.insert(conn.client_id.clone(), conn.clone());
        info!(client_id, client_type = %client_type, "Client registered from heartbeat");
        HeartbeatOutcome::Created(conn)
    }

    /// Remove a client. Returns the removed connection.
    pub fn deregister(&self, client_id: &str) -> Option<Connection> {
        let removed = self.clients.write().remove(client_id);
        if removed.is_some() {
            info!(client_id, "Client deregistered");
        }
        removed
    }

    /// Snapshot of one client.
    pub fn get(&self, client_id: &str) -> Option<Connection> {
        self.clients.read().get(client_id).cloned()
    }

    /// Clients of one type, oldest registration first.
    pub fn list_by_type(&self, client_type: ClientType) -> Vec<Connection> {
        let mut list: Vec<Connection> = self
            .clients
            .read()
            .values()
            .filter(|c| c.client_type == client_type)
            .cloned()
            .collect();
        sort_stable(&mut list);
        list
    }

    /// Idle clients of one type, oldest registration first.
    pub fn list_idle(&self, client_type: ClientType) -> Vec<Connection> {
        let mut list = self.list_by_type(client_type);
        list.retain(Connection::is_idle);
        list
    }

    /// Returns `false` if the client is unknown.
    pub fn set_status(&self, client_id: &str, status: ClientStatus) -> bool {
        match self.clients.write().get_mut(client_id) {
            Some(conn) => {
                conn.status = status;
                true
            }
            None => false,
        }
    }

    /// Pick the oldest idle client of `client_type` not in `exclude` and mark
    /// it busy in the same critical section, so two concurrent delegations
    /// never pick the same executor.
    pub fn reserve_idle(
        &self,
        client_type: ClientType,
        exclude: &HashSet<String>,
    ) -> Option<Connection> {
        let mut clients = self.clients.write();
        let chosen = clients
            .values()
            .filter(|c| {
                c.client_type == client_type && c.is_idle() && !exclude.contains(&c.client_id)
            })
            .min_by(|a, b| {
                a.registered_at
                    .cmp(&b.registered_at)
                    .then_with(|| a.client_id.cmp(&b.client_id))
            })?
            .client_id
            .clone();
        let conn = clients.get_mut(&chosen)?;
        conn.status = ClientStatus::Busy;
        Some(conn.clone())
    }

    /// Clients whose last heartbeat is older than `max_age`.
    pub fn stale(&self, max_age: Duration) -> Vec<Connection> {
        let now = Utc::now();
        let mut list: Vec<Connection> = self
            .clients
            .read()
            .values()
            .filter(|c| c.is_stale(max_age, now))
            .cloned()
            .collect();
        sort_stable(&mut list);
        list
    }

    /// Snapshot of every client.
    pub fn snapshot(&self) -> Vec<Connection> {
        let mut list: Vec<Connection> = self.clients.read().values().cloned().collect();
        sort_stable(&mut list);
        list
    }

    /// Current roster grouped by client type.
    pub fn roster(&self) -> RosterUpdate {
        let mut roster = RosterUpdate {
            workers: Vec::new(),
            supervisors: Vec::new(),
            gateways: Vec::new(),
        };
        for conn in self.snapshot() {
            match conn.client_type {
                ClientType::Worker => roster.workers.push(conn),
                ClientType::Supervisor => roster.supervisors.push(conn),
                ClientType::Gateway => roster.gateways.push(conn),
            }
        }
        roster
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// `true` when no client is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

fn sort_stable(list: &mut [Connection]) {
    list.sort_by(|a, b| {
        a.registered_at
            .cmp(&b.registered_at)
            .then_with(|| a.client_id.cmp(&b.client_id))
    });
}
