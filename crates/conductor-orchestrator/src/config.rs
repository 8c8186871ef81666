use conductor_core::{ClientType, DesktopWorker, JsonMap, Subjects};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime settings for one orchestrator instance.
///
/// Every field has a default so an empty `[orchestrator]` table (or none at
/// all) yields a working single-node setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// First token of every subject.
    pub subject_prefix: String,
    /// Identifies this replica when claiming schedules.
    pub instance_id: String,
    /// Queue group shared by all replicas for competing consumption.
    pub queue_group: String,
    /// Seconds between scheduler ticks.
    pub scheduler_tick_secs: u64,
    /// Maximum schedules claimed per tick.
    pub claim_batch: usize,
    /// Reply deadline for task assignment requests.
    pub assignment_timeout_ms: u64,
    /// Executor type that receives tasks created from gateway messages.
    pub gateway_target: ClientType,
    /// Self-healing retries allowed per failed scheduled run.
    pub self_healing_max_retries: u32,
    /// Heartbeat age after which a client is reported stale.
    pub heartbeat_stale_secs: u64,
    /// Used when a help request does not carry its own timeout.
    pub default_help_timeout_secs: f64,
    /// Desktop workers to upsert at startup.
    pub desktop_workers: Vec<DesktopWorkerSeed>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "conductor".to_string(),
            instance_id: "conductor-1".to_string(),
            queue_group: "conductor".to_string(),
            scheduler_tick_secs: 5,
            claim_batch: 16,
            assignment_timeout_ms: 5000,
            gateway_target: ClientType::Supervisor,
            self_healing_max_retries: 2,
            heartbeat_stale_secs: 60,
            default_help_timeout_secs: 300.0,
            desktop_workers: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Subject builder for `subject_prefix`.
    pub fn subjects(&self) -> Subjects {
        Subjects::new(self.subject_prefix.clone())
    }

    /// Scheduler tick period, at least one second.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }

    /// Assignment reply deadline, at least one millisecond.
    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_millis(self.assignment_timeout_ms.max(1))
    }

    /// Heartbeat age treated as stale, saturating on overflow.
    pub fn heartbeat_max_age(&self) -> chrono::Duration {
        secs_to_chrono(self.heartbeat_stale_secs)
    }
}

fn secs_to_chrono(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// A desktop worker declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesktopWorkerSeed {
    /// Id the worker registers under.
    pub client_id: String,
    /// Remote desktop viewer URL.
    #[serde(default)]
    pub novnc_url: Option<String>,
    /// Capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Extra data stored with the worker.
    #[serde(default)]
    pub metadata: JsonMap,
}

impl DesktopWorkerSeed {
    /// Stored form of this seed.
    pub fn to_desktop_worker(&self) -> DesktopWorker {
        let mut worker = DesktopWorker::new(self.client_id.clone());
        worker.novnc_url = self.novnc_url.clone();
        worker.capabilities = self.capabilities.clone();
        worker.metadata = self.metadata.clone();
        worker
    }
}
