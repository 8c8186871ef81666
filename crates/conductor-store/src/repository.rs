use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorResult, Connection, DesktopWorker, HelpRequest, ScheduledTask, Task};
use std::sync::Arc;

/// Persistence for tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert or update. A stored row with a higher or equal `version` wins,
    /// so late mirrors of older snapshots are ignored.
    async fn save_task(&self, task: &Task) -> ConductorResult<()>;
    /// Fetch one task.
    async fn get_task(&self, task_id: &str) -> ConductorResult<Option<Task>>;
    /// Tasks that are not completed or failed.
    async fn list_active_tasks(&self) -> ConductorResult<Vec<Task>>;
    /// Tasks fired by one schedule, oldest first.
    async fn list_tasks_by_schedule(&self, schedule_id: &str) -> ConductorResult<Vec<Task>>;
    /// Most recent tasks first, up to `limit`.
    async fn list_recent_tasks(&self, limit: usize) -> ConductorResult<Vec<Task>>;
}

/// Parameters for [`ScheduleRepository::claim_due`].
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Identifies the claiming orchestrator instance.
    pub owner: String,
    /// Schedules with `next_run_at <= now` are due.
    pub now: DateTime<Utc>,
    /// Maximum schedules claimed in one call.
    pub limit: usize,
}

/// Persistence for scheduled tasks.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Insert a new schedule.
    async fn create_schedule(&self, schedule: &ScheduledTask) -> ConductorResult<()>;

    /// Overwrite the definition of an existing schedule. Run counters are
    /// owned by [`claim_due`](Self::claim_due) and
    /// [`increment_learning_runs`](Self::increment_learning_runs) and are left
    /// untouched. Returns `false` when the schedule does not exist.
    async fn update_schedule(&self, schedule: &ScheduledTask) -> ConductorResult<bool>;

    /// Fetch a schedule, including tombstoned ones.
    async fn get_schedule(&self, schedule_id: &str) -> ConductorResult<Option<ScheduledTask>>;

    /// All schedules that are not deleted.
    async fn list_schedules(&self) -> ConductorResult<Vec<ScheduledTask>>;

    /// Tombstone a schedule. Returns `false` if it was unknown or already
    /// deleted.
    async fn delete_schedule(&self, schedule_id: &str) -> ConductorResult<bool>;

    /// Claim the due schedules (enabled, not deleted, `next_run_at <= now`)
    /// for `request.owner` and account for their run in the same write
    /// transaction (see [`ScheduledTask::record_run`]). Returns the advanced
    /// schedules; the caller fires them after the transaction. A slot is
    /// handed out once, so concurrent callers receive disjoint sets and a
    /// caller that dies while firing never causes a second firing.
    async fn claim_due(&self, request: &ClaimRequest) -> ConductorResult<Vec<ScheduledTask>>;

    /// Atomically increment `self_learning_run_count`, returning the new value.
    async fn increment_learning_runs(&self, schedule_id: &str) -> ConductorResult<Option<u32>>;
}

/// Persistence for help requests.
#[async_trait]
pub trait HelpRepository: Send + Sync {
    /// Insert or overwrite a help request.
    async fn save_help_request(&self, request: &HelpRequest) -> ConductorResult<()>;
    /// Fetch one help request.
    async fn get_help_request(&self, request_id: &str) -> ConductorResult<Option<HelpRequest>>;
    /// Requests still waiting for an answer.
    async fn list_pending_help_requests(&self) -> ConductorResult<Vec<HelpRequest>>;
}

/// Best-effort snapshot of registered connections.
#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    /// Insert or overwrite a client snapshot.
    async fn save_connection(&self, connection: &Connection) -> ConductorResult<()>;
    /// Forget a client. Unknown ids are not an error.
    async fn delete_connection(&self, client_id: &str) -> ConductorResult<()>;
    /// Every stored client snapshot.
    async fn list_connections(&self) -> ConductorResult<Vec<Connection>>;
}

/// Persistence for durable desktop workers.
#[async_trait]
pub trait DesktopWorkerRepository: Send + Sync {
    /// Insert or replace a desktop worker.
    async fn upsert_desktop_worker(&self, worker: &DesktopWorker) -> ConductorResult<()>;
    /// Fetch one desktop worker.
    async fn get_desktop_worker(&self, client_id: &str) -> ConductorResult<Option<DesktopWorker>>;
    /// Remove a desktop worker. Returns `false` if it was unknown.
    async fn delete_desktop_worker(&self, client_id: &str) -> ConductorResult<bool>;
    /// Every desktop worker.
    async fn list_desktop_workers(&self) -> ConductorResult<Vec<DesktopWorker>>;
}

/// One shared handle per repository trait.
#[derive(Clone)]
pub struct Repositories {
    /// Task persistence.
    pub tasks: Arc<dyn TaskRepository>,
    /// Schedule persistence.
    pub schedules: Arc<dyn ScheduleRepository>,
    /// Help request persistence.
    pub help: Arc<dyn HelpRepository>,
    /// Client snapshots.
    pub connections: Arc<dyn ConnectionRepository>,
    /// Desktop worker definitions.
    pub desktop_workers: Arc<dyn DesktopWorkerRepository>,
}

impl Repositories {
    /// Split a store implementing every repository into trait handles.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TaskRepository
            + ScheduleRepository
            + HelpRepository
            + ConnectionRepository
            + DesktopWorkerRepository
            + 'static,
    {
        Self {
            tasks: store.clone(),
            schedules: store.clone(),
            help: store.clone(),
            connections: store.clone(),
            desktop_workers: store,
        }
    }
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}
