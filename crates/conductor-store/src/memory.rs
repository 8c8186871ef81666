use crate::repository::{
    ClaimRequest, ConnectionRepository, DesktopWorkerRepository, HelpRepository,
    ScheduleRepository, TaskRepository,
};
use async_trait::async_trait;
use chrono::Utc;
use conductor_core::{
    ConductorResult, Connection, DesktopWorker, HelpRequest, ScheduledTask, Task,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

struct ScheduleRow {
    schedule: ScheduledTask,
    last_fired_by: Option<String>,
}

/// In-memory store with the same semantics as [`SqliteStore`](crate::SqliteStore).
///
/// Useful for tests and for running a single orchestrator without a database.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    schedules: Mutex<HashMap<String, ScheduleRow>>,
    help: RwLock<HashMap<String, HelpRequest>>,
    connections: RwLock<HashMap<String, Connection>>,
    desktop_workers: RwLock<HashMap<String, DesktopWorker>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance that claimed the latest run of a schedule, if any.
    pub fn last_fired_by(&self, schedule_id: &str) -> Option<String> {
        self.schedules
            .lock()
            .get(schedule_id)
            .and_then(|row| row.last_fired_by.clone())
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn save_task(&self, task: &Task) -> ConductorResult<()> {
        let mut tasks = self.tasks.write();
        match tasks.get(&task.task_id) {
            Some(existing) if existing.version >= task.version => {}
            _ => {
                tasks.insert(task.task_id.clone(), task.clone());
            }
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> ConductorResult<Option<Task>> {
        Ok(self.tasks.read().get(task_id).cloned())
    }

    async fn list_active_tasks(&self) -> ConductorResult<Vec<Task>> {
        let mut active: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| !t.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|t| t.created_at);
        Ok(active)
    }

    async fn list_tasks_by_schedule(&self, schedule_id: &str) -> ConductorResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.scheduled_task_id.as_deref() == Some(schedule_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn list_recent_tasks(&self, limit: usize) -> ConductorResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }
}

#[async_trait]
impl ScheduleRepository for MemoryStore {
    async fn create_schedule(&self, schedule: &ScheduledTask) -> ConductorResult<()> {
        self.schedules.lock().insert(
            schedule.schedule_id.clone(),
            ScheduleRow {
                schedule: schedule.clone(),
                last_fired_by: None,
            },
        );
        Ok(())
    }

    async fn update_schedule(&self, schedule: &ScheduledTask) -> ConductorResult<bool> {
        let mut schedules = self.schedules.lock();
        let Some(row) = schedules.get_mut(&schedule.schedule_id) else {
            return Ok(false);
        };
        if row.schedule.deleted {
            return Ok(false);
        }
        let mut updated = schedule.clone();
        updated.run_count = row.schedule.run_count;
        updated.last_run_at = row.schedule.last_run_at;
        updated.self_learning_run_count = row.schedule.self_learning_run_count;
        updated.deleted = row.schedule.deleted;
        updated.created_at = row.schedule.created_at;
        row.schedule = updated;
        Ok(true)
    }

    async fn get_schedule(&self, schedule_id: &str) -> ConductorResult<Option<ScheduledTask>> {
        Ok(self
            .schedules
            .lock()
            .get(schedule_id)
            .map(|row| row.schedule.clone()))
    }

    async fn list_schedules(&self) -> ConductorResult<Vec<ScheduledTask>> {
        let mut schedules: Vec<ScheduledTask> = self
            .schedules
            .lock()
            .values()
            .filter(|row| !row.schedule.deleted)
            .map(|row| row.schedule.clone())
            .collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn delete_schedule(&self, schedule_id: &str) -> ConductorResult<bool> {
        let mut schedules = self.schedules.lock();
        match schedules.get_mut(schedule_id) {
            Some(row) if !row.schedule.deleted => {
                row.schedule.deleted = true;
                row.schedule.enabled = false;
                row.schedule.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_due(&self, request: &ClaimRequest) -> ConductorResult<Vec<ScheduledTask>> {
        let mut schedules = self.schedules.lock();
        let mut due: Vec<&mut ScheduleRow> = schedules
            .values_mut()
            .filter(|row| row.schedule.is_due(request.now))
            .collect();
        due.sort_by_key(|row| row.schedule.next_run_at);
        due.truncate(request.limit);

        let mut claimed = Vec::with_capacity(due.len());
        for row in due {
            row.schedule.record_run(request.now);
            row.last_fired_by = Some(request.owner.clone());
            claimed.push(row.schedule.clone());
        }
        Ok(claimed)
    }

    async fn increment_learning_runs(&self, schedule_id: &str) -> ConductorResult<Option<u32>> {
        Ok(self.schedules.lock().get_mut(schedule_id).map(|row| {
            row.schedule.self_learning_run_count += 1;
            row.schedule.self_learning_run_count
        }))
    }
}

#[async_trait]
impl HelpRepository for MemoryStore {
    async fn save_help_request(&self, request: &HelpRequest) -> ConductorResult<()> {
        self.help
            .write()
            .insert(request.request_id.clone(), request.clone());
        Ok(())
    }

    async fn get_help_request(&self, request_id: &str) -> ConductorResult<Option<HelpRequest>> {
        Ok(self.help.read().get(request_id).cloned())
    }

    async fn list_pending_help_requests(&self) -> ConductorResult<Vec<HelpRequest>> {
        let mut pending: Vec<HelpRequest> = self
            .help
            .read()
            .values()
            .filter(|r| r.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }
}

#[async_trait]
impl ConnectionRepository for MemoryStore {
    async fn save_connection(&self, connection: &Connection) -> ConductorResult<()> {
        self.connections
            .write()
            .insert(connection.client_id.clone(), connection.clone());
        Ok(())
    }

    async fn delete_connection(&self, client_id: &str) -> ConductorResult<()> {
        self.connections.write().remove(client_id);
        Ok(())
    }

    async fn list_connections(&self) -> ConductorResult<Vec<Connection>> {
        let mut connections: Vec<Connection> = self.connections.read().values().cloned().collect();
        connections.sort_by_key(|c| c.registered_at);
        Ok(connections)
    }
}

#[async_trait]
impl DesktopWorkerRepository for MemoryStore {
    async fn upsert_desktop_worker(&self, worker: &DesktopWorker) -> ConductorResult<()> {
        let mut workers = self.desktop_workers.write();
        let created_at = workers
            .get(&worker.client_id)
            .map_or(worker.created_at, |existing| existing.created_at);
        let mut stored = worker.clone();
        stored.created_at = created_at;
        workers.insert(worker.client_id.clone(), stored);
        Ok(())
    }

    async fn get_desktop_worker(&self, client_id: &str) -> ConductorResult<Option<DesktopWorker>> {
        Ok(self.desktop_workers.read().get(client_id).cloned())
    }

    async fn delete_desktop_worker(&self, client_id: &str) -> ConductorResult<bool> {
        Ok(self.desktop_workers.write().remove(client_id).is_some())
    }

    async fn list_desktop_workers(&self) -> ConductorResult<Vec<DesktopWorker>> {
        let mut workers: Vec<DesktopWorker> =
            self.desktop_workers.read().values().cloned().collect();
        workers.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(workers)
    }
}
