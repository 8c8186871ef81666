use chrono::{DateTime, Utc};
use conductor_core::{
    ClientType, ConductorResult, ScheduledTask, Subjects, Task, TaskSource, TaskStatus,
};
use conductor_store::{ClaimRequest, ScheduleRepository};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::delegate::{Delegation, Delegator};
use crate::outbox::Outbox;
use crate::registry::Registry;
use crate::task_manager::{NewTask, TaskManager};

/// Longest result excerpt put into a completion notification.
const NOTIFY_EXCERPT_CHARS: usize = 3000;

/// Fires due schedules and runs the follow-up hooks of scheduled tasks.
///
/// Replicas share the schedule table; each tick claims a disjoint set of due
/// schedules through [`ScheduleRepository::claim_due`], which advances them in
/// the same transaction, so a schedule never fires twice for the same slot.
/// Firing happens after the claim; a crash while firing loses that run
/// rather than repeating it.
pub struct SchedulerService {
    schedules: Arc<dyn ScheduleRepository>,
    tasks: Arc<TaskManager>,
    delegator: Arc<Delegator>,
    registry: Arc<Registry>,
    outbox: Arc<Outbox>,
    subjects: Subjects,
    instance_id: String,
    batch: usize,
    tick_interval: Duration,
    max_retries: u32,
}

impl SchedulerService {
    /// Wire a scheduler over the shared task manager and delegator.
    pub fn new(
        config: &OrchestratorConfig,
        schedules: Arc<dyn ScheduleRepository>,
        tasks: Arc<TaskManager>,
        delegator: Arc<Delegator>,
        registry: Arc<Registry>,
        outbox: Arc<Outbox>,
    ) -> Self {
        Self {
            schedules,
            tasks,
            delegator,
            registry,
            outbox,
            subjects: config.subjects(),
            instance_id: config.instance_id.clone(),
            batch: config.claim_batch.max(1),
            tick_interval: config.tick_interval(),
            max_retries: config.self_healing_max_retries,
        }
    }

    /// Start the tick loop. It stops when `shutdown` flips to `true` or its
    /// sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                instance_id = %self.instance_id,
                tick_secs = self.tick_interval.as_secs(),
                "Scheduler started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(Utc::now()).await {
                            warn!(error = %e, "Scheduler tick failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(instance_id = %self.instance_id, "Scheduler stopped");
        })
    }

    /// Claim and fire every schedule due at `now`. Returns the claimed
    /// schedules with their run already counted.
    pub async fn tick(&self, now: DateTime<Utc>) -> ConductorResult<Vec<ScheduledTask>> {
        let claimed = self
            .schedules
            .claim_due(&ClaimRequest {
                owner: self.instance_id.clone(),
                now,
                limit: self.batch,
            })
            .await?;
        if claimed.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = claimed.len(), "Claimed due schedules");

        for schedule in &claimed {
            let tasks = self.fire(schedule).await;
            info!(
                schedule_id = %schedule.schedule_id,
                run_count = schedule.run_count,
                tasks = tasks.len(),
                enabled = schedule.enabled,
                next_run_at = ?schedule.next_run_at,
                "Schedule fired"
            );
        }
        Ok(claimed)
    }

    /// Create and delegate one task per parallel worker slot.
    async fn fire(&self, schedule: &ScheduledTask) -> Vec<Task> {
        let target = schedule.target().unwrap_or(ClientType::Worker);
        let mut created = Vec::with_capacity(schedule.parallel_workers as usize);
        for slot in 0..schedule.parallel_workers.max(1) {
            let mut new = NewTask::new(schedule.prompt.clone(), TaskSource::Scheduler);
            new.options = schedule.options.clone();
            if let Some(url) = &schedule.start_url {
                new.options.insert("start_url".into(), json!(url));
            }
            new.scheduled_task_id = Some(schedule.schedule_id.clone());
            new.source_metadata
                .insert("schedule_name".into(), json!(schedule.name));
            new.source_metadata
                .insert("run".into(), json!(schedule.run_count));
            if schedule.parallel_workers > 1 {
                new.source_metadata.insert("slot".into(), json!(slot));
            }

            let task = self.tasks.create(new).await;
            self.delegator.delegate(&task.task_id, target).await;
            created.push(task);
        }
        created
    }

    /// Hooks run once, after the first terminal transition of a task.
    pub async fn on_task_finished(&self, task: &Task) {
        let Some(schedule_id) = task.scheduled_task_id.as_deref() else {
            return;
        };
        if task.source == TaskSource::Optimizer {
            debug!(task_id = %task.task_id, schedule_id, "Optimizer task finished");
            return;
        }
        let schedule = match self.schedules.get_schedule(schedule_id).await {
            Ok(Some(schedule)) if !schedule.deleted => schedule,
            Ok(_) => return,
            Err(e) => {
                warn!(schedule_id, error = %e, "Failed to load schedule for completion hooks");
                return;
            }
        };

        if schedule.notify_on_complete {
            self.notify(&schedule, task).await;
        }
        if task.status == TaskStatus::Failed && schedule.self_healing {
            self.retry(&schedule, task).await;
        }
        if schedule.learning_allowed() {
            self.optimize(&schedule, task).await;
        }
    }

    async fn notify(&self, schedule: &ScheduledTask, task: &Task) {
        let outcome = if task.status == TaskStatus::Completed {
            "completed"
        } else {
            "failed"
        };
        let excerpt: String = task
            .result_text()
            .unwrap_or_default()
            .chars()
            .take(NOTIFY_EXCERPT_CHARS)
            .collect();
        let text = format!("Scheduled task '{}' {outcome}:\n{excerpt}", schedule.name);
        let gateways = self.registry.list_by_type(ClientType::Gateway);
        debug!(schedule_id = %schedule.schedule_id, gateways = gateways.len(), "Sending completion notice");
        self.outbox.notify_gateways(&gateways, &text).await;
    }

    async fn retry(&self, schedule: &ScheduledTask, failed: &Task) {
        if failed.retry_count >= self.max_retries {
            info!(
                task_id = %failed.task_id,
                schedule_id = %schedule.schedule_id,
                retries = failed.retry_count,
                "Self-healing retries exhausted"
            );
            return;
        }
        let mut new = NewTask::new(failed.prompt.clone(), TaskSource::Scheduler);
        new.options = failed.options.clone();
        new.source_metadata = failed.source_metadata.clone();
        new.source_metadata
            .insert("retry_of".into(), json!(failed.task_id));
        new.scheduled_task_id = Some(schedule.schedule_id.clone());
        new.retry_count = failed.retry_count + 1;

        let retry = self.tasks.create(new).await;
        info!(
            task_id = %retry.task_id,
            retry_of = %failed.task_id,
            retry_count = retry.retry_count,
            "Self-healing retry created"
        );
        let target = schedule.target().unwrap_or(ClientType::Worker);
        self.delegator.delegate(&retry.task_id, target).await;
    }

    async fn optimize(&self, schedule: &ScheduledTask, finished: &Task) {
        let count = match self
            .schedules
            .increment_learning_runs(&schedule.schedule_id)
            .await
        {
            Ok(Some(count)) => count,
            Ok(None) => return,
            Err(e) => {
                warn!(schedule_id = %schedule.schedule_id, error = %e, "Failed to count learning run");
                return;
            }
        };
        // Another replica may have taken the last slot since we loaded it.
        if schedule
            .self_learning_max_runs
            .is_some_and(|max| count > max)
        {
            return;
        }

        let mut new = NewTask::new(self.optimizer_prompt(schedule, finished), TaskSource::Optimizer);
        new.options.insert("schedule_id".into(), json!(schedule.schedule_id));
        new.source_metadata
            .insert("optimizes_task_id".into(), json!(finished.task_id));
        new.scheduled_task_id = Some(schedule.schedule_id.clone());

        let task = self.tasks.create(new).await;
        info!(
            task_id = %task.task_id,
            schedule_id = %schedule.schedule_id,
            learning_run = count,
            "Optimizer task created"
        );
        if self.delegator.delegate(&task.task_id, ClientType::Supervisor).await == Delegation::NoExecutor {
            info!(task_id = %task.task_id, "No idle supervisor, optimizer task left pending");
        }
    }

    fn optimizer_prompt(&self, schedule: &ScheduledTask, finished: &Task) -> String {
        let result = finished
            .result
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();
        format!(
            "Review the latest run of scheduled task '{name}' (schedule_id: {id}) and refine its prompt.\n\n\
             Current prompt:\n{prompt}\n\n\
             Latest run ({status}):\n{result}\n\n\
             If the prompt can be improved, send the refined version to {subject} as \
             {{\"schedule_id\": \"{id}\", \"prompt\": \"...\"}}.",
            name = schedule.name,
            id = schedule.schedule_id,
            prompt = schedule.prompt,
            status = finished.status,
            subject = self.subjects.schedules_api("update"),
        )
    }
}
