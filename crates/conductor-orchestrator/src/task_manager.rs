use conductor_core::{new_id, ConductorResult, JsonMap, Task, TaskMessage, TaskSource, TaskStatus};
use conductor_store::TaskRepository;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parameters for [`TaskManager::create`].
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Caller-chosen id; a fresh one is generated when absent.
    pub task_id: Option<String>,
    /// Instruction text for the executor.
    pub prompt: String,
    /// Free-form executor options, passed through unchanged.
    pub options: JsonMap,
    /// Where the task came from.
    pub source: TaskSource,
    /// Reply routing for the source (channel, chat id, request id).
    pub source_metadata: JsonMap,
    /// Owning schedule, for tasks fired by the scheduler.
    pub scheduled_task_id: Option<String>,
    /// Self-healing retries already spent on this prompt.
    pub retry_count: u32,
}

impl NewTask {
    /// A pending task with empty options and metadata.
    pub fn new(prompt: impl Into<String>, source: TaskSource) -> Self {
        Self {
            task_id: None,
            prompt: prompt.into(),
            options: JsonMap::new(),
            source,
            source_metadata: JsonMap::new(),
            scheduled_task_id: None,
            retry_count: 0,
        }
    }
}

/// Result of a non-terminal state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The task moved; carries the new state.
    Applied(Task),
    /// No task with that id, in memory or in the store.
    NotFound,
    /// The task was not in the required state; nothing changed.
    Conflict { current: TaskStatus },
}

/// Result of a terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// First terminal transition; follow-up hooks should run.
    Applied(Task),
    /// The task had already finished. The stored task is returned unchanged.
    AlreadyTerminal(Task),
    /// No task with that id, in memory or in the store.
    NotFound,
}

/// Authoritative task state machine.
///
/// All transitions are compare-and-set under one lock, so concurrent or
/// redelivered events cannot move a task backwards. With a repository
/// configured, every mutation is mirrored before the call returns; mirror
/// failures are logged and the manager keeps working in memory.
///
/// The repository is also read through before every mutation: a task that
/// another instance created or advanced is pulled in when the stored
/// version is newer than the local one.
pub struct TaskManager {
    tasks: RwLock<HashMap<String, Task>>,
    repo: Option<Arc<dyn TaskRepository>>,
}

impl TaskManager {
    /// A manager that mirrors to `repo` when one is given.
    pub fn new(repo: Option<Arc<dyn TaskRepository>>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            repo,
        }
    }

    /// Create a pending task. Re-submitting an existing id returns the stored
    /// task untouched.
    pub async fn create(&self, new: NewTask) -> Task {
        let task_id = new.task_id.unwrap_or_else(new_id);
        let task = {
            let mut tasks = self.tasks.write();
            if let Some(existing) = tasks.get(&task_id) {
                debug!(task_id = %task_id, "Task id already known, keeping existing task");
                return existing.clone();
            }
            let mut task = Task::new(task_id.clone(), new.prompt, new.source);
            task.options = new.options;
            task.source_metadata = new.source_metadata;
            task.scheduled_task_id = new.scheduled_task_id;
            task.retry_count = new.retry_count;
            tasks.insert(task_id, task.clone());
            task
        };
        info!(task_id = %task.task_id, source = %task.source, "Task created");
        self.mirror(&task).await;
        task
    }

    /// `pending → assigned`.
    pub async fn assign(&self, task_id: &str, worker_id: &str) -> Transition {
        self.transition(task_id, "assign", |task| task.assign_to(worker_id))
            .await
    }

    /// `assigned → running`.
    pub async fn start(&self, task_id: &str, session_id: Option<String>) -> Transition {
        self.transition(task_id, "start", |task| task.start(session_id))
            .await
    }

    /// `assigned → pending`, clearing the worker.
    pub async fn requeue(&self, task_id: &str) -> Transition {
        self.transition(task_id, "requeue", Task::requeue).await
    }

    /// Complete with `result`.
    pub async fn complete(&self, task_id: &str, result: Value) -> Completion {
        self.finish(task_id, TaskStatus::Completed, result).await
    }

    /// Fail with `{"error": error}` as the result.
    pub async fn fail(&self, task_id: &str, error: &str) -> Completion {
        self.finish(task_id, TaskStatus::Failed, json!({ "error": error }))
            .await
    }

    /// Append to the message history. `None` if the task is unknown.
    pub async fn append_message(&self, task_id: &str, content: Value) -> Option<TaskMessage> {
        self.refresh(task_id).await;
        let (message, snapshot) = {
            let mut tasks = self.tasks.write();
            let task = tasks.get_mut(task_id)?;
            let message = task.push_message(content);
            (message, task.clone())
        };
        self.mirror(&snapshot).await;
        Some(message)
    }

    /// In-memory snapshot of one task.
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().get(task_id).cloned()
    }

    /// Every known task, oldest first.
    pub fn all(&self) -> Vec<Task> {
        self.collect(|_| true)
    }

    /// Tasks assigned to `worker_id`, oldest first.
    pub fn by_worker(&self, worker_id: &str) -> Vec<Task> {
        self.collect(|t| t.worker_id.as_deref() == Some(worker_id))
    }

    /// Tasks currently in `status`, oldest first.
    pub fn by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.collect(|t| t.status == status)
    }

    /// Tasks fired by `schedule_id`, oldest first.
    pub fn by_schedule(&self, schedule_id: &str) -> Vec<Task> {
        self.collect(|t| t.scheduled_task_id.as_deref() == Some(schedule_id))
    }

    /// Reload non-terminal tasks from the repository. In-memory entries with
    /// a newer version are kept.
    pub async fn load_from_store(&self) -> ConductorResult<usize> {
        let Some(repo) = &self.repo else {
            return Ok(0);
        };
        let active = repo.list_active_tasks().await?;
        let mut loaded = 0;
        let mut tasks = self.tasks.write();
        for task in active {
            match tasks.get(&task.task_id) {
                Some(existing) if existing.version >= task.version => {}
                _ => {
                    tasks.insert(task.task_id.clone(), task);
                    loaded += 1;
                }
            }
        }
        info!(count = loaded, "Loaded active tasks from store");
        Ok(loaded)
    }

    async fn transition<F>(&self, task_id: &str, action: &'static str, apply: F) -> Transition
    where
        F: FnOnce(&mut Task) -> Result<(), TaskStatus>,
    {
        self.refresh(task_id).await;
        let outcome = {
            let mut tasks = self.tasks.write();
            match tasks.get_mut(task_id) {
                None => Transition::NotFound,
                Some(task) => match apply(task) {
                    Ok(()) => Transition::Applied(task.clone()),
                    Err(current) => Transition::Conflict { current },
                },
            }
        };
        match &outcome {
            Transition::Applied(task) => {
                debug!(task_id, action, status = %task.status, "Task transition applied");
                self.mirror(task).await;
            }
            Transition::Conflict { current } => {
                debug!(task_id, action, current = %current, "Task transition refused");
            }
            Transition::NotFound => debug!(task_id, action, "Transition for unknown task"),
        }
        outcome
    }

    async fn finish(&self, task_id: &str, status: TaskStatus, result: Value) -> Completion {
        self.refresh(task_id).await;
        let outcome = {
            let mut tasks = self.tasks.write();
            match tasks.get_mut(task_id) {
                None => Completion::NotFound,
                Some(task) => match task.finish(status, result) {
                    Ok(()) => Completion::Applied(task.clone()),
                    Err(_) => Completion::AlreadyTerminal(task.clone()),
                },
            }
        };
        match &outcome {
            Completion::Applied(task) => {
                info!(task_id, status = %task.status, "Task finished");
                self.mirror(task).await;
            }
            Completion::AlreadyTerminal(task) => {
                debug!(task_id, status = %task.status, "Task already finished, ignoring");
            }
            Completion::NotFound => debug!(task_id, "Completion for unknown task"),
        }
        outcome
    }

    fn collect(&self, keep: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut list: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| keep(t))
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        list
    }

    /// Adopt the stored copy of `task_id` when it is unknown locally or the
    /// stored version is newer. Store errors leave memory as it is.
    async fn refresh(&self, task_id: &str) {
        let Some(repo) = &self.repo else {
            return;
        };
        let stored = match repo.get_task(task_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(e) => {
                warn!(task_id, error = %e, "Failed to read task from store, using memory");
                return;
            }
        };
        let mut tasks = self.tasks.write();
        match tasks.get(task_id) {
            Some(existing) if existing.version >= stored.version => {}
            _ => {
                debug!(task_id, version = stored.version, "Adopted newer task from store");
                tasks.insert(task_id.to_string(), stored);
            }
        }
    }

    async fn mirror(&self, task: &Task) {
        if let Some(repo) = &self.repo {
            if let Err(e) = repo.save_task(task).await {
                warn!(task_id = %task.task_id, error = %e, "Failed to persist task, continuing in memory");
            }
        }
    }
}
