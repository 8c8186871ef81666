use conductor_bus::{MessageBus, MessageBusExt};
use conductor_core::protocol::{AssignmentReply, TaskAssignment};
use conductor_core::{ClientStatus, ClientType, Connection, Subjects, Task, TaskStatus};
use conductor_store::ConnectionRepository;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::help::HelpRequestManager;
use crate::outbox::Outbox;
use crate::registry::Registry;
use crate::task_manager::{TaskManager, Transition};

/// Outcome of [`Delegator::delegate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delegation {
    /// An executor accepted the task.
    Assigned {
        /// The task as assigned.
        task: Task,
        /// Executor that took it.
        client_id: String,
    },
    /// No idle executor of the requested type answered; the task is pending.
    NoExecutor,
    /// The task was unknown or not pending, so it was left alone.
    NotPending {
        /// Status found, `None` when the task was unknown.
        current: Option<TaskStatus>,
    },
}

impl Delegation {
    /// Executor id when the task was assigned.
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Delegation::Assigned { client_id, .. } => Some(client_id),
            _ => None,
        }
    }
}

/// Hands pending tasks to idle executors.
///
/// The assignment request doubles as a liveness check: an executor that
/// times out or has no responders is evicted and the next idle candidate is
/// tried.
pub struct Delegator {
    registry: Arc<Registry>,
    tasks: Arc<TaskManager>,
    help: Arc<HelpRequestManager>,
    outbox: Arc<Outbox>,
    bus: Arc<dyn MessageBus>,
    subjects: Subjects,
    connections: Option<Arc<dyn ConnectionRepository>>,
    timeout: Duration,
}

impl Delegator {
    /// Wire a delegator; `connections` drops snapshots of evicted clients.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        tasks: Arc<TaskManager>,
        help: Arc<HelpRequestManager>,
        outbox: Arc<Outbox>,
        bus: Arc<dyn MessageBus>,
        subjects: Subjects,
        connections: Option<Arc<dyn ConnectionRepository>>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            tasks,
            help,
            outbox,
            bus,
            subjects,
            connections,
            timeout,
        }
    }

    /// Assign a pending task to an idle executor of `target`.
    pub async fn delegate(&self, task_id: &str, target: ClientType) -> Delegation {
        let mut tried: HashSet<String> = HashSet::new();
        loop {
            let Some(candidate) = self.registry.reserve_idle(target, &tried) else {
                info!(task_id, target = %target, "No idle executor available, task stays pending");
                return Delegation::NoExecutor;
            };
            let client_id = candidate.client_id.clone();
            tried.insert(client_id.clone());

            let task = match self.tasks.assign(task_id, &client_id).await {
                Transition::Applied(task) => task,
                Transition::NotFound => {
                    self.registry.set_status(&client_id, ClientStatus::Idle);
                    return Delegation::NotPending { current: None };
                }
                Transition::Conflict { current } => {
                    self.registry.set_status(&client_id, ClientStatus::Idle);
                    debug!(task_id, current = %current, "Task no longer pending, not delegating");
                    return Delegation::NotPending {
                        current: Some(current),
                    };
                }
            };

            let subject = self.subjects.assignment(target, &client_id);
            let reply: Result<AssignmentReply, _> = self
                .bus
                .request_json(&subject, &TaskAssignment::from(&task), self.timeout)
                .await;

            match reply {
                Ok(reply) if reply.accepted => {
                    info!(task_id, client_id = %client_id, target = %target, "Task delegated");
                    self.outbox.task_updated(&task).await;
                    self.broadcast_roster().await;
                    return Delegation::Assigned { task, client_id };
                }
                Ok(reply) => {
                    // Refusals usually mean the executor is busy; its next
                    // heartbeat restores the real status.
                    info!(
                        task_id,
                        client_id = %client_id,
                        reason = reply.reason.as_deref().unwrap_or(""),
                        "Executor refused task"
                    );
                    self.tasks.requeue(task_id).await;
                }
                Err(e) if e.is_unreachable() => {
                    warn!(task_id, client_id = %client_id, error = %e, "Executor unreachable, evicting");
                    self.tasks.requeue(task_id).await;
                    self.evict(&client_id).await;
                }
                Err(e) => {
                    warn!(task_id, client_id = %client_id, error = %e, "Assignment request failed");
                    self.tasks.requeue(task_id).await;
                    self.registry.set_status(&client_id, ClientStatus::Idle);
                }
            }
        }
    }

    /// Remove a client and clean up after it: pending help requests are
    /// cancelled and tasks it had not started yet go back to pending.
    pub async fn evict(&self, client_id: &str) -> Option<Connection> {
        let removed = self.registry.deregister(client_id);

        let cancelled = self.help.cancel_requests_for_worker(client_id).await;
        let mut requeued = 0;
        for task in self.tasks.by_worker(client_id) {
            if task.status == TaskStatus::Assigned {
                if let Transition::Applied(task) = self.tasks.requeue(&task.task_id).await {
                    self.outbox.task_updated(&task).await;
                    requeued += 1;
                }
            }
        }
        if let Some(repo) = &self.connections {
            if let Err(e) = repo.delete_connection(client_id).await {
                warn!(client_id, error = %e, "Failed to delete connection snapshot");
            }
        }
        if removed.is_some() || cancelled > 0 || requeued > 0 {
            info!(client_id, cancelled, requeued, "Client evicted");
        }
        self.broadcast_roster().await;
        removed
    }

    /// Publish the current roster on `ui.roster`.
    pub async fn broadcast_roster(&self) {
        self.outbox.roster(&self.registry.roster()).await;
    }
}
