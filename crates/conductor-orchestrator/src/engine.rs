use conductor_bus::MessageBus;
use conductor_core::{ConductorResult, Subjects};
use conductor_store::Repositories;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::delegate::Delegator;
use crate::dispatcher::Dispatcher;
use crate::help::HelpRequestManager;
use crate::outbox::Outbox;
use crate::registry::{RegisterInput, Registry};
use crate::scheduler::SchedulerService;
use crate::task_manager::TaskManager;

/// One orchestrator instance: every component, wired together.
///
/// Components are constructed once here and shared as `Arc`s; nothing is
/// global. Several instances may run against the same bus and store.
pub struct Orchestrator {
    config: OrchestratorConfig,
    subjects: Subjects,
    bus: Arc<dyn MessageBus>,
    repos: Repositories,
    registry: Arc<Registry>,
    tasks: Arc<TaskManager>,
    help: Arc<HelpRequestManager>,
    outbox: Arc<Outbox>,
    delegator: Arc<Delegator>,
    scheduler: Arc<SchedulerService>,
}

impl Orchestrator {
    /// Wire every component over one bus and store.
    pub fn new(config: OrchestratorConfig, bus: Arc<dyn MessageBus>, repos: Repositories) -> Arc<Self> {
        let subjects = config.subjects();
        let outbox = Arc::new(Outbox::new(bus.clone(), subjects.clone()));
        let registry = Arc::new(Registry::new());
        let tasks = Arc::new(TaskManager::new(Some(repos.tasks.clone())));
        let help = HelpRequestManager::new(outbox.clone(), Some(repos.help.clone()));
        let delegator = Arc::new(Delegator::new(
            registry.clone(),
            tasks.clone(),
            help.clone(),
            outbox.clone(),
            bus.clone(),
            subjects.clone(),
            Some(repos.connections.clone()),
            config.assignment_timeout(),
        ));
        let scheduler = Arc::new(SchedulerService::new(
            &config,
            repos.schedules.clone(),
            tasks.clone(),
            delegator.clone(),
            registry.clone(),
            outbox.clone(),
        ));

        Arc::new(Self {
            config,
            subjects,
            bus,
            repos,
            registry,
            tasks,
            help,
            outbox,
            delegator,
            scheduler,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Subject builder for this instance's prefix.
    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    /// The bus this instance talks over.
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Store handles.
    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    /// Client roster.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Task lifecycle manager.
    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Help request manager.
    pub fn help(&self) -> &Arc<HelpRequestManager> {
        &self.help
    }

    /// Outbound publisher.
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Task delegator.
    pub fn delegator(&self) -> &Arc<Delegator> {
        &self.delegator
    }

    /// Schedule runner.
    pub fn scheduler(&self) -> &Arc<SchedulerService> {
        &self.scheduler
    }

    /// Restore state after a restart.
    ///
    /// Reloads active tasks and pending help requests, upserts the desktop
    /// workers named in the configuration and registers every stored desktop
    /// worker. Store failures are logged; the instance starts regardless.
    pub async fn bootstrap(&self) {
        if let Err(e) = self.tasks.load_from_store().await {
            warn!(error = %e, "Could not reload tasks");
        }
        if let Err(e) = self.help.load_from_store().await {
            warn!(error = %e, "Could not reload help requests");
        }

        for seed in &self.config.desktop_workers {
            let worker = seed.to_desktop_worker();
            if let Err(e) = self.repos.desktop_workers.upsert_desktop_worker(&worker).await {
                warn!(client_id = %worker.client_id, error = %e, "Could not store configured desktop worker");
            }
            self.registry
                .register(RegisterInput::from(worker.to_connection()));
        }
        match self.repos.desktop_workers.list_desktop_workers().await {
            Ok(workers) => {
                for worker in &workers {
                    if self.registry.get(&worker.client_id).is_none() {
                        self.registry
                            .register(RegisterInput::from(worker.to_connection()));
                    }
                }
                info!(count = workers.len(), "Desktop workers loaded");
            }
            Err(e) => warn!(error = %e, "Could not load desktop workers"),
        }
        self.delegator.broadcast_roster().await;
    }

    /// Bootstrap, then serve until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> ConductorResult<()> {
        self.bootstrap().await;

        let dispatcher = Dispatcher::new(self.clone());
        let mut handles = dispatcher.start(shutdown.clone()).await?;
        handles.push(self.scheduler.clone().spawn(shutdown.clone()));
        handles.push(self.spawn_stale_sweep(shutdown.clone()));
        info!(
            instance_id = %self.config.instance_id,
            prefix = %self.subjects.prefix(),
            "Orchestrator running"
        );

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!(instance_id = %self.config.instance_id, "Orchestrator stopped");
        Ok(())
    }

    /// Periodically report clients whose heartbeats stopped.
    fn spawn_stale_sweep(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let max_age = self.config.heartbeat_max_age();
        let period = Duration::from_secs(self.config.heartbeat_stale_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for conn in registry.stale(max_age) {
                            if !conn.is_desktop() {
                                warn!(
                                    client_id = %conn.client_id,
                                    client_type = %conn.client_type,
                                    last_heartbeat = %conn.last_heartbeat,
                                    "Client heartbeat is stale"
                                );
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
