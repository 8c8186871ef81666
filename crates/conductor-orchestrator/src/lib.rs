//! Agent-fleet orchestration for Conductor.
//!
//! Tracks connected workers, supervisors and gateways, drives every task
//! through its lifecycle, fires recurring schedules and brokers
//! human-in-the-loop help requests. All interaction happens over the
//! message bus; state is mirrored to the store so a restarted instance
//! picks up where it left off.
//!
//! # Main types
//!
//! - [`Orchestrator`]: One wired instance; `run` serves until shutdown.
//! - [`Dispatcher`]: Routes decoded bus messages to their handlers.
//! - [`Registry`]: Live roster of clients and their idle/busy status.
//! - [`TaskManager`]: Task state machine with write-through persistence.
//! - [`Delegator`]: Assigns pending tasks to idle executors.
//! - [`HelpRequestManager`]: Pending questions, timeouts and answers.
//! - [`SchedulerService`]: Claims due schedules and handles their outcomes.
//! - [`OrchestratorConfig`]: Tunables with serde defaults.

/// Orchestrator configuration.
pub mod config;
/// Task delegation and client eviction.
pub mod delegate;
/// Inbound message routing.
pub mod dispatcher;
/// Component wiring and the serve loop.
pub mod engine;
/// Human-in-the-loop help requests.
pub mod help;
/// Outbound publishing.
pub mod outbox;
/// Connected client registry.
pub mod registry;
/// Recurring schedule execution.
pub mod scheduler;
/// Task lifecycle management.
pub mod task_manager;

pub use config::{DesktopWorkerSeed, OrchestratorConfig};
pub use delegate::{Delegation, Delegator};
pub use dispatcher::{durable_subjects, Dispatcher};
pub use engine::Orchestrator;
pub use help::{HelpNotifier, HelpRequestManager, NewHelpRequest};
pub use outbox::Outbox;
pub use registry::{HeartbeatOutcome, HeartbeatUpdate, RegisterInput, Registry};
pub use scheduler::SchedulerService;
pub use task_manager::{Completion, NewTask, TaskManager, Transition};
