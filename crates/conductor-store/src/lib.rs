//! Durable storage for Conductor.
//!
//! The orchestrator keeps its authoritative state in memory and mirrors it
//! through the repository traits defined here. Two implementations are
//! provided: [`SqliteStore`] for real deployments and [`MemoryStore`] for tests
//! and ephemeral runs. Both implement the same claim semantics for due
//! schedules, so several orchestrator replicas sharing one database never fire
//! the same schedule twice.
//!
//! # Main types
//!
//! - [`TaskRepository`], [`ScheduleRepository`], [`HelpRepository`],
//!   [`ConnectionRepository`], [`DesktopWorkerRepository`]: Per-entity
//!   async repository traits.
//! - [`Repositories`]: One handle per trait, built from any full store.
//! - [`SqliteStore`]: rusqlite-backed store; schedule claims advance the run atomically.
//! - [`MemoryStore`]: In-memory store with the same semantics.

/// In-memory store.
pub mod memory;
/// Repository traits.
pub mod repository;
/// Schema setup and connection helpers.
pub mod schema;
/// SQLite store.
pub mod sqlite;

pub use memory::MemoryStore;
pub use repository::{
    ClaimRequest, ConnectionRepository, DesktopWorkerRepository, HelpRepository, Repositories,
    ScheduleRepository, TaskRepository,
};
pub use sqlite::SqliteStore;
