//! Core types and error definitions for the Conductor orchestrator.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the unified error type, the domain entities tracked by the
//! orchestrator, the typed wire protocol spoken over the message bus, and the
//! subject naming scheme.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`Connection`]: A registered worker, supervisor or gateway client.
//! - [`Task`]: A unit of agent work and its lifecycle state.
//! - [`ScheduledTask`]: A recurring task definition.
//! - [`HelpRequest`]: A pending human-in-the-loop question set.
//! - [`InboundEvent`]: Typed decoding of every inbound bus message.
//! - [`Subjects`]: Subject builder for a configured prefix.

/// Registered client connections.
pub mod connection;
/// Human-in-the-loop help requests.
pub mod help;
/// Typed bus payloads and inbound event decoding.
pub mod protocol;
/// Recurring task definitions.
pub mod schedule;
/// Subject naming and wildcard matching.
pub mod subjects;
/// Tasks and their state machine.
pub mod task;

pub use connection::{ClientStatus, ClientType, Connection, DesktopWorker};
pub use help::{HelpQuestion, HelpRequest, HelpStatus, ResponseSource};
pub use protocol::InboundEvent;
pub use schedule::ScheduledTask;
pub use subjects::{subject_matches, Subjects};
pub use task::{Task, TaskMessage, TaskSource, TaskStatus};

use chrono::{DateTime, Utc};

// --- Error types ---

/// Top-level error type for the Conductor workspace.
///
/// Each variant corresponds to a subsystem that can produce errors. State
/// conflicts (assigning a task that is no longer pending, answering a help
/// request that already timed out) are *not* errors and never appear here;
/// they are reported as ordinary outcome values by the managers.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// The message bus is unreachable or rejected an operation.
    #[error("Bus error: {0}")]
    Bus(String),

    /// A request/reply call did not get an answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A request/reply call had nobody listening on the subject.
    #[error("No responders on subject {0}")]
    NoResponders(String),

    /// A durable repository call failed.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An inbound payload was missing fields or could not be decoded.
    #[error("Malformed payload on {subject}: {reason}")]
    Payload {
        /// Subject the payload arrived on.
        subject: String,
        /// What was wrong with it.
        reason: String,
    },

    /// An error from the orchestrator core.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Shorthand for a [`ConductorError::Payload`] error.
    pub fn payload(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Payload {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the remote side never answered, as opposed to
    /// a local failure. Used by assignment liveness probing.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::NoResponders(_))
    }
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Open key/value map used for options and metadata.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Generate a fresh random identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Convert epoch milliseconds back to a UTC timestamp.
///
/// Out-of-range values clamp to the Unix epoch.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConductorError::payload("conductor.heartbeat.worker.w1", "missing client_id");
        assert_eq!(
            err.to_string(),
            "Malformed payload on conductor.heartbeat.worker.w1: missing client_id"
        );
        assert_eq!(
            ConductorError::NoResponders("a.b".into()).to_string(),
            "No responders on subject a.b"
        );
    }

    #[test]
    fn test_is_unreachable() {
        assert!(ConductorError::Timeout("x".into()).is_unreachable());
        assert!(ConductorError::NoResponders("x".into()).is_unreachable());
        assert!(!ConductorError::Bus("x".into()).is_unreachable());
    }

    #[test]
    fn test_millis_roundtrip() {
        let now = Utc::now();
        let back = from_millis(now.timestamp_millis());
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
