//! Subject naming.
//!
//! Subjects are dot-separated token lists under a configurable prefix.
//! Entity ids are encoded positionally (`<prefix>.task.<id>.complete`).
//! Subscriptions may use `*` to match exactly one token and `>` to match one
//! or more trailing tokens.

use crate::ClientType;

/// Whether `subject` matches the (possibly wildcarded) `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    while let Some(p) = pattern_tokens.next() {
        if p == ">" {
            // Tail wildcard must be last and must consume at least one token.
            return pattern_tokens.peek().is_none() && subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(s) if p == "*" || p == s => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

/// Builds every subject the orchestrator publishes or subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    prefix: String,
}

impl Default for Subjects {
    fn default() -> Self {
        Self::new("conductor")
    }
}

impl Subjects {
    /// Subjects under `prefix`; surrounding dots are trimmed.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_matches('.').to_string(),
        }
    }

    /// First token of every subject.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn join(&self, rest: &str) -> String {
        format!("{}.{rest}", self.prefix)
    }

    /// Tokens of `subject` after the prefix, or `None` if it is foreign.
    pub fn tokens<'a>(&self, subject: &'a str) -> Option<Vec<&'a str>> {
        let rest = subject.strip_prefix(self.prefix.as_str())?.strip_prefix('.')?;
        Some(rest.split('.').collect())
    }

    // --- Registry ---

    /// `register.<type>`, request/reply.
    pub fn register(&self, client_type: ClientType) -> String {
        self.join(&format!("register.{client_type}"))
    }

    /// Wildcard over every `register.<type>`.
    pub fn register_all(&self) -> String {
        self.join("register.*")
    }

    /// `deregister`, request/reply.
    pub fn deregister(&self) -> String {
        self.join("deregister")
    }

    /// `heartbeat.<type>.<id>`.
    pub fn heartbeat(&self, client_type: ClientType, client_id: &str) -> String {
        self.join(&format!("heartbeat.{client_type}.{client_id}"))
    }

    /// Every heartbeat.
    pub fn heartbeat_all(&self) -> String {
        self.join("heartbeat.>")
    }

    // --- Tasks ---

    /// Request/reply subject used to push work to one executor.
    pub fn assignment(&self, client_type: ClientType, client_id: &str) -> String {
        self.join(&format!("{client_type}.{client_id}.task"))
    }

    /// `task.<id>.<event>` for one task.
    pub fn task_event(&self, task_id: &str, event: &str) -> String {
        self.join(&format!("task.{task_id}.{event}"))
    }

    /// `task.*.<event>` across all tasks.
    pub fn task_events(&self, event: &str) -> String {
        self.join(&format!("task.*.{event}"))
    }

    /// Every task lifecycle subject, for durable stream configuration.
    pub fn task_stream(&self) -> String {
        self.join("task.>")
    }

    /// `api.tasks.submit`, request/reply.
    pub fn task_submit(&self) -> String {
        self.join("api.tasks.submit")
    }

    // --- Gateway channels ---

    /// `gateway.<channel>.<event>`.
    pub fn gateway(&self, channel: &str, event: &str) -> String {
        self.join(&format!("gateway.{channel}.{event}"))
    }

    /// `gateway.*.<event>` across channels.
    pub fn gateway_all(&self, event: &str) -> String {
        self.join(&format!("gateway.*.{event}"))
    }

    // --- Help requests ---

    /// `help.<action>`: `request`, `respond` or `cancel`.
    pub fn help(&self, action: &str) -> String {
        self.join(&format!("help.{action}"))
    }

    /// Where the waiting worker listens for its answer.
    pub fn help_reply(&self, worker_id: &str) -> String {
        self.join(&format!("help.reply.{worker_id}"))
    }

    // --- UI fan-out ---

    /// `ui.<topic>`, published for dashboards.
    pub fn ui(&self, topic: &str) -> String {
        self.join(&format!("ui.{topic}"))
    }

    // --- Administration (request/reply) ---

    /// `api.desktop.<action>`.
    pub fn desktop_api(&self, action: &str) -> String {
        self.join(&format!("api.desktop.{action}"))
    }

    /// `api.schedules.<action>`.
    pub fn schedules_api(&self, action: &str) -> String {
        self.join(&format!("api.schedules.{action}"))
    }
}
