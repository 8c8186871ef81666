use crate::JsonMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Lifecycle state of a [`Task`].
///
/// `Pending → Assigned → Running → {Completed | Failed}`. The two terminal
/// states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, waiting for an executor.
    Pending,
    /// Reserved by an executor that has not started yet.
    Assigned,
    /// The executor reported it started.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Who asked for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    /// Submitted over the API.
    #[default]
    Api,
    /// A chat message from a gateway channel.
    Gateway,
    /// Fired by a schedule.
    Scheduler,
    /// Prompt refinement for a self-learning schedule.
    Optimizer,
}

impl TaskSource {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Api => "api",
            TaskSource::Gateway => "gateway",
            TaskSource::Scheduler => "scheduler",
            TaskSource::Optimizer => "optimizer",
        }
    }
}

impl std::fmt::Display for TaskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(TaskSource::Api),
            "gateway" => Ok(TaskSource::Gateway),
            "scheduler" => Ok(TaskSource::Scheduler),
            "optimizer" => Ok(TaskSource::Optimizer),
            other => Err(format!("unknown task source '{other}'")),
        }
    }
}

/// One entry of a task's ordered message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Per-task sequence number, starting at 1.
    pub seq: u64,
    /// Progress payload as reported.
    pub content: Value,
    /// When the message was appended.
    pub timestamp: DateTime<Utc>,
}

/// A unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Caller-chosen or generated id.
    pub task_id: String,
    /// Instruction text.
    pub prompt: String,
    /// Executor options, passed through.
    #[serde(default)]
    pub options: JsonMap,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Assigned executor.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Executor session reported on start.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Output or `{"error": ..}`, once finished.
    #[serde(default)]
    pub result: Option<Value>,
    /// Origin of the task.
    #[serde(default)]
    pub source: TaskSource,
    /// Reply routing for the source.
    #[serde(default)]
    pub source_metadata: JsonMap,
    /// Schedule that spawned this task, for scheduler and optimizer tasks.
    #[serde(default)]
    pub scheduled_task_id: Option<String>,
    /// How many self-healing retries preceded this task.
    #[serde(default)]
    pub retry_count: u32,
    /// Progress history in arrival order.
    #[serde(default)]
    pub messages: Vec<TaskMessage>,
    /// Bumped on every mutation; storage keeps the highest version it saw.
    #[serde(default)]
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
    /// Set on the terminal transition.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A pending task at version 1.
    pub fn new(task_id: impl Into<String>, prompt: impl Into<String>, source: TaskSource) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            prompt: prompt.into(),
            options: JsonMap::new(),
            status: TaskStatus::Pending,
            worker_id: None,
            session_id: None,
            result: None,
            source,
            source_metadata: JsonMap::new(),
            scheduled_task_id: None,
            retry_count: 0,
            messages: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Gateway channel this task should report back to, if any.
    pub fn channel(&self) -> Option<&str> {
        self.source_metadata
            .get("channel")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
    }

    /// Chat correlation id inside the gateway channel.
    pub fn chat_id(&self) -> Option<&Value> {
        self.source_metadata.get("chat_id").filter(|v| !v.is_null())
    }

    /// Next message sequence number.
    pub fn next_seq(&self) -> u64 {
        self.messages.last().map_or(1, |m| m.seq + 1)
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// `pending → assigned`. On refusal returns the current status.
    pub fn assign_to(&mut self, worker_id: &str) -> Result<(), TaskStatus> {
        if self.status != TaskStatus::Pending {
            return Err(self.status);
        }
        self.status = TaskStatus::Assigned;
        self.worker_id = Some(worker_id.to_string());
        self.touch();
        Ok(())
    }

    /// `assigned → running`.
    pub fn start(&mut self, session_id: Option<String>) -> Result<(), TaskStatus> {
        if self.status != TaskStatus::Assigned {
            return Err(self.status);
        }
        self.status = TaskStatus::Running;
        if session_id.is_some() {
            self.session_id = session_id;
        }
        self.touch();
        Ok(())
    }

    /// `assigned → pending`, dropping the worker. Used when an assignment
    /// could not be confirmed.
    pub fn requeue(&mut self) -> Result<(), TaskStatus> {
        if self.status != TaskStatus::Assigned {
            return Err(self.status);
        }
        self.status = TaskStatus::Pending;
        self.worker_id = None;
        self.touch();
        Ok(())
    }

    /// Any non-terminal state to `completed` or `failed`.
    pub fn finish(&mut self, status: TaskStatus, result: Value) -> Result<(), TaskStatus> {
        debug_assert!(status.is_terminal());
        if self.is_terminal() {
            return Err(self.status);
        }
        self.status = status;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Append to the message history and return the stored entry.
    pub fn push_message(&mut self, content: Value) -> TaskMessage {
        let message = TaskMessage {
            seq: self.next_seq(),
            content,
            timestamp: Utc::now(),
        };
        self.messages.push(message.clone());
        self.touch();
        message
    }

    /// Human-readable text of the result payload.
    ///
    /// Plain strings are returned as-is; `{"result": ...}` objects are
    /// unwrapped one level; `{"error": ...}` wrappers yield the error text;
    /// anything else is rendered as JSON.
    pub fn result_text(&self) -> Option<String> {
        self.result.as_ref().map(extract_text)
    }
}

fn extract_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            if let Some(inner) = map.get("result") {
                return match inner {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
            }
            if let Some(Value::String(err)) = map.get("error") {
                return err.clone();
            }
            value.to_string()
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_happy_path_transitions() {
        let mut task = Task::new("t1", "do it", TaskSource::Api);
        assert_eq!(task.status, TaskStatus::Pending);
        task.assign_to("w1").unwrap();
        assert_eq!(task.worker_id.as_deref(), Some("w1"));
        task.start(Some("s1".into())).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        task.finish(TaskStatus::Completed, json!("ok")).unwrap();
        assert!(task.is_terminal());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_illegal_transitions_report_current_status() {
        let mut task = Task::new("t1", "x", TaskSource::Api);
        assert_eq!(task.start(None), Err(TaskStatus::Pending));
        assert_eq!(task.requeue(), Err(TaskStatus::Pending));
        task.assign_to("w1").unwrap();
        assert_eq!(task.assign_to("w2"), Err(TaskStatus::Assigned));
        assert_eq!(task.worker_id.as_deref(), Some("w1"));
    }

    #[test]
    fn test_finish_is_final() {
        let mut task = Task::new("t1", "x", TaskSource::Api);
        task.finish(TaskStatus::Failed, json!({"error": "boom"})).unwrap();
        let version = task.version;
        assert_eq!(
            task.finish(TaskStatus::Completed, json!("late")),
            Err(TaskStatus::Failed)
        );
        assert_eq!(task.version, version);
        assert_eq!(task.result_text().as_deref(), Some("boom"));
    }

    #[test]
    fn test_message_sequence() {
        let mut task = Task::new("t1", "x", TaskSource::Api);
        assert_eq!(task.push_message(json!("a")).seq, 1);
        assert_eq!(task.push_message(json!("b")).seq, 2);
        assert_eq!(task.next_seq(), 3);
    }

    #[test]
    fn test_result_text_extraction() {
        let mut task = Task::new("t1", "x", TaskSource::Api);
        task.result = Some(json!("Done"));
        assert_eq!(task.result_text().as_deref(), Some("Done"));
        task.result = Some(json!({"result": "Nested"}));
        assert_eq!(task.result_text().as_deref(), Some("Nested"));
        task.result = Some(json!({"result": {"rows": 2}}));
        assert_eq!(task.result_text().as_deref(), Some(r#"{"rows":2}"#));
        task.result = Some(json!(42));
        assert_eq!(task.result_text().as_deref(), Some("42"));
    }

    #[test]
    fn test_channel_accessors() {
        let mut task = Task::new("t1", "x", TaskSource::Gateway);
        assert!(task.channel().is_none());
        task.source_metadata.insert("channel".into(), json!("telegram"));
        task.source_metadata.insert("chat_id".into(), json!(123));
        assert_eq!(task.channel(), Some("telegram"));
        assert_eq!(task.chat_id(), Some(&json!(123)));
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(serde_json::to_string(&TaskStatus::Assigned).unwrap(), "\"assigned\"");
        assert_eq!("failed".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
        assert_eq!(TaskSource::Optimizer.to_string(), "optimizer");
    }
}
