use crate::JsonMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a [`HelpRequest`]. Every state except `Pending` is terminal
/// and only one of them can ever apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelpStatus {
    /// Waiting for an answer.
    Pending,
    /// Answered by a human.
    Responded,
    /// Nobody answered in time.
    Timeout,
    /// Withdrawn by the worker or the orchestrator.
    Cancelled,
}

impl HelpStatus {
    /// Anything but `Pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HelpStatus::Pending)
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HelpStatus::Pending => "pending",
            HelpStatus::Responded => "responded",
            HelpStatus::Timeout => "timeout",
            HelpStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for HelpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HelpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HelpStatus::Pending),
            "responded" => Ok(HelpStatus::Responded),
            "timeout" => Ok(HelpStatus::Timeout),
            "cancelled" => Ok(HelpStatus::Cancelled),
            other => Err(format!("unknown help status '{other}'")),
        }
    }
}

/// Where an answer came from: the dashboard, or a named gateway channel.
///
/// Serialized as a plain string: `"ui"` or the channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResponseSource {
    /// The dashboard.
    Ui,
    /// A gateway channel, by name.
    Channel(String),
}

impl From<String> for ResponseSource {
    fn from(s: String) -> Self {
        if s.is_empty() || s.eq_ignore_ascii_case("ui") {
            ResponseSource::Ui
        } else {
            ResponseSource::Channel(s)
        }
    }
}

impl From<ResponseSource> for String {
    fn from(source: ResponseSource) -> Self {
        match source {
            ResponseSource::Ui => "ui".to_string(),
            ResponseSource::Channel(name) => name,
        }
    }
}

impl std::fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseSource::Ui => f.write_str("ui"),
            ResponseSource::Channel(name) => f.write_str(name),
        }
    }
}

/// A single question put to a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpQuestion {
    /// Question text shown to the human.
    pub question: String,
    /// Short label rendered above the question (e.g. as a chat header).
    #[serde(default)]
    pub header: Option<String>,
    /// Suggested answers; empty means free text.
    #[serde(default)]
    pub options: Vec<String>,
    /// Whether several options may be picked.
    #[serde(default)]
    pub multi_select: bool,
}

impl HelpQuestion {
    /// A free-text question with no header or options.
    pub fn text(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            header: None,
            options: Vec::new(),
            multi_select: false,
        }
    }
}

/// A worker's request for human input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpRequest {
    /// Caller-chosen or generated id.
    pub request_id: String,
    /// Task the worker was running when it asked.
    pub task_id: String,
    /// Worker waiting for the answer.
    pub worker_id: String,
    /// Questions, answered together.
    pub questions: Vec<HelpQuestion>,
    /// Extra context shown next to the questions.
    #[serde(default)]
    pub context: Option<Value>,
    /// Seconds to wait before timing out.
    pub timeout_seconds: f64,
    /// Current state; see [`HelpStatus`].
    pub status: HelpStatus,
    /// Answers keyed by question text, once responded.
    #[serde(default)]
    pub answers: Option<JsonMap>,
    /// Who answered.
    #[serde(default)]
    pub response_source: Option<ResponseSource>,
    /// Gateway channel the questions were posted to.
    #[serde(default)]
    pub channel: Option<String>,
    /// Chat the questions were posted in.
    #[serde(default)]
    pub chat_id: Option<Value>,
    /// Id of the outbound channel message, so it can be edited once answered.
    #[serde(default)]
    pub message_id: Option<String>,
    /// When the request was raised.
    pub created_at: DateTime<Utc>,
    /// When the request left `pending`.
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HelpRequest {
    /// Still waiting for an answer.
    pub fn is_pending(&self) -> bool {
        self.status == HelpStatus::Pending
    }

    /// Time left before the request expires, clamped at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        let total = timeout_duration(self.timeout_seconds);
        let elapsed = (now - self.created_at).to_std().unwrap_or_default();
        total.saturating_sub(elapsed)
    }

    /// Compare-and-set from `Pending` to a terminal state.
    ///
    /// Returns `false` and leaves the request untouched when it is no longer
    /// pending.
    pub fn resolve(
        &mut self,
        status: HelpStatus,
        answers: Option<JsonMap>,
        source: Option<ResponseSource>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        if !self.is_pending() {
            return false;
        }
        self.status = status;
        self.answers = answers;
        self.response_source = source;
        self.resolved_at = Some(Utc::now());
        true
    }
}

/// Convert a fractional, possibly garbage, second count into a timer length.
pub fn timeout_duration(seconds: f64) -> std::time::Duration {
    if seconds.is_finite() && seconds > 0.0 {
        std::time::Duration::try_from_secs_f64(seconds).unwrap_or(std::time::Duration::MAX)
    } else {
        std::time::Duration::ZERO
    }
}
