//! Typed payloads exchanged over the bus.
//!
//! Every inbound message is decoded at the boundary into one
//! [`InboundEvent`] variant chosen by its subject; raw JSON maps never travel
//! further into the orchestrator.

use crate::connection::{ClientStatus, ClientType, Connection, DesktopWorker};
use crate::help::{HelpQuestion, ResponseSource};
use crate::schedule::{SchedulePatch, ScheduledTask};
use crate::subjects::Subjects;
use crate::task::{Task, TaskSource};
use crate::{ConductorError, ConductorResult, JsonMap};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// --- Inbound payloads ---

/// `register.<type>` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    /// Id the client will heartbeat under.
    pub client_id: String,
    /// Initial status; idle when absent.
    #[serde(default)]
    pub status: Option<ClientStatus>,
    /// Capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Remote desktop viewer URL.
    #[serde(default)]
    pub novnc_url: Option<String>,
    /// Extra client data, kept on the connection.
    #[serde(default)]
    pub metadata: JsonMap,
}

/// `heartbeat.<type>.<id>` body. The id falls back to the subject token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Falls back to the last subject token when empty.
    #[serde(default)]
    pub client_id: String,
    /// Only heartbeats that carry a type may auto-register an unknown client.
    #[serde(default)]
    pub client_type: Option<ClientType>,
    /// Reported status; absent keeps the current one.
    #[serde(default)]
    pub status: Option<ClientStatus>,
    /// Updated desktop viewer URL.
    #[serde(default)]
    pub novnc_url: Option<String>,
}

/// `deregister` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterPayload {
    /// Client to remove.
    pub client_id: String,
}

/// `api.tasks.submit` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmitPayload {
    /// Instruction text.
    pub prompt: String,
    /// Executor options, passed through.
    #[serde(default)]
    pub options: JsonMap,
    /// Caller-chosen id; resubmitting it is a no-op.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Executor type to delegate to; defaults to worker.
    #[serde(default)]
    pub target: Option<ClientType>,
    /// Reply routing, echoed back to the executor.
    #[serde(default)]
    pub source_metadata: JsonMap,
}

/// `task.<id>.started` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStartedPayload {
    /// Executor session, for later correlation.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Reporting executor.
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// `task.<id>.message` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMessagePayload {
    /// Progress payload appended to the history.
    #[serde(default)]
    pub message: Value,
}

/// `task.<id>.complete` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCompletePayload {
    /// Executor output.
    #[serde(default)]
    pub result: Value,
    /// Reporting executor.
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// `task.<id>.error` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorPayload {
    /// Failure description.
    pub error: String,
    /// Reporting executor.
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// `gateway.<channel>.inbound` body: a human message to turn into a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInboundPayload {
    /// Chat the message came from; echoed in the reply.
    pub chat_id: Value,
    /// Message text.
    #[serde(default)]
    pub text: Option<String>,
    /// Accepted when `text` is absent.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Executor options for the created task.
    #[serde(default)]
    pub options: JsonMap,
    #[serde(default)]
    pub user: Option<String>,
}

impl GatewayInboundPayload {
    /// The prompt text: `text`, falling back to `prompt`, ignoring blanks.
    pub fn prompt_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.prompt.as_deref().filter(|p| !p.trim().is_empty()))
    }
}

/// `help.request` body sent by a worker or supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpRequestPayload {
    /// Caller-chosen id; a redelivered request keeps the first one.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Task the caller is working on.
    pub task_id: String,
    /// Worker or supervisor waiting for the answer.
    pub worker_id: String,
    /// Questions to ask.
    pub questions: Vec<HelpQuestion>,
    /// Extra context shown with the questions.
    #[serde(default)]
    pub context: Option<Value>,
    /// Seconds to wait; the configured default when absent.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

/// `help.respond` body sent by the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpRespondPayload {
    /// Request being answered.
    pub request_id: String,
    /// Answers keyed by question text.
    #[serde(default)]
    pub answers: JsonMap,
    /// Defaults to the UI.
    #[serde(default)]
    pub source: Option<ResponseSource>,
}

/// `help.cancel` body: one request, or everything a worker has open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelpCancelPayload {
    /// Cancel this request.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Cancel every pending request of this worker.
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// `gateway.<channel>.help_posted`: the adapter reports where it posted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpPostedPayload {
    /// Request the questions belong to.
    pub request_id: String,
    /// Channel message id, numbers accepted.
    #[serde(deserialize_with = "id_string")]
    pub message_id: String,
    /// Chat the message was posted in.
    #[serde(default)]
    pub chat_id: Option<Value>,
}

/// `gateway.<channel>.callback`: a reply (e.g. button tap) to a posted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCallbackPayload {
    /// Message the reply belongs to.
    #[serde(deserialize_with = "id_string")]
    pub message_id: String,
    /// Answers keyed by question text.
    #[serde(default)]
    pub answers: JsonMap,
}

/// Body of `api.schedules.create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    /// Display name.
    pub name: String,
    /// Instruction each run delegates.
    pub prompt: String,
    /// Page the executor opens first.
    #[serde(default)]
    pub start_url: Option<String>,
    /// Seconds between runs when no cron expression is set.
    #[serde(default)]
    pub interval_seconds: u64,
    /// Seven-field cron expression; wins over the interval.
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Disabled schedules never fire.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Executor options for every run.
    #[serde(default)]
    pub options: JsonMap,
    /// Tasks created per run.
    #[serde(default = "default_parallel")]
    pub parallel_workers: u32,
    /// Disable after this many runs.
    #[serde(default)]
    pub max_runs: Option<u32>,
    /// Send a gateway notice when a run finishes.
    #[serde(default)]
    pub notify_on_complete: bool,
    /// Hand results to a supervisor for prompt refinement.
    #[serde(default)]
    pub self_learning: bool,
    /// Retry failed runs.
    #[serde(default)]
    pub self_healing: bool,
    /// Cap on optimizer runs.
    #[serde(default)]
    pub self_learning_max_runs: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_parallel() -> u32 {
    1
}

impl NewSchedule {
    /// Build and validate the schedule entity.
    pub fn into_schedule(self) -> ConductorResult<ScheduledTask> {
        let mut schedule = ScheduledTask::new(self.name, self.prompt, self.interval_seconds);
        schedule.start_url = self.start_url;
        schedule.cron_expression = self.cron_expression.filter(|e| !e.trim().is_empty());
        schedule.options = self.options;
        schedule.parallel_workers = self.parallel_workers.max(1);
        schedule.max_runs = self.max_runs;
        schedule.notify_on_complete = self.notify_on_complete;
        schedule.self_learning = self.self_learning;
        schedule.self_healing = self.self_healing;
        schedule.self_learning_max_runs = self.self_learning_max_runs;
        schedule.validate()?;
        let now = schedule.created_at;
        if self.enabled {
            schedule.enable(now);
        } else {
            schedule.disable(now);
        }
        Ok(schedule)
    }
}

/// `api.schedules.update` body: an id plus the fields to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleUpdatePayload {
    /// Schedule to patch.
    pub schedule_id: String,
    /// Fields to change.
    #[serde(flatten)]
    pub patch: SchedulePatch,
}

/// Body naming one schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleIdPayload {
    /// Target schedule.
    pub schedule_id: String,
}

/// Body naming one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdPayload {
    /// Target client.
    pub client_id: String,
}

/// Desktop-worker administration requests.
#[derive(Debug, Clone)]
pub enum DesktopAdmin {
    /// Add a desktop worker and register it.
    Register(DesktopWorker),
    /// Merge the given fields into a stored desktop worker.
    Update(DesktopWorker),
    /// Delete a desktop worker and drop it from the roster.
    Remove(ClientIdPayload),
    /// List stored desktop workers.
    List,
}

/// Schedule administration requests.
#[derive(Debug, Clone)]
pub enum ScheduleAdmin {
    /// Validate and store a new schedule.
    Create(NewSchedule),
    /// Patch a schedule.
    Update(ScheduleUpdatePayload),
    /// Tombstone a schedule.
    Delete(ScheduleIdPayload),
    /// List live schedules.
    List,
}

/// Every inbound message the dispatcher understands, one variant per
/// subject kind.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// `register.<type>`.
    Register {
        /// Type taken from the subject.
        client_type: ClientType,
        /// Decoded body.
        payload: RegisterPayload,
    },
    /// `heartbeat.<type>.<id>`.
    Heartbeat(HeartbeatPayload),
    /// `deregister`.
    Deregister(DeregisterPayload),
    /// `api.tasks.submit`.
    TaskSubmit(TaskSubmitPayload),
    /// `task.<id>.started`.
    TaskStarted {
        /// Id taken from the subject.
        task_id: String,
        /// Decoded body.
        payload: TaskStartedPayload,
    },
    /// `task.<id>.message`.
    TaskMessage {
        /// Id taken from the subject.
        task_id: String,
        /// Decoded body.
        payload: TaskMessagePayload,
    },
    /// `task.<id>.complete`.
    TaskComplete {
        /// Id taken from the subject.
        task_id: String,
        /// Decoded body.
        payload: TaskCompletePayload,
    },
    /// `task.<id>.error`.
    TaskError {
        /// Id taken from the subject.
        task_id: String,
        /// Decoded body.
        payload: TaskErrorPayload,
    },
    /// `gateway.<channel>.inbound`.
    GatewayInbound {
        /// Channel taken from the subject.
        channel: String,
        /// Decoded body.
        payload: GatewayInboundPayload,
    },
    /// `help.request`.
    HelpRequest(HelpRequestPayload),
    /// `help.respond`.
    HelpRespond(HelpRespondPayload),
    /// `help.cancel`.
    HelpCancel(HelpCancelPayload),
    /// `gateway.<channel>.help_posted`.
    HelpPosted {
        /// Channel taken from the subject.
        channel: String,
        /// Decoded body.
        payload: HelpPostedPayload,
    },
    /// `gateway.<channel>.callback`.
    ChannelCallback {
        /// Channel taken from the subject.
        channel: String,
        /// Decoded body.
        payload: ChannelCallbackPayload,
    },
    /// `api.desktop.<action>`.
    Desktop(DesktopAdmin),
    /// `api.schedules.<action>`.
    Schedule(ScheduleAdmin),
}

impl InboundEvent {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Register { .. } => "register",
            InboundEvent::Heartbeat(_) => "heartbeat",
            InboundEvent::Deregister(_) => "deregister",
            InboundEvent::TaskSubmit(_) => "task_submit",
            InboundEvent::TaskStarted { .. } => "task_started",
            InboundEvent::TaskMessage { .. } => "task_message",
            InboundEvent::TaskComplete { .. } => "task_complete",
            InboundEvent::TaskError { .. } => "task_error",
            InboundEvent::GatewayInbound { .. } => "gateway_inbound",
            InboundEvent::HelpRequest(_) => "help_request",
            InboundEvent::HelpRespond(_) => "help_respond",
            InboundEvent::HelpCancel(_) => "help_cancel",
            InboundEvent::HelpPosted { .. } => "help_posted",
            InboundEvent::ChannelCallback { .. } => "channel_callback",
            InboundEvent::Desktop(_) => "desktop_admin",
            InboundEvent::Schedule(_) => "schedule_admin",
        }
    }

    /// Decode a raw bus message. The subject picks the variant; the payload
    /// must deserialize into that variant's body.
    pub fn decode(subjects: &Subjects, subject: &str, payload: &[u8]) -> ConductorResult<Self> {
        let tokens = subjects
            .tokens(subject)
            .ok_or_else(|| ConductorError::payload(subject, "subject outside prefix"))?;

        let event = match tokens.as_slice() {
            ["register", kind] => {
                let client_type = kind
                    .parse::<ClientType>()
                    .map_err(|e| ConductorError::payload(subject, e))?;
                let payload: RegisterPayload = parse(subject, payload)?;
                require(subject, "client_id", &payload.client_id)?;
                InboundEvent::Register {
                    client_type,
                    payload,
                }
            }
            ["heartbeat", .., id] => {
                let mut body: HeartbeatPayload = parse(subject, payload)?;
                if body.client_id.is_empty() {
                    body.client_id = (*id).to_string();
                }
                require(subject, "client_id", &body.client_id)?;
                InboundEvent::Heartbeat(body)
            }
            ["deregister"] => {
                let body: DeregisterPayload = parse(subject, payload)?;
                require(subject, "client_id", &body.client_id)?;
                InboundEvent::Deregister(body)
            }
            ["api", "tasks", "submit"] => {
                let body: TaskSubmitPayload = parse(subject, payload)?;
                require(subject, "prompt", &body.prompt)?;
                InboundEvent::TaskSubmit(body)
            }
            ["task", task_id, event] => {
                let task_id = (*task_id).to_string();
                match *event {
                    "started" => InboundEvent::TaskStarted {
                        task_id,
                        payload: parse(subject, payload)?,
                    },
                    "message" => InboundEvent::TaskMessage {
                        task_id,
                        payload: parse(subject, payload)?,
                    },
                    "complete" => InboundEvent::TaskComplete {
                        task_id,
                        payload: parse(subject, payload)?,
                    },
                    "error" => InboundEvent::TaskError {
                        task_id,
                        payload: parse(subject, payload)?,
                    },
                    other => {
                        return Err(ConductorError::payload(
                            subject,
                            format!("unknown task event '{other}'"),
                        ))
                    }
                }
            }
            ["gateway", channel, event] => {
                let channel = (*channel).to_string();
                match *event {
                    "inbound" => {
                        let body: GatewayInboundPayload = parse(subject, payload)?;
                        if body.prompt_text().is_none() {
                            return Err(ConductorError::payload(subject, "missing text/prompt"));
                        }
                        InboundEvent::GatewayInbound {
                            channel,
                            payload: body,
                        }
                    }
                    "help_posted" => InboundEvent::HelpPosted {
                        channel,
                        payload: parse(subject, payload)?,
                    },
                    "callback" => InboundEvent::ChannelCallback {
                        channel,
                        payload: parse(subject, payload)?,
                    },
                    other => {
                        return Err(ConductorError::payload(
                            subject,
                            format!("unexpected gateway event '{other}'"),
                        ))
                    }
                }
            }
            ["help", "request"] => {
                let body: HelpRequestPayload = parse(subject, payload)?;
                require(subject, "task_id", &body.task_id)?;
                require(subject, "worker_id", &body.worker_id)?;
                if body.questions.is_empty() {
                    return Err(ConductorError::payload(subject, "no questions"));
                }
                InboundEvent::HelpRequest(body)
            }
            ["help", "respond"] => InboundEvent::HelpRespond(parse(subject, payload)?),
            ["help", "cancel"] => InboundEvent::HelpCancel(parse(subject, payload)?),
            ["api", "desktop", action] => InboundEvent::Desktop(match *action {
                "register" => DesktopAdmin::Register(parse(subject, payload)?),
                "update" => DesktopAdmin::Update(parse(subject, payload)?),
                "remove" => DesktopAdmin::Remove(parse(subject, payload)?),
                "list" => DesktopAdmin::List,
                other => {
                    return Err(ConductorError::payload(
                        subject,
                        format!("unknown desktop action '{other}'"),
                    ))
                }
            }),
            ["api", "schedules", action] => InboundEvent::Schedule(match *action {
                "create" => ScheduleAdmin::Create(parse(subject, payload)?),
                "update" => ScheduleAdmin::Update(parse(subject, payload)?),
                "delete" => ScheduleAdmin::Delete(parse(subject, payload)?),
                "list" => ScheduleAdmin::List,
                other => {
                    return Err(ConductorError::payload(
                        subject,
                        format!("unknown schedule action '{other}'"),
                    ))
                }
            }),
            _ => return Err(ConductorError::payload(subject, "no handler for subject")),
        };
        Ok(event)
    }
}

fn parse<T: DeserializeOwned>(subject: &str, payload: &[u8]) -> ConductorResult<T> {
    let bytes: &[u8] = if payload.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        payload
    };
    serde_json::from_slice(bytes).map_err(|e| ConductorError::payload(subject, e.to_string()))
}

fn require(subject: &str, field: &str, value: &str) -> ConductorResult<()> {
    if value.trim().is_empty() {
        return Err(ConductorError::payload(subject, format!("missing {field}")));
    }
    Ok(())
}

/// Accept ids sent either as strings or as numbers (chat platforms differ).
fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

// --- Outbound payloads ---

/// Generic request/reply acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// `"ok"` or `"error"`.
    pub status: String,
    /// Reason, for errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Extra reply fields, flattened into the object.
    #[serde(flatten)]
    pub data: JsonMap,
}

impl Ack {
    /// Success with no extra fields.
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            error: None,
            data: JsonMap::new(),
        }
    }

    /// Failure with a reason.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(message.into()),
            data: JsonMap::new(),
        }
    }

    /// Attach an extra field to the reply.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        self.data.insert(
            key.to_string(),
            serde_json::to_value(value).unwrap_or(Value::Null),
        );
        self
    }

    /// Whether `status` is `"ok"`.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Work pushed to an executor over request/reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Task being assigned.
    pub task_id: String,
    /// Instruction text.
    pub prompt: String,
    /// Executor options.
    #[serde(default)]
    pub options: JsonMap,
    /// Where the task came from.
    pub source: TaskSource,
    /// Reply routing for the source.
    #[serde(default)]
    pub source_metadata: JsonMap,
}

impl From<&Task> for TaskAssignment {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            prompt: task.prompt.clone(),
            options: task.options.clone(),
            source: task.source,
            source_metadata: task.source_metadata.clone(),
        }
    }
}

/// Executor's answer to a [`TaskAssignment`]. An empty reply counts as
/// acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentReply {
    /// `false` refuses the task.
    #[serde(default = "default_true")]
    pub accepted: bool,
    /// Why the task was refused.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `gateway.<channel>.send`: a reply into one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySend {
    /// Target chat.
    pub chat_id: Value,
    /// Message text.
    pub text: String,
}

/// `gateway.<channel>.notify`: an operator notification; the adapter picks
/// the recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayNotify {
    /// Message text.
    pub text: String,
}

/// `gateway.<channel>.help`: questions to post into a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayHelpPost {
    /// Request being posted.
    pub request_id: String,
    /// Task that raised it.
    pub task_id: String,
    /// Target chat.
    pub chat_id: Value,
    /// Questions to render.
    pub questions: Vec<HelpQuestion>,
}

/// `gateway.<channel>.edit`: rewrite a previously posted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEdit {
    /// Chat holding the message.
    pub chat_id: Value,
    /// Message to rewrite.
    pub message_id: String,
    /// Replacement text.
    pub text: String,
}

/// `help.reply.<worker_id>`: unblocks the waiting worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpReply {
    /// Request being resolved.
    pub request_id: String,
    /// Task that raised it.
    pub task_id: String,
    /// Answers, when responded.
    #[serde(default)]
    pub answers: Option<JsonMap>,
    /// Who answered.
    #[serde(default)]
    pub source: Option<ResponseSource>,
    /// `"timeout"` or `"cancelled"` when no answer is coming.
    #[serde(default)]
    pub error: Option<String>,
}

/// `ui.roster`: current executors after a registry change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterUpdate {
    /// Connected workers.
    pub workers: Vec<Connection>,
    /// Connected supervisors.
    pub supervisors: Vec<Connection>,
    /// Connected gateways.
    pub gateways: Vec<Connection>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subjects() -> Subjects {
        Subjects::default()
    }

    fn decode(subject: &str, body: Value) -> ConductorResult<InboundEvent> {
        InboundEvent::decode(&subjects(), subject, body.to_string().as_bytes())
    }

    #[test]
    fn test_decode_register() {
        let event = decode(
            "conductor.register.supervisor",
            json!({"client_id": "sup-1", "capabilities": ["browser"]}),
        )
        .unwrap();
        match event {
            InboundEvent::Register {
                client_type,
                payload,
            } => {
                assert_eq!(client_type, ClientType::Supervisor);
                assert_eq!(payload.capabilities, vec!["browser".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_register_requires_client_id() {
        let err = decode("conductor.register.worker", json!({"client_id": ""})).unwrap_err();
        assert!(matches!(err, ConductorError::Payload { .. }));
    }

    #[test]
    fn test_heartbeat_id_from_subject() {
        let event = decode("conductor.heartbeat.worker.w7", json!({"status": "busy"})).unwrap();
        match event {
            InboundEvent::Heartbeat(hb) => {
                assert_eq!(hb.client_id, "w7");
                assert_eq!(hb.status, Some(ClientStatus::Busy));
                assert!(hb.client_type.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_task_events() {
        let event = decode("conductor.task.t1.complete", json!({"result": "Done"})).unwrap();
        assert_eq!(event.kind(), "task_complete");
        let err = decode("conductor.task.t1.error", json!({})).unwrap_err();
        assert!(err.to_string().contains("error"));
        assert!(decode("conductor.task.t1.exploded", json!({})).is_err());
    }

    #[test]
    fn test_gateway_inbound_text_fallback() {
        let event = decode(
            "conductor.gateway.telegram.inbound",
            json!({"chat_id": 123, "prompt": "summarize"}),
        )
        .unwrap();
        match event {
            InboundEvent::GatewayInbound { channel, payload } => {
                assert_eq!(channel, "telegram");
                assert_eq!(payload.prompt_text(), Some("summarize"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(decode(
            "conductor.gateway.telegram.inbound",
            json!({"chat_id": 123, "text": "  "})
        )
        .is_err());
    }

    #[test]
    fn test_numeric_message_id() {
        let event = decode(
            "conductor.gateway.telegram.callback",
            json!({"message_id": 991, "answers": {"q": "yes"}}),
        )
        .unwrap();
        match event {
            InboundEvent::ChannelCallback { payload, .. } => assert_eq!(payload.message_id, "991"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload_for_list() {
        let event = InboundEvent::decode(&subjects(), "conductor.api.schedules.list", b"").unwrap();
        assert!(matches!(event, InboundEvent::Schedule(ScheduleAdmin::List)));
    }

    #[test]
    fn test_foreign_subject_rejected() {
        assert!(decode("other.register.worker", json!({"client_id": "x"})).is_err());
        assert!(decode("conductor.nothing.here", json!({})).is_err());
    }

    #[test]
    fn test_new_schedule_validation() {
        let bad: NewSchedule =
            serde_json::from_value(json!({"name": "n", "prompt": "p"})).unwrap();
        assert!(bad.into_schedule().is_err());
        let good: NewSchedule = serde_json::from_value(
            json!({"name": "n", "prompt": "p", "interval_seconds": 60, "enabled": false}),
        )
        .unwrap();
        let schedule = good.into_schedule().unwrap();
        assert!(!schedule.enabled);
        assert_eq!(schedule.parallel_workers, 1);
    }

    #[test]
    fn test_ack_shape() {
        let ack = Ack::ok().with("task_id", "t1");
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json, json!({"status": "ok", "task_id": "t1"}));
        let parsed: Ack = serde_json::from_value(json!({"status": "ok"})).unwrap();
        assert!(parsed.is_ok());
    }

    #[test]
    fn test_assignment_reply_defaults_to_accepted() {
        let reply: AssignmentReply = serde_json::from_str("{}").unwrap();
        assert!(reply.accepted);
    }
}
