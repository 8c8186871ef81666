use async_trait::async_trait;
use conductor_bus::{MessageBus, MessageBusExt};
use conductor_core::protocol::{
    GatewayEdit, GatewayHelpPost, GatewayNotify, GatewaySend, HelpReply, RosterUpdate,
};
use conductor_core::{Connection, HelpRequest, HelpStatus, Subjects, Task, TaskMessage};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::help::HelpNotifier;

/// Every message the orchestrator sends on its own initiative.
///
/// Publishing is best-effort: failures are logged and never propagate into
/// the state machines.
pub struct Outbox {
    bus: Arc<dyn MessageBus>,
    subjects: Subjects,
}

impl Outbox {
    /// Publish through `bus` using `subjects`.
    pub fn new(bus: Arc<dyn MessageBus>, subjects: Subjects) -> Self {
        Self { bus, subjects }
    }

    /// Subject builder used for every publish.
    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    /// Reply into one chat of a gateway channel.
    pub async fn gateway_send(&self, channel: &str, chat_id: &Value, text: &str) {
        let body = GatewaySend {
            chat_id: chat_id.clone(),
            text: text.to_string(),
        };
        self.publish(&self.subjects.gateway(channel, "send"), &body)
            .await;
    }

    /// Operator notification to every given gateway.
    pub async fn notify_gateways(&self, gateways: &[Connection], text: &str) {
        let body = GatewayNotify {
            text: text.to_string(),
        };
        for gateway in gateways {
            self.publish(&self.subjects.gateway(&gateway.client_id, "notify"), &body)
                .await;
        }
    }

    /// Publish the roster on the UI subject.
    pub async fn roster(&self, roster: &RosterUpdate) {
        self.publish(&self.subjects.ui("roster"), roster).await;
    }

    /// Publish a task snapshot on the UI subject.
    pub async fn task_updated(&self, task: &Task) {
        self.publish(&self.subjects.ui("task.updated"), task).await;
    }

    /// Publish one message appended to a task's history.
    pub async fn task_message(&self, task_id: &str, message: &TaskMessage) {
        let body = json!({ "task_id": task_id, "message": message });
        self.publish(&self.subjects.ui("task.updated"), &body).await;
    }

    async fn publish<T: Serialize + Sync + ?Sized>(&self, subject: &str, body: &T) {
        if let Err(e) = self.bus.publish_json(subject, body).await {
            warn!(subject, error = %e, "Failed to publish");
        }
    }
}

#[async_trait]
impl HelpNotifier for Outbox {
    async fn help_requested(&self, request: &HelpRequest) {
        self.publish(&self.subjects.ui("help.requested"), request)
            .await;

        if let (Some(channel), Some(chat_id)) = (&request.channel, &request.chat_id) {
            let post = GatewayHelpPost {
                request_id: request.request_id.clone(),
                task_id: request.task_id.clone(),
                chat_id: chat_id.clone(),
                questions: request.questions.clone(),
            };
            self.publish(&self.subjects.gateway(channel, "help"), &post)
                .await;
        }
    }

    async fn help_resolved(&self, request: &HelpRequest) {
        let reply = HelpReply {
            request_id: request.request_id.clone(),
            task_id: request.task_id.clone(),
            answers: request.answers.clone(),
            source: request.response_source.clone(),
            error: match request.status {
                HelpStatus::Timeout | HelpStatus::Cancelled => {
                    Some(request.status.as_str().to_string())
                }
                HelpStatus::Pending | HelpStatus::Responded => None,
            },
        };
        self.publish(&self.subjects.help_reply(&request.worker_id), &reply)
            .await;

        let topic = match request.status {
            HelpStatus::Responded => "help.responded",
            _ => "help.closed",
        };
        self.publish(&self.subjects.ui(topic), request).await;

        if let (Some(channel), Some(chat_id), Some(message_id)) =
            (&request.channel, &request.chat_id, &request.message_id)
        {
            let edit = GatewayEdit {
                chat_id: chat_id.clone(),
                message_id: message_id.clone(),
                text: resolution_text(request),
            };
            self.publish(&self.subjects.gateway(channel, "edit"), &edit)
                .await;
        }
    }
}

/// Replacement text for a posted help message once it is settled.
fn resolution_text(request: &HelpRequest) -> String {
    let questions: Vec<&str> = request
        .questions
        .iter()
        .map(|q| q.question.as_str())
        .collect();
    let header = questions.join("\n");
    match request.status {
        HelpStatus::Responded => {
            let answers = request
                .answers
                .as_ref()
                .map(|answers| {
                    answers
                        .iter()
                        .map(|(question, answer)| match answer {
                            Value::String(s) => format!("{question}: {s}"),
                            other => format!("{question}: {other}"),
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            let via = request
                .response_source
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "ui".to_string());
            format!("{header}\n\nAnswered via {via}:\n{answers}")
        }
        HelpStatus::Timeout => format!("{header}\n\nNo answer in time, the agent continued without it."),
        HelpStatus::Cancelled => format!("{header}\n\nNo longer needed."),
        HelpStatus::Pending => header,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conductor_bus::InMemoryBus;
    use conductor_core::{HelpQuestion, JsonMap, ResponseSource};

    fn request() -> HelpRequest {
        HelpRequest {
            request_id: "h1".into(),
            task_id: "t1".into(),
            worker_id: "w1".into(),
            questions: vec![HelpQuestion::text("Which account?")],
            context: None,
            timeout_seconds: 5.0,
            status: HelpStatus::Pending,
            answers: None,
            response_source: None,
            channel: Some("telegram".into()),
            chat_id: Some(json!(123)),
            message_id: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn test_help_requested_posts_to_ui_and_channel() {
        let bus = InMemoryBus::new();
        let outbox = Outbox::new(Arc::new(bus.clone()), Subjects::default());
        outbox.help_requested(&request()).await;

        assert_eq!(bus.published_json("conductor.ui.help.requested").len(), 1);
        let posts = bus.published_json("conductor.gateway.telegram.help");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0]["chat_id"], json!(123));
        assert_eq!(posts[0]["questions"][0]["question"], "Which account?");
    }

    #[tokio::test]
    async fn test_timeout_reply_carries_error() {
        let bus = InMemoryBus::new();
        let outbox = Outbox::new(Arc::new(bus.clone()), Subjects::default());
        let mut req = request();
        req.channel = None;
        assert!(req.resolve(HelpStatus::Timeout, None, None));
        outbox.help_resolved(&req).await;

        let replies = bus.published_json("conductor.help.reply.w1");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["error"], "timeout");
        assert_eq!(bus.published_json("conductor.ui.help.closed").len(), 1);
        assert!(bus.published_json("conductor.gateway.>").is_empty());
    }

    #[tokio::test]
    async fn test_answer_edits_channel_message() {
        let bus = InMemoryBus::new();
        let outbox = Outbox::new(Arc::new(bus.clone()), Subjects::default());
        let mut req = request();
        req.message_id = Some("991".into());
        let mut answers = JsonMap::new();
        answers.insert("Which account?".into(), json!("work"));
        assert!(req.resolve(
            HelpStatus::Responded,
            Some(answers),
            Some(ResponseSource::Channel("telegram".into()))
        ));
        outbox.help_resolved(&req).await;

        let reply = &bus.published_json("conductor.help.reply.w1")[0];
        assert_eq!(reply["answers"]["Which account?"], "work");
        assert_eq!(reply["source"], "telegram");
        let edits = bus.published_json("conductor.gateway.telegram.edit");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0]["message_id"], "991");
        assert!(edits[0]["text"].as_str().unwrap().contains("Which account?: work"));
    }
}
