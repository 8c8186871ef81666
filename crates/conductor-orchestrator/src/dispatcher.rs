use chrono::Utc;
use conductor_bus::{BusMessage, MessageBusExt, Subscription};
use conductor_core::protocol::{
    Ack, ChannelCallbackPayload, DesktopAdmin, GatewayInboundPayload, HeartbeatPayload,
    HelpCancelPayload, HelpPostedPayload, HelpRequestPayload, HelpRespondPayload,
    RegisterPayload, ScheduleAdmin, TaskSubmitPayload,
};
use conductor_core::{
    ClientStatus, ClientType, ConductorError, ConductorResult, Connection, DesktopWorker,
    InboundEvent, ResponseSource, Subjects, Task, TaskSource,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::Orchestrator;
use crate::help::NewHelpRequest;
use crate::registry::{HeartbeatOutcome, HeartbeatUpdate, RegisterInput};
use crate::task_manager::{Completion, NewTask, Transition};

/// Subjects that must be backed by durable storage on the bus.
pub fn durable_subjects(subjects: &Subjects) -> Vec<String> {
    vec![subjects.task_stream()]
}

/// How one instance shares a subject with its peers.
#[derive(Debug, Clone, PartialEq)]
enum Delivery {
    /// Every instance gets every message; used for roster state each
    /// instance keeps locally.
    Fanout,
    /// One instance of the queue group handles each message.
    Queue,
    /// One instance handles each message, backed by the named durable consumer.
    Durable(String),
}

struct Route {
    subject: String,
    delivery: Delivery,
}

/// Routes every inbound bus message to the component that owns it.
///
/// Each message is decoded into an [`InboundEvent`] at the boundary and
/// handled on its own spawned task. Request/reply messages are answered with
/// an [`Ack`]; durable messages are acked once handled, including malformed
/// ones, which are logged and dropped.
#[derive(Clone)]
pub struct Dispatcher {
    orch: Arc<Orchestrator>,
}

impl Dispatcher {
    /// Build a dispatcher over a wired orchestrator.
    pub fn new(orch: Arc<Orchestrator>) -> Self {
        Self { orch }
    }

    fn routes(&self) -> Vec<Route> {
        let s = self.orch.subjects();
        let group = &self.orch.config().queue_group;
        let mut routes: Vec<Route> = [s.register_all(), s.deregister(), s.heartbeat_all()]
            .into_iter()
            .map(|subject| Route {
                subject,
                delivery: Delivery::Fanout,
            })
            .collect();
        let queued = [
            s.task_submit(),
            s.gateway_all("inbound"),
            s.gateway_all("help_posted"),
            s.gateway_all("callback"),
            s.help("request"),
            s.help("respond"),
            s.help("cancel"),
            s.desktop_api("*"),
            s.schedules_api("*"),
        ];
        routes.extend(queued.into_iter().map(|subject| Route {
            subject,
            delivery: Delivery::Queue,
        }));
        for event in ["started", "message", "complete", "error"] {
            routes.push(Route {
                subject: s.task_events(event),
                delivery: Delivery::Durable(format!("{group}-task-{event}")),
            });
        }
        routes
    }

    /// Subscribe to every inbound subject and spawn one receive loop per
    /// subscription. All subscriptions exist before this returns.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> ConductorResult<Vec<JoinHandle<()>>> {
        let bus = self.orch.bus();
        let group = self.orch.config().queue_group.clone();
        let mut handles = Vec::new();
        for route in self.routes() {
            let subscription = match &route.delivery {
                Delivery::Fanout => bus.subscribe(&route.subject).await?,
                Delivery::Queue => bus.subscribe_queue(&route.subject, &group).await?,
                Delivery::Durable(consumer) => {
                    bus.subscribe_durable(&route.subject, consumer).await?
                }
            };
            info!(subject = %route.subject, delivery = ?route.delivery, "Subscribed");
            handles.push(self.spawn_loop(subscription, shutdown.clone()));
        }
        Ok(handles)
    }

    fn spawn_loop(&self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = subscription.next() => {
                        match msg {
                            Some(msg) => {
                                let handler = dispatcher.clone();
                                tokio::spawn(async move { handler.handle(msg).await });
                            }
                            None => {
                                warn!(subject = %subscription.subject(), "Subscription stream ended");
                                break;
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!(subject = %subscription.subject(), "Receive loop shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Decode and handle one raw message, answering and acking it.
    pub async fn handle(&self, msg: BusMessage) {
        let event = match InboundEvent::decode(self.orch.subjects(), &msg.subject, &msg.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "Dropping malformed message");
                self.reply(&msg, &Ack::error(e.to_string())).await;
                self.settle(&msg, true).await;
                return;
            }
        };

        let kind = event.kind();
        debug!(subject = %msg.subject, kind, "Handling message");
        match self.dispatch(event).await {
            Ok(ack) => {
                self.reply(&msg, &ack).await;
                self.settle(&msg, true).await;
            }
            Err(e) => {
                warn!(subject = %msg.subject, kind, error = %e, "Handler failed");
                self.reply(&msg, &Ack::error(e.to_string())).await;
                self.settle(&msg, false).await;
            }
        }
    }

    async fn dispatch(&self, event: InboundEvent) -> ConductorResult<Ack> {
        match event {
            InboundEvent::Register {
                client_type,
                payload,
            } => Ok(self.on_register(client_type, payload).await),
            InboundEvent::Heartbeat(payload) => Ok(self.on_heartbeat(payload).await),
            InboundEvent::Deregister(payload) => {
                self.orch.delegator().evict(&payload.client_id).await;
                Ok(Ack::ok())
            }
            InboundEvent::TaskSubmit(payload) => Ok(self.on_task_submit(payload).await),
            InboundEvent::TaskStarted { task_id, payload } => {
                match self.orch.tasks().start(&task_id, payload.session_id).await {
                    Transition::Applied(task) => self.orch.outbox().task_updated(&task).await,
                    Transition::Conflict { current } => {
                        debug!(task_id = %task_id, current = %current, "Ignoring started event");
                    }
                    Transition::NotFound => warn!(task_id = %task_id, "Started event for unknown task"),
                }
                Ok(Ack::ok())
            }
            InboundEvent::TaskMessage { task_id, payload } => {
                match self.orch.tasks().append_message(&task_id, payload.message).await {
                    Some(message) => self.orch.outbox().task_message(&task_id, &message).await,
                    None => warn!(task_id = %task_id, "Message for unknown task"),
                }
                Ok(Ack::ok())
            }
            InboundEvent::TaskComplete { task_id, payload } => {
                let outcome = self.orch.tasks().complete(&task_id, payload.result).await;
                self.on_completion(&task_id, outcome).await;
                Ok(Ack::ok())
            }
            InboundEvent::TaskError { task_id, payload } => {
                let outcome = self.orch.tasks().fail(&task_id, &payload.error).await;
                self.on_completion(&task_id, outcome).await;
                Ok(Ack::ok())
            }
            InboundEvent::GatewayInbound { channel, payload } => {
                Ok(self.on_gateway_inbound(&channel, payload).await)
            }
            InboundEvent::HelpRequest(payload) => Ok(self.on_help_request(payload).await),
            InboundEvent::HelpRespond(payload) => Ok(self.on_help_respond(payload).await),
            InboundEvent::HelpCancel(payload) => self.on_help_cancel(payload).await,
            InboundEvent::HelpPosted { channel, payload } => {
                Ok(self.on_help_posted(&channel, payload).await)
            }
            InboundEvent::ChannelCallback { channel, payload } => {
                Ok(self.on_channel_callback(&channel, payload).await)
            }
            InboundEvent::Desktop(admin) => self.on_desktop_admin(admin).await,
            InboundEvent::Schedule(admin) => self.on_schedule_admin(admin).await,
        }
    }

    // --- Registry ---

    async fn on_register(&self, client_type: ClientType, payload: RegisterPayload) -> Ack {
        let conn = self
            .orch
            .registry()
            .register(RegisterInput::from_payload(client_type, payload));
        self.snapshot(&conn).await;
        self.orch.delegator().broadcast_roster().await;
        Ack::ok().with("client_id", &conn.client_id)
    }

    async fn on_heartbeat(&self, payload: HeartbeatPayload) -> Ack {
        let outcome = self.orch.registry().update_heartbeat(
            &payload.client_id,
            HeartbeatUpdate {
                status: payload.status,
                client_type: payload.client_type,
                novnc_url: payload.novnc_url,
            },
        );
        if let HeartbeatOutcome::Created(conn) = &outcome {
            self.snapshot(conn).await;
        }
        if outcome.roster_changed() {
            self.orch.delegator().broadcast_roster().await;
        }
        Ack::ok()
    }

    async fn snapshot(&self, conn: &Connection) {
        if let Err(e) = self
            .orch
            .repositories()
            .connections
            .save_connection(conn)
            .await
        {
            warn!(client_id = %conn.client_id, error = %e, "Failed to store connection snapshot");
        }
    }

    // --- Tasks ---

    async fn on_task_submit(&self, payload: TaskSubmitPayload) -> Ack {
        let target = payload.target.unwrap_or(ClientType::Worker);
        let mut new = NewTask::new(payload.prompt, TaskSource::Api);
        new.task_id = payload.task_id;
        new.options = payload.options;
        new.source_metadata = payload.source_metadata;

        let task = self.orch.tasks().create(new).await;
        let delegation = self.orch.delegator().delegate(&task.task_id, target).await;
        let status = self
            .orch
            .tasks()
            .get(&task.task_id)
            .map_or(task.status, |t| t.status);

        let mut ack = Ack::ok()
            .with("task_id", &task.task_id)
            .with("status", status);
        if let Some(client_id) = delegation.client_id() {
            ack = ack.with("worker_id", client_id);
        }
        ack
    }

    async fn on_completion(&self, task_id: &str, outcome: Completion) {
        match outcome {
            Completion::Applied(task) => self.after_terminal(task).await,
            Completion::AlreadyTerminal(task) => {
                debug!(task_id, status = %task.status, "Duplicate completion ignored");
            }
            Completion::NotFound => warn!(task_id, "Completion for unknown task"),
        }
    }

    /// Runs exactly once per task, after its first terminal transition.
    async fn after_terminal(&self, task: Task) {
        if let Some(worker_id) = &task.worker_id {
            if self
                .orch
                .registry()
                .set_status(worker_id, ClientStatus::Idle)
            {
                self.orch.delegator().broadcast_roster().await;
            }
        }
        if let (Some(channel), Some(chat_id)) = (task.channel(), task.chat_id()) {
            let text = task.result_text().unwrap_or_default();
            self.orch.outbox().gateway_send(channel, chat_id, &text).await;
        }
        self.orch.outbox().task_updated(&task).await;
        self.orch.scheduler().on_task_finished(&task).await;
    }

    async fn on_gateway_inbound(&self, channel: &str, payload: GatewayInboundPayload) -> Ack {
        let prompt = payload.prompt_text().unwrap_or_default().to_string();
        let mut new = NewTask::new(prompt, TaskSource::Gateway);
        new.options = payload.options;
        new.source_metadata.insert("channel".into(), json!(channel));
        new.source_metadata.insert("chat_id".into(), payload.chat_id);
        if let Some(user) = payload.user {
            new.source_metadata.insert("user".into(), Value::String(user));
        }

        let task = self.orch.tasks().create(new).await;
        info!(task_id = %task.task_id, channel, "Task created from gateway message");
        let target = self.orch.config().gateway_target;
        self.orch.delegator().delegate(&task.task_id, target).await;
        Ack::ok().with("task_id", &task.task_id)
    }

    // --- Help requests ---

    async fn on_help_request(&self, payload: HelpRequestPayload) -> Ack {
        let (channel, chat_id) = self
            .orch
            .tasks()
            .get(&payload.task_id)
            .map(|t| (t.channel().map(str::to_string), t.chat_id().cloned()))
            .unwrap_or((None, None));
        let request = self
            .orch
            .help()
            .create_request(NewHelpRequest {
                request_id: payload.request_id,
                task_id: payload.task_id,
                worker_id: payload.worker_id,
                questions: payload.questions,
                context: payload.context,
                timeout_seconds: payload
                    .timeout_seconds
                    .unwrap_or(self.orch.config().default_help_timeout_secs),
                channel,
                chat_id,
            })
            .await;
        Ack::ok().with("request_id", &request.request_id)
    }

    async fn on_help_respond(&self, payload: HelpRespondPayload) -> Ack {
        let source = payload.source.unwrap_or(ResponseSource::Ui);
        if self
            .orch
            .help()
            .respond(&payload.request_id, payload.answers, source)
            .await
        {
            Ack::ok()
        } else {
            Ack::error("help request is not pending")
        }
    }

    async fn on_help_cancel(&self, payload: HelpCancelPayload) -> ConductorResult<Ack> {
        let help = self.orch.help();
        let cancelled = match (payload.request_id, payload.worker_id) {
            (Some(request_id), _) => usize::from(help.cancel_request(&request_id).await),
            (None, Some(worker_id)) => help.cancel_requests_for_worker(&worker_id).await,
            (None, None) => {
                return Err(ConductorError::payload(
                    self.orch.subjects().help("cancel"),
                    "request_id or worker_id required",
                ))
            }
        };
        Ok(Ack::ok().with("cancelled", cancelled))
    }

    async fn on_help_posted(&self, channel: &str, payload: HelpPostedPayload) -> Ack {
        if self
            .orch
            .help()
            .set_channel_message_id(&payload.request_id, channel, &payload.message_id, payload.chat_id)
            .await
        {
            Ack::ok()
        } else {
            warn!(request_id = %payload.request_id, channel, "Posted help request is unknown");
            Ack::error("unknown help request")
        }
    }

    async fn on_channel_callback(&self, channel: &str, payload: ChannelCallbackPayload) -> Ack {
        let help = self.orch.help();
        let Some(request) = help.get_by_channel_message_id(channel, &payload.message_id) else {
            debug!(channel, message_id = %payload.message_id, "Callback for uncorrelated message");
            return Ack::error("no help request for this message");
        };
        let source = ResponseSource::Channel(channel.to_string());
        if help.respond(&request.request_id, payload.answers, source).await {
            Ack::ok().with("request_id", &request.request_id)
        } else {
            Ack::error("help request is not pending")
        }
    }

    // --- Administration ---

    async fn on_desktop_admin(&self, admin: DesktopAdmin) -> ConductorResult<Ack> {
        let repo = &self.orch.repositories().desktop_workers;
        match admin {
            DesktopAdmin::Register(mut worker) => {
                worker.updated_at = Utc::now();
                repo.upsert_desktop_worker(&worker).await?;
                self.register_desktop(&worker).await;
                info!(client_id = %worker.client_id, "Desktop worker registered");
                Ok(Ack::ok().with("worker", &worker))
            }
            DesktopAdmin::Update(patch) => {
                let Some(mut worker) = repo.get_desktop_worker(&patch.client_id).await? else {
                    return Ok(Ack::error(format!(
                        "unknown desktop worker '{}'",
                        patch.client_id
                    )));
                };
                merge_desktop(&mut worker, patch);
                repo.upsert_desktop_worker(&worker).await?;
                self.register_desktop(&worker).await;
                info!(client_id = %worker.client_id, "Desktop worker updated");
                Ok(Ack::ok().with("worker", &worker))
            }
            DesktopAdmin::Remove(payload) => {
                let existed = repo.delete_desktop_worker(&payload.client_id).await?;
                self.orch.delegator().evict(&payload.client_id).await;
                if existed {
                    info!(client_id = %payload.client_id, "Desktop worker removed");
                    Ok(Ack::ok())
                } else {
                    Ok(Ack::error(format!(
                        "unknown desktop worker '{}'",
                        payload.client_id
                    )))
                }
            }
            DesktopAdmin::List => {
                let workers = repo.list_desktop_workers().await?;
                Ok(Ack::ok().with("workers", &workers))
            }
        }
    }

    /// Put a desktop worker into the registry, keeping a known client's
    /// current status.
    async fn register_desktop(&self, worker: &DesktopWorker) {
        let registry = self.orch.registry();
        let mut input = RegisterInput::from(worker.to_connection());
        if let Some(existing) = registry.get(&worker.client_id) {
            input.status = existing.status;
        }
        registry.register(input);
        self.orch.delegator().broadcast_roster().await;
    }

    async fn on_schedule_admin(&self, admin: ScheduleAdmin) -> ConductorResult<Ack> {
        let repo = &self.orch.repositories().schedules;
        match admin {
            ScheduleAdmin::Create(new) => {
                let schedule = new.into_schedule()?;
                repo.create_schedule(&schedule).await?;
                info!(schedule_id = %schedule.schedule_id, name = %schedule.name, "Schedule created");
                Ok(Ack::ok().with("schedule", &schedule))
            }
            ScheduleAdmin::Update(payload) => {
                let schedule_id = payload.schedule_id;
                let mut schedule = match repo.get_schedule(&schedule_id).await? {
                    Some(schedule) if !schedule.deleted => schedule,
                    _ => return Ok(Ack::error(format!("unknown schedule '{schedule_id}'"))),
                };
                schedule.apply(payload.patch, Utc::now());
                schedule.validate()?;
                if !repo.update_schedule(&schedule).await? {
                    return Ok(Ack::error(format!("unknown schedule '{schedule_id}'")));
                }
                info!(schedule_id = %schedule_id, "Schedule updated");
                let stored = repo.get_schedule(&schedule_id).await?.unwrap_or(schedule);
                Ok(Ack::ok().with("schedule", &stored))
            }
            ScheduleAdmin::Delete(payload) => {
                if repo.delete_schedule(&payload.schedule_id).await? {
                    info!(schedule_id = %payload.schedule_id, "Schedule deleted");
                    Ok(Ack::ok())
                } else {
                    Ok(Ack::error(format!(
                        "unknown schedule '{}'",
                        payload.schedule_id
                    )))
                }
            }
            ScheduleAdmin::List => {
                let schedules = repo.list_schedules().await?;
                Ok(Ack::ok().with("schedules", &schedules))
            }
        }
    }

    // --- Transport ---

    async fn reply(&self, msg: &BusMessage, ack: &Ack) {
        if let Err(e) = self.orch.bus().respond(msg, ack).await {
            warn!(subject = %msg.subject, error = %e, "Failed to send reply");
        }
    }

    async fn settle(&self, msg: &BusMessage, handled: bool) {
        if !msg.is_durable() {
            return;
        }
        let result = if handled { msg.ack().await } else { msg.nak().await };
        if let Err(e) = result {
            warn!(subject = %msg.subject, error = %e, "Failed to settle durable message");
        }
    }
}

/// Overlay the fields an update actually carries.
fn merge_desktop(worker: &mut DesktopWorker, patch: DesktopWorker) {
    if patch.novnc_url.is_some() {
        worker.novnc_url = patch.novnc_url;
    }
    if !patch.capabilities.is_empty() {
        worker.capabilities = patch.capabilities;
    }
    if !patch.metadata.is_empty() {
        worker.metadata = patch.metadata;
    }
    worker.updated_at = Utc::now();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use conductor_bus::InMemoryBus;
    use conductor_store::{MemoryStore, Repositories};
    use std::time::Duration;

    fn orchestrator() -> (InMemoryBus, Dispatcher) {
        let bus = InMemoryBus::new();
        let orch = Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(bus.clone()),
            Repositories::from_store(Arc::new(MemoryStore::new())),
        );
        (bus, Dispatcher::new(orch))
    }

    fn message(subject: &str, body: Value) -> BusMessage {
        BusMessage::new(subject, serde_json::to_vec(&body).unwrap().into(), None)
    }

    #[test]
    fn test_routes_cover_task_lifecycle_durably() {
        let (_, dispatcher) = orchestrator();
        let routes = dispatcher.routes();
        let durable: Vec<&str> = routes
            .iter()
            .filter(|r| matches!(r.delivery, Delivery::Durable(_)))
            .map(|r| r.subject.as_str())
            .collect();
        assert_eq!(durable.len(), 4);
        assert!(durable.contains(&"conductor.task.*.complete"));
        let fanout: Vec<&str> = routes
            .iter()
            .filter(|r| r.delivery == Delivery::Fanout)
            .map(|r| r.subject.as_str())
            .collect();
        assert_eq!(
            fanout,
            vec!["conductor.register.*", "conductor.deregister", "conductor.heartbeat.>"]
        );
        assert_eq!(
            durable_subjects(&Subjects::default()),
            vec!["conductor.task.>".to_string()]
        );
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let (bus, dispatcher) = orchestrator();
        dispatcher
            .handle(message("conductor.register.worker", json!({"status": "idle"})))
            .await;
        assert!(dispatcher.orch.registry().is_empty());
        assert!(bus.published_json("conductor.ui.roster").is_empty());
    }

    #[tokio::test]
    async fn test_register_then_deregister() {
        let (bus, dispatcher) = orchestrator();
        dispatcher
            .handle(message("conductor.register.worker", json!({"client_id": "w1"})))
            .await;
        assert!(dispatcher.orch.registry().get("w1").is_some());
        dispatcher
            .handle(message("conductor.deregister", json!({"client_id": "w1"})))
            .await;
        assert!(dispatcher.orch.registry().get("w1").is_none());
        assert_eq!(bus.published_json("conductor.ui.roster").len(), 2);
    }

    #[tokio::test]
    async fn test_desktop_update_merges_and_keeps_status() {
        let (_, dispatcher) = orchestrator();
        dispatcher
            .handle(message(
                "conductor.api.desktop.register",
                json!({"client_id": "desk-1", "novnc_url": "http://desk-1:6080"}),
            ))
            .await;
        let registry = dispatcher.orch.registry();
        assert!(registry.get("desk-1").unwrap().is_desktop());
        registry.set_status("desk-1", ClientStatus::Busy);

        dispatcher
            .handle(message(
                "conductor.api.desktop.update",
                json!({"client_id": "desk-1", "capabilities": ["browser"]}),
            ))
            .await;
        let conn = registry.get("desk-1").unwrap();
        assert_eq!(conn.status, ClientStatus::Busy);
        assert_eq!(conn.novnc_url.as_deref(), Some("http://desk-1:6080"));
        assert_eq!(conn.capabilities, vec!["browser".to_string()]);
    }

    #[tokio::test]
    async fn test_help_cancel_requires_a_target() {
        let (_, dispatcher) = orchestrator();
        let err = dispatcher
            .on_help_cancel(HelpCancelPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Payload { .. }));
    }

    #[tokio::test]
    async fn test_task_message_reaches_ui() {
        let (bus, dispatcher) = orchestrator();
        let task = dispatcher
            .orch
            .tasks()
            .create(NewTask::new("x", TaskSource::Api))
            .await;
        dispatcher
            .handle(message(
                &format!("conductor.task.{}.message", task.task_id),
                json!({"message": {"role": "assistant", "text": "working"}}),
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dispatcher.orch.tasks().get(&task.task_id).unwrap().messages.len(), 1);
        let updates = bus.published_json("conductor.ui.task.updated");
        assert_eq!(updates.last().unwrap()["message"]["seq"], 1);
    }
}
