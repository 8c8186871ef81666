#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end tests: a full orchestrator behind its dispatcher, driven only
//! through bus messages by fake workers, supervisors, gateways and UIs.

use chrono::Utc;
use conductor_bus::{InMemoryBus, MessageBus, MessageBusExt};
use conductor_core::protocol::TaskAssignment;
use conductor_core::{ClientStatus, ClientType, HelpStatus, Subjects, TaskSource, TaskStatus};
use conductor_orchestrator::{Dispatcher, Orchestrator, OrchestratorConfig, Transition};
use conductor_store::{MemoryStore, Repositories, TaskRepository};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Harness {
    bus: InMemoryBus,
    orch: Arc<Orchestrator>,
    subjects: Subjects,
    _shutdown: watch::Sender<bool>,
}

async fn start() -> Harness {
    start_replica(&InMemoryBus::new(), Arc::new(MemoryStore::new()), "conductor-1").await
}

/// One orchestrator instance; replicas share the bus and the store.
async fn start_replica(bus: &InMemoryBus, store: Arc<MemoryStore>, instance_id: &str) -> Harness {
    let config = OrchestratorConfig {
        instance_id: instance_id.to_string(),
        ..OrchestratorConfig::default()
    };
    let orch = Orchestrator::new(
        config,
        Arc::new(bus.clone()),
        Repositories::from_store(store),
    );
    orch.bootstrap().await;
    let (tx, rx) = watch::channel(false);
    Dispatcher::new(orch.clone()).start(rx).await.unwrap();
    Harness {
        bus: bus.clone(),
        subjects: orch.subjects().clone(),
        orch,
        _shutdown: tx,
    }
}

impl Harness {
    async fn request(&self, subject: &str, body: Value) -> Value {
        self.bus
            .request_json(subject, &body, Duration::from_secs(2))
            .await
            .unwrap()
    }

    async fn publish(&self, subject: &str, body: Value) {
        self.bus.publish_json(subject, &body).await.unwrap();
    }

    /// Register an executor that accepts every assignment and reports what
    /// it was given.
    async fn executor(&self, client_type: ClientType, client_id: &str) -> mpsc::UnboundedReceiver<TaskAssignment> {
        let mut inbox = self
            .bus
            .subscribe(&self.subjects.assignment(client_type, client_id))
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let responder = self.bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbox.next().await {
                let assignment: TaskAssignment = serde_json::from_slice(&msg.payload).unwrap();
                responder
                    .respond(&msg, &json!({"accepted": true}))
                    .await
                    .unwrap();
                let _ = tx.send(assignment);
            }
        });

        let ack = self
            .request(
                &format!("conductor.register.{client_type}"),
                json!({"client_id": client_id}),
            )
            .await;
        assert_eq!(ack["status"], "ok");
        rx
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn next_assignment(rx: &mut mpsc::UnboundedReceiver<TaskAssignment>) -> TaskAssignment {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("assignment in time")
        .expect("executor alive")
}

#[tokio::test]
async fn submitted_task_runs_to_completion() {
    let h = start().await;
    let mut w1 = h.executor(ClientType::Worker, "w1").await;

    let ack = h.request("conductor.api.tasks.submit", json!({"prompt": "x"})).await;
    assert_eq!(ack["status"], "ok");
    assert_eq!(ack["worker_id"], "w1");
    let task_id = ack["task_id"].as_str().unwrap().to_string();
    assert_eq!(next_assignment(&mut w1).await.task_id, task_id);
    assert_eq!(h.orch.registry().get("w1").unwrap().status, ClientStatus::Busy);

    h.publish(&format!("conductor.task.{task_id}.started"), json!({"session_id": "s-1"}))
        .await;
    eventually(|| h.orch.tasks().get(&task_id).unwrap().status == TaskStatus::Running).await;

    h.publish(&format!("conductor.task.{task_id}.complete"), json!({"result": "ok"}))
        .await;
    eventually(|| h.orch.tasks().get(&task_id).unwrap().status == TaskStatus::Completed).await;
    eventually(|| h.orch.registry().get("w1").unwrap().is_idle()).await;

    // Replayed completion changes nothing.
    h.publish(&format!("conductor.task.{task_id}.error"), json!({"error": "late"}))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let task = h.orch.tasks().get(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!("ok")));

    // Api-sourced tasks never answer into a gateway.
    assert!(h.bus.published_json("conductor.gateway.*.send").is_empty());
}

#[tokio::test]
async fn second_assignment_conflicts_and_keeps_first_worker() {
    let h = start().await;
    let ack = h.request("conductor.api.tasks.submit", json!({"prompt": "x"})).await;
    let task_id = ack["task_id"].as_str().unwrap();
    assert_eq!(ack["status"], "pending");

    let tasks = h.orch.tasks();
    assert!(matches!(tasks.assign(task_id, "w1").await, Transition::Applied(_)));
    assert_eq!(
        tasks.assign(task_id, "w2").await,
        Transition::Conflict {
            current: TaskStatus::Assigned
        }
    );
    assert_eq!(tasks.get(task_id).unwrap().worker_id.as_deref(), Some("w1"));
}

#[tokio::test]
async fn help_request_times_out_and_rejects_late_answer() {
    let h = start().await;
    let ack = h
        .request(
            "conductor.help.request",
            json!({
                "request_id": "H1",
                "task_id": "t1",
                "worker_id": "w1",
                "questions": [{"question": "Which account?"}],
                "timeout_seconds": 0.1
            }),
        )
        .await;
    assert_eq!(ack["request_id"], "H1");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.orch.help().get("H1").unwrap().status, HelpStatus::Timeout);

    let late = h
        .request(
            "conductor.help.respond",
            json!({"request_id": "H1", "answers": {"Which account?": "work"}}),
        )
        .await;
    assert_eq!(late["status"], "error");

    let replies = h.bus.published_json("conductor.help.reply.w1");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["error"], "timeout");
}

#[tokio::test]
async fn help_request_is_answered_exactly_once() {
    let h = start().await;
    let mut sup = h.executor(ClientType::Supervisor, "s1").await;
    h.publish(
        "conductor.gateway.telegram.inbound",
        json!({"chat_id": 42, "text": "book a flight"}),
    )
    .await;
    let task_id = next_assignment(&mut sup).await.task_id;

    h.request(
        "conductor.help.request",
        json!({
            "request_id": "H2",
            "task_id": task_id,
            "worker_id": "s1",
            "questions": [{"question": "Window or aisle?"}]
        }),
    )
    .await;
    let posts = h.bus.published_json("conductor.gateway.telegram.help");
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["chat_id"], 42);

    let posted = h
        .request(
            "conductor.gateway.telegram.help_posted",
            json!({"request_id": "H2", "message_id": 77}),
        )
        .await;
    assert_eq!(posted["status"], "ok");

    let first = h
        .request(
            "conductor.help.respond",
            json!({"request_id": "H2", "answers": {"Window or aisle?": "window"}}),
        )
        .await;
    assert_eq!(first["status"], "ok");
    let second = h
        .request(
            "conductor.gateway.telegram.callback",
            json!({"message_id": "77", "answers": {"Window or aisle?": "aisle"}}),
        )
        .await;
    assert_eq!(second["status"], "error");

    let request = h.orch.help().get("H2").unwrap();
    assert_eq!(request.status, HelpStatus::Responded);
    assert_eq!(request.answers.unwrap()["Window or aisle?"], "window");
    assert_eq!(h.bus.published_json("conductor.help.reply.s1").len(), 1);
    assert_eq!(h.bus.published_json("conductor.gateway.telegram.edit").len(), 1);
}

#[tokio::test]
async fn self_learning_schedule_hands_optimizer_to_idle_supervisor() {
    let h = start().await;
    let mut w1 = h.executor(ClientType::Worker, "w1").await;
    let mut s1 = h.executor(ClientType::Supervisor, "s1").await;

    let created = h
        .request(
            "conductor.api.schedules.create",
            json!({
                "name": "digest",
                "prompt": "summarize the news",
                "interval_seconds": 60,
                "self_learning": true
            }),
        )
        .await;
    let schedule_id = created["schedule"]["schedule_id"].as_str().unwrap().to_string();

    let fired = h
        .orch
        .scheduler()
        .tick(Utc::now() + chrono::Duration::seconds(120))
        .await
        .unwrap();
    assert_eq!(fired.len(), 1);
    let task_id = next_assignment(&mut w1).await.task_id;

    h.publish(
        &format!("conductor.task.{task_id}.complete"),
        json!({"result": "three headlines"}),
    )
    .await;

    let optimizer = next_assignment(&mut s1).await;
    assert_eq!(optimizer.source, TaskSource::Optimizer);
    assert!(optimizer.prompt.contains(&schedule_id));
    let optimizers: Vec<_> = h
        .orch
        .tasks()
        .all()
        .into_iter()
        .filter(|t| t.source == TaskSource::Optimizer)
        .collect();
    assert_eq!(optimizers.len(), 1);
    assert_eq!(optimizers[0].worker_id.as_deref(), Some("s1"));
}

#[tokio::test]
async fn optimizer_waits_when_no_supervisor_is_idle() {
    let h = start().await;
    let mut w1 = h.executor(ClientType::Worker, "w1").await;
    h.request(
        "conductor.api.schedules.create",
        json!({
            "name": "digest",
            "prompt": "summarize the news",
            "interval_seconds": 60,
            "self_learning": true
        }),
    )
    .await;
    h.orch
        .scheduler()
        .tick(Utc::now() + chrono::Duration::seconds(120))
        .await
        .unwrap();
    let task_id = next_assignment(&mut w1).await.task_id;

    h.publish(&format!("conductor.task.{task_id}.complete"), json!({"result": "done"}))
        .await;
    eventually(|| {
        h.orch
            .tasks()
            .all()
            .iter()
            .any(|t| t.source == TaskSource::Optimizer)
    })
    .await;

    let optimizer = h
        .orch
        .tasks()
        .all()
        .into_iter()
        .find(|t| t.source == TaskSource::Optimizer)
        .unwrap();
    assert_eq!(optimizer.status, TaskStatus::Pending);
    assert!(optimizer.worker_id.is_none());
}

#[tokio::test]
async fn gateway_task_answers_back_into_its_chat() {
    let h = start().await;
    let mut s1 = h.executor(ClientType::Supervisor, "s1").await;

    let ack = h
        .request(
            "conductor.gateway.telegram.inbound",
            json!({"chat_id": 123, "text": "what's the weather?", "user": "ana"}),
        )
        .await;
    let task_id = ack["task_id"].as_str().unwrap().to_string();
    let assignment = next_assignment(&mut s1).await;
    assert_eq!(assignment.task_id, task_id);
    assert_eq!(assignment.source, TaskSource::Gateway);
    assert_eq!(assignment.source_metadata["channel"], "telegram");

    h.publish(&format!("conductor.task.{task_id}.complete"), json!({"result": "Done"}))
        .await;
    eventually(|| !h.bus.published_json("conductor.gateway.*.send").is_empty()).await;

    // A duplicate completion must not send a second reply.
    h.publish(&format!("conductor.task.{task_id}.complete"), json!({"result": "Done"}))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sends = h.bus.published_json("conductor.gateway.*.send");
    assert_eq!(sends, vec![json!({"chat_id": 123, "text": "Done"})]);
    assert_eq!(h.bus.published_json("conductor.gateway.telegram.send").len(), 1);
}

#[tokio::test]
async fn heartbeat_without_type_does_not_register() {
    let h = start().await;
    h.publish("conductor.heartbeat.worker.ghost", json!({"client_id": "ghost"}))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.orch.registry().get("ghost").is_none());

    h.publish(
        "conductor.heartbeat.worker.w9",
        json!({"client_id": "w9", "client_type": "worker", "status": "idle"}),
    )
    .await;
    eventually(|| h.orch.registry().get("w9").is_some()).await;
    assert!(!h.bus.published_json("conductor.ui.roster").is_empty());
}

#[tokio::test]
async fn schedule_with_max_runs_disables_itself() {
    let h = start().await;
    let created = h
        .request(
            "conductor.api.schedules.create",
            json!({"name": "once", "prompt": "ping", "interval_seconds": 30, "max_runs": 1}),
        )
        .await;
    let schedule_id = created["schedule"]["schedule_id"].as_str().unwrap().to_string();

    let later = Utc::now() + chrono::Duration::seconds(60);
    assert_eq!(h.orch.scheduler().tick(later).await.unwrap().len(), 1);
    assert!(h
        .orch
        .scheduler()
        .tick(later + chrono::Duration::seconds(60))
        .await
        .unwrap()
        .is_empty());

    let listed = h.request("conductor.api.schedules.list", json!({})).await;
    let schedule = listed["schedules"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["schedule_id"] == schedule_id.as_str())
        .unwrap()
        .clone();
    assert_eq!(schedule["enabled"], false);
    assert!(schedule["next_run_at"].is_null());
    assert_eq!(schedule["run_count"], 1);
}

#[tokio::test]
async fn deregistered_worker_loses_unstarted_task() {
    let h = start().await;
    let mut w1 = h.executor(ClientType::Worker, "w1").await;
    let ack = h.request("conductor.api.tasks.submit", json!({"prompt": "x"})).await;
    let task_id = ack["task_id"].as_str().unwrap().to_string();
    next_assignment(&mut w1).await;

    h.request("conductor.deregister", json!({"client_id": "w1"}))
        .await;
    assert!(h.orch.registry().get("w1").is_none());
    let task = h.orch.tasks().get(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.worker_id.is_none());
}

async fn stored_status(store: &MemoryStore, task_id: &str) -> Option<TaskStatus> {
    store.get_task(task_id).await.unwrap().map(|t| t.status)
}

#[tokio::test]
async fn every_replica_tracks_every_client() {
    let bus = InMemoryBus::new();
    let store = Arc::new(MemoryStore::new());
    let a = start_replica(&bus, store.clone(), "conductor-a").await;
    let b = start_replica(&bus, store, "conductor-b").await;

    let _w1 = a.executor(ClientType::Worker, "w1").await;
    eventually(|| a.orch.registry().get("w1").is_some() && b.orch.registry().get("w1").is_some())
        .await;

    a.publish(
        "conductor.heartbeat.worker.w1",
        json!({"client_id": "w1", "status": "busy"}),
    )
    .await;
    eventually(|| {
        [&a, &b]
            .iter()
            .all(|h| h.orch.registry().get("w1").unwrap().status == ClientStatus::Busy)
    })
    .await;

    a.publish("conductor.deregister", json!({"client_id": "w1"})).await;
    eventually(|| a.orch.registry().get("w1").is_none() && b.orch.registry().get("w1").is_none())
        .await;
}

#[tokio::test]
async fn lifecycle_events_complete_tasks_on_any_replica() {
    let bus = InMemoryBus::new();
    let store = Arc::new(MemoryStore::new());
    let a = start_replica(&bus, store.clone(), "conductor-a").await;
    let b = start_replica(&bus, store.clone(), "conductor-b").await;
    let mut w1 = a.executor(ClientType::Worker, "w1").await;
    eventually(|| b.orch.registry().get("w1").is_some()).await;

    // Submissions are shared across the queue group, so each replica owns one.
    let mut task_ids = Vec::new();
    for prompt in ["first", "second"] {
        let ack = a.request("conductor.api.tasks.submit", json!({"prompt": prompt})).await;
        assert_eq!(ack["status"], "ok");
        task_ids.push(ack["task_id"].as_str().unwrap().to_string());
    }
    let first = next_assignment(&mut w1).await;
    let second = next_assignment(&mut w1).await;
    assert_ne!(first.task_id, second.task_id);
    assert!(a.orch.tasks().get(&task_ids[0]).is_some() != a.orch.tasks().get(&task_ids[1]).is_some());

    // Completions arrive in the opposite order, so each lands on the replica
    // that did not create the task.
    for task_id in task_ids.iter().rev() {
        a.publish(&format!("conductor.task.{task_id}.complete"), json!({"result": "ok"}))
            .await;
    }
    for _ in 0..200 {
        let mut done = 0;
        for task_id in &task_ids {
            if stored_status(&store, task_id).await == Some(TaskStatus::Completed) {
                done += 1;
            }
        }
        if done == task_ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for task_id in &task_ids {
        assert_eq!(stored_status(&store, task_id).await, Some(TaskStatus::Completed));
    }
}
