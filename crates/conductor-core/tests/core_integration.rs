#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for conductor-core.
//!
//! Exercises the public surface the other crates rely on: decoding inbound
//! messages built with the same subject builders the orchestrator uses, the
//! task state machine, and schedule run accounting.

use chrono::Utc;
use conductor_core::protocol::{
    Ack, DesktopAdmin, GatewaySend, HelpReply, ScheduleAdmin, TaskAssignment,
};
use conductor_core::*;
use serde_json::json;

// ---------------------------------------------------------------------------
// 1. Subjects round-trip through the decoder
// ---------------------------------------------------------------------------

#[test]
fn decoded_subjects_match_builders() {
    let subjects = Subjects::new("acme");

    let register = subjects.register(ClientType::Gateway);
    let event = InboundEvent::decode(
        &subjects,
        &register,
        json!({"client_id": "tg"}).to_string().as_bytes(),
    )
    .unwrap();
    assert!(matches!(
        event,
        InboundEvent::Register {
            client_type: ClientType::Gateway,
            ..
        }
    ));

    let heartbeat = subjects.heartbeat(ClientType::Worker, "w1");
    assert!(subject_matches(&subjects.heartbeat_all(), &heartbeat));
    let event = InboundEvent::decode(&subjects, &heartbeat, b"{}").unwrap();
    match event {
        InboundEvent::Heartbeat(hb) => assert_eq!(hb.client_id, "w1"),
        other => panic!("unexpected {other:?}"),
    }

    let started = subjects.task_event("t-42", "started");
    assert!(subject_matches(&subjects.task_events("started"), &started));
    assert!(subject_matches(&subjects.task_stream(), &started));
    let event = InboundEvent::decode(
        &subjects,
        &started,
        json!({"session_id": "s1"}).to_string().as_bytes(),
    )
    .unwrap();
    match event {
        InboundEvent::TaskStarted { task_id, payload } => {
            assert_eq!(task_id, "t-42");
            assert_eq!(payload.session_id.as_deref(), Some("s1"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn admin_subjects_decode() {
    let subjects = Subjects::default();
    let event = InboundEvent::decode(
        &subjects,
        &subjects.desktop_api("register"),
        json!({"client_id": "desk-1", "novnc_url": "http://desk-1"})
            .to_string()
            .as_bytes(),
    )
    .unwrap();
    match event {
        InboundEvent::Desktop(DesktopAdmin::Register(worker)) => {
            assert_eq!(worker.client_id, "desk-1");
        }
        other => panic!("unexpected {other:?}"),
    }

    let event = InboundEvent::decode(
        &subjects,
        &subjects.schedules_api("update"),
        json!({"schedule_id": "s1", "enabled": false})
            .to_string()
            .as_bytes(),
    )
    .unwrap();
    match event {
        InboundEvent::Schedule(ScheduleAdmin::Update(update)) => {
            assert_eq!(update.schedule_id, "s1");
            assert_eq!(update.patch.enabled, Some(false));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn help_request_requires_questions() {
    let subjects = Subjects::default();
    let err = InboundEvent::decode(
        &subjects,
        &subjects.help("request"),
        json!({"task_id": "t1", "worker_id": "w1", "questions": []})
            .to_string()
            .as_bytes(),
    )
    .unwrap_err();
    assert!(matches!(err, ConductorError::Payload { .. }));
}

// ---------------------------------------------------------------------------
// 2. Outbound payload shapes
// ---------------------------------------------------------------------------

#[test]
fn outbound_payload_shapes() {
    let mut task = Task::new("t1", "open the dashboard", TaskSource::Gateway);
    task.source_metadata.insert("channel".into(), json!("telegram"));
    let assignment = TaskAssignment::from(&task);
    let value = serde_json::to_value(&assignment).unwrap();
    assert_eq!(value["task_id"], "t1");
    assert_eq!(value["source"], "gateway");
    assert_eq!(value["source_metadata"]["channel"], "telegram");

    let send = GatewaySend {
        chat_id: json!(123),
        text: "Done".into(),
    };
    assert_eq!(
        serde_json::to_value(&send).unwrap(),
        json!({"chat_id": 123, "text": "Done"})
    );

    let reply = HelpReply {
        request_id: "h1".into(),
        task_id: "t1".into(),
        answers: None,
        source: None,
        error: Some("timeout".into()),
    };
    assert_eq!(serde_json::to_value(&reply).unwrap()["error"], "timeout");

    let ack = Ack::error("no such schedule");
    assert!(!ack.is_ok());
}

// ---------------------------------------------------------------------------
// 3. Entity lifecycles
// ---------------------------------------------------------------------------

#[test]
fn task_requeue_then_reassign() {
    let mut task = Task::new("t1", "x", TaskSource::Scheduler);
    task.assign_to("w1").unwrap();
    task.requeue().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.worker_id.is_none());
    task.assign_to("w2").unwrap();
    assert_eq!(task.worker_id.as_deref(), Some("w2"));
    assert_eq!(task.version, 4);
}

#[test]
fn schedule_serde_keeps_run_state() {
    let mut schedule = ScheduledTask::new("report", "build the weekly report", 3600);
    schedule.max_runs = Some(1);
    schedule.record_run(Utc::now());
    let json = serde_json::to_string(&schedule).unwrap();
    let back: ScheduledTask = serde_json::from_str(&json).unwrap();
    assert_eq!(back.run_count, 1);
    assert!(!back.enabled);
    assert!(back.next_run_at.is_none());
}
