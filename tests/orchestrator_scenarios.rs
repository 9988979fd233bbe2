//! 编排器端到端场景：提交 → 执行 → 会话历史 → 仪表盘 → 推送

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::json;

use reg_agent::config::AppConfig;
use reg_agent::core::{ErrorCode, OrchestratorBuilder, OrchestratorError, Submission, ToolError};
use reg_agent::dashboard::ActivityKind;
use reg_agent::gateway::{EventType, HubMessage, Subscription};
use reg_agent::persistence::{MemoryPersistence, MemoryProjectStore, Persistence, Project, ProjectStore};
use reg_agent::task::{
    ClassificationData, PredicateDevice, StructuredData, Task, TaskInput, TaskRequest, TaskStatus,
    TaskType, ToolResult,
};
use reg_agent::tools::{MockCapability, ToolRegistry, LATENCY_PARAM};
use reg_agent::Orchestrator;

const PROJECT: &str = "proj_1";
const USER: &str = "user_1";

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.executor.backoff_base_ms = 1;
    config.executor.backoff_max_ms = 5;
    config
}

fn orchestrator_with(config: AppConfig, registry: ToolRegistry) -> Arc<Orchestrator> {
    OrchestratorBuilder::new(config)
        .with_registry(registry)
        .build()
        .unwrap()
}

async fn submit(orchestrator: &Arc<Orchestrator>, message: &str) -> Task {
    match orchestrator
        .handle_task_request(PROJECT, USER, message)
        .await
        .unwrap()
    {
        Submission::Queued(task) => task,
        Submission::Help(r) => panic!("expected queued task, got help: {}", r.content),
    }
}

async fn wait_for(orchestrator: &Orchestrator, task_id: &str, pred: impl Fn(&Task) -> bool) -> Task {
    for _ in 0..300 {
        let task = orchestrator.find_task(task_id).await.unwrap();
        if pred(&task) {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached expected state", task_id);
}

async fn wait_terminal(orchestrator: &Orchestrator, task_id: &str) -> Task {
    wait_for(orchestrator, task_id, |t| t.is_terminal()).await
}

/// 收集事件直到看到该任务的 agent_interaction（终态扇出的最后一步）
async fn events_until_interaction(sub: &mut Subscription, task_id: &str) -> Vec<EventType> {
    let mut seen = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), sub.recv())
            .await
            .expect("timed out waiting for events")
            .expect("subscription closed");
        if let HubMessage::Event(event) = msg {
            seen.push(event.event_type);
            if event.event_type == EventType::AgentInteraction && event.payload["id"] == task_id {
                return seen;
            }
        }
    }
}

/// 提交并等待终态扇出完成（仪表盘与推送都已更新）
async fn submit_settled(orchestrator: &Arc<Orchestrator>, message: &str) -> Task {
    let connection = format!("settle_{}", uuid::Uuid::new_v4());
    let mut sub = orchestrator.hub().subscribe(PROJECT, &connection);
    let task = submit(orchestrator, message).await;
    events_until_interaction(&mut sub, &task.id).await;
    orchestrator.hub().unsubscribe(&connection);
    orchestrator.find_task(&task.id).await.unwrap()
}

fn predicate_output(devices: &[(&str, f64, Option<(i32, u32, u32)>)]) -> serde_json::Value {
    let devices: Vec<PredicateDevice> = devices
        .iter()
        .map(|(k, score, date)| PredicateDevice {
            k_number: k.to_string(),
            device_name: format!("Device {}", k),
            intended_use: String::new(),
            confidence_score: *score,
            clearance_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
        })
        .collect();
    json!({
        "content": format!("{} devices", devices.len()),
        "confidence": 0.8,
        "citations": [],
        "data": { "devices": devices }
    })
}

#[tokio::test]
async fn classification_completes_and_updates_dashboard() {
    let mut registry = ToolRegistry::new();
    registry.register(
        TaskType::ClassifyDevice,
        MockCapability::classification("Class II", "DRT", 0.92),
    );
    let projects = Arc::new(MemoryProjectStore::new());
    projects.insert(Project::new(PROJECT, "Cardiac monitor")).await;
    let orchestrator = OrchestratorBuilder::new(fast_config())
        .with_registry(registry)
        .with_project_store(projects.clone())
        .build()
        .unwrap();

    let mut sub = orchestrator.hub().subscribe(PROJECT, "conn_a");
    let task = submit(&orchestrator, "/classify-device cardiac monitor").await;
    assert_eq!(task.status, TaskStatus::Queued);

    let events = events_until_interaction(&mut sub, &task.id).await;
    assert_eq!(events[0], EventType::ConnectionEstablished);
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == EventType::ClassificationCompleted)
            .count(),
        1
    );
    assert!(events.contains(&EventType::ProjectUpdated));
    assert!(events.contains(&EventType::ActivityAdded));

    let done = wait_terminal(&orchestrator, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);

    let snapshot = orchestrator.get_snapshot(PROJECT).await.unwrap();
    let classification = snapshot.classification.unwrap();
    assert_eq!(classification.device_class, "Class II");
    assert_eq!(classification.confidence, 0.92);

    let project = projects.get(PROJECT).await.unwrap().unwrap();
    assert_eq!(project.device_class.as_deref(), Some("Class II"));
    assert_eq!(project.product_code.as_deref(), Some("DRT"));
}

#[tokio::test]
async fn predicate_searches_keep_submission_order_and_merge_results() {
    let mut registry = ToolRegistry::new();
    registry.register(
        TaskType::PredicateSearch,
        MockCapability::scripted(
            "mock_predicates",
            vec![
                Ok(predicate_output(&[
                    ("K100001", 0.6, Some((2019, 5, 1))),
                    ("K100002", 0.9, Some((2018, 1, 1))),
                ])),
                Ok(predicate_output(&[
                    ("K200001", 0.75, None),
                    ("K100001", 0.8, Some((2019, 5, 1))),
                ])),
            ],
        )
        .with_latency(Duration::from_millis(50)),
    );
    let orchestrator = orchestrator_with(fast_config(), registry);

    let mut sub = orchestrator.hub().subscribe(PROJECT, "conn_b");
    let first = submit(&orchestrator, "/predicate-search x").await;
    let second = submit(&orchestrator, "/predicate-search y").await;
    assert_eq!(first.session_id, second.session_id);

    let mut pending = vec![first.id.clone(), second.id.clone()];
    while !pending.is_empty() {
        let msg = tokio::time::timeout(Duration::from_secs(3), sub.recv())
            .await
            .expect("timed out waiting for events")
            .expect("subscription closed");
        if let HubMessage::Event(event) = msg {
            if event.event_type == EventType::AgentInteraction {
                pending.retain(|id| event.payload["id"] != id.as_str());
            }
        }
    }

    let session = orchestrator.resume_session(&first.session_id).await.unwrap();
    let ids: Vec<&str> = session.task_history.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);

    let predicates = orchestrator.predicates(PROJECT).await.unwrap();
    let k_numbers: Vec<&str> = predicates.iter().map(|p| p.k_number.as_str()).collect();
    assert_eq!(k_numbers.len(), 3);
    assert_eq!(k_numbers[0], "K100002");
    let scores: Vec<f64> = predicates.iter().map(|p| p.confidence_score).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn repeated_timeouts_fail_without_touching_classification() {
    let mut config = fast_config();
    config.executor.sla.classify_device_secs = 0.05;
    let mut registry = ToolRegistry::new();
    let mock = MockCapability::classification("Class II", "DRT", 0.92);
    let calls = mock.call_counter();
    registry.register(TaskType::ClassifyDevice, mock);
    let orchestrator = orchestrator_with(config, registry);

    submit_settled(&orchestrator, "/classify-device cardiac monitor").await;
    let before = orchestrator.classification(PROJECT).await.unwrap();
    assert!(before.is_some());

    let mut sub = orchestrator.hub().subscribe(PROJECT, "conn_c");
    let slow = orchestrator
        .submit_request(
            PROJECT,
            USER,
            TaskRequest::new(
                TaskType::ClassifyDevice,
                TaskInput::text("implantable pacemaker").with_param(LATENCY_PARAM, json!(400)),
            ),
        )
        .await
        .unwrap();
    let events = events_until_interaction(&mut sub, &slow.id).await;
    assert!(!events.contains(&EventType::ClassificationCompleted));
    let failed = orchestrator.find_task(&slow.id).await.unwrap();

    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.as_ref().unwrap().code, ErrorCode::TimeoutError);
    assert_eq!(calls.load(Ordering::SeqCst), 1 + 3);

    let snapshot = orchestrator.get_snapshot(PROJECT).await.unwrap();
    assert_eq!(snapshot.classification, before);
    assert!(snapshot
        .recent_activity
        .iter()
        .any(|a| a.kind == ActivityKind::Error && a.task_id == slow.id));
    assert_eq!(snapshot.statistics.timed_out_tasks, 1);
}

#[tokio::test]
async fn reconnect_gets_fresh_established_and_current_snapshot() {
    let mut registry = ToolRegistry::new();
    registry.register(
        TaskType::ClassifyDevice,
        MockCapability::classification("Class III", "DXY", 0.85)
            .with_latency(Duration::from_millis(100)),
    );
    let orchestrator = orchestrator_with(fast_config(), registry);
    let hub = orchestrator.hub().clone();

    let mut sub = hub.subscribe(PROJECT, "conn_d");
    assert!(matches!(sub.recv().await, Some(HubMessage::Event(e)) if e.event_type == EventType::ConnectionEstablished));

    let task = submit(&orchestrator, "/classify-device heart valve").await;
    assert!(hub.unsubscribe("conn_d"));
    drop(sub);

    wait_terminal(&orchestrator, &task.id).await;

    let mut again = hub.subscribe(PROJECT, "conn_d");
    match again.recv().await {
        Some(HubMessage::Event(e)) => assert_eq!(e.event_type, EventType::ConnectionEstablished),
        other => panic!("expected connection_established, got {:?}", other),
    }
    let mut device_class = None;
    for _ in 0..100 {
        let snapshot = orchestrator.get_snapshot(PROJECT).await.unwrap();
        device_class = snapshot.classification.map(|c| c.device_class);
        if device_class.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(device_class.as_deref(), Some("Class III"));
}

#[tokio::test]
async fn always_unavailable_tool_is_invoked_three_times() {
    let mut registry = ToolRegistry::new();
    let mock = MockCapability::failing(ToolError::Unavailable("openFDA 503".into()));
    let calls = mock.call_counter();
    registry.register(TaskType::FindGuidance, mock);
    let orchestrator = orchestrator_with(fast_config(), registry);

    let task = submit(&orchestrator, "/find-guidance cybersecurity").await;
    let failed = wait_terminal(&orchestrator, &task.id).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(failed.status, TaskStatus::Failed);
    let failure = failed.error.unwrap();
    assert_eq!(failure.code, ErrorCode::ToolUnavailableError);
    assert_eq!(failed.retry_count, 2);

    let (_, response) = orchestrator.poll_response(&task.id).await.unwrap();
    assert_eq!(response.confidence, 0.0);
    assert_eq!(response.content, failure.message);
}

#[tokio::test]
async fn missing_confidence_is_never_fabricated() {
    let mut registry = ToolRegistry::new();
    registry.register(
        TaskType::ClassifyDevice,
        MockCapability::raw(json!({
            "content": "Class II",
            "data": {
                "device_class": "Class II",
                "product_code": "DRT",
                "regulatory_pathway": "510(k)"
            }
        })),
    );
    let orchestrator = orchestrator_with(fast_config(), registry);

    let task = submit(&orchestrator, "/classify-device monitor").await;
    let done = wait_terminal(&orchestrator, &task.id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.error.unwrap().code, ErrorCode::MalformedResponseError);
    assert!(done.result.is_none());
    assert!(orchestrator.classification(PROJECT).await.unwrap().is_none());
}

#[tokio::test]
async fn completed_classification_always_has_confidence() {
    let mut config = fast_config();
    config.fda.offline = true;
    let orchestrator = OrchestratorBuilder::new(config).build().unwrap();

    let task = submit(&orchestrator, "/classify-device infusion pump").await;
    let done = wait_terminal(&orchestrator, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    let confidence = done.confidence().unwrap();
    assert!((0.0..=1.0).contains(&confidence));
}

#[tokio::test]
async fn snapshot_is_idempotent_without_new_completions() {
    let mut registry = ToolRegistry::new();
    registry.register(
        TaskType::ClassifyDevice,
        MockCapability::classification("Class I", "LXH", 0.7),
    );
    let orchestrator = orchestrator_with(fast_config(), registry);
    submit_settled(&orchestrator, "/classify-device tongue depressor").await;

    let a = orchestrator.get_snapshot(PROJECT).await.unwrap();
    let b = orchestrator.get_snapshot(PROJECT).await.unwrap();
    assert_eq!(a, b);
    assert!(a.version > 0);
}

#[tokio::test]
async fn unrecognized_input_replies_with_help_and_queues_nothing() {
    let orchestrator = orchestrator_with(fast_config(), ToolRegistry::new());
    match orchestrator
        .handle_task_request(PROJECT, USER, "what class is my device?")
        .await
        .unwrap()
    {
        Submission::Help(response) => {
            assert_eq!(response.confidence, 0.95);
            assert!(response.sources.is_empty());
            assert!(response.content.contains("/classify-device"));
        }
        Submission::Queued(_) => panic!("unrecognized input must not queue a task"),
    }
    assert_eq!(orchestrator.sessions().open_count().await, 0);
}

#[tokio::test]
async fn unsupported_task_type_fails_with_unsupported_code() {
    let orchestrator = orchestrator_with(fast_config(), ToolRegistry::new());
    let task = submit(&orchestrator, "/compare-predicate K192345 wearable ECG").await;
    let done = wait_terminal(&orchestrator, &task.id).await;
    assert_eq!(done.error.unwrap().code, ErrorCode::UnsupportedTaskError);
}

#[tokio::test]
async fn closing_session_cancels_queued_and_discards_running() {
    let mut config = fast_config();
    config.executor.max_concurrent_tasks = 1;
    let mut registry = ToolRegistry::new();
    registry.register(
        TaskType::ClassifyDevice,
        MockCapability::classification("Class II", "DRT", 0.9),
    );
    let orchestrator = orchestrator_with(config, registry);

    let running = orchestrator
        .submit_request(
            PROJECT,
            USER,
            TaskRequest::new(
                TaskType::ClassifyDevice,
                TaskInput::text("monitor").with_param(LATENCY_PARAM, json!(300)),
            ),
        )
        .await
        .unwrap();
    wait_for(&orchestrator, &running.id, |t| t.status == TaskStatus::Running).await;
    let queued = submit(&orchestrator, "/classify-device second monitor").await;

    let cancelled = orchestrator.close_session(&running.session_id).await.unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, queued.id);
    assert_eq!(
        cancelled[0].error.as_ref().unwrap().code,
        ErrorCode::SessionClosedError
    );

    let settled = wait_terminal(&orchestrator, &running.id).await;
    assert_eq!(settled.status, TaskStatus::Failed);
    assert!(settled.result.is_none());
    assert_eq!(settled.error.unwrap().code, ErrorCode::SessionClosedError);

    let snapshot = orchestrator.get_snapshot(PROJECT).await.unwrap();
    assert!(snapshot.classification.is_none());
    assert_eq!(snapshot.progress.pending_tasks, 0);
    assert_eq!(snapshot.statistics.total_tasks, 2);
    assert!(snapshot
        .recent_activity
        .iter()
        .all(|a| a.task_id != running.id || a.kind != ActivityKind::Error));

    let next = submit(&orchestrator, "/classify-device third monitor").await;
    assert_ne!(next.session_id, running.session_id);
}

/// 上一进程留下的任务：一个已完成的 Class III 分类，一个没来得及结束的检索
async fn persisted_history(persistence: &MemoryPersistence) -> (Task, Task) {
    let mut classified = Task::new(
        "session_old".into(),
        PROJECT.into(),
        USER.into(),
        TaskRequest::new(TaskType::ClassifyDevice, TaskInput::text("implantable pacemaker")),
    );
    classified.created_at = classified.created_at - chrono::Duration::hours(2);
    classified.mark_running();
    classified.complete(ToolResult {
        content: "Class III".into(),
        confidence: 0.95,
        citations: vec![],
        structured_data: Some(StructuredData::Classification(ClassificationData {
            device_class: "Class III".into(),
            product_code: "DXY".into(),
            regulatory_pathway: "PMA".into(),
            reasoning: String::new(),
            cfr_sections: vec![],
        })),
    });
    // 新进程的序号从 1 重新开始
    classified.sequence = 1;

    let mut stale = Task::new(
        "session_old".into(),
        PROJECT.into(),
        USER.into(),
        TaskRequest::new(TaskType::PredicateSearch, TaskInput::text("pacemaker")),
    );
    stale.created_at = stale.created_at - chrono::Duration::hours(1);
    stale.mark_running();
    stale.sequence = 2;

    persistence.save_task(&classified).await.unwrap();
    persistence.save_task(&stale).await.unwrap();
    (classified, stale)
}

#[tokio::test]
async fn restart_keeps_persisted_history_when_first_touch_is_a_submission() {
    let persistence = Arc::new(MemoryPersistence::new());
    let (classified, stale) = persisted_history(&persistence).await;

    let mut registry = ToolRegistry::new();
    registry.register(TaskType::FindGuidance, MockCapability::offline(TaskType::FindGuidance));
    registry.register(
        TaskType::ClassifyDevice,
        MockCapability::classification("Class II", "DRT", 0.9),
    );
    let orchestrator = OrchestratorBuilder::new(fast_config())
        .with_registry(registry)
        .with_persistence(persistence.clone())
        .build()
        .unwrap();

    let guidance = submit_settled(&orchestrator, "/find-guidance cybersecurity").await;
    assert_eq!(guidance.status, TaskStatus::Completed);

    let snapshot = orchestrator.get_snapshot(PROJECT).await.unwrap();
    assert_eq!(snapshot.classification.as_ref().unwrap().device_class, "Class III");
    assert_eq!(snapshot.statistics.total_tasks, 3);
    assert_eq!(snapshot.progress.pending_tasks, 0);

    let reloaded = persistence.load_tasks(PROJECT).await.unwrap();
    let stale = reloaded.iter().find(|t| t.id == stale.id).unwrap();
    assert_eq!(stale.error.as_ref().unwrap().code, ErrorCode::SessionClosedError);

    let newer = submit_settled(&orchestrator, "/classify-device wearable ECG patch").await;
    assert!(newer.sequence > classified.sequence);
    let snapshot = orchestrator.get_snapshot(PROJECT).await.unwrap();
    assert_eq!(snapshot.statistics.total_tasks, 4);
    assert_eq!(snapshot.classification.unwrap().task_id, newer.id);
}

#[tokio::test]
async fn resubmit_only_accepts_failed_tasks() {
    let mut registry = ToolRegistry::new();
    registry.register(
        TaskType::ClassifyDevice,
        MockCapability::scripted(
            "flaky",
            vec![
                Err(ToolError::Validation("bad input".into())),
                Ok(json!({
                    "content": "Class II",
                    "confidence": 0.8,
                    "data": {
                        "device_class": "Class II",
                        "product_code": "DRT",
                        "regulatory_pathway": "510(k)"
                    }
                })),
            ],
        ),
    );
    let orchestrator = orchestrator_with(fast_config(), registry);

    let task = submit(&orchestrator, "/classify-device monitor").await;
    let failed = wait_terminal(&orchestrator, &task.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);

    let retry = orchestrator.resubmit(&task.id).await.unwrap();
    assert_eq!(retry.resubmitted_from.as_deref(), Some(task.id.as_str()));
    let done = wait_terminal(&orchestrator, &retry.id).await;
    assert_eq!(done.status, TaskStatus::Completed);

    assert!(matches!(
        orchestrator.resubmit(&retry.id).await,
        Err(OrchestratorError::Validation(_))
    ));
    assert!(matches!(
        orchestrator.resubmit("task_missing").await,
        Err(OrchestratorError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn admission_limit_rejects_with_retry_after() {
    let mut config = fast_config();
    config.session.max_pending_tasks = 2;
    let mut registry = ToolRegistry::new();
    registry.register(
        TaskType::FindGuidance,
        MockCapability::guidance(vec![]).with_latency(Duration::from_millis(300)),
    );
    let orchestrator = orchestrator_with(config, registry);

    submit(&orchestrator, "/find-guidance a").await;
    submit(&orchestrator, "/find-guidance b").await;
    let third = orchestrator
        .handle_task_request(PROJECT, USER, "/find-guidance c")
        .await;
    assert!(matches!(
        third,
        Err(OrchestratorError::RateLimited { retry_after_secs }) if retry_after_secs > 0
    ));
}

#[tokio::test]
async fn deleting_project_drops_state_and_notifies() {
    let mut registry = ToolRegistry::new();
    registry.register(
        TaskType::ClassifyDevice,
        MockCapability::classification("Class II", "DRT", 0.9),
    );
    let orchestrator = orchestrator_with(fast_config(), registry);
    submit_settled(&orchestrator, "/classify-device monitor").await;

    let mut sub = orchestrator.hub().subscribe(PROJECT, "conn_del");
    sub.recv().await;

    assert!(orchestrator.delete_project(PROJECT).await.unwrap());
    match tokio::time::timeout(Duration::from_secs(1), sub.recv()).await {
        Ok(Some(HubMessage::Event(e))) => {
            assert_eq!(e.event_type, EventType::ProjectUpdated);
            assert_eq!(e.payload["deleted"], true);
        }
        other => panic!("expected project_updated, got {:?}", other),
    }

    let snapshot = orchestrator.get_snapshot(PROJECT).await.unwrap();
    assert_eq!(snapshot.version, 0);
    assert!(snapshot.classification.is_none());
    assert!(!orchestrator.delete_project(PROJECT).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_get_or_create_yields_one_session() {
    let orchestrator = orchestrator_with(fast_config(), ToolRegistry::new());
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .sessions()
                    .get_or_create_session(PROJECT, USER)
                    .await
                    .id
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
}
