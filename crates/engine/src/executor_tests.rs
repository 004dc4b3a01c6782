//! End-to-end tests for the task executor.
//!
//! Everything runs over `MemoryStore` and recording `MemorySink`s, so no
//! Postgres connection is required.

use std::sync::Arc;
use std::time::Duration;

use notify::memory::MemorySink;
use notify::NotificationKind;
use serde_json::json;
use uuid::Uuid;

use crate::condition::SkipPropagation;
use crate::models::{Branch, FlowEdge, FlowGraph, FlowNode, NodeStatus, NodeType, StepStatus};
use crate::planner::{TriggerOrigin, TriggerRequest};
use crate::{
    EngineError, ExecutorConfig, FlowDefinition, FlowDraft, FlowService, MemoryStore, Sinks,
    TaskExecutor, TaskStatus, ValidationError,
};

struct Harness {
    flows: FlowService,
    executor: Arc<TaskExecutor>,
    sinks: Sinks,
    sink: MemorySink,
}

impl Harness {
    /// The recording sink, once everything queued so far has reached it.
    async fn delivered(&self) -> &MemorySink {
        self.sinks.flush().await;
        &self.sink
    }
}

fn harness_with(config: ExecutorConfig, sink: MemorySink) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let sinks = Sinks::new(Arc::new(sink.clone()), Arc::new(sink.clone()), Duration::from_secs(1));
    Harness {
        flows: FlowService::new(store.clone(), sinks.clone()),
        executor: Arc::new(TaskExecutor::new(store, sinks.clone(), config)),
        sinks,
        sink,
    }
}

fn harness() -> Harness {
    harness_with(ExecutorConfig::default(), MemorySink::new())
}

fn human(id: &str) -> FlowNode {
    FlowNode::new(id, NodeType::Human, id)
}

async fn save(h: &Harness, name: &str, nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> FlowDefinition {
    h.flows
        .save(&FlowDraft::new(name, FlowGraph::new(nodes, edges)), "designer")
        .await
        .expect("flow saves")
}

/// Flow "采购审核流程": collect(auto) -> review(human).
async fn purchase_flow(h: &Harness) -> FlowDefinition {
    save(
        h,
        "采购审核流程",
        vec![FlowNode::new("collect", NodeType::Auto, "采集数据"), FlowNode::new("review", NodeType::Human, "审核")],
        vec![FlowEdge::new("collect", "review")],
    )
    .await
}

async fn parallel_flow(h: &Harness, ids: &[&str]) -> FlowDefinition {
    save(h, "并行审批", ids.iter().map(|id| human(id)).collect(), vec![]).await
}

// ============================================================
// Instantiation
// ============================================================

#[tokio::test]
async fn purchase_review_runs_until_its_step_is_submitted() {
    let h = harness();
    let flow = purchase_flow(&h).await;

    let task = h.executor.trigger(flow.id, &TriggerRequest::manual(json!({})), "alice").await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.has_human_step);

    let dag = h.executor.task_dag(task.id).await.unwrap();
    let statuses: Vec<_> = dag.nodes.iter().map(|n| (n.node_key.as_str(), n.status)).collect();
    assert_eq!(statuses, vec![("collect", NodeStatus::Completed), ("review", NodeStatus::Pending)]);
    assert_eq!(dag.edges.len(), 1);
    assert_eq!(dag.edges[0].source, "collect");

    let steps = h.executor.steps(task.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Pending);

    let outcome = h.executor.submit_step(steps[0].id, "approved", "alice").await.unwrap();
    assert!(outcome.finalized);
    assert_eq!(outcome.step.final_content.as_deref(), Some("approved"));

    let done = h.executor.task(task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(!done.has_human_step);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn amount_condition_skips_the_true_branch_for_small_orders() {
    let h = harness();
    let flow = save(
        &h,
        "金额审批",
        vec![
            FlowNode::new("check", NodeType::Condition, "金额判断")
                .with_config(json!({"expression": "amount > 1000"})),
            human("boss"),
            human("clerk"),
        ],
        vec![
            FlowEdge::new("check", "boss").on(Branch::True),
            FlowEdge::new("check", "clerk").on(Branch::False),
        ],
    )
    .await;

    let task = h.executor.trigger(flow.id, &TriggerRequest::manual(json!({"amount": 500})), "alice").await.unwrap();
    let dag = h.executor.task_dag(task.id).await.unwrap();
    let status_of = |key: &str| dag.nodes.iter().find(|n| n.node_key == key).map(|n| n.status);

    assert_eq!(status_of("check"), Some(NodeStatus::Completed));
    assert_eq!(status_of("boss"), Some(NodeStatus::Skipped));
    assert_eq!(status_of("clerk"), Some(NodeStatus::Pending));

    let steps = h.executor.steps(task.id).await.unwrap();
    assert_eq!(steps.iter().map(|s| s.node_key.as_str()).collect::<Vec<_>>(), vec!["clerk"]);
}

#[tokio::test]
async fn flow_without_human_nodes_is_completed_on_return() {
    let h = harness();
    let flow = save(
        &h,
        "自动同步",
        vec![FlowNode::new("a", NodeType::Auto, "a"), FlowNode::new("b", NodeType::Auto, "b")],
        vec![FlowEdge::new("a", "b")],
    )
    .await;

    let task = h.executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.completed_at.is_some());
    assert!(!task.has_human_step);

    let kinds: Vec<_> = h.delivered().await.notifications().iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![NotificationKind::TaskStart]);
}

#[tokio::test]
async fn one_step_per_reachable_human_node_and_checkpoint_notifications() {
    let h = harness();
    let flow = parallel_flow(&h, &["a", "b", "c"]).await;

    let task = h.executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.has_human_step);
    assert_eq!(h.executor.steps(task.id).await.unwrap().len(), 3);

    let notes = h.delivered().await.notifications();
    assert_eq!(notes[0].kind, NotificationKind::TaskStart);
    assert_eq!(notes.iter().filter(|n| n.kind == NotificationKind::HumanStep).count(), 3);
    assert!(notes.iter().all(|n| n.task_id == task.id));
}

#[tokio::test]
async fn suggestion_origin_titles_the_task() {
    let h = harness();
    let flow = purchase_flow(&h).await;
    let request = TriggerRequest {
        origin: TriggerOrigin::Suggestion { title: "蓝牙耳机补货".into() },
        assignee: Some("bob".into()),
        ..TriggerRequest::default()
    };

    let task = h.executor.trigger(flow.id, &request, "bot").await.unwrap();
    assert_eq!(task.title, "[AI建议] 蓝牙耳机补货");
    assert_eq!(task.flow_name, "采购审核流程");

    let board = h.executor.my_tasks("bob").await.unwrap();
    assert_eq!(board.total, 1);
    assert!(h.executor.my_tasks("carol").await.unwrap().items.is_empty());
}

#[tokio::test]
async fn unknown_flow_and_bad_input_are_caller_errors() {
    let h = harness();
    assert!(matches!(
        h.executor.trigger(Uuid::new_v4(), &TriggerRequest::default(), "alice").await,
        Err(EngineError::NotFound { entity: "flow", .. })
    ));

    let flow = purchase_flow(&h).await;
    assert!(matches!(
        h.executor.trigger(flow.id, &TriggerRequest::manual(json!("amount=5")), "alice").await,
        Err(EngineError::Validation(ValidationError::InvalidInput(_)))
    ));
}

#[tokio::test]
async fn failing_sinks_never_break_the_primary_operation() {
    let h = harness_with(ExecutorConfig::default(), MemorySink::failing("im bot offline"));
    let flow = purchase_flow(&h).await;

    let task = h.executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();
    let step = h.executor.steps(task.id).await.unwrap().remove(0);
    h.executor.submit_step(step.id, "ok", "alice").await.unwrap();
    h.executor.urge(task.id, "alice").await.unwrap();
    assert!(h.delivered().await.notifications().is_empty());
}

struct Stalled;

#[async_trait::async_trait]
impl notify::NotificationSink for Stalled {
    async fn send(&self, _: notify::Notification) -> Result<(), notify::SinkError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_notifier_does_not_delay_trigger() {
    let store = Arc::new(MemoryStore::new());
    let audit = MemorySink::new();
    let sinks = Sinks::new(Arc::new(Stalled), Arc::new(audit), Duration::from_secs(2));
    let flows = FlowService::new(store.clone(), sinks.clone());
    let executor = TaskExecutor::new(store, sinks, ExecutorConfig::default());
    let flow = flows
        .save(&FlowDraft::new("三审", FlowGraph::new(vec![human("a"), human("b"), human("c")], vec![])), "designer")
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let task = executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();
    let step = executor.steps(task.id).await.unwrap().remove(0);
    executor.reject_step(step.id, "资料不全", "alice").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn transitive_mode_skips_downstream_of_dead_branch() {
    let config = ExecutorConfig { skip_propagation: SkipPropagation::Transitive, ..ExecutorConfig::default() };
    let h = harness_with(config, MemorySink::new());
    let flow = save(
        &h,
        "分支",
        vec![
            FlowNode::new("check", NodeType::Condition, "check").with_config(json!({"expression": "vip == true"})),
            FlowNode::new("gift", NodeType::Auto, "gift"),
            human("ship"),
        ],
        vec![FlowEdge::new("check", "gift").on(Branch::True), FlowEdge::new("gift", "ship")],
    )
    .await;

    let task = h.executor.trigger(flow.id, &TriggerRequest::manual(json!({"vip": false})), "alice").await.unwrap();
    let dag = h.executor.task_dag(task.id).await.unwrap();
    assert!(dag.nodes.iter().all(|n| n.node_key == "check" || n.status == NodeStatus::Skipped));
    assert_eq!(task.status, TaskStatus::Completed);
}

// ============================================================
// Human step lifecycle
// ============================================================

#[tokio::test]
async fn resolving_twice_fails_and_keeps_the_first_result() {
    let h = harness();
    let flow = purchase_flow(&h).await;
    let task = h.executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();
    let step = h.executor.steps(task.id).await.unwrap().remove(0);

    h.executor.submit_step(step.id, "first", "alice").await.unwrap();
    assert!(matches!(
        h.executor.submit_step(step.id, "second", "bob").await,
        Err(EngineError::InvalidState(_))
    ));
    assert!(matches!(
        h.executor.reject_step(step.id, "too late", "bob").await,
        Err(EngineError::InvalidState(_))
    ));

    let stored = h.executor.step(step.id).await.unwrap();
    assert_eq!(stored.final_content.as_deref(), Some("first"));
    assert_eq!(stored.reject_reason, None);
    assert_eq!(stored.resolved_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn unknown_step_is_not_found() {
    let h = harness();
    assert!(matches!(
        h.executor.submit_step(Uuid::new_v4(), "x", "alice").await,
        Err(EngineError::NotFound { entity: "step", .. })
    ));
}

#[tokio::test]
async fn one_rejection_rejects_the_whole_task() {
    let h = harness();
    let flow = parallel_flow(&h, &["a", "b", "c"]).await;
    let task = h.executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();
    let steps = h.executor.steps(task.id).await.unwrap();

    let outcome = h.executor.reject_step(steps[1].id, "预算不足", "bob").await.unwrap();
    assert!(outcome.finalized);
    assert_eq!(outcome.task.status, TaskStatus::Rejected);
    assert!(!outcome.task.has_human_step);

    let reloaded = h.executor.task(task.id).await.unwrap();
    assert_eq!(reloaded.status, TaskStatus::Rejected);
    assert!(!reloaded.has_human_step);
    assert_eq!(reloaded.current_step.as_deref(), Some("已驳回: 预算不足"));

    // Siblings stay pending but are closed for resolution.
    let siblings = h.executor.steps(task.id).await.unwrap();
    assert_eq!(siblings[0].status, StepStatus::Pending);
    assert!(matches!(
        h.executor.submit_step(siblings[0].id, "ok", "alice").await,
        Err(EngineError::InvalidState(_))
    ));

    let audit = h.delivered().await.audit_entries();
    assert!(audit.iter().any(|e| e.action == "step_rejected" && e.actor == "bob"));
}

#[tokio::test]
async fn two_steps_in_either_order_complete_once() {
    for reverse in [false, true] {
        let h = harness();
        let flow = parallel_flow(&h, &["a", "b"]).await;
        let task = h.executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();
        let mut steps = h.executor.steps(task.id).await.unwrap();
        if reverse {
            steps.reverse();
        }

        let first = h.executor.submit_step(steps[0].id, "ok", "alice").await.unwrap();
        assert!(!first.finalized);
        assert_eq!(first.task.status, TaskStatus::Running);

        let second = h.executor.submit_step(steps[1].id, "ok", "alice").await.unwrap();
        assert!(second.finalized);
        assert_eq!(second.task.status, TaskStatus::Completed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_finalize_exactly_once() {
    for _ in 0..50 {
        let h = harness();
        let flow = parallel_flow(&h, &["a", "b"]).await;
        let task = h.executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();
        let steps = h.executor.steps(task.id).await.unwrap();

        let handles: Vec<_> = steps
            .iter()
            .map(|step| {
                let executor = h.executor.clone();
                let id = step.id;
                tokio::spawn(async move { executor.submit_step(id, "ok", "alice").await })
            })
            .collect();

        let mut finalized = 0;
        for handle in handles {
            let outcome = handle.await.expect("join").expect("submit");
            finalized += usize::from(outcome.finalized);
        }
        assert_eq!(finalized, 1);

        let done = h.executor.task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(!done.has_human_step);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_on_the_same_step_lets_one_caller_win() {
    let h = harness();
    let flow = purchase_flow(&h).await;
    let task = h.executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();
    let step = h.executor.steps(task.id).await.unwrap().remove(0);

    let (a, b) = tokio::join!(
        h.executor.submit_step(step.id, "from alice", "alice"),
        h.executor.reject_step(step.id, "from bob", "bob"),
    );
    assert!(a.is_ok() ^ b.is_ok());
}

// ============================================================
// Terminate / urge
// ============================================================

#[tokio::test]
async fn terminate_fails_a_live_task_once() {
    let h = harness();
    let flow = purchase_flow(&h).await;
    let task = h.executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();

    let failed = h.executor.terminate(task.id, Some("供应商停产"), "boss").await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.completed_at.is_some());
    assert!(!failed.has_human_step);
    assert!(failed.current_step.as_deref().unwrap().ends_with("(终止原因: 供应商停产)"));

    assert!(matches!(
        h.executor.terminate(task.id, None, "boss").await,
        Err(EngineError::InvalidState(_))
    ));
    assert!(h.delivered().await.audit_entries().iter().any(|e| e.action == "task_terminated"));
}

#[tokio::test]
async fn urge_works_on_terminal_tasks_and_changes_nothing() {
    let h = harness();
    let flow = save(&h, "自动", vec![FlowNode::new("a", NodeType::Auto, "a")], vec![]).await;
    let task = h.executor.trigger(flow.id, &TriggerRequest::default(), "alice").await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let urged = h.executor.urge(task.id, "boss").await.unwrap();
    assert_eq!(urged, h.executor.task(task.id).await.unwrap());

    let reminder = h
        .delivered()
        .await
        .notifications()
        .into_iter()
        .find(|n| n.kind == NotificationKind::Reminder)
        .expect("reminder sent");
    assert_eq!(reminder.target, "manager");

    assert!(matches!(
        h.executor.urge(Uuid::new_v4(), "boss").await,
        Err(EngineError::NotFound { entity: "task", .. })
    ));
}

#[tokio::test]
async fn preview_does_not_create_tasks() {
    let h = harness();
    let flow = purchase_flow(&h).await;
    let preview = h.executor.preview(flow.id, &json!({})).await.unwrap();
    assert_eq!(preview.order, vec!["collect", "review"]);
    assert_eq!(preview.human_steps, vec!["审核"]);
    assert_eq!(h.executor.list_tasks(&Default::default()).await.unwrap().total, 0);
}
