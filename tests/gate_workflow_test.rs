//! End-to-end gate workflow tests.
//!
//! Drives tasks through the full review pipeline the way agents do:
//! completion-report envelopes through the protocol router, with the
//! dispatcher's per-gate agent assignment simulated between gates.
//!
//! Each test creates its own `TempDir` for full isolation.

use std::sync::Arc;

use tempfile::TempDir;

use foreman::domain::models::{
    Envelope, GateConfig, GateOutcome, GateWhen, ProtocolMessage, Routing, RunOutcome, Task,
    TaskId, TaskStatus, TestStats, WorkflowConfig,
};
use foreman::infrastructure::events::EventLog;
use foreman::infrastructure::store::{NewTask, RunArtifacts, TaskStore};
use foreman::services::{
    AcquireOptions, GateEngine, LeaseManager, ProtocolRouter, TaskLocks,
};

mod harness {
    use super::*;

    pub struct Pipeline {
        pub _dir: TempDir,
        pub store: Arc<TaskStore>,
        pub event_log: Arc<EventLog>,
        pub leases: Arc<LeaseManager>,
        pub router: ProtocolRouter,
    }

    /// implement -> code_review -> qa_review, with qa gated on the
    /// `feature` tag.
    pub fn feature_workflow() -> WorkflowConfig {
        WorkflowConfig::new(
            "feature-pipeline",
            vec![
                GateConfig::new("implement", "developer"),
                GateConfig::new("code_review", "reviewer").rejectable(),
                GateConfig::new("qa_review", "qa")
                    .rejectable()
                    .with_when(GateWhen::has_tag("feature")),
            ],
        )
    }

    pub async fn pipeline() -> Pipeline {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).await.unwrap());
        let event_log = Arc::new(EventLog::open(dir.path(), Vec::new()).await.unwrap());
        let artifacts = RunArtifacts::new(dir.path());
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&store),
            artifacts.clone(),
            Arc::clone(&event_log),
            chrono::Duration::minutes(5),
        ));
        let engine = Arc::new(GateEngine::new(
            Arc::clone(&store),
            Arc::clone(&event_log),
            feature_workflow(),
        ));
        let router = ProtocolRouter::new(
            "proj-a",
            Arc::clone(&store),
            artifacts,
            Arc::clone(&event_log),
            Arc::new(TaskLocks::new()),
            Some(engine),
        );
        Pipeline {
            _dir: dir,
            store,
            event_log,
            leases,
            router,
        }
    }

    /// Create a workflow task, enroll it at the first gate, and lease
    /// it to `agent` so it is in progress.
    pub async fn start_task(p: &Pipeline, agent: &str, tags: &[&str]) -> Task {
        let mut routing = Routing::to_agent(agent);
        for tag in tags {
            routing = routing.with_tag(*tag);
        }
        let task = p
            .store
            .create(NewTask {
                project: "proj-a".into(),
                title: "ship the feature".into(),
                body: "Implement, review, QA.\n".into(),
                routing,
                ..NewTask::default()
            })
            .await
            .unwrap();
        p.store
            .update(&task.id, |t| {
                t.gate = Some(foreman::domain::models::GatePosition {
                    current: "implement".into(),
                    entered: chrono::Utc::now(),
                });
            })
            .await
            .unwrap();
        p.store.transition(&task.id, TaskStatus::Ready).await.unwrap();
        p.leases
            .acquire(
                &task.id,
                agent,
                AcquireOptions {
                    ttl: chrono::Duration::minutes(15),
                    write_run_artifacts: false,
                },
            )
            .await
            .unwrap()
    }

    /// Simulate the dispatcher assigning the gate's work to a concrete
    /// agent.
    pub async fn hand_to(p: &Pipeline, task_id: &TaskId, agent: &str) {
        let agent = agent.to_string();
        p.store
            .update(task_id, move |task| {
                task.routing.role = None;
                task.routing.agent = Some(agent);
            })
            .await
            .unwrap();
    }

    /// Send a completion report from `agent`.
    pub async fn report(
        p: &Pipeline,
        task_id: &TaskId,
        agent: &str,
        outcome: RunOutcome,
        blockers: Vec<String>,
        rejection_notes: Option<String>,
    ) {
        // Give every gate a measurable dwell time.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let message = ProtocolMessage::CompletionReport {
            outcome,
            summary_ref: None,
            deliverables: Vec::new(),
            tests: TestStats::default(),
            blockers,
            rejection_notes,
            notes: None,
            summary: None,
        };
        p.router
            .handle(&Envelope::new("proj-a", task_id.clone(), agent, message))
            .await
            .unwrap();
    }
}

use harness::{hand_to, pipeline, report, start_task};

#[tokio::test]
async fn happy_path_feature_runs_all_three_gates() {
    let p = pipeline().await;
    let task = start_task(&p, "dev-1", &["feature"]).await;

    report(&p, &task.id, "dev-1", RunOutcome::Done, Vec::new(), None).await;
    hand_to(&p, &task.id, "rev-1").await;
    report(&p, &task.id, "rev-1", RunOutcome::Done, Vec::new(), None).await;
    hand_to(&p, &task.id, "qa-1").await;
    report(&p, &task.id, "qa-1", RunOutcome::Done, Vec::new(), None).await;

    let task = p.store.get(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.gate_history.len(), 3);
    let gates: Vec<&str> = task.gate_history.iter().map(|e| e.gate.as_str()).collect();
    assert_eq!(gates, vec!["implement", "code_review", "qa_review"]);
    for entry in &task.gate_history {
        assert_eq!(entry.outcome, GateOutcome::Complete);
        assert!(entry.duration_ms > 0, "gate {} had no dwell time", entry.gate);
        assert!(entry.entered <= entry.exited);
    }
    // History is monotonic: each gate is entered after the previous
    // one exits (1ms of clock jitter allowed).
    for pair in task.gate_history.windows(2) {
        assert!(
            pair[1].entered >= pair[0].exited - chrono::Duration::milliseconds(1),
            "gate history out of order"
        );
    }
}

#[tokio::test]
async fn rejection_loops_back_then_completes() {
    let p = pipeline().await;
    let task = start_task(&p, "dev-1", &["feature"]).await;

    report(&p, &task.id, "dev-1", RunOutcome::Done, Vec::new(), None).await;
    hand_to(&p, &task.id, "rev-1").await;
    report(
        &p,
        &task.id,
        "rev-1",
        RunOutcome::NeedsReview,
        vec!["missing error handling".into(), "no retry logic".into()],
        Some("retry transient failures".into()),
    )
    .await;

    let rejected = p.store.get(&task.id).await.unwrap();
    assert_eq!(rejected.status, TaskStatus::InProgress);
    assert_eq!(rejected.gate.as_ref().unwrap().current, "implement");
    let ctx = rejected.review_context.as_ref().unwrap();
    assert_eq!(ctx.from_gate, "code_review");
    assert_eq!(
        ctx.blockers,
        vec![
            "missing error handling".to_string(),
            "no retry logic".to_string()
        ]
    );
    assert_eq!(ctx.notes.as_deref(), Some("retry transient failures"));

    // Rework and drive the pipeline home.
    hand_to(&p, &task.id, "dev-1").await;
    report(&p, &task.id, "dev-1", RunOutcome::Done, Vec::new(), None).await;
    hand_to(&p, &task.id, "rev-1").await;
    report(&p, &task.id, "rev-1", RunOutcome::Done, Vec::new(), None).await;
    hand_to(&p, &task.id, "qa-1").await;
    report(&p, &task.id, "qa-1", RunOutcome::Done, Vec::new(), None).await;

    let task = p.store.get(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.review_context.is_none());
    assert_eq!(task.gate_history.len(), 5);
    let outcomes: Vec<GateOutcome> = task.gate_history.iter().map(|e| e.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            GateOutcome::Complete,
            GateOutcome::NeedsReview,
            GateOutcome::Complete,
            GateOutcome::Complete,
            GateOutcome::Complete,
        ]
    );
}

#[tokio::test]
async fn bugfix_fast_path_skips_qa() {
    let p = pipeline().await;
    let task = start_task(&p, "dev-1", &["skip-qa"]).await;

    report(&p, &task.id, "dev-1", RunOutcome::Done, Vec::new(), None).await;
    hand_to(&p, &task.id, "rev-1").await;
    report(&p, &task.id, "rev-1", RunOutcome::Done, Vec::new(), None).await;

    let task = p.store.get(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.gate_history.len(), 2);

    // The final gate transition records qa_review as skipped.
    let transitions = p
        .event_log
        .events_of_type(foreman::domain::models::EventType::GateTransition)
        .await
        .unwrap();
    let last = transitions
        .iter()
        .find(|e| e.payload["from"] == "code_review")
        .unwrap();
    assert_eq!(last.payload["skipped"][0], "qa_review");
    assert_eq!(last.payload["to"], "done");
}

#[tokio::test]
async fn reviewer_without_assignment_is_rejected() {
    let p = pipeline().await;
    let task = start_task(&p, "dev-1", &["feature"]).await;
    report(&p, &task.id, "dev-1", RunOutcome::Done, Vec::new(), None).await;

    // Nobody assigned the code_review gate yet, so a random reviewer
    // is unauthorized and mutates nothing.
    let message = ProtocolMessage::CompletionReport {
        outcome: RunOutcome::Done,
        summary_ref: None,
        deliverables: Vec::new(),
        tests: TestStats::default(),
        blockers: Vec::new(),
        rejection_notes: None,
        notes: None,
        summary: None,
    };
    let err = p
        .router
        .handle(&Envelope::new("proj-a", task.id.clone(), "rev-1", message))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        foreman::DomainError::UnauthorizedAgent { .. }
    ));
    let task = p.store.get(&task.id).await.unwrap();
    assert_eq!(task.gate.as_ref().unwrap().current, "code_review");
    assert_eq!(task.gate_history.len(), 1);
}
