//! Gate workflow engine.
//!
//! Drives tasks through the review pipeline configured in the project
//! manifest. Gates are worked while the task is `in-progress`; the
//! `review` status is the parking state for human review and the
//! pass-through on final completion. Every gate exit appends an audit
//! history entry and emits `gate_transition`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::meta_keys;
use crate::domain::models::{
    EventActor, EventRecord, EventType, GateConfig, GateHistoryEntry, GateOutcome, GatePosition,
    ReviewContext, RejectStrategy, Task, TaskId, TaskStatus, WorkflowConfig,
};
use crate::infrastructure::events::EventLog;
use crate::infrastructure::store::TaskStore;

/// A gate-level outcome request, as sent by an agent or a tool.
#[derive(Debug, Clone)]
pub enum GateRequest {
    Complete {
        summary: Option<String>,
    },
    NeedsReview {
        blockers: Vec<String>,
        rejection_notes: Option<String>,
    },
    Blocked {
        blockers: Vec<String>,
        summary: Option<String>,
    },
}

impl GateRequest {
    /// Parse a tool-level outcome string. Unknown values get a teaching
    /// error naming the accepted set.
    pub fn from_outcome_str(
        outcome: &str,
        summary: Option<String>,
        blockers: Vec<String>,
        rejection_notes: Option<String>,
    ) -> DomainResult<Self> {
        match outcome {
            "complete" | "done" => Ok(Self::Complete { summary }),
            "needs_review" => Ok(Self::NeedsReview {
                blockers,
                rejection_notes,
            }),
            "blocked" => Ok(Self::Blocked { blockers, summary }),
            other => Err(DomainError::InvalidOutcome(other.to_string())),
        }
    }
}

/// Where the task went after a gate outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Advanced to a later gate.
    NextGate(String),
    /// Pipeline finished; task is `done` (or parked in `review` when
    /// human review is required).
    Done,
    /// Rejection sent the task back to an earlier gate.
    LoopedBack(String),
    /// Task is blocked pending outside help.
    Blocked,
}

/// Result of applying a gate outcome.
#[derive(Debug, Clone)]
pub struct GateTransition {
    pub from_gate: String,
    pub outcome: GateOutcome,
    pub next: NextStep,
    /// Gates skipped by unsatisfied `when` conditions during advance.
    pub skipped: Vec<String>,
}

/// The deterministic gate engine for one project workflow.
pub struct GateEngine {
    store: Arc<TaskStore>,
    event_log: Arc<EventLog>,
    workflow: WorkflowConfig,
}

impl GateEngine {
    pub fn new(store: Arc<TaskStore>, event_log: Arc<EventLog>, workflow: WorkflowConfig) -> Self {
        Self {
            store,
            event_log,
            workflow,
        }
    }

    pub fn workflow(&self) -> &WorkflowConfig {
        &self.workflow
    }

    /// Place a task at its first applicable gate if it is not already
    /// enrolled. No-op for tasks already in a gate.
    pub async fn enroll(&self, task_id: &TaskId) -> DomainResult<Option<String>> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))?;
        if task.gate.is_some() {
            return Ok(task.gate.map(|g| g.current));
        }
        let Some(first) = self.workflow.first_applicable(&task.routing) else {
            return Ok(None);
        };
        let gate_id = first.id.clone();
        let entered = Utc::now();
        self.store
            .update(task_id, {
                let gate_id = gate_id.clone();
                move |task| {
                    task.gate = Some(GatePosition {
                        current: gate_id,
                        entered,
                    });
                }
            })
            .await?;
        Ok(Some(gate_id))
    }

    /// Apply a gate outcome reported by `agent` for the task's current
    /// gate.
    pub async fn apply(
        &self,
        task_id: &TaskId,
        agent: &str,
        request: GateRequest,
    ) -> DomainResult<GateTransition> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))?;
        let gate_pos = task
            .gate
            .clone()
            .ok_or_else(|| DomainError::NotInWorkflow(task_id.clone()))?;
        let current_index = self
            .workflow
            .gate_index(&gate_pos.current)
            .ok_or_else(|| DomainError::NotInWorkflow(task_id.clone()))?;
        let current = self.workflow.gates[current_index].clone();

        match request {
            GateRequest::Complete { summary } => {
                self.advance(&task, &gate_pos, current_index, agent, summary)
                    .await
            }
            GateRequest::NeedsReview {
                blockers,
                rejection_notes,
            } => {
                if !current.can_reject {
                    return Err(DomainError::GateNotRejectable {
                        gate: current.id.clone(),
                    });
                }
                let Some(notes) = rejection_notes else {
                    return Err(DomainError::MissingRejectionNotes);
                };
                self.loop_back(&task, &gate_pos, current_index, agent, blockers, notes)
                    .await
            }
            GateRequest::Blocked { blockers, summary } => {
                if blockers.is_empty() {
                    return Err(DomainError::MissingBlockers);
                }
                self.block(&task, &gate_pos, &current, agent, blockers, summary)
                    .await
            }
        }
    }

    /// Whether an in-progress gated task has outstayed its gate's
    /// configured timeout.
    pub fn is_timed_out(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::InProgress {
            return false;
        }
        let Some(gate_pos) = &task.gate else {
            return false;
        };
        let Some(gate) = self.workflow.gate(&gate_pos.current) else {
            return false;
        };
        let Some(timeout) = gate.timeout else {
            return false;
        };
        now - gate_pos.entered > timeout.as_duration()
    }

    /// Escalate one timed-out gate: rewrite routing to `escalateTo`
    /// (when configured), append a blocked history entry, and restart
    /// the gate clock.
    pub async fn escalate(&self, task_id: &TaskId, now: DateTime<Utc>) -> DomainResult<()> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))?;
        let gate_pos = task
            .gate
            .clone()
            .ok_or_else(|| DomainError::NotInWorkflow(task_id.clone()))?;
        let gate = self
            .workflow
            .gate(&gate_pos.current)
            .ok_or_else(|| DomainError::NotInWorkflow(task_id.clone()))?;
        let timeout = gate
            .timeout
            .map_or_else(|| "unbounded".to_string(), |t| t.to_string());

        let entry = history_entry(
            gate,
            &gate_pos,
            now,
            GateOutcome::Blocked,
            task.authorized_agent().unwrap_or("unassigned"),
            Some(format!("gate timeout after {timeout}")),
            Vec::new(),
            None,
        );
        let escalate_to = gate.escalate_to.clone();
        let gate_id = gate.id.clone();
        self.store
            .update(task_id, {
                let escalate_to = escalate_to.clone();
                move |task| {
                    task.gate_history.push(entry);
                    if let Some(role) = escalate_to {
                        task.routing.agent = None;
                        task.routing.team = None;
                        task.routing.role = Some(role);
                    }
                    if let Some(gate) = task.gate.as_mut() {
                        gate.entered = now;
                    }
                }
            })
            .await?;

        warn!(task_id = %task_id, gate = %gate_id, "gate timeout, escalating");
        self.event_log
            .log(
                EventRecord::new(EventType::GateTimeout, EventActor::Scheduler)
                    .with_task(task_id.clone())
                    .with_payload(serde_json::json!({
                        "gate": gate_id,
                        "escalatedTo": escalate_to,
                    })),
            )
            .await;
        Ok(())
    }

    /// Escalate every timed-out gated task. Returns the escalated ids.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> DomainResult<Vec<TaskId>> {
        let mut escalated = Vec::new();
        for task in self.store.snapshot().await {
            if self.is_timed_out(&task, now) {
                self.escalate(&task.id, now).await?;
                escalated.push(task.id.clone());
            }
        }
        Ok(escalated)
    }

    // ---- outcome handlers ----------------------------------------------

    async fn advance(
        &self,
        task: &Task,
        gate_pos: &GatePosition,
        current_index: usize,
        agent: &str,
        summary: Option<String>,
    ) -> DomainResult<GateTransition> {
        let now = Utc::now();
        let current = &self.workflow.gates[current_index];
        let entry = history_entry(
            current,
            gate_pos,
            now,
            GateOutcome::Complete,
            agent,
            summary,
            Vec::new(),
            None,
        );

        // Advance past any gate whose `when` the task does not satisfy.
        let mut skipped = Vec::new();
        let mut next: Option<&GateConfig> = None;
        for gate in &self.workflow.gates[current_index + 1..] {
            if gate.applies_to(&task.routing) {
                next = Some(gate);
                break;
            }
            skipped.push(gate.id.clone());
        }

        let transition = if let Some(next_gate) = next {
            let next_id = next_gate.id.clone();
            let next_role = next_gate.role.clone();
            self.store
                .update(&task.id, {
                    let next_id = next_id.clone();
                    move |task| {
                        task.gate_history.push(entry);
                        task.gate = Some(GatePosition {
                            current: next_id,
                            entered: now,
                        });
                        // The next gate belongs to a different role; the
                        // dispatcher fills in the concrete agent.
                        task.routing.agent = None;
                        task.routing.team = None;
                        task.routing.role = Some(next_role);
                        task.lease = None;
                        task.review_context = None;
                    }
                })
                .await?;
            GateTransition {
                from_gate: gate_pos.current.clone(),
                outcome: GateOutcome::Complete,
                next: NextStep::NextGate(next_id),
                skipped,
            }
        } else {
            // Pipeline exhausted: through review, then done unless a
            // human review hold is requested.
            let review_required = task.review_required();
            self.store
                .transition_with(&task.id, TaskStatus::Review, move |task| {
                    task.gate_history.push(entry);
                    task.gate = None;
                    task.review_context = None;
                    task.lease = None;
                })
                .await?;
            if !review_required {
                self.store.transition(&task.id, TaskStatus::Done).await?;
            }
            GateTransition {
                from_gate: gate_pos.current.clone(),
                outcome: GateOutcome::Complete,
                next: NextStep::Done,
                skipped,
            }
        };

        info!(
            task_id = %task.id,
            from = %transition.from_gate,
            next = ?transition.next,
            "gate complete"
        );
        self.emit_gate_transition(&task.id, &transition, agent).await;
        Ok(transition)
    }

    async fn loop_back(
        &self,
        task: &Task,
        gate_pos: &GatePosition,
        current_index: usize,
        agent: &str,
        blockers: Vec<String>,
        notes: String,
    ) -> DomainResult<GateTransition> {
        let now = Utc::now();
        let current = &self.workflow.gates[current_index];
        let target = self.reject_target(task, current_index)?;
        let entry = history_entry(
            current,
            gate_pos,
            now,
            GateOutcome::NeedsReview,
            agent,
            None,
            blockers.clone(),
            Some(notes.clone()),
        );

        let review_context = ReviewContext {
            from_gate: current.id.clone(),
            agent: agent.to_string(),
            role: current.role.clone(),
            blockers,
            notes: Some(notes),
            rejected_at: now,
        };

        let target_id = target.id.clone();
        let target_role = target.role.clone();
        self.store
            .update(&task.id, {
                let target_id = target_id.clone();
                move |task| {
                    task.gate_history.push(entry);
                    task.gate = Some(GatePosition {
                        current: target_id,
                        entered: now,
                    });
                    task.routing.agent = None;
                    task.routing.team = None;
                    task.routing.role = Some(target_role);
                    task.lease = None;
                    task.review_context = Some(review_context);
                }
            })
            .await?;

        let transition = GateTransition {
            from_gate: gate_pos.current.clone(),
            outcome: GateOutcome::NeedsReview,
            next: NextStep::LoopedBack(target_id),
            skipped: Vec::new(),
        };
        info!(
            task_id = %task.id,
            from = %transition.from_gate,
            next = ?transition.next,
            "gate rejected"
        );
        self.emit_gate_transition(&task.id, &transition, agent).await;
        Ok(transition)
    }

    async fn block(
        &self,
        task: &Task,
        gate_pos: &GatePosition,
        current: &GateConfig,
        agent: &str,
        blockers: Vec<String>,
        summary: Option<String>,
    ) -> DomainResult<GateTransition> {
        let now = Utc::now();
        let entry = history_entry(
            current,
            gate_pos,
            now,
            GateOutcome::Blocked,
            agent,
            summary,
            blockers.clone(),
            None,
        );
        let reason = blockers.join("; ");
        self.store
            .transition_with(&task.id, TaskStatus::Blocked, move |task| {
                task.gate_history.push(entry);
                task.lease = None;
                task.set_meta(meta_keys::BLOCK_REASON, reason);
                task.set_meta(meta_keys::LAST_BLOCKED_AT, now.to_rfc3339());
            })
            .await?;

        let transition = GateTransition {
            from_gate: gate_pos.current.clone(),
            outcome: GateOutcome::Blocked,
            next: NextStep::Blocked,
            skipped: Vec::new(),
        };
        self.emit_gate_transition(&task.id, &transition, agent).await;
        Ok(transition)
    }

    /// Resolve the loop-back target per the gate's `onReject` strategy.
    fn reject_target(&self, task: &Task, current_index: usize) -> DomainResult<&GateConfig> {
        let current = &self.workflow.gates[current_index];
        let strategy = current.on_reject.clone().unwrap_or_default();
        let target = match strategy {
            RejectStrategy::OriginGate => self.workflow.gates[..current_index]
                .iter()
                .rev()
                .find(|g| g.role != current.role && g.applies_to(&task.routing)),
            RejectStrategy::PreviousGate => self.workflow.gates[..current_index]
                .iter()
                .rev()
                .find(|g| g.applies_to(&task.routing)),
            RejectStrategy::Gate(name) => self.workflow.gate(&name),
        };
        target.ok_or_else(|| DomainError::GateNotRejectable {
            gate: current.id.clone(),
        })
    }

    async fn emit_gate_transition(&self, task_id: &TaskId, transition: &GateTransition, agent: &str) {
        let next = match &transition.next {
            NextStep::NextGate(id) | NextStep::LoopedBack(id) => id.clone(),
            NextStep::Done => "done".to_string(),
            NextStep::Blocked => "blocked".to_string(),
        };
        self.event_log
            .log(
                EventRecord::new(EventType::GateTransition, EventActor::agent(agent))
                    .with_task(task_id.clone())
                    .with_payload(serde_json::json!({
                        "from": transition.from_gate,
                        "to": next,
                        "outcome": transition.outcome.as_str(),
                        "skipped": transition.skipped,
                    })),
            )
            .await;
    }
}

#[allow(clippy::too_many_arguments)]
fn history_entry(
    gate: &GateConfig,
    gate_pos: &GatePosition,
    exited: DateTime<Utc>,
    outcome: GateOutcome,
    agent: &str,
    summary: Option<String>,
    blockers: Vec<String>,
    rejection_notes: Option<String>,
) -> GateHistoryEntry {
    GateHistoryEntry {
        gate: gate.id.clone(),
        role: gate.role.clone(),
        entered: gate_pos.entered,
        exited,
        outcome,
        agent: agent.to_string(),
        summary,
        blockers,
        rejection_notes,
        duration_ms: (exited - gate_pos.entered).num_milliseconds(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{GateWhen, Routing};
    use crate::infrastructure::store::NewTask;

    fn pipeline() -> WorkflowConfig {
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

    async fn setup() -> (tempfile::TempDir, Arc<TaskStore>, Arc<EventLog>, GateEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).await.unwrap());
        let event_log = Arc::new(EventLog::open(dir.path(), Vec::new()).await.unwrap());
        let engine = GateEngine::new(Arc::clone(&store), Arc::clone(&event_log), pipeline());
        (dir, store, event_log, engine)
    }

    /// Create a task already enrolled at `implement` and in progress.
    async fn workflow_task(store: &TaskStore, engine: &GateEngine, tags: &[&str]) -> Task {
        let mut routing = Routing::to_agent("dev-1");
        for tag in tags {
            routing = routing.with_tag(*tag);
        }
        let task = store
            .create(NewTask {
                project: "proj-a".into(),
                title: "feature".into(),
                routing,
                ..NewTask::default()
            })
            .await
            .unwrap();
        engine.enroll(&task.id).await.unwrap();
        store.transition(&task.id, TaskStatus::Ready).await.unwrap();
        store
            .transition(&task.id, TaskStatus::InProgress)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn complete_advances_to_next_gate() {
        let (_dir, store, _log, engine) = setup().await;
        let task = workflow_task(&store, &engine, &["feature"]).await;

        let t = engine
            .apply(
                &task.id,
                "dev-1",
                GateRequest::Complete {
                    summary: Some("implemented".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(t.next, NextStep::NextGate("code_review".into()));
        assert!(t.skipped.is_empty());

        let task = store.get(&task.id).await.unwrap();
        assert_eq!(task.gate.unwrap().current, "code_review");
        assert_eq!(task.routing.role.as_deref(), Some("reviewer"));
        assert_eq!(task.routing.agent, None);
        assert_eq!(task.gate_history.len(), 1);
        assert_eq!(task.gate_history[0].outcome, GateOutcome::Complete);
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn final_gate_completes_to_done() {
        let (_dir, store, _log, engine) = setup().await;
        let task = workflow_task(&store, &engine, &["feature"]).await;

        engine
            .apply(&task.id, "dev-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();
        engine
            .apply(&task.id, "rev-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();
        let t = engine
            .apply(&task.id, "qa-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();
        assert_eq!(t.next, NextStep::Done);

        let task = store.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.gate.is_none());
        assert_eq!(task.gate_history.len(), 3);
        for entry in &task.gate_history {
            assert!(entry.duration_ms >= 0);
        }
    }

    #[tokio::test]
    async fn when_condition_skips_gate() {
        let (_dir, store, _log, engine) = setup().await;
        // Tagged skip-qa, so the qa_review `when: tag feature` fails.
        let task = workflow_task(&store, &engine, &["skip-qa"]).await;

        engine
            .apply(&task.id, "dev-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();
        let t = engine
            .apply(&task.id, "rev-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();
        assert_eq!(t.next, NextStep::Done);
        assert_eq!(t.skipped, vec!["qa_review".to_string()]);

        let task = store.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.gate_history.len(), 2);
    }

    #[tokio::test]
    async fn rejection_loops_back_with_context() {
        let (_dir, store, _log, engine) = setup().await;
        let task = workflow_task(&store, &engine, &["feature"]).await;
        engine
            .apply(&task.id, "dev-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();

        let t = engine
            .apply(
                &task.id,
                "rev-1",
                GateRequest::NeedsReview {
                    blockers: vec!["missing error handling".into()],
                    rejection_notes: Some("retry transient failures".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(t.next, NextStep::LoopedBack("implement".into()));

        let task = store.get(&task.id).await.unwrap();
        assert_eq!(task.gate.as_ref().unwrap().current, "implement");
        let ctx = task.review_context.as_ref().unwrap();
        assert_eq!(ctx.from_gate, "code_review");
        assert_eq!(ctx.blockers, vec!["missing error handling".to_string()]);
        assert_eq!(task.routing.role.as_deref(), Some("developer"));
    }

    #[tokio::test]
    async fn review_context_cleared_on_advance() {
        let (_dir, store, _log, engine) = setup().await;
        let task = workflow_task(&store, &engine, &["feature"]).await;
        engine
            .apply(&task.id, "dev-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();
        engine
            .apply(
                &task.id,
                "rev-1",
                GateRequest::NeedsReview {
                    blockers: vec!["nit".into()],
                    rejection_notes: Some("fix".into()),
                },
            )
            .await
            .unwrap();
        engine
            .apply(&task.id, "dev-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();

        let task = store.get(&task.id).await.unwrap();
        assert!(task.review_context.is_none());
        assert_eq!(task.gate.as_ref().unwrap().current, "code_review");
    }

    #[test]
    fn outcome_strings_parse_or_teach() {
        assert!(matches!(
            GateRequest::from_outcome_str("complete", None, Vec::new(), None),
            Ok(GateRequest::Complete { .. })
        ));
        assert!(matches!(
            GateRequest::from_outcome_str("done", None, Vec::new(), None),
            Ok(GateRequest::Complete { .. })
        ));
        let err =
            GateRequest::from_outcome_str("finished", None, Vec::new(), None).unwrap_err();
        assert!(matches!(err, DomainError::InvalidOutcome(_)));
        // The error names the accepted outcomes.
        assert!(err.to_string().contains("needs_review"));
    }

    #[tokio::test]
    async fn non_rejectable_gate_teaches() {
        let (_dir, store, _log, engine) = setup().await;
        let task = workflow_task(&store, &engine, &["feature"]).await;

        let err = engine
            .apply(
                &task.id,
                "dev-1",
                GateRequest::NeedsReview {
                    blockers: Vec::new(),
                    rejection_notes: Some("nope".into()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::GateNotRejectable { .. }));
        assert!(err.to_string().contains("implement"));
    }

    #[tokio::test]
    async fn needs_review_requires_notes_and_blocked_requires_blockers() {
        let (_dir, store, _log, engine) = setup().await;
        let task = workflow_task(&store, &engine, &["feature"]).await;
        engine
            .apply(&task.id, "dev-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();

        let err = engine
            .apply(
                &task.id,
                "rev-1",
                GateRequest::NeedsReview {
                    blockers: vec!["x".into()],
                    rejection_notes: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::MissingRejectionNotes));

        let err = engine
            .apply(
                &task.id,
                "rev-1",
                GateRequest::Blocked {
                    blockers: Vec::new(),
                    summary: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::MissingBlockers));
    }

    #[tokio::test]
    async fn explicit_reject_strategies_override_origin_gate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).await.unwrap());
        let event_log = Arc::new(EventLog::open(dir.path(), Vec::new()).await.unwrap());
        // Two reviewer gates in a row: origin-gate would skip back to
        // implement, but code_review pins its rejections to a named
        // gate and qa_review to the gate right before it.
        let workflow = WorkflowConfig::new(
            "strict",
            vec![
                GateConfig::new("implement", "developer"),
                GateConfig {
                    on_reject: Some(crate::domain::models::RejectStrategy::Gate(
                        "implement".into(),
                    )),
                    ..GateConfig::new("code_review", "reviewer").rejectable()
                },
                GateConfig {
                    on_reject: Some(crate::domain::models::RejectStrategy::PreviousGate),
                    ..GateConfig::new("qa_review", "reviewer").rejectable()
                },
            ],
        );
        let engine = GateEngine::new(Arc::clone(&store), event_log, workflow);
        let task = workflow_task(&store, &engine, &[]).await;

        engine
            .apply(&task.id, "dev-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();
        engine
            .apply(&task.id, "rev-1", GateRequest::Complete { summary: None })
            .await
            .unwrap();
        // qa_review rejects to the previous applicable gate.
        let t = engine
            .apply(
                &task.id,
                "rev-2",
                GateRequest::NeedsReview {
                    blockers: vec!["regression".into()],
                    rejection_notes: Some("fix the regression".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(t.next, NextStep::LoopedBack("code_review".into()));

        // code_review rejects to its named gate.
        let t = engine
            .apply(
                &task.id,
                "rev-1",
                GateRequest::NeedsReview {
                    blockers: vec!["same regression".into()],
                    rejection_notes: Some("needs rework".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(t.next, NextStep::LoopedBack("implement".into()));
    }

    #[tokio::test]
    async fn blocked_outcome_parks_task() {
        let (_dir, store, _log, engine) = setup().await;
        let task = workflow_task(&store, &engine, &["feature"]).await;

        let t = engine
            .apply(
                &task.id,
                "dev-1",
                GateRequest::Blocked {
                    blockers: vec!["waiting on credentials".into(), "missing API key".into()],
                    summary: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(t.next, NextStep::Blocked);

        let task = store.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.gate_history.len(), 1);
        assert_eq!(task.gate_history[0].outcome, GateOutcome::Blocked);
        // Gate survives so the task resumes where it stopped.
        assert_eq!(task.gate.as_ref().unwrap().current, "implement");
    }

    #[tokio::test]
    async fn gate_timeout_escalates_routing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).await.unwrap());
        let event_log = Arc::new(EventLog::open(dir.path(), Vec::new()).await.unwrap());
        let workflow = WorkflowConfig::new(
            "timed",
            vec![GateConfig::new("implement", "developer")
                .with_timeout(crate::domain::models::DurationLit::minutes(30))
                .with_escalation("lead")],
        );
        let engine = GateEngine::new(Arc::clone(&store), Arc::clone(&event_log), workflow);
        let task = workflow_task(&store, &engine, &[]).await;

        // Not yet elapsed.
        let escalated = engine.check_timeouts(Utc::now()).await.unwrap();
        assert!(escalated.is_empty());

        let later = Utc::now() + chrono::Duration::hours(1);
        let escalated = engine.check_timeouts(later).await.unwrap();
        assert_eq!(escalated, vec![task.id.clone()]);

        let task = store.get(&task.id).await.unwrap();
        assert_eq!(task.routing.role.as_deref(), Some("lead"));
        assert_eq!(task.gate_history.len(), 1);
        assert_eq!(task.gate_history[0].outcome, GateOutcome::Blocked);
        let events = event_log
            .events_of_type(EventType::GateTimeout)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}
