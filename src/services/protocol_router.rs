//! Protocol router: applies agent messages to task state.
//!
//! Every envelope is resolved, locked, authorized, and applied under
//! the per-task lock. Rejections mutate nothing and emit exactly one
//! `protocol.message.rejected` record.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::meta_keys;
use crate::domain::models::{
    Envelope, EventActor, EventRecord, EventType, ProtocolMessage, RunOutcome, RunResult, Task,
    TaskId, TaskStatus, TestStats,
};
use crate::infrastructure::events::EventLog;
use crate::infrastructure::store::{RunArtifacts, TaskStore};
use crate::services::gate_engine::{GateEngine, GateRequest};
use crate::services::task_locks::TaskLocks;

/// Router for one project's inbound agent messages.
pub struct ProtocolRouter {
    project_id: String,
    store: Arc<TaskStore>,
    artifacts: RunArtifacts,
    event_log: Arc<EventLog>,
    locks: Arc<TaskLocks>,
    gate_engine: Option<Arc<GateEngine>>,
}

impl ProtocolRouter {
    pub fn new(
        project_id: impl Into<String>,
        store: Arc<TaskStore>,
        artifacts: RunArtifacts,
        event_log: Arc<EventLog>,
        locks: Arc<TaskLocks>,
        gate_engine: Option<Arc<GateEngine>>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            store,
            artifacts,
            event_log,
            locks,
            gate_engine,
        }
    }

    /// Apply one envelope. Any rejection leaves state untouched and is
    /// journaled; the error also surfaces to the caller.
    #[instrument(skip(self, envelope), fields(task_id = %envelope.task_id, message = envelope.message.type_name()))]
    pub async fn handle(&self, envelope: &Envelope) -> DomainResult<()> {
        self.event_log
            .log(
                EventRecord::new(
                    EventType::ProtocolMessageReceived,
                    EventActor::agent(&envelope.from_agent),
                )
                .with_task(envelope.task_id.clone())
                .with_payload(serde_json::json!({
                    "message": envelope.message.type_name(),
                    "projectId": envelope.project_id,
                })),
            )
            .await;

        match self.handle_inner(envelope).await {
            Ok(()) => {
                // Terminal tasks take no further messages; drop their
                // lock entry.
                if let Some(task) = self.store.get(&envelope.task_id).await {
                    if task.status.is_terminal() {
                        self.locks.forget(&task.id).await;
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.reject(envelope, &err).await;
                Err(err)
            }
        }
    }

    async fn handle_inner(&self, envelope: &Envelope) -> DomainResult<()> {
        if envelope.project_id != self.project_id {
            return Err(DomainError::ProjectNotFound(envelope.project_id.clone()));
        }

        // The lock covers the load so authorization always sees the
        // latest lease holder.
        let _guard = self.locks.acquire(&envelope.task_id).await;
        let task = self
            .store
            .get(&envelope.task_id)
            .await
            .ok_or_else(|| DomainError::TaskNotFound(envelope.task_id.clone()))?;

        self.authorize(envelope, &task).await?;

        match &envelope.message {
            ProtocolMessage::CompletionReport {
                outcome,
                summary_ref,
                deliverables,
                tests,
                blockers,
                rejection_notes,
                notes,
                summary,
            } => {
                self.handle_completion(
                    envelope,
                    &task,
                    *outcome,
                    summary_ref.clone(),
                    deliverables.clone(),
                    *tests,
                    blockers.clone(),
                    rejection_notes.clone(),
                    notes.clone(),
                    summary.clone(),
                )
                .await
            }
            ProtocolMessage::StatusUpdate { status, note } => {
                self.handle_status_update(envelope, &task, *status, note.clone())
                    .await
            }
            ProtocolMessage::HandoffRequest {
                task_id,
                routing,
                reason,
            } => {
                self.handle_handoff_request(envelope, &task, task_id, routing.clone(), reason.clone())
                    .await
            }
            ProtocolMessage::HandoffAccepted { reason } => {
                info!(task_id = %task.id, agent = %envelope.from_agent, "handoff accepted");
                self.event_log
                    .log(
                        EventRecord::new(
                            EventType::DelegationAccepted,
                            EventActor::agent(&envelope.from_agent),
                        )
                        .with_task(task.id.clone())
                        .with_payload(serde_json::json!({ "reason": reason })),
                    )
                    .await;
                Ok(())
            }
            ProtocolMessage::HandoffRejected { reason } => {
                self.store
                    .transition_with(&task.id, TaskStatus::Blocked, {
                        let reason = reason.clone();
                        move |task| {
                            task.set_meta(meta_keys::BLOCK_REASON, reason);
                            task.set_meta(meta_keys::LAST_BLOCKED_AT, Utc::now().to_rfc3339());
                        }
                    })
                    .await?;
                self.event_log
                    .log(
                        EventRecord::new(
                            EventType::DelegationRejected,
                            EventActor::agent(&envelope.from_agent),
                        )
                        .with_task(task.id.clone())
                        .with_payload(serde_json::json!({ "reason": reason })),
                    )
                    .await;
                Ok(())
            }
        }
    }

    /// The only agent permitted to mutate is the lease holder, falling
    /// back to the routed agent. Handoff requests authorize against the
    /// parent (the delegator), handled in the handoff path itself.
    async fn authorize(&self, envelope: &Envelope, task: &Task) -> DomainResult<()> {
        if matches!(envelope.message, ProtocolMessage::HandoffRequest { .. }) {
            let parent_id = task
                .parent_id
                .clone()
                .ok_or_else(|| DomainError::ParentNotFound(task.id.clone()))?;
            let parent = self
                .store
                .get(&parent_id)
                .await
                .ok_or_else(|| DomainError::ParentNotFound(task.id.clone()))?;
            return check_agent(&parent, &envelope.from_agent);
        }
        check_agent(task, &envelope.from_agent)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_completion(
        &self,
        envelope: &Envelope,
        task: &Task,
        outcome: RunOutcome,
        summary_ref: Option<String>,
        deliverables: Vec<String>,
        tests: TestStats,
        blockers: Vec<String>,
        rejection_notes: Option<String>,
        notes: Option<String>,
        summary: Option<String>,
    ) -> DomainResult<()> {
        // Persist the run result first so recovery can replay it even
        // if a later step fails.
        let mut result = RunResult::new(task.id.clone(), envelope.from_agent.clone(), outcome);
        result.summary_ref = summary_ref;
        result.deliverables = deliverables;
        result.tests = tests;
        result.blockers.clone_from(&blockers);
        result.notes = notes;
        self.artifacts.write_run_result(&result).await?;

        let in_gate = task.gate.is_some();
        if let (true, Some(engine)) = (in_gate, &self.gate_engine) {
            match outcome {
                RunOutcome::Done => {
                    engine
                        .apply(
                            &task.id,
                            &envelope.from_agent,
                            GateRequest::Complete { summary },
                        )
                        .await?;
                }
                RunOutcome::NeedsReview => {
                    engine
                        .apply(
                            &task.id,
                            &envelope.from_agent,
                            GateRequest::NeedsReview {
                                blockers,
                                rejection_notes,
                            },
                        )
                        .await?;
                }
                RunOutcome::Blocked => {
                    engine
                        .apply(
                            &task.id,
                            &envelope.from_agent,
                            GateRequest::Blocked { blockers, summary },
                        )
                        .await?;
                }
                // `partial` is not a gate verdict; the task parks for a
                // human decision with its gate intact.
                RunOutcome::Partial => {
                    self.apply_step(&task.id, TaskStatus::Review, true).await;
                }
            }
        } else {
            self.apply_plain_outcome(task, outcome, &blockers).await;
        }

        // Blocked reports already journal as task.blocked / a gate
        // transition; everything else is a completion.
        if outcome != RunOutcome::Blocked {
            self.event_log
                .log(
                    EventRecord::new(
                        EventType::TaskCompleted,
                        EventActor::agent(&envelope.from_agent),
                    )
                    .with_task(task.id.clone())
                    .with_payload(serde_json::json!({
                        "outcome": outcome.as_str(),
                        "tests": { "total": tests.total, "passed": tests.passed, "failed": tests.failed },
                    })),
                )
                .await;
        }
        Ok(())
    }

    /// Outcome-driven transitions for tasks outside a gate workflow.
    /// Each step is validated; an invalid edge is skipped, not fatal.
    async fn apply_plain_outcome(&self, task: &Task, outcome: RunOutcome, blockers: &[String]) {
        match outcome {
            RunOutcome::Done => {
                self.apply_step(&task.id, TaskStatus::Review, true).await;
                if !task.review_required() {
                    self.apply_step(&task.id, TaskStatus::Done, false).await;
                }
            }
            RunOutcome::Blocked => {
                let reason = if blockers.is_empty() {
                    "blocked by agent report".to_string()
                } else {
                    blockers.join("; ")
                };
                let moved = self
                    .store
                    .transition_with(&task.id, TaskStatus::Blocked, move |task| {
                        task.lease = None;
                        task.set_meta(meta_keys::BLOCK_REASON, reason);
                        task.set_meta(meta_keys::LAST_BLOCKED_AT, Utc::now().to_rfc3339());
                    })
                    .await;
                match moved {
                    Ok(task) => {
                        self.event_log
                            .log(
                                EventRecord::new(EventType::TaskBlocked, EventActor::System)
                                    .with_task(task.id),
                            )
                            .await;
                    }
                    Err(err) => warn!(task_id = %task.id, error = %err, "skipping blocked step"),
                }
            }
            RunOutcome::NeedsReview | RunOutcome::Partial => {
                self.apply_step(&task.id, TaskStatus::Review, true).await;
            }
        }
    }

    /// Apply one transition step, tolerating disallowed edges.
    async fn apply_step(&self, task_id: &TaskId, to: TaskStatus, clear_lease: bool) {
        let result = self
            .store
            .transition_with(task_id, to, move |task| {
                if clear_lease {
                    task.lease = None;
                }
            })
            .await;
        if let Err(err) = result {
            warn!(task_id = %task_id, to = %to, error = %err, "skipping invalid transition step");
        }
    }

    async fn handle_status_update(
        &self,
        envelope: &Envelope,
        task: &Task,
        status: Option<TaskStatus>,
        note: Option<String>,
    ) -> DomainResult<()> {
        if let Some(to) = status {
            let result = self.store.transition(&task.id, to).await;
            if let Err(err) = result {
                warn!(task_id = %task.id, to = %to, error = %err, "status update carried invalid transition");
            }
        }
        if let Some(note) = note {
            let entry = format!("{}: {note}", envelope.from_agent);
            self.store.append_work_log(&task.id, &entry).await?;
        }
        Ok(())
    }

    async fn handle_handoff_request(
        &self,
        envelope: &Envelope,
        child: &Task,
        payload_task_id: &TaskId,
        routing: Option<crate::domain::models::Routing>,
        reason: Option<String>,
    ) -> DomainResult<()> {
        if payload_task_id != &envelope.task_id {
            return Err(DomainError::TaskNotFound(payload_task_id.clone()));
        }
        let parent_id = child
            .parent_id
            .clone()
            .ok_or_else(|| DomainError::ParentNotFound(child.id.clone()))?;
        let parent = self
            .store
            .get(&parent_id)
            .await
            .ok_or_else(|| DomainError::ParentNotFound(child.id.clone()))?;

        let depth = parent.delegation_depth() + 1;
        if depth > 1 {
            return Err(DomainError::DelegationDepthExceeded {
                task_id: child.id.clone(),
                depth,
            });
        }

        // Handoff artifacts: machine-readable plus a human summary the
        // assignee reads before accepting.
        let inputs_dir = self.store.task_inputs_dir(child);
        tokio::fs::create_dir_all(&inputs_dir).await?;
        let handoff = serde_json::json!({
            "taskId": child.id,
            "parentId": parent.id,
            "fromAgent": envelope.from_agent,
            "toAgent": envelope.to_agent,
            "reason": reason,
            "sentAt": envelope.sent_at,
        });
        tokio::fs::write(
            inputs_dir.join("handoff.json"),
            serde_json::to_string_pretty(&handoff)?,
        )
        .await?;
        let markdown = format!(
            "# Handoff: {}\n\nFrom: {}\nTo: {}\nParent: {}\n\n{}\n",
            child.title,
            envelope.from_agent,
            envelope.to_agent.as_deref().unwrap_or("(unassigned)"),
            parent.id,
            reason.as_deref().unwrap_or("No reason given."),
        );
        tokio::fs::write(inputs_dir.join("handoff.md"), markdown).await?;

        self.store
            .update(&child.id, move |task| {
                task.set_meta(meta_keys::DELEGATION_DEPTH, depth);
                if let Some(routing) = routing {
                    if routing.is_valid() {
                        task.routing = routing;
                    }
                }
            })
            .await?;

        info!(task_id = %child.id, parent = %parent.id, "delegation requested");
        self.event_log
            .log(
                EventRecord::new(
                    EventType::DelegationRequested,
                    EventActor::agent(&envelope.from_agent),
                )
                .with_task(child.id.clone())
                .with_payload(serde_json::json!({
                    "parentId": parent.id,
                    "toAgent": envelope.to_agent,
                    "delegationDepth": depth,
                })),
            )
            .await;
        Ok(())
    }

    /// Reconcile in-progress tasks against their run-result artifacts.
    ///
    /// Tasks whose agent exited cleanly (artifact present, not expired)
    /// get their completion transitions re-applied; the rest are left
    /// for stale-heartbeat recovery. Idempotent: a second call finds no
    /// in-progress task with a live artifact and does nothing.
    pub async fn session_end(&self) -> DomainResult<Vec<TaskId>> {
        let mut reconciled = Vec::new();
        for task in self.store.snapshot().await {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let Some(result) = self.artifacts.read_run_result(&task.id).await? else {
                continue;
            };
            if result.expired {
                continue;
            }

            let _guard = self.locks.acquire(&task.id).await;
            // Re-read under the lock; a protocol message may have won.
            let Some(task) = self.store.get(&task.id).await else {
                continue;
            };
            if task.status != TaskStatus::InProgress {
                continue;
            }

            info!(task_id = %task.id, outcome = result.outcome.as_str(), "session-end reconciliation");
            if let (true, Some(engine)) = (task.gate.is_some(), &self.gate_engine) {
                let request = match result.outcome {
                    RunOutcome::Done => Some(GateRequest::Complete { summary: None }),
                    RunOutcome::NeedsReview => Some(GateRequest::NeedsReview {
                        blockers: result.blockers.clone(),
                        rejection_notes: result.notes.clone(),
                    }),
                    RunOutcome::Blocked => Some(GateRequest::Blocked {
                        blockers: result.blockers.clone(),
                        summary: None,
                    }),
                    RunOutcome::Partial => None,
                };
                match request {
                    Some(request) => {
                        if let Err(err) = engine.apply(&task.id, &result.agent_id, request).await {
                            warn!(task_id = %task.id, error = %err, "gate reconciliation failed");
                        }
                    }
                    None => self.apply_step(&task.id, TaskStatus::Review, true).await,
                }
            } else {
                self.apply_plain_outcome(&task, result.outcome, &result.blockers)
                    .await;
            }
            reconciled.push(task.id.clone());
        }
        Ok(reconciled)
    }

    async fn reject(&self, envelope: &Envelope, err: &DomainError) {
        self.event_log
            .log(
                EventRecord::new(
                    EventType::ProtocolMessageRejected,
                    EventActor::agent(&envelope.from_agent),
                )
                .with_task(envelope.task_id.clone())
                .with_payload(serde_json::json!({
                    "message": envelope.message.type_name(),
                    "reason": rejection_reason(err),
                    "detail": err.to_string(),
                })),
            )
            .await;
    }
}

fn check_agent(task: &Task, from_agent: &str) -> DomainResult<()> {
    match task.authorized_agent() {
        Some(agent) if agent == from_agent => Ok(()),
        _ => Err(DomainError::UnauthorizedAgent {
            task_id: task.id.clone(),
            agent: from_agent.to_string(),
        }),
    }
}

/// Stable rejection codes carried in `protocol.message.rejected`.
fn rejection_reason(err: &DomainError) -> &'static str {
    match err {
        DomainError::ProjectNotFound(_) => "invalid_project_id",
        DomainError::TaskNotFound(_) => "task_not_found",
        DomainError::ParentNotFound(_) => "parent_not_found",
        DomainError::UnauthorizedAgent { .. } => "unauthorized_agent",
        DomainError::DelegationDepthExceeded { .. } => "nested_delegation",
        DomainError::GateNotRejectable { .. } => "gate_not_rejectable",
        DomainError::MissingRejectionNotes => "missing_rejection_notes",
        DomainError::MissingBlockers => "missing_blockers",
        DomainError::InvalidOutcome(_) => "invalid_outcome",
        DomainError::InvalidTransition { .. } => "invalid_transition",
        _ => "internal_error",
    }
}
