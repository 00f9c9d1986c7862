//! Scheduler poll loop.
//!
//! The periodic control loop: each cycle snapshots the store, plans a
//! set of actions (expiries, recoveries, promotions, dispatches,
//! alerts), executes them sequentially, and journals one
//! `scheduler.poll` summary. Recoverable failures become logged
//! skips; nothing here unwinds the loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    Config, EventActor, EventRecord, EventType, ProjectManifest, RoutingTarget, Task, TaskId,
    TaskStatus,
};
use crate::infrastructure::events::EventLog;
use crate::infrastructure::store::{RunArtifacts, TaskStore};
use crate::services::action_executor::{ActionExecutor, DispatchOutcome, DispatchSettings};
use crate::services::dependency_graph::DependencyGraph;
use crate::services::gate_engine::GateEngine;
use crate::services::lease_manager::LeaseManager;

/// One decision produced by the planning phase of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// Lease has lapsed; clear it and requeue.
    ExpireLease { task_id: TaskId },
    /// Agent stopped heartbeating while its lease is still live.
    StaleHeartbeat { task_id: TaskId },
    /// Park a task (dependency cycle).
    Block { task_id: TaskId, reason: String },
    /// In-progress longer than the project SLA allows.
    SlaViolation { task_id: TaskId, age_secs: i64 },
    /// Gate timeout elapsed; escalate.
    GateTimeout { task_id: TaskId },
    /// Backlog task cleared its prerequisites.
    Promote { task_id: TaskId },
    /// Dispatch a ready task to a concrete target.
    Assign {
        task_id: TaskId,
        agent: String,
        routing_kind: &'static str,
    },
    /// Return a blocked task to the queue.
    Requeue { task_id: TaskId },
    /// Write a record; change no state.
    Alert {
        task_id: Option<TaskId>,
        reason: String,
    },
}

impl PlannedAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExpireLease { .. } => "expire_lease",
            Self::StaleHeartbeat { .. } => "stale_heartbeat",
            Self::Block { .. } => "block",
            Self::SlaViolation { .. } => "sla_violation",
            Self::GateTimeout { .. } => "gate_timeout",
            Self::Promote { .. } => "promote",
            Self::Assign { .. } => "assign",
            Self::Requeue { .. } => "requeue",
            Self::Alert { .. } => "alert",
        }
    }
}

/// Why a cycle executed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    NoTasks,
    NoReadyTasks,
    AlertOnly,
    NoExecutor,
    ActionFailed,
    DryRunMode,
}

impl IdleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoTasks => "no_tasks",
            Self::NoReadyTasks => "no_ready_tasks",
            Self::AlertOnly => "alert_only",
            Self::NoExecutor => "no_executor",
            Self::ActionFailed => "action_failed",
            Self::DryRunMode => "dry_run_mode",
        }
    }
}

/// Outcome of one poll cycle. `executed` counts state-mutating
/// actions; alerts and SLA records are tallied separately.
#[derive(Debug)]
pub struct PollSummary {
    pub planned: Vec<PlannedAction>,
    pub executed: usize,
    pub failed: usize,
    pub alerts: usize,
    pub dispatched: usize,
    pub by_status: HashMap<TaskStatus, usize>,
    pub idle_reason: Option<IdleReason>,
    pub duration_ms: u128,
}

/// Mutable cross-cycle scheduler state. Never module-global; tests can
/// reset it.
#[derive(Debug, Default)]
struct SchedulerState {
    /// Cap imposed by executor platform limits, when lower than the
    /// configured maximum.
    platform_cap: Option<usize>,
    last_dispatch_at: Option<DateTime<Utc>>,
    last_team_dispatch: HashMap<String, DateTime<Utc>>,
    sla_alerted: HashMap<TaskId, DateTime<Utc>>,
}

/// The periodic poll loop over one project store.
pub struct Scheduler {
    config: Config,
    manifest: ProjectManifest,
    store: Arc<TaskStore>,
    artifacts: RunArtifacts,
    lease_manager: Arc<LeaseManager>,
    gate_engine: Option<Arc<GateEngine>>,
    action_executor: Option<Arc<ActionExecutor>>,
    event_log: Arc<EventLog>,
    graph: DependencyGraph,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        manifest: ProjectManifest,
        store: Arc<TaskStore>,
        artifacts: RunArtifacts,
        lease_manager: Arc<LeaseManager>,
        gate_engine: Option<Arc<GateEngine>>,
        action_executor: Option<Arc<ActionExecutor>>,
        event_log: Arc<EventLog>,
    ) -> Self {
        Self {
            config,
            manifest,
            store,
            artifacts,
            lease_manager,
            gate_engine,
            action_executor,
            event_log,
            graph: DependencyGraph::new(),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Clear cross-cycle state (platform cap, throttles, alert
    /// rate-limits).
    pub async fn reset_state(&self) {
        *self.state.lock().await = SchedulerState::default();
    }

    /// Run one full cycle: plan, execute, journal.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> DomainResult<PollSummary> {
        let started = std::time::Instant::now();
        let now = Utc::now();

        // 1. Snapshot and indexes.
        let snapshot = self.store.snapshot().await;
        let by_id: HashMap<TaskId, &Task> =
            snapshot.iter().map(|t| (t.id.clone(), t)).collect();
        let mut children: HashMap<TaskId, Vec<&Task>> = HashMap::new();
        for task in &snapshot {
            if let Some(parent) = &task.parent_id {
                children.entry(parent.clone()).or_default().push(task);
            }
        }
        let mut by_status: HashMap<TaskStatus, usize> = HashMap::new();
        for task in &snapshot {
            *by_status.entry(task.status).or_insert(0) += 1;
        }

        let actions = self
            .plan(&snapshot, &by_id, &children, &by_status, now)
            .await;

        let (executed, failed, alerts, dispatched) = if self.config.scheduler.dry_run {
            (0, 0, 0, 0)
        } else {
            self.execute(&actions, &by_status, now).await
        };

        let idle_reason = self.idle_reason(&snapshot, &actions, executed, failed);
        let duration_ms = started.elapsed().as_millis();

        let mut planned_counts: HashMap<&'static str, usize> = HashMap::new();
        for action in &actions {
            *planned_counts.entry(action.kind()).or_insert(0) += 1;
        }
        let stats: HashMap<&'static str, usize> = by_status
            .iter()
            .map(|(status, count)| (status.as_str(), *count))
            .collect();

        info!(
            planned = actions.len(),
            executed,
            failed,
            duration_ms = duration_ms as u64,
            "poll cycle complete"
        );
        self.event_log
            .log(
                EventRecord::new(EventType::SchedulerPoll, EventActor::Scheduler).with_payload(
                    serde_json::json!({
                        "planned": planned_counts,
                        "executed": executed,
                        "failed": failed,
                        "alerts": alerts,
                        "dispatched": dispatched,
                        "stats": stats,
                        "reason": idle_reason.map(|r| r.as_str()),
                        "durationMs": duration_ms as u64,
                    }),
                ),
            )
            .await;

        Ok(PollSummary {
            planned: actions,
            executed,
            failed,
            alerts,
            dispatched,
            by_status,
            idle_reason,
            duration_ms,
        })
    }

    // ---- planning ------------------------------------------------------

    async fn plan(
        &self,
        snapshot: &[Task],
        by_id: &HashMap<TaskId, &Task>,
        children: &HashMap<TaskId, Vec<&Task>>,
        by_status: &HashMap<TaskStatus, usize>,
        now: DateTime<Utc>,
    ) -> Vec<PlannedAction> {
        let mut actions = Vec::new();
        let state = self.state.lock().await;

        // 2. Expiries.
        let mut expiring: HashSet<&TaskId> = HashSet::new();
        for task in snapshot {
            if matches!(task.status, TaskStatus::InProgress | TaskStatus::Blocked)
                && task.lease.as_ref().is_some_and(|l| l.is_expired(now))
            {
                expiring.insert(&task.id);
                actions.push(PlannedAction::ExpireLease {
                    task_id: task.id.clone(),
                });
            }
        }

        // 3. Resource occupancy.
        let mut resources: HashMap<&str, &TaskId> = HashMap::new();
        for task in snapshot {
            if task.status == TaskStatus::InProgress {
                if let Some(resource) = task.resource.as_deref() {
                    resources.insert(resource, &task.id);
                }
            }
        }

        // 4. Stale heartbeats (live lease, silent agent).
        for task in snapshot {
            if task.status != TaskStatus::InProgress || expiring.contains(&task.id) {
                continue;
            }
            let Some(lease) = &task.lease else { continue };
            let last_seen = self
                .artifacts
                .last_heartbeat_at(&task.id)
                .await
                .unwrap_or(lease.acquired_at);
            if now - last_seen > self.config.heartbeat_ttl() {
                actions.push(PlannedAction::StaleHeartbeat {
                    task_id: task.id.clone(),
                });
            }
        }

        // 5. Dependency cycles.
        let cyclic = self.graph.tasks_on_cycles(snapshot);
        for id in &cyclic {
            let Some(task) = by_id.get(id) else { continue };
            if matches!(task.status, TaskStatus::Backlog | TaskStatus::Ready) {
                actions.push(PlannedAction::Block {
                    task_id: id.clone(),
                    reason: "dependency cycle".to_string(),
                });
            }
        }

        // 6. SLA violations, rate-limited per task.
        for task in snapshot {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let Some(limit) = self.manifest.sla_limit_for(task.priority) else {
                continue;
            };
            let age = now - task.last_transition_at;
            if age <= limit {
                continue;
            }
            let recently_alerted = state
                .sla_alerted
                .get(&task.id)
                .is_some_and(|at| now - *at < self.config.sla_alert_interval());
            if !recently_alerted {
                actions.push(PlannedAction::SlaViolation {
                    task_id: task.id.clone(),
                    age_secs: age.num_seconds(),
                });
            }
        }

        // 7. Gate timeouts.
        if let Some(engine) = &self.gate_engine {
            for task in snapshot {
                if engine.is_timed_out(task, now) {
                    actions.push(PlannedAction::GateTimeout {
                        task_id: task.id.clone(),
                    });
                    actions.push(PlannedAction::Alert {
                        task_id: Some(task.id.clone()),
                        reason: "gate timeout escalated".to_string(),
                    });
                }
            }
        }

        // 8. Backlog promotion.
        for task in snapshot {
            if task.status != TaskStatus::Backlog || cyclic.contains(&task.id) {
                continue;
            }
            match promotion_blocker(task, by_id, children) {
                None => actions.push(PlannedAction::Promote {
                    task_id: task.id.clone(),
                }),
                Some(reason) => {
                    debug!(task_id = %task.id, reason = %reason, "not promotable");
                }
            }
        }

        // 9. Dispatch planning. The tightest limit wins: effective cap,
        // then per-poll max, then the dispatch interval.
        let in_progress = by_status.get(&TaskStatus::InProgress).copied().unwrap_or(0);
        let effective_cap = self
            .config
            .scheduler
            .max_concurrent
            .min(state.platform_cap.unwrap_or(usize::MAX));
        let mut budget = effective_cap
            .saturating_sub(in_progress)
            .min(self.config.scheduler.max_dispatches_per_poll);
        let interval = chrono::Duration::milliseconds(
            i64::try_from(self.config.scheduler.min_dispatch_interval_ms).unwrap_or(0),
        );
        if interval > chrono::Duration::zero()
            && state
                .last_dispatch_at
                .is_some_and(|at| now - at < interval)
        {
            budget = 0;
        }

        let mut ready: Vec<&Task> = snapshot
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut claimed_resources: HashSet<&str> = HashSet::new();
        for task in ready {
            if cyclic.contains(&task.id) {
                continue;
            }
            if task.has_live_lease(now) {
                debug!(task_id = %task.id, "ready task holds a live lease, skipping");
                continue;
            }
            let waiting_subtasks = children
                .get(&task.id)
                .map_or(0, |subs| subs.iter().filter(|s| s.status != TaskStatus::Done).count());
            if waiting_subtasks > 0 {
                continue;
            }
            if let Some(resource) = task.resource.as_deref() {
                if resources.contains_key(resource) || claimed_resources.contains(resource) {
                    continue;
                }
            }
            match task.routing.target() {
                Some(target) => {
                    if budget == 0 {
                        continue;
                    }
                    let (agent, routing_kind) = match target {
                        RoutingTarget::Agent(a) => (a, "agent"),
                        RoutingTarget::Role(r) => (r, "role"),
                        RoutingTarget::Team(t) => (t, "team"),
                    };
                    if let Some(resource) = task.resource.as_deref() {
                        claimed_resources.insert(resource);
                    }
                    budget -= 1;
                    actions.push(PlannedAction::Assign {
                        task_id: task.id.clone(),
                        agent,
                        routing_kind,
                    });
                }
                None => {
                    let reason = if task.routing.tags.is_empty() {
                        "no routing target".to_string()
                    } else {
                        format!("tags-only routing: {}", task.routing.tags.join(","))
                    };
                    actions.push(PlannedAction::Alert {
                        task_id: Some(task.id.clone()),
                        reason,
                    });
                }
            }
        }

        // 10. Unblock recovery: dependency-gated blocked tasks whose
        // prerequisites have since completed. Spawn-failed tasks follow
        // the retry path; canceled tasks stay parked.
        for task in snapshot {
            if task.status != TaskStatus::Blocked || expiring.contains(&task.id) {
                continue;
            }
            let reason = task.block_reason().unwrap_or_default();
            if reason.starts_with("spawn_failed") || reason == "canceled" {
                continue;
            }
            let has_prereqs =
                !task.depends_on.is_empty() || children.contains_key(&task.id);
            if !has_prereqs {
                continue;
            }
            let deps_met = DependencyGraph::dependencies_met(task, by_id);
            let subs_done = children
                .get(&task.id)
                .is_none_or(|subs| subs.iter().all(|s| s.status == TaskStatus::Done));
            if deps_met && subs_done {
                actions.push(PlannedAction::Requeue {
                    task_id: task.id.clone(),
                });
            }
        }

        // 11. Dispatch-failure retry.
        for task in snapshot {
            if task.status != TaskStatus::Blocked {
                continue;
            }
            if !task
                .block_reason()
                .unwrap_or_default()
                .starts_with("spawn_failed")
            {
                continue;
            }
            if task.retry_count() < self.config.retry.max_retries {
                let blocked_long_enough = task
                    .last_blocked_at()
                    .is_none_or(|at| now - at > self.config.retry_delay());
                if blocked_long_enough {
                    actions.push(PlannedAction::Requeue {
                        task_id: task.id.clone(),
                    });
                }
            } else {
                actions.push(PlannedAction::Alert {
                    task_id: Some(task.id.clone()),
                    reason: "dispatch retries exhausted".to_string(),
                });
            }
        }

        actions
    }

    // ---- execution -----------------------------------------------------

    async fn execute(
        &self,
        actions: &[PlannedAction],
        by_status: &HashMap<TaskStatus, usize>,
        now: DateTime<Utc>,
    ) -> (usize, usize, usize, usize) {
        let mut executed = 0;
        let mut failed = 0;
        let mut alerts = 0;
        let mut dispatched = 0;
        let mut expiries_done = false;
        let mut stop_assigning = false;

        for action in actions {
            let result: DomainResult<()> = match action {
                PlannedAction::ExpireLease { .. } => {
                    // One scan clears every planned expiry.
                    if expiries_done {
                        Ok(())
                    } else {
                        expiries_done = true;
                        self.lease_manager.expire_leases(now).await.map(|_| ())
                    }
                }
                PlannedAction::StaleHeartbeat { task_id } => {
                    self.lease_manager
                        .force_expire(task_id, "stale_heartbeat")
                        .await
                }
                PlannedAction::Block { task_id, reason } => {
                    self.store.block(task_id, reason.clone()).await.map(|_| ())
                }
                PlannedAction::SlaViolation { task_id, age_secs } => {
                    self.state
                        .lock()
                        .await
                        .sla_alerted
                        .insert(task_id.clone(), now);
                    self.event_log
                        .log(
                            EventRecord::new(EventType::SlaViolation, EventActor::Scheduler)
                                .with_task(task_id.clone())
                                .with_payload(serde_json::json!({ "ageSecs": age_secs })),
                        )
                        .await;
                    alerts += 1;
                    continue;
                }
                PlannedAction::GateTimeout { task_id } => match &self.gate_engine {
                    Some(engine) => engine.escalate(task_id, now).await,
                    None => Ok(()),
                },
                PlannedAction::Promote { task_id } => {
                    match self.store.transition(task_id, TaskStatus::Ready).await {
                        Ok(_) => match &self.gate_engine {
                            Some(engine) => engine.enroll(task_id).await.map(|_| ()),
                            None => Ok(()),
                        },
                        Err(err) => Err(err),
                    }
                }
                PlannedAction::Assign {
                    task_id,
                    agent,
                    routing_kind,
                } => {
                    if stop_assigning {
                        continue;
                    }
                    let Some(executor) = &self.action_executor else {
                        continue;
                    };
                    let settings = DispatchSettings {
                        lease_ttl: self.config.lease_ttl(),
                        max_renewals: self.config.lease.max_renewals,
                        spawn_timeout_ms: self.config.executor.spawn_timeout_ms,
                    };
                    match executor.dispatch(task_id, agent, routing_kind, settings).await {
                        Ok(DispatchOutcome::Dispatched { .. }) => {
                            dispatched += 1;
                            let mut state = self.state.lock().await;
                            state.last_dispatch_at = Some(Utc::now());
                            if *routing_kind == "team" {
                                state
                                    .last_team_dispatch
                                    .insert(agent.clone(), Utc::now());
                            }
                            Ok(())
                        }
                        Ok(DispatchOutcome::PlatformLimited) => {
                            // Lower the cap to what is actually running
                            // and stop assigning this cycle.
                            let running =
                                by_status.get(&TaskStatus::InProgress).copied().unwrap_or(0)
                                    + dispatched;
                            self.state.lock().await.platform_cap = Some(running.max(1));
                            stop_assigning = true;
                            Ok(())
                        }
                        Ok(_) => Ok(()),
                        Err(err) => Err(err),
                    }
                }
                PlannedAction::Requeue { task_id } => {
                    self.store.unblock(task_id).await.map(|_| ())
                }
                PlannedAction::Alert { task_id, reason } => {
                    let mut record =
                        EventRecord::new(EventType::SchedulerAlert, EventActor::Scheduler)
                            .with_payload(serde_json::json!({ "reason": reason }));
                    if let Some(task_id) = task_id {
                        record = record.with_task(task_id.clone());
                    }
                    self.event_log.log(record).await;
                    alerts += 1;
                    continue;
                }
            };

            match result {
                Ok(()) => executed += 1,
                Err(err) => {
                    warn!(kind = action.kind(), error = %err, "planned action failed");
                    failed += 1;
                }
            }
        }

        (executed, failed, alerts, dispatched)
    }

    fn idle_reason(
        &self,
        snapshot: &[Task],
        actions: &[PlannedAction],
        executed: usize,
        failed: usize,
    ) -> Option<IdleReason> {
        if executed > 0 {
            return None;
        }
        if snapshot.is_empty() {
            return Some(IdleReason::NoTasks);
        }
        if self.config.scheduler.dry_run {
            return Some(IdleReason::DryRunMode);
        }
        if failed > 0 {
            return Some(IdleReason::ActionFailed);
        }
        let has_assign = actions
            .iter()
            .any(|a| matches!(a, PlannedAction::Assign { .. }));
        if has_assign && self.action_executor.is_none() {
            return Some(IdleReason::NoExecutor);
        }
        if !actions.is_empty()
            && actions.iter().all(|a| {
                matches!(
                    a,
                    PlannedAction::Alert { .. } | PlannedAction::SlaViolation { .. }
                )
            })
        {
            return Some(IdleReason::AlertOnly);
        }
        Some(IdleReason::NoReadyTasks)
    }
}

/// Why a backlog task cannot promote, or `None` when it is eligible.
///
/// Eligibility: every dependency known and done, every subtask done,
/// exactly one routing target, no lease.
pub fn promotion_blocker(
    task: &Task,
    by_id: &HashMap<TaskId, &Task>,
    children: &HashMap<TaskId, Vec<&Task>>,
) -> Option<String> {
    for dep in &task.depends_on {
        match by_id.get(dep) {
            Some(dep_task) if dep_task.status == TaskStatus::Done => {}
            _ => return Some(format!("Missing dependency: {dep}")),
        }
    }
    let waiting = children
        .get(&task.id)
        .map_or(0, |subs| subs.iter().filter(|s| s.status != TaskStatus::Done).count());
    if waiting > 0 {
        return Some(format!("Waiting on {waiting} subtask(s)"));
    }
    if task.routing.target_count() != 1 {
        return Some("No routing target".to_string());
    }
    if task.lease.is_some() {
        return Some("Active lease (corrupted state?)".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Lease, Routing, TaskPriority};
    use crate::infrastructure::store::NewTask;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<TaskStore>,
        event_log: Arc<EventLog>,
        scheduler: Scheduler,
    }

    async fn setup(config: Config, manifest: ProjectManifest) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).await.unwrap());
        let event_log = Arc::new(EventLog::open(dir.path(), Vec::new()).await.unwrap());
        let artifacts = RunArtifacts::new(dir.path());
        let lease_manager = Arc::new(LeaseManager::new(
            Arc::clone(&store),
            artifacts.clone(),
            Arc::clone(&event_log),
            config.heartbeat_ttl(),
        ));
        let scheduler = Scheduler::new(
            config,
            manifest,
            Arc::clone(&store),
            artifacts,
            lease_manager,
            None,
            None,
            Arc::clone(&event_log),
        );
        Harness {
            _dir: dir,
            store,
            event_log,
            scheduler,
        }
    }

    fn routed(title: &str) -> NewTask {
        NewTask {
            project: "proj-a".into(),
            title: title.into(),
            routing: Routing::to_agent("coder-1"),
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn empty_store_reports_no_tasks() {
        let h = setup(Config::default(), ProjectManifest::new("proj-a")).await;
        let summary = h.scheduler.poll_once().await.unwrap();
        assert_eq!(summary.idle_reason, Some(IdleReason::NoTasks));
        assert!(summary.planned.is_empty());

        let polls = h
            .event_log
            .events_of_type(EventType::SchedulerPoll)
            .await
            .unwrap();
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].payload["reason"], "no_tasks");
    }

    #[tokio::test]
    async fn promotes_eligible_backlog_tasks() {
        let h = setup(Config::default(), ProjectManifest::new("proj-a")).await;
        let task = h.store.create(routed("a")).await.unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(summary
            .planned
            .iter()
            .any(|a| matches!(a, PlannedAction::Promote { task_id } if task_id == &task.id)));
        assert_eq!(
            h.store.get(&task.id).await.unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn backlog_task_with_unmet_dep_stays_put() {
        let h = setup(Config::default(), ProjectManifest::new("proj-a")).await;
        let dep = h.store.create(routed("dep")).await.unwrap();
        let mut blocked = routed("b");
        blocked.depends_on = vec![dep.id.clone()];
        let task = h.store.create(blocked).await.unwrap();

        h.scheduler.poll_once().await.unwrap();
        assert_eq!(
            h.store.get(&task.id).await.unwrap().status,
            TaskStatus::Backlog
        );
    }

    #[tokio::test]
    async fn cycle_members_are_blocked_not_promoted() {
        let h = setup(Config::default(), ProjectManifest::new("proj-a")).await;
        let a = h.store.create(routed("a")).await.unwrap();
        let b = h.store.create(routed("b")).await.unwrap();
        h.store.add_dep(&a.id, &b.id).await.unwrap();
        h.store.add_dep(&b.id, &a.id).await.unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        let blocks: Vec<_> = summary
            .planned
            .iter()
            .filter(|a| matches!(a, PlannedAction::Block { .. }))
            .collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            h.store.get(&a.id).await.unwrap().status,
            TaskStatus::Blocked
        );
        assert_eq!(
            h.store.get(&a.id).await.unwrap().block_reason(),
            Some("dependency cycle")
        );
    }

    #[tokio::test]
    async fn expired_lease_planned_and_requeued() {
        let h = setup(Config::default(), ProjectManifest::new("proj-a")).await;
        let task = h.store.create(routed("a")).await.unwrap();
        h.store.transition(&task.id, TaskStatus::Ready).await.unwrap();
        h.store
            .transition_with(&task.id, TaskStatus::InProgress, |task| {
                task.lease = Some(Lease {
                    agent: "coder-1".into(),
                    acquired_at: Utc::now() - chrono::Duration::hours(2),
                    expires_at: Utc::now() - chrono::Duration::hours(1),
                    renew_count: 0,
                });
            })
            .await
            .unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(summary
            .planned
            .iter()
            .any(|a| matches!(a, PlannedAction::ExpireLease { .. })));
        assert_eq!(
            h.store.get(&task.id).await.unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn stale_heartbeat_recovers_silent_agent() {
        let mut config = Config::default();
        config.scheduler.heartbeat_ttl_secs = 60;
        let h = setup(config, ProjectManifest::new("proj-a")).await;
        let task = h.store.create(routed("a")).await.unwrap();
        h.store.transition(&task.id, TaskStatus::Ready).await.unwrap();
        // Live lease, but acquired long ago and no heartbeat on disk.
        h.store
            .transition_with(&task.id, TaskStatus::InProgress, |task| {
                task.lease = Some(Lease {
                    agent: "coder-1".into(),
                    acquired_at: Utc::now() - chrono::Duration::minutes(30),
                    expires_at: Utc::now() + chrono::Duration::minutes(30),
                    renew_count: 0,
                });
            })
            .await
            .unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(summary
            .planned
            .iter()
            .any(|a| matches!(a, PlannedAction::StaleHeartbeat { .. })));
        assert_eq!(
            h.store.get(&task.id).await.unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn dispatch_respects_concurrency_cap() {
        let mut config = Config::default();
        config.scheduler.max_concurrent = 2;
        config.scheduler.min_dispatch_interval_ms = 0;
        let h = setup(config, ProjectManifest::new("proj-a")).await;

        // One already running.
        let running = h.store.create(routed("running")).await.unwrap();
        h.store
            .transition(&running.id, TaskStatus::Ready)
            .await
            .unwrap();
        h.store
            .transition(&running.id, TaskStatus::InProgress)
            .await
            .unwrap();

        for i in 0..3 {
            let task = h.store.create(routed(&format!("r{i}"))).await.unwrap();
            h.store.transition(&task.id, TaskStatus::Ready).await.unwrap();
        }

        let summary = h.scheduler.poll_once().await.unwrap();
        let assigns = summary
            .planned
            .iter()
            .filter(|a| matches!(a, PlannedAction::Assign { .. }))
            .count();
        // cap 2, one slot taken.
        assert_eq!(assigns, 1);
    }

    #[tokio::test]
    async fn resource_conflicts_skip_dispatch() {
        let mut config = Config::default();
        config.scheduler.min_dispatch_interval_ms = 0;
        let h = setup(config, ProjectManifest::new("proj-a")).await;

        let mut first = routed("first");
        first.resource = Some("repo-main".into());
        let first = h.store.create(first).await.unwrap();
        h.store.transition(&first.id, TaskStatus::Ready).await.unwrap();

        let mut second = routed("second");
        second.resource = Some("repo-main".into());
        let second = h.store.create(second).await.unwrap();
        h.store
            .transition(&second.id, TaskStatus::Ready)
            .await
            .unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        let assigns: Vec<&PlannedAction> = summary
            .planned
            .iter()
            .filter(|a| matches!(a, PlannedAction::Assign { .. }))
            .collect();
        // Same resource: only one may go out per cycle.
        assert_eq!(assigns.len(), 1);
    }

    #[tokio::test]
    async fn tags_only_routing_alerts_instead_of_assigning() {
        let h = setup(Config::default(), ProjectManifest::new("proj-a")).await;
        let task = h
            .store
            .create(NewTask {
                project: "proj-a".into(),
                title: "untargeted".into(),
                routing: Routing::default().with_tag("feature"),
                ..NewTask::default()
            })
            .await
            .unwrap();
        h.store.transition(&task.id, TaskStatus::Ready).await.unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(summary
            .planned
            .iter()
            .any(|a| matches!(a, PlannedAction::Alert { .. })));
        assert!(!summary
            .planned
            .iter()
            .any(|a| matches!(a, PlannedAction::Assign { .. })));
        // Ready task exists, so the idle reason is alert_only, but the
        // alert itself executes.
        assert_eq!(
            h.store.get(&task.id).await.unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn priority_orders_dispatch_planning() {
        let mut config = Config::default();
        config.scheduler.max_concurrent = 1;
        config.scheduler.min_dispatch_interval_ms = 0;
        let h = setup(config, ProjectManifest::new("proj-a")).await;

        let mut low = routed("low");
        low.priority = TaskPriority::Low;
        let low = h.store.create(low).await.unwrap();
        h.store.transition(&low.id, TaskStatus::Ready).await.unwrap();

        let mut critical = routed("critical");
        critical.priority = TaskPriority::Critical;
        let critical = h.store.create(critical).await.unwrap();
        h.store
            .transition(&critical.id, TaskStatus::Ready)
            .await
            .unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        let first_assign = summary
            .planned
            .iter()
            .find_map(|a| match a {
                PlannedAction::Assign { task_id, .. } => Some(task_id.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(first_assign, critical.id);
    }

    #[tokio::test]
    async fn unblock_recovery_requeues_when_deps_complete() {
        let h = setup(Config::default(), ProjectManifest::new("proj-a")).await;
        let dep = h.store.create(routed("dep")).await.unwrap();
        let mut dependent = routed("waiter");
        dependent.depends_on = vec![dep.id.clone()];
        let dependent = h.store.create(dependent).await.unwrap();
        h.store.block(&dependent.id, "waiting on dep").await.unwrap();

        // Dependency not done yet: stays blocked.
        h.scheduler.poll_once().await.unwrap();
        assert_eq!(
            h.store.get(&dependent.id).await.unwrap().status,
            TaskStatus::Blocked
        );

        // Complete the dependency, then requeue.
        h.store.transition(&dep.id, TaskStatus::Ready).await.unwrap();
        h.store
            .transition(&dep.id, TaskStatus::InProgress)
            .await
            .unwrap();
        h.store.transition(&dep.id, TaskStatus::Review).await.unwrap();
        h.store.transition(&dep.id, TaskStatus::Done).await.unwrap();

        h.scheduler.poll_once().await.unwrap();
        assert_eq!(
            h.store.get(&dependent.id).await.unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn spawn_failed_retry_waits_for_delay() {
        let mut config = Config::default();
        config.retry.retry_delay_secs = 300;
        let h = setup(config, ProjectManifest::new("proj-a")).await;
        let task = h.store.create(routed("flaky")).await.unwrap();
        h.store.transition(&task.id, TaskStatus::Ready).await.unwrap();
        h.store
            .transition_with(&task.id, TaskStatus::Blocked, |task| {
                task.set_meta("blockReason", "spawn_failed: connection refused");
                task.set_meta("retryCount", 1u32);
                task.set_meta(
                    "lastBlockedAt",
                    (Utc::now() - chrono::Duration::minutes(1)).to_rfc3339(),
                );
            })
            .await
            .unwrap();

        // Only a minute old: too soon.
        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(!summary
            .planned
            .iter()
            .any(|a| matches!(a, PlannedAction::Requeue { .. })));

        // Age it past the delay.
        h.store
            .update(&task.id, |task| {
                task.set_meta(
                    "lastBlockedAt",
                    (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339(),
                );
            })
            .await
            .unwrap();
        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(summary
            .planned
            .iter()
            .any(|a| matches!(a, PlannedAction::Requeue { task_id } if task_id == &task.id)));
        assert_eq!(
            h.store.get(&task.id).await.unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn exhausted_retries_alert_instead_of_requeue() {
        let h = setup(Config::default(), ProjectManifest::new("proj-a")).await;
        let task = h.store.create(routed("hopeless")).await.unwrap();
        h.store.transition(&task.id, TaskStatus::Ready).await.unwrap();
        h.store
            .transition_with(&task.id, TaskStatus::Blocked, |task| {
                task.set_meta("blockReason", "spawn_failed: connection refused");
                task.set_meta("retryCount", 3u32);
                task.set_meta(
                    "lastBlockedAt",
                    (Utc::now() - chrono::Duration::hours(1)).to_rfc3339(),
                );
            })
            .await
            .unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(summary.planned.iter().any(|a| matches!(
            a,
            PlannedAction::Alert { reason, .. } if reason.contains("retries exhausted")
        )));
        assert_eq!(
            h.store.get(&task.id).await.unwrap().status,
            TaskStatus::Blocked
        );
    }

    #[tokio::test]
    async fn sla_violation_alerts_and_rate_limits() {
        let mut manifest = ProjectManifest::new("proj-a");
        manifest.sla = Some(crate::domain::models::SlaConfig {
            default: Some(crate::domain::models::DurationLit::minutes(10)),
            per_priority: std::collections::BTreeMap::new(),
        });
        let h = setup(Config::default(), manifest).await;
        let task = h.store.create(routed("slow")).await.unwrap();
        h.store.transition(&task.id, TaskStatus::Ready).await.unwrap();
        h.store
            .transition(&task.id, TaskStatus::InProgress)
            .await
            .unwrap();
        // Age the transition stamp past the SLA.
        h.store
            .update(&task.id, |task| {
                task.last_transition_at = Utc::now() - chrono::Duration::hours(1);
            })
            .await
            .unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(summary
            .planned
            .iter()
            .any(|a| matches!(a, PlannedAction::SlaViolation { .. })));
        assert_eq!(
            h.event_log
                .events_of_type(EventType::SlaViolation)
                .await
                .unwrap()
                .len(),
            1
        );
        // State unchanged, and the second poll is rate-limited.
        assert_eq!(
            h.store.get(&task.id).await.unwrap().status,
            TaskStatus::InProgress
        );
        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(!summary
            .planned
            .iter()
            .any(|a| matches!(a, PlannedAction::SlaViolation { .. })));
    }

    #[tokio::test]
    async fn dry_run_plans_but_never_executes() {
        let mut config = Config::default();
        config.scheduler.dry_run = true;
        let h = setup(config, ProjectManifest::new("proj-a")).await;
        let task = h.store.create(routed("a")).await.unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(!summary.planned.is_empty());
        assert_eq!(summary.executed, 0);
        assert_eq!(summary.idle_reason, Some(IdleReason::DryRunMode));
        assert_eq!(
            h.store.get(&task.id).await.unwrap().status,
            TaskStatus::Backlog
        );
    }

    #[tokio::test]
    async fn assign_without_executor_reports_no_executor() {
        let mut config = Config::default();
        config.scheduler.min_dispatch_interval_ms = 0;
        let h = setup(config, ProjectManifest::new("proj-a")).await;
        let task = h.store.create(routed("a")).await.unwrap();
        h.store.transition(&task.id, TaskStatus::Ready).await.unwrap();

        let summary = h.scheduler.poll_once().await.unwrap();
        assert!(summary
            .planned
            .iter()
            .any(|a| matches!(a, PlannedAction::Assign { .. })));
        assert_eq!(summary.dispatched, 0);
        // Assigns were skipped; with nothing else executed the cycle
        // reports the missing executor.
        assert_eq!(summary.idle_reason, Some(IdleReason::NoExecutor));
    }

    #[tokio::test]
    async fn promotion_blocker_reasons() {
        let h = setup(Config::default(), ProjectManifest::new("proj-a")).await;
        let dep = h.store.create(routed("dep")).await.unwrap();
        let mut child_new = routed("child");
        let parent = h.store.create(routed("parent")).await.unwrap();
        child_new.parent_id = Some(parent.id.clone());
        let child = h.store.create(child_new).await.unwrap();

        let snapshot = h.store.snapshot().await;
        let by_id: HashMap<TaskId, &Task> =
            snapshot.iter().map(|t| (t.id.clone(), t)).collect();
        let mut children: HashMap<TaskId, Vec<&Task>> = HashMap::new();
        for task in &snapshot {
            if let Some(p) = &task.parent_id {
                children.entry(p.clone()).or_default().push(task);
            }
        }
        let now = Utc::now();

        // Parent waits on its child.
        let parent_task = by_id[&parent.id];
        assert_eq!(
            promotion_blocker(parent_task, &by_id, &children),
            Some("Waiting on 1 subtask(s)".to_string())
        );

        // Unrouted task.
        let mut unrouted = (*by_id[&child.id]).clone();
        unrouted.routing = Routing::default();
        assert_eq!(
            promotion_blocker(&unrouted, &by_id, &children),
            Some("No routing target".to_string())
        );

        // Missing dependency.
        let mut missing = (*by_id[&dep.id]).clone();
        missing.depends_on = vec![TaskId::new("TASK-1999-01-01-001")];
        assert!(promotion_blocker(&missing, &by_id, &children)
            .unwrap()
            .starts_with("Missing dependency"));

        // Lease on a backlog task is corrupted state.
        let mut leased = (*by_id[&dep.id]).clone();
        leased.lease = Some(Lease::new("ghost", now, chrono::Duration::minutes(5)));
        assert_eq!(
            promotion_blocker(&leased, &by_id, &children),
            Some("Active lease (corrupted state?)".to_string())
        );

        // Clean task is eligible.
        assert_eq!(promotion_blocker(by_id[&dep.id], &by_id, &children), None);
    }
}
