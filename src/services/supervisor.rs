//! Supervisor: wires the core together and runs the scheduler timer.
//!
//! Build order: config, manifest, store, event log, lease manager,
//! gate engine, failure tracker, action executor, protocol router,
//! scheduler. The store's after-transition hook journals every move
//! and stops renewal timers when a task leaves `in-progress`.

use std::path::Path;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};

use crate::domain::models::{
    Config, EventActor, EventRecord, EventType, ProjectManifest, TaskStatus,
};
use crate::domain::ports::{AgentExecutor, EventSubscriber};
use crate::infrastructure::config::{load_manifest, ConfigLoader};
use crate::infrastructure::events::EventLog;
use crate::infrastructure::store::{RunArtifacts, TaskStore};
use crate::services::action_executor::ActionExecutor;
use crate::services::failure_tracker::FailureTracker;
use crate::services::gate_engine::GateEngine;
use crate::services::lease_manager::LeaseManager;
use crate::services::protocol_router::ProtocolRouter;
use crate::services::scheduler::Scheduler;
use crate::services::task_locks::TaskLocks;

/// The assembled core for one data directory.
pub struct Supervisor {
    config: Config,
    manifest: ProjectManifest,
    store: Arc<TaskStore>,
    event_log: Arc<EventLog>,
    lease_manager: Arc<LeaseManager>,
    router: Arc<ProtocolRouter>,
    scheduler: Arc<Scheduler>,
}

impl Supervisor {
    /// Load config and manifest, open the store, and wire every
    /// service. `executor` is the external spawn interface; without
    /// one the scheduler plans assigns but cannot execute them.
    pub async fn start(
        data_dir: &Path,
        executor: Option<Arc<dyn AgentExecutor>>,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
    ) -> Result<Self> {
        let config = ConfigLoader::load(data_dir).context("Failed to load configuration")?;
        Self::start_with_config(data_dir, config, executor, subscribers).await
    }

    /// Like [`Supervisor::start`], but with a caller-supplied
    /// configuration. The binary uses this to apply CLI overrides
    /// (`--poll-interval`, `--dry-run`) on top of the loaded config.
    pub async fn start_with_config(
        data_dir: &Path,
        config: Config,
        executor: Option<Arc<dyn AgentExecutor>>,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
    ) -> Result<Self> {
        ConfigLoader::validate(&config).context("Invalid configuration")?;
        let manifest = load_manifest(data_dir)
            .await
            .context("Failed to load project manifest")?;

        let store = Arc::new(
            TaskStore::open(data_dir)
                .await
                .context("Failed to open task store")?,
        );
        let event_log = Arc::new(
            EventLog::open(data_dir, subscribers)
                .await
                .context("Failed to open event log")?,
        );
        let artifacts = RunArtifacts::new(data_dir);

        let lease_manager = Arc::new(LeaseManager::new(
            Arc::clone(&store),
            artifacts.clone(),
            Arc::clone(&event_log),
            config.heartbeat_ttl(),
        ));

        // `task.created` precedes every other event for an id.
        let create_log = Arc::clone(&event_log);
        store.set_on_create(Arc::new(move |task| {
            let log = Arc::clone(&create_log);
            Box::pin(async move {
                log.log(
                    EventRecord::new(EventType::TaskCreated, EventActor::System)
                        .with_task(task.id.clone())
                        .with_payload(serde_json::json!({
                            "title": task.title,
                            "priority": task.priority.as_str(),
                            "project": task.project,
                        })),
                )
                .await;
            })
        }));

        // Journal every transition and stop renewals on exit from
        // in-progress. Weak: the store must not keep the lease manager
        // (and transitively itself) alive.
        let hook_log = Arc::clone(&event_log);
        let hook_leases: Weak<LeaseManager> = Arc::downgrade(&lease_manager);
        store.set_after_transition(Arc::new(move |task, from| {
            let log = Arc::clone(&hook_log);
            let leases = hook_leases.clone();
            Box::pin(async move {
                if from == TaskStatus::InProgress && task.status != TaskStatus::InProgress {
                    if let Some(leases) = leases.upgrade() {
                        leases.stop_renewal(&task.id);
                    }
                }
                log.log(
                    EventRecord::new(EventType::TaskTransitioned, EventActor::System)
                        .with_task(task.id.clone())
                        .with_payload(serde_json::json!({
                            "from": from.as_str(),
                            "to": task.status.as_str(),
                        })),
                )
                .await;
            })
        }));

        let gate_engine = manifest.workflow.clone().map(|workflow| {
            Arc::new(GateEngine::new(
                Arc::clone(&store),
                Arc::clone(&event_log),
                workflow,
            ))
        });
        let failure_tracker = Arc::new(FailureTracker::new(
            Arc::clone(&store),
            Arc::clone(&event_log),
            config.retry.max_dispatch_failures,
        ));
        let action_executor = executor.map(|executor| {
            Arc::new(ActionExecutor::new(
                manifest.id.clone(),
                Arc::clone(&store),
                Arc::clone(&lease_manager),
                Arc::clone(&failure_tracker),
                Arc::clone(&event_log),
                executor,
            ))
        });

        let router = Arc::new(ProtocolRouter::new(
            manifest.id.clone(),
            Arc::clone(&store),
            artifacts.clone(),
            Arc::clone(&event_log),
            Arc::new(TaskLocks::new()),
            gate_engine.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            manifest.clone(),
            Arc::clone(&store),
            artifacts,
            Arc::clone(&lease_manager),
            gate_engine,
            action_executor,
            Arc::clone(&event_log),
        ));

        info!(project = %manifest.id, data_dir = %data_dir.display(), "supervisor started");
        Ok(Self {
            config,
            manifest,
            store,
            event_log,
            lease_manager,
            router,
            scheduler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manifest(&self) -> &ProjectManifest {
        &self.manifest
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    pub fn router(&self) -> &Arc<ProtocolRouter> {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Run the poll timer until `shutdown` flips true. Reconciles
    /// stranded work once on startup, then polls at the configured
    /// interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let reconciled = self.router.session_end().await?;
        if !reconciled.is_empty() {
            info!(count = reconciled.len(), "recovered tasks from run artifacts");
        }

        let period = std::time::Duration::from_secs(self.config.scheduler.poll_interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.scheduler.poll_once().await {
                        error!(error = %err, "poll cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.lease_manager.stop_all_renewals();
        info!("supervisor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Routing;
    use crate::infrastructure::config::write_manifest;
    use crate::infrastructure::store::NewTask;

    async fn seeded_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), &ProjectManifest::new("proj-a"))
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn start_wires_core_and_hook_journals_transitions() {
        let dir = seeded_dir().await;
        let supervisor = Supervisor::start(dir.path(), None, Vec::new())
            .await
            .unwrap();

        let task = supervisor
            .store()
            .create(NewTask {
                project: "proj-a".into(),
                title: "t".into(),
                routing: Routing::to_agent("coder-1"),
                ..NewTask::default()
            })
            .await
            .unwrap();
        supervisor
            .store()
            .transition(&task.id, TaskStatus::Ready)
            .await
            .unwrap();

        let events = supervisor.event_log().read_all().await.unwrap();
        let for_task: Vec<_> = events
            .iter()
            .filter(|e| e.task_id.as_ref() == Some(&task.id))
            .collect();
        // Creation precedes every other event for the id.
        assert_eq!(for_task[0].event_type, EventType::TaskCreated);
        assert_eq!(for_task[1].event_type, EventType::TaskTransitioned);
        assert_eq!(for_task[1].payload["from"], "backlog");
        assert_eq!(for_task[1].payload["to"], "ready");
    }

    #[tokio::test]
    async fn caller_supplied_config_reaches_the_scheduler() {
        let dir = seeded_dir().await;
        let mut config = Config::default();
        config.scheduler.dry_run = true;
        let supervisor = Supervisor::start_with_config(dir.path(), config, None, Vec::new())
            .await
            .unwrap();

        let task = supervisor
            .store()
            .create(NewTask {
                project: "proj-a".into(),
                title: "t".into(),
                routing: Routing::to_agent("coder-1"),
                ..NewTask::default()
            })
            .await
            .unwrap();

        // Dry-run override holds: the cycle plans but executes nothing.
        let summary = supervisor.scheduler().poll_once().await.unwrap();
        assert_eq!(summary.executed, 0);
        assert_eq!(
            supervisor.store().get(&task.id).await.unwrap().status,
            TaskStatus::Backlog
        );

        // A bad override is rejected up front.
        let mut config = Config::default();
        config.scheduler.poll_interval_secs = 0;
        assert!(
            Supervisor::start_with_config(dir.path(), config, None, Vec::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn promotion_enrolls_workflow_tasks_at_first_gate() {
        use crate::domain::models::{GateConfig, WorkflowConfig};

        let dir = tempfile::tempdir().unwrap();
        let manifest = ProjectManifest::new("proj-a").with_workflow(WorkflowConfig::new(
            "pipeline",
            vec![
                GateConfig::new("implement", "developer"),
                GateConfig::new("code_review", "reviewer").rejectable(),
            ],
        ));
        write_manifest(dir.path(), &manifest).await.unwrap();

        let supervisor = Supervisor::start(dir.path(), None, Vec::new())
            .await
            .unwrap();
        let task = supervisor
            .store()
            .create(NewTask {
                project: "proj-a".into(),
                title: "gated".into(),
                routing: Routing::to_agent("dev-1"),
                ..NewTask::default()
            })
            .await
            .unwrap();

        supervisor.scheduler().poll_once().await.unwrap();
        let task = supervisor.store().get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.gate.as_ref().unwrap().current, "implement");
    }

    #[tokio::test]
    async fn missing_manifest_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Supervisor::start(dir.path(), None, Vec::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let dir = seeded_dir().await;
        let supervisor = Supervisor::start(dir.path(), None, Vec::new())
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { supervisor.run(rx).await });
        tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
