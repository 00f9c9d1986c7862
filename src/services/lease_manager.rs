//! Lease lifecycle: acquire, renew, release, expire.
//!
//! A lease is the only door into `in-progress`. Background renewal
//! tasks re-up active leases at half-TTL and stop when the task
//! leaves `in-progress`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    EventActor, EventRecord, EventType, Lease, Task, TaskId, TaskStatus,
};
use crate::infrastructure::events::EventLog;
use crate::infrastructure::store::{RunArtifacts, TaskStore};
use crate::services::dependency_graph::DependencyGraph;

/// Options for [`LeaseManager::acquire`].
#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    pub ttl: chrono::Duration,
    /// Initialize `runs/<id>/` with a fresh heartbeat.
    pub write_run_artifacts: bool,
}

/// Options for [`LeaseManager::renew`].
#[derive(Debug, Clone, Copy)]
pub struct RenewOptions {
    pub ttl: chrono::Duration,
    pub max_renewals: u32,
}

/// Manages exclusive per-task leases.
pub struct LeaseManager {
    store: Arc<TaskStore>,
    artifacts: RunArtifacts,
    event_log: Arc<EventLog>,
    heartbeat_ttl: chrono::Duration,
    // std Mutex so the synchronous after-transition hook can stop timers.
    renewal_timers: std::sync::Mutex<HashMap<TaskId, JoinHandle<()>>>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<TaskStore>,
        artifacts: RunArtifacts,
        event_log: Arc<EventLog>,
        heartbeat_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            artifacts,
            event_log,
            heartbeat_ttl,
            renewal_timers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Atomically claim a ready task for an agent and move it to
    /// `in-progress`.
    pub async fn acquire(
        &self,
        task_id: &TaskId,
        agent: &str,
        options: AcquireOptions,
    ) -> DomainResult<Task> {
        let now = Utc::now();
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))?;

        if task.status != TaskStatus::Ready {
            return Err(DomainError::InvalidTransition {
                task_id: task_id.clone(),
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }
        if let Some(lease) = &task.lease {
            if !lease.is_expired(now) {
                return Err(DomainError::AlreadyLeased {
                    task_id: task_id.clone(),
                    holder: lease.agent.clone(),
                });
            }
        }
        if let Some(resource) = &task.resource {
            // One in-progress task per resource, no exceptions.
            for other in self.store.snapshot().await {
                if other.id != task.id
                    && other.status == TaskStatus::InProgress
                    && other.resource.as_deref() == Some(resource)
                {
                    return Err(DomainError::AlreadyLeased {
                        task_id: other.id.clone(),
                        holder: other
                            .lease
                            .map_or_else(|| "unknown".to_string(), |l| l.agent),
                    });
                }
            }
        }

        let lease = Lease::new(agent, now, options.ttl);
        let updated = self
            .store
            .transition_with(task_id, TaskStatus::InProgress, {
                let lease = lease.clone();
                move |task| task.lease = Some(lease)
            })
            .await?;

        if options.write_run_artifacts {
            self.artifacts
                .init_for_task(task_id, agent, self.heartbeat_ttl)
                .await?;
        }

        info!(task_id = %task_id, agent, "lease acquired");
        self.event_log
            .log(
                EventRecord::new(EventType::LeaseAcquired, EventActor::agent(agent))
                    .with_task(task_id.clone())
                    .with_payload(serde_json::json!({
                        "agent": agent,
                        "expiresAt": lease.expires_at,
                    })),
            )
            .await;
        Ok(updated)
    }

    /// Extend a held lease. Capped at `max_renewals` to stop runaway
    /// agents from holding a task forever.
    pub async fn renew(
        &self,
        task_id: &TaskId,
        agent: &str,
        options: RenewOptions,
    ) -> DomainResult<Task> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))?;

        let Some(lease) = &task.lease else {
            return Err(DomainError::NotLeaseHolder {
                task_id: task_id.clone(),
                agent: agent.to_string(),
            });
        };
        if lease.agent != agent {
            return Err(DomainError::NotLeaseHolder {
                task_id: task_id.clone(),
                agent: agent.to_string(),
            });
        }
        if lease.renew_count >= options.max_renewals {
            return Err(DomainError::RenewalCapReached {
                task_id: task_id.clone(),
                renewals: lease.renew_count,
            });
        }

        let now = Utc::now();
        let updated = self
            .store
            .update(task_id, move |task| {
                if let Some(lease) = task.lease.as_mut() {
                    lease.expires_at = now + options.ttl;
                    lease.renew_count += 1;
                }
            })
            .await?;

        debug!(task_id = %task_id, agent, "lease renewed");
        self.event_log
            .log(
                EventRecord::new(EventType::LeaseRenewed, EventActor::agent(agent))
                    .with_task(task_id.clone())
                    .with_payload(serde_json::json!({
                        "renewCount": updated.lease.as_ref().map_or(0, |l| l.renew_count),
                    })),
            )
            .await;
        Ok(updated)
    }

    /// Give a lease back without finishing the task. The caller decides
    /// the follow-up transition.
    pub async fn release(&self, task_id: &TaskId, agent: &str) -> DomainResult<Task> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))?;
        match &task.lease {
            Some(lease) if lease.agent == agent => {}
            _ => {
                return Err(DomainError::NotLeaseHolder {
                    task_id: task_id.clone(),
                    agent: agent.to_string(),
                })
            }
        }

        self.stop_renewal(task_id);
        let updated = self.store.update(task_id, |task| task.lease = None).await?;
        self.event_log
            .log(
                EventRecord::new(EventType::LeaseReleased, EventActor::agent(agent))
                    .with_task(task_id.clone()),
            )
            .await;
        Ok(updated)
    }

    /// Expire every lapsed lease on in-progress and blocked tasks.
    ///
    /// In-progress tasks requeue to `ready`; blocked tasks requeue only
    /// when their dependencies and subtasks have since completed. Run
    /// artifacts are marked expired so stale results are not replayed.
    pub async fn expire_leases(&self, now: chrono::DateTime<Utc>) -> DomainResult<Vec<TaskId>> {
        let snapshot = self.store.snapshot().await;
        let by_id: HashMap<TaskId, &Task> =
            snapshot.iter().map(|t| (t.id.clone(), t)).collect();

        let mut expired = Vec::new();
        for task in &snapshot {
            if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Blocked) {
                continue;
            }
            let Some(lease) = &task.lease else { continue };
            if !lease.is_expired(now) {
                continue;
            }

            let holder = lease.agent.clone();
            self.stop_renewal(&task.id);
            self.artifacts.mark_expired(&task.id).await?;

            let requeue = match task.status {
                TaskStatus::InProgress => true,
                TaskStatus::Blocked => {
                    DependencyGraph::dependencies_met(task, &by_id)
                        && subtasks_done(task, &snapshot)
                }
                _ => unreachable!(),
            };

            if requeue {
                self.store
                    .transition_with(&task.id, TaskStatus::Ready, |task| task.lease = None)
                    .await?;
            } else {
                self.store
                    .update(&task.id, |task| task.lease = None)
                    .await?;
            }

            warn!(task_id = %task.id, agent = %holder, requeued = requeue, "lease expired");
            self.event_log
                .log(
                    EventRecord::new(EventType::LeaseExpired, EventActor::Scheduler)
                        .with_task(task.id.clone())
                        .with_payload(serde_json::json!({
                            "agent": holder,
                            "requeued": requeue,
                        })),
                )
                .await;
            expired.push(task.id.clone());
        }
        Ok(expired)
    }

    /// Forcibly end one task's lease, independent of its expiry time.
    /// Used by stale-heartbeat recovery when the agent has gone quiet
    /// but keeps renewing. In-progress tasks requeue to `ready`.
    pub async fn force_expire(&self, task_id: &TaskId, reason: &str) -> DomainResult<()> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))?;
        let Some(lease) = &task.lease else {
            return Ok(());
        };
        let holder = lease.agent.clone();

        self.stop_renewal(task_id);
        self.artifacts.mark_expired(task_id).await?;
        if task.status == TaskStatus::InProgress {
            self.store
                .transition_with(task_id, TaskStatus::Ready, |task| task.lease = None)
                .await?;
        } else {
            self.store
                .update(task_id, |task| task.lease = None)
                .await?;
        }

        warn!(task_id = %task_id, agent = %holder, reason, "lease force-expired");
        self.event_log
            .log(
                EventRecord::new(EventType::LeaseExpired, EventActor::Scheduler)
                    .with_task(task_id.clone())
                    .with_payload(serde_json::json!({
                        "agent": holder,
                        "reason": reason,
                        "requeued": task.status == TaskStatus::InProgress,
                    })),
            )
            .await;
        Ok(())
    }

    /// Start the background renewal task for an active lease. Re-ups at
    /// half-TTL and stops when renewal fails or the task leaves
    /// `in-progress`.
    pub fn start_renewal(
        self: &Arc<Self>,
        task_id: TaskId,
        agent: String,
        options: RenewOptions,
    ) {
        let manager = Arc::clone(self);
        let id = task_id.clone();
        // tokio intervals reject a zero period.
        let half_ttl = options
            .ttl
            .to_std()
            .map(|d| d / 2)
            .unwrap_or(std::time::Duration::from_secs(300))
            .max(std::time::Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(half_ttl);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                match manager.store.get(&id).await {
                    Some(task) if task.status == TaskStatus::InProgress => {}
                    _ => break,
                }
                if let Err(err) = manager.renew(&id, &agent, options).await {
                    debug!(task_id = %id, error = %err, "stopping lease renewal");
                    break;
                }
            }
        });

        let mut timers = self
            .renewal_timers
            .lock()
            .expect("renewal timer lock poisoned");
        if let Some(old) = timers.insert(task_id, handle) {
            old.abort();
        }
    }

    /// Stop the renewal timer for a task, if one is running. Safe to
    /// call from the synchronous after-transition hook.
    pub fn stop_renewal(&self, task_id: &TaskId) {
        let handle = self
            .renewal_timers
            .lock()
            .expect("renewal timer lock poisoned")
            .remove(task_id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Abort every renewal timer; used on shutdown.
    pub fn stop_all_renewals(&self) {
        let mut timers = self
            .renewal_timers
            .lock()
            .expect("renewal timer lock poisoned");
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

fn subtasks_done(task: &Task, snapshot: &[Task]) -> bool {
    snapshot
        .iter()
        .filter(|t| t.parent_id.as_ref() == Some(&task.id))
        .all(|t| t.status == TaskStatus::Done)
}
