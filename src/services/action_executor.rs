//! Action executor: turns planned `assign` actions into running agents.
//!
//! Acquires the lease, calls the external spawn interface, and folds
//! the reply back into task state: session on success, cap pressure on
//! platform limits, classified failure otherwise.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::task::meta_keys;
use crate::domain::models::{EventActor, EventRecord, EventType, TaskId, TaskStatus};
use crate::domain::ports::{AgentExecutor, SpawnContext, SpawnOptions};
use crate::infrastructure::events::EventLog;
use crate::infrastructure::store::TaskStore;
use crate::services::failure_tracker::{DeadletterReason, FailureTracker};
use crate::services::lease_manager::{AcquireOptions, LeaseManager, RenewOptions};

/// Classification of a spawn error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a delay.
    Transient,
    /// Retry cannot help; the task goes straight to deadletter.
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Classify an executor error message.
///
/// Unknown errors default to transient so a flaky executor does not
/// burn tasks.
pub fn classify_spawn_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    const PERMANENT_MARKERS: [&str; 6] = [
        "not found",
        "unknown agent",
        "invalid",
        "unauthorized",
        "unsupported",
        "template",
    ];
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Transient
    }
}

/// What happened to one assign action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Agent running; renewal timer started.
    Dispatched { session_id: String },
    /// Executor is at capacity; the task went back to `ready` and the
    /// scheduler should lower its effective cap.
    PlatformLimited,
    /// Spawn failed with a retryable error; task is `blocked`.
    FailedTransient,
    /// Spawn failed permanently; task is deadlettered.
    FailedPermanent,
}

/// Settings for one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub lease_ttl: chrono::Duration,
    pub max_renewals: u32,
    pub spawn_timeout_ms: u64,
}

/// Executes assign actions against the external executor.
pub struct ActionExecutor {
    project_id: String,
    store: Arc<TaskStore>,
    lease_manager: Arc<LeaseManager>,
    failure_tracker: Arc<FailureTracker>,
    event_log: Arc<EventLog>,
    executor: Arc<dyn AgentExecutor>,
}

impl ActionExecutor {
    pub fn new(
        project_id: impl Into<String>,
        store: Arc<TaskStore>,
        lease_manager: Arc<LeaseManager>,
        failure_tracker: Arc<FailureTracker>,
        event_log: Arc<EventLog>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            store,
            lease_manager,
            failure_tracker,
            event_log,
            executor,
        }
    }

    /// Dispatch one ready task to `agent`.
    pub async fn dispatch(
        &self,
        task_id: &TaskId,
        agent: &str,
        routing_kind: &str,
        settings: DispatchSettings,
    ) -> DomainResult<DispatchOutcome> {
        let task = self
            .lease_manager
            .acquire(
                task_id,
                agent,
                AcquireOptions {
                    ttl: settings.lease_ttl,
                    write_run_artifacts: true,
                },
            )
            .await?;

        // Correlation id stitches scheduler decisions, the executor
        // call, and agent events together for this one dispatch.
        let correlation_id = Uuid::new_v4().to_string();
        let task = self
            .store
            .update(task_id, {
                let correlation_id = correlation_id.clone();
                move |task| task.set_meta(meta_keys::CORRELATION_ID, correlation_id)
            })
            .await?;

        let context = SpawnContext {
            task_id: task_id.clone(),
            task_path: self.store.task_path(&task),
            agent: agent.to_string(),
            routing_kind: routing_kind.to_string(),
            priority: task.priority,
            gate_context: task.gate.as_ref().map(|g| g.current.clone()),
            project_id: self.project_id.clone(),
            correlation_id: correlation_id.clone(),
        };
        let options = SpawnOptions {
            timeout_ms: settings.spawn_timeout_ms,
        };

        // Bound the call even when the executor ignores its timeout option.
        let outer = std::time::Duration::from_millis(settings.spawn_timeout_ms.saturating_add(1000));
        let response = match tokio::time::timeout(outer, self.executor.spawn(&context, options)).await
        {
            Ok(response) => response,
            Err(_) => crate::domain::ports::SpawnResponse::failed("spawn timed out"),
        };

        if response.success {
            let session_id = response
                .session_id
                .unwrap_or_else(|| correlation_id.clone());
            self.store
                .update(task_id, {
                    let session_id = session_id.clone();
                    move |task| task.set_meta(meta_keys::SESSION_ID, session_id)
                })
                .await?;
            self.lease_manager.start_renewal(
                task_id.clone(),
                agent.to_string(),
                RenewOptions {
                    ttl: settings.lease_ttl,
                    max_renewals: settings.max_renewals,
                },
            );
            info!(task_id = %task_id, agent, session_id = %session_id, "dispatch matched");
            self.event_log
                .log(
                    EventRecord::new(EventType::DispatchMatched, EventActor::Scheduler)
                        .with_task(task_id.clone())
                        .with_payload(serde_json::json!({
                            "agent": agent,
                            "sessionId": session_id,
                            "correlationId": correlation_id,
                        })),
                )
                .await;
            return Ok(DispatchOutcome::Dispatched { session_id });
        }

        if response.platform_limit {
            // Capacity pressure, not a task failure: hand the lease
            // back and let the next cycle run with a lower cap.
            warn!(task_id = %task_id, "executor at platform limit, releasing lease");
            self.lease_manager.release(task_id, agent).await?;
            self.store.transition(task_id, TaskStatus::Ready).await?;
            self.event_log
                .log(
                    EventRecord::new(EventType::DispatchError, EventActor::Scheduler)
                        .with_task(task_id.clone())
                        .with_payload(serde_json::json!({
                            "reason": "platform_limit",
                            "correlationId": correlation_id,
                        })),
                )
                .await;
            return Ok(DispatchOutcome::PlatformLimited);
        }

        let message = response
            .error
            .unwrap_or_else(|| "unknown spawn error".to_string());
        let class = classify_spawn_error(&message);
        error!(task_id = %task_id, error = %message, class = class.as_str(), "spawn failed");

        let tracked = self
            .failure_tracker
            .track_dispatch_failure(task_id, &message)
            .await?;
        self.store
            .update(task_id, {
                let message = message.clone();
                move |task| {
                    task.set_meta(meta_keys::RETRY_COUNT, tracked.retry_count() + 1);
                    task.set_meta(meta_keys::LAST_ERROR, message);
                    task.set_meta(meta_keys::ERROR_CLASS, class.as_str());
                }
            })
            .await?;
        self.event_log
            .log(
                EventRecord::new(EventType::DispatchError, EventActor::Scheduler)
                    .with_task(task_id.clone())
                    .with_payload(serde_json::json!({
                        "reason": message,
                        "errorClass": class.as_str(),
                        "correlationId": correlation_id,
                    })),
            )
            .await;

        match class {
            ErrorClass::Permanent => {
                self.failure_tracker
                    .transition_to_deadletter(task_id, DeadletterReason::PermanentError, &message)
                    .await?;
                Ok(DispatchOutcome::FailedPermanent)
            }
            ErrorClass::Transient => {
                let refreshed = self.store.get(task_id).await.ok_or_else(|| {
                    crate::domain::errors::DomainError::TaskNotFound(task_id.clone())
                })?;
                if self.failure_tracker.should_deadletter(&refreshed) {
                    self.failure_tracker
                        .transition_to_deadletter(
                            task_id,
                            DeadletterReason::MaxDispatchFailures,
                            &message,
                        )
                        .await?;
                    return Ok(DispatchOutcome::FailedPermanent);
                }
                self.store
                    .transition_with(task_id, TaskStatus::Blocked, move |task| {
                        task.lease = None;
                        task.set_meta(
                            meta_keys::BLOCK_REASON,
                            format!("spawn_failed: {message}"),
                        );
                        task.set_meta(
                            meta_keys::LAST_BLOCKED_AT,
                            chrono::Utc::now().to_rfc3339(),
                        );
                    })
                    .await?;
                Ok(DispatchOutcome::FailedTransient)
            }
        }
    }
}
