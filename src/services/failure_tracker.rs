//! Dispatch-failure tracking and deadletter transitions.
//!
//! Counts failed dispatch attempts per task and retires tasks that
//! are past saving. Deadletter is terminal; only administrator
//! tooling digs tasks back out.

use std::sync::Arc;

use tracing::warn;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::meta_keys;
use crate::domain::models::{
    EventActor, EventRecord, EventType, MetaValue, Task, TaskId, TaskStatus,
};
use crate::infrastructure::events::EventLog;
use crate::infrastructure::store::TaskStore;

/// Why a task was deadlettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadletterReason {
    /// `dispatchFailures` reached the configured threshold.
    MaxDispatchFailures,
    /// The executor reported a non-retryable error.
    PermanentError,
}

impl DeadletterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxDispatchFailures => "max_dispatch_failures",
            Self::PermanentError => "permanent_error",
        }
    }
}

/// Tracks dispatch failures and retires hopeless tasks.
pub struct FailureTracker {
    store: Arc<TaskStore>,
    event_log: Arc<EventLog>,
    max_dispatch_failures: u32,
}

impl FailureTracker {
    pub fn new(store: Arc<TaskStore>, event_log: Arc<EventLog>, max_dispatch_failures: u32) -> Self {
        Self {
            store,
            event_log,
            max_dispatch_failures,
        }
    }

    /// Record one failed dispatch attempt.
    pub async fn track_dispatch_failure(
        &self,
        task_id: &TaskId,
        reason: &str,
    ) -> DomainResult<Task> {
        let reason = reason.to_string();
        self.store
            .update(task_id, move |task| {
                let failures = task.dispatch_failures() + 1;
                task.set_meta(meta_keys::DISPATCH_FAILURES, failures);
                task.set_meta(meta_keys::LAST_DISPATCH_FAILURE_REASON, reason.clone());
                // Keep the whole failure trail for the deadletter payload.
                let history = match task.metadata.remove("failureHistory") {
                    Some(MetaValue::List(mut list)) => {
                        list.push(MetaValue::String(reason));
                        list
                    }
                    _ => vec![MetaValue::String(reason)],
                };
                task.metadata
                    .insert("failureHistory".to_string(), MetaValue::List(history));
            })
            .await
    }

    /// Whether the task has burned through its dispatch budget.
    pub fn should_deadletter(&self, task: &Task) -> bool {
        task.dispatch_failures() >= self.max_dispatch_failures
    }

    /// Move a task into `tasks/deadletter/` and emit the retirement
    /// event. Missing metadata falls back to safe defaults.
    pub async fn transition_to_deadletter(
        &self,
        task_id: &TaskId,
        reason: DeadletterReason,
        last_failure: &str,
    ) -> DomainResult<Task> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))?;

        let failure_count = task.dispatch_failures();
        let retry_count = task.retry_count();
        let error_class = task
            .error_class()
            .unwrap_or("unknown")
            .to_string();
        let agent = task
            .authorized_agent()
            .unwrap_or("unassigned")
            .to_string();
        let failure_history: Vec<String> = match task.metadata.get("failureHistory") {
            Some(MetaValue::List(list)) => list
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };

        let retired = self
            .store
            .transition_with(task_id, TaskStatus::Deadletter, |task| {
                task.lease = None;
            })
            .await?;

        warn!(
            task_id = %task_id,
            reason = reason.as_str(),
            failure_count,
            "task deadlettered"
        );
        self.event_log
            .log(
                EventRecord::new(EventType::TaskDeadlettered, EventActor::Scheduler)
                    .with_task(task_id.clone())
                    .with_payload(serde_json::json!({
                        "reason": reason.as_str(),
                        "failureCount": failure_count,
                        "retryCount": retry_count,
                        "lastFailureReason": last_failure,
                        "errorClass": error_class,
                        "agent": agent,
                        "failureHistory": failure_history,
                    })),
            )
            .await;
        Ok(retired)
    }
}
