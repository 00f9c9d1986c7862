//! Ports: the seams where the core meets the outside world.
//!
//! The agent-spawning executor and the notification adapter live
//! behind these traits; the core never knows their concrete types.

use async_trait::async_trait;

use crate::domain::models::{EventRecord, TaskId, TaskPriority};

/// Everything the executor needs to spawn an agent for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnContext {
    pub task_id: TaskId,
    /// Path of the task file at dispatch time.
    pub task_path: std::path::PathBuf,
    /// Resolved agent identifier.
    pub agent: String,
    /// Routing target kind the agent was resolved from (agent/role/team).
    pub routing_kind: String,
    pub priority: TaskPriority,
    /// Current gate id for workflow tasks.
    pub gate_context: Option<String>,
    pub project_id: String,
    pub correlation_id: String,
}

/// Per-call spawn options.
#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    pub timeout_ms: u64,
}

/// Executor reply. `platform_limit` signals capacity backpressure that
/// lowers the effective concurrency cap rather than counting as a
/// dispatch failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnResponse {
    pub success: bool,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub platform_limit: bool,
}

impl SpawnResponse {
    pub fn ok(session_id: impl Into<String>) -> Self {
        Self {
            success: true,
            session_id: Some(session_id.into()),
            error: None,
            platform_limit: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
            platform_limit: false,
        }
    }

    pub fn at_platform_limit() -> Self {
        Self {
            success: false,
            session_id: None,
            error: None,
            platform_limit: true,
        }
    }
}

/// The external agent-spawning interface. Opaque to the core.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn spawn(&self, context: &SpawnContext, options: SpawnOptions) -> SpawnResponse;
}

/// Synchronous event consumer registered at logger construction.
/// Called for every record before `log` returns; implementations must
/// not block for long and must not panic.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &EventRecord);
}
