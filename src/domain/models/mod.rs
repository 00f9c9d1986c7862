//! Domain models.

pub mod config;
pub mod envelope;
pub mod event;
pub mod project;
pub mod run_result;
pub mod task;
pub mod workflow;

pub use config::{Config, ExecutorConfig, LeaseConfig, LoggingConfig, RetryConfig, SchedulerConfig};
pub use envelope::{Envelope, ProtocolMessage, PROTOCOL_NAME, PROTOCOL_VERSION};
pub use event::{EventActor, EventRecord, EventType};
pub use project::{ProjectManifest, SlaConfig};
pub use run_result::{HeartbeatRecord, RunOutcome, RunResult, TestStats};
pub use task::{
    meta_keys, GateHistoryEntry, GateOutcome, GatePosition, Lease, MetaValue, ReviewContext,
    Routing, RoutingTarget, Task, TaskId, TaskPriority, TaskStatus,
};
pub use workflow::{
    parse_duration, DurationLit, GateConfig, GateWhen, RejectStrategy, WorkflowConfig,
};
