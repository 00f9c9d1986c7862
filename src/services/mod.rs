//! Service layer: the orchestration engine proper.

pub mod action_executor;
pub mod dependency_graph;
pub mod failure_tracker;
pub mod gate_engine;
pub mod lease_manager;
pub mod protocol_router;
pub mod scheduler;
pub mod supervisor;
pub mod task_locks;

pub use action_executor::{classify_spawn_error, ActionExecutor, DispatchOutcome, ErrorClass};
pub use dependency_graph::DependencyGraph;
pub use failure_tracker::{DeadletterReason, FailureTracker};
pub use gate_engine::{GateEngine, GateRequest, GateTransition, NextStep};
pub use lease_manager::{AcquireOptions, LeaseManager, RenewOptions};
pub use protocol_router::ProtocolRouter;
pub use scheduler::{promotion_blocker, IdleReason, PlannedAction, PollSummary, Scheduler};
pub use supervisor::Supervisor;
pub use task_locks::TaskLocks;
