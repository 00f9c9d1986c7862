//! Event records emitted for every state change.
//!
//! Events are append-only facts. The log writes them as
//! newline-delimited JSON; subscribers consume them synchronously.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskId;

/// The closed set of event types the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.transitioned")]
    TaskTransitioned,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.blocked")]
    TaskBlocked,
    #[serde(rename = "task.deadlettered")]
    TaskDeadlettered,
    #[serde(rename = "lease.acquired")]
    LeaseAcquired,
    #[serde(rename = "lease.renewed")]
    LeaseRenewed,
    #[serde(rename = "lease.released")]
    LeaseReleased,
    #[serde(rename = "lease.expired")]
    LeaseExpired,
    #[serde(rename = "scheduler.poll")]
    SchedulerPoll,
    #[serde(rename = "scheduler.alert")]
    SchedulerAlert,
    #[serde(rename = "gate_transition")]
    GateTransition,
    #[serde(rename = "gate_timeout")]
    GateTimeout,
    #[serde(rename = "sla.violation")]
    SlaViolation,
    #[serde(rename = "dispatch.matched")]
    DispatchMatched,
    #[serde(rename = "dispatch.error")]
    DispatchError,
    #[serde(rename = "delegation.requested")]
    DelegationRequested,
    #[serde(rename = "delegation.accepted")]
    DelegationAccepted,
    #[serde(rename = "delegation.rejected")]
    DelegationRejected,
    #[serde(rename = "protocol.message.received")]
    ProtocolMessageReceived,
    #[serde(rename = "protocol.message.rejected")]
    ProtocolMessageRejected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task.created",
            Self::TaskTransitioned => "task.transitioned",
            Self::TaskCompleted => "task.completed",
            Self::TaskBlocked => "task.blocked",
            Self::TaskDeadlettered => "task.deadlettered",
            Self::LeaseAcquired => "lease.acquired",
            Self::LeaseRenewed => "lease.renewed",
            Self::LeaseReleased => "lease.released",
            Self::LeaseExpired => "lease.expired",
            Self::SchedulerPoll => "scheduler.poll",
            Self::SchedulerAlert => "scheduler.alert",
            Self::GateTransition => "gate_transition",
            Self::GateTimeout => "gate_timeout",
            Self::SlaViolation => "sla.violation",
            Self::DispatchMatched => "dispatch.matched",
            Self::DispatchError => "dispatch.error",
            Self::DelegationRequested => "delegation.requested",
            Self::DelegationAccepted => "delegation.accepted",
            Self::DelegationRejected => "delegation.rejected",
            Self::ProtocolMessageReceived => "protocol.message.received",
            Self::ProtocolMessageRejected => "protocol.message.rejected",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventActor {
    /// Core machinery outside the poll loop.
    System,
    /// The scheduler poll loop.
    Scheduler,
    /// A specific agent, by id.
    Agent { id: String },
    /// A human invoking tooling.
    User { identifier: String },
}

impl EventActor {
    pub fn agent(id: impl Into<String>) -> Self {
        Self::Agent { id: id.into() }
    }
}

/// A single event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub actor: EventActor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl EventRecord {
    pub fn new(event_type: EventType, actor: EventActor) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            actor,
            task_id: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
