//! Protocol envelopes exchanged with running agents.
//!
//! Agents talk to the core through typed envelopes; the router
//! validates, authorizes, and applies them under per-task locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::run_result::{RunOutcome, TestStats};
use super::task::{Routing, TaskId, TaskStatus};

/// Protocol name carried in every envelope.
pub const PROTOCOL_NAME: &str = "foreman/agent";
/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Typed message body, tagged by `type` with the body under `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum ProtocolMessage {
    /// An agent finished (or gave up on) its leased task.
    #[serde(rename = "completion.report")]
    CompletionReport {
        outcome: RunOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        deliverables: Vec<String>,
        #[serde(default)]
        tests: TestStats,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        blockers: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejection_notes: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    /// Mid-run progress note, optionally with a status change.
    #[serde(rename = "status.update")]
    StatusUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<TaskStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Request to delegate a subtask to another agent.
    #[serde(rename = "handoff.request")]
    HandoffRequest {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        routing: Option<Routing>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Assignee acknowledges a handoff.
    #[serde(rename = "handoff.accepted")]
    HandoffAccepted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Assignee declines a handoff.
    #[serde(rename = "handoff.rejected")]
    HandoffRejected { reason: String },
}

impl ProtocolMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CompletionReport { .. } => "completion.report",
            Self::StatusUpdate { .. } => "status.update",
            Self::HandoffRequest { .. } => "handoff.request",
            Self::HandoffAccepted { .. } => "handoff.accepted",
            Self::HandoffRejected { .. } => "handoff.rejected",
        }
    }
}

/// Transport envelope around a protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub protocol: String,
    pub version: u32,
    pub project_id: String,
    pub task_id: TaskId,
    pub from_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(flatten)]
    pub message: ProtocolMessage,
}

impl Envelope {
    pub fn new(
        project_id: impl Into<String>,
        task_id: TaskId,
        from_agent: impl Into<String>,
        message: ProtocolMessage,
    ) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
            project_id: project_id.into(),
            task_id,
            from_agent: from_agent.into(),
            to_agent: None,
            sent_at: Utc::now(),
            message,
        }
    }

    pub fn to_agent(mut self, agent: impl Into<String>) -> Self {
        self.to_agent = Some(agent.into());
        self
    }
}
