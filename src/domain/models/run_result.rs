//! Run-result artifacts and heartbeat records.
//!
//! An agent writes `runs/<task-id>/run_result.json` before it exits;
//! recovery consumes it when a lease lapses without a protocol
//! message. `runs/<task-id>/status.json` carries the heartbeat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// Terminal outcome an agent reports for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    Blocked,
    NeedsReview,
    Partial,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::NeedsReview => "needs_review",
            Self::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "done" => Some(Self::Done),
            "blocked" => Some(Self::Blocked),
            "needs_review" => Some(Self::NeedsReview),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

/// Test counters reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStats {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

/// On-disk record an agent writes before exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub task_id: TaskId,
    pub agent_id: String,
    pub completed_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub tests: TestStats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Set by lease expiry so recovery will not re-apply a stale result.
    #[serde(default)]
    pub expired: bool,
}

impl RunResult {
    pub fn new(task_id: TaskId, agent_id: impl Into<String>, outcome: RunOutcome) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            completed_at: Utc::now(),
            outcome,
            summary_ref: None,
            deliverables: Vec::new(),
            tests: TestStats::default(),
            blockers: Vec::new(),
            notes: None,
            expired: false,
        }
    }
}

/// Heartbeat metadata written alongside the run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub agent_id: String,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl HeartbeatRecord {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
