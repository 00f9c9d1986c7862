//! Project manifest loaded from `project.yaml` at the data-dir root.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::task::TaskPriority;
use super::workflow::{DurationLit, WorkflowConfig};

/// Per-project SLA limits for in-progress tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaConfig {
    /// Limit applied when no per-priority entry matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DurationLit>,
    /// Overrides keyed by priority name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_priority: BTreeMap<String, DurationLit>,
}

impl SlaConfig {
    /// The SLA limit for a task of the given priority, if any.
    pub fn limit_for(&self, priority: TaskPriority) -> Option<chrono::Duration> {
        self.per_priority
            .get(priority.as_str())
            .or(self.default.as_ref())
            .map(DurationLit::as_duration)
    }
}

/// The `project.yaml` manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<SlaConfig>,
}

impl ProjectManifest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workflow: None,
            sla: None,
        }
    }

    pub fn with_workflow(mut self, workflow: WorkflowConfig) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn sla_limit_for(&self, priority: TaskPriority) -> Option<chrono::Duration> {
        self.sla.as_ref().and_then(|sla| sla.limit_for(priority))
    }
}
