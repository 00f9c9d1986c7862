//! Task domain model.
//!
//! Tasks are durable units of work dispatched to coding agents. They
//! form a DAG via `depends_on`, may nest one level via `parent_id`,
//! and walk a fixed status lifecycle enforced by the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable task identifier (`TASK-YYYY-MM-DD-NNN`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Created but prerequisites not yet cleared
    Backlog,
    /// Eligible for dispatch
    Ready,
    /// Leased to an agent and running
    InProgress,
    /// Waiting on dependencies, subtasks, or manual unblock
    Blocked,
    /// Completed work awaiting a review gate
    Review,
    /// Terminal success
    Done,
    /// Terminal failure, retired by the failure tracker
    Deadletter,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Backlog
    }
}

impl TaskStatus {
    /// All statuses, in directory-scan order.
    pub const ALL: [TaskStatus; 7] = [
        Self::Backlog,
        Self::Ready,
        Self::InProgress,
        Self::Blocked,
        Self::Review,
        Self::Done,
        Self::Deadletter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Review => "review",
            Self::Done => "done",
            Self::Deadletter => "deadletter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "backlog" => Some(Self::Backlog),
            "ready" => Some(Self::Ready),
            "in-progress" | "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "review" => Some(Self::Review),
            "done" => Some(Self::Done),
            "deadletter" => Some(Self::Deadletter),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Deadletter)
    }

    /// Valid transitions from this status.
    ///
    /// Deadletter appears for every non-terminal status, but only the
    /// failure tracker issues that edge.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Backlog => &[Self::Ready, Self::Blocked, Self::Deadletter],
            Self::Ready => &[Self::InProgress, Self::Blocked, Self::Deadletter],
            // Ready is reachable again on lease expiry.
            Self::InProgress => &[Self::Review, Self::Blocked, Self::Ready, Self::Deadletter],
            Self::Review => &[Self::Done, Self::InProgress, Self::Deadletter],
            Self::Blocked => &[Self::Ready, Self::Deadletter],
            Self::Done => &[],
            Self::Deadletter => &[],
        }
    }

    pub fn can_transition_to(&self, to: Self) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority level for dispatch ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Routing target for a task. At most one of `agent`, `role`, `team`
/// may be set; `tags` qualify gate conditions and dispatch filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A concrete routing destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingTarget {
    Agent(String),
    Role(String),
    Team(String),
}

impl Routing {
    pub fn to_agent(agent: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.into()),
            ..Self::default()
        }
    }

    pub fn to_role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            ..Self::default()
        }
    }

    pub fn to_team(team: impl Into<String>) -> Self {
        Self {
            team: Some(team.into()),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Number of routing fields set. Valid routings have at most one.
    pub fn target_count(&self) -> usize {
        [
            self.agent.is_some(),
            self.role.is_some(),
            self.team.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    pub fn is_valid(&self) -> bool {
        self.target_count() <= 1
    }

    /// The concrete destination, if exactly one is set.
    pub fn target(&self) -> Option<RoutingTarget> {
        if let Some(agent) = &self.agent {
            Some(RoutingTarget::Agent(agent.clone()))
        } else if let Some(role) = &self.role {
            Some(RoutingTarget::Role(role.clone()))
        } else {
            self.team.clone().map(RoutingTarget::Team)
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A time-bounded exclusive claim by one agent on one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub agent: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub renew_count: u32,
}

impl Lease {
    pub fn new(agent: impl Into<String>, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            agent: agent.into(),
            acquired_at: now,
            expires_at: now + ttl,
            renew_count: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Structural validity: non-empty holder and a forward-running window.
    pub fn is_well_formed(&self) -> bool {
        !self.agent.is_empty() && self.expires_at > self.acquired_at
    }
}

/// Position of a workflow task inside its gate pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatePosition {
    pub current: String,
    pub entered: DateTime<Utc>,
}

/// Outcome recorded when a task leaves a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Complete,
    NeedsReview,
    Blocked,
}

impl GateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::NeedsReview => "needs_review",
            Self::Blocked => "blocked",
        }
    }
}

/// One audited stop in the gate pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateHistoryEntry {
    pub gate: String,
    pub role: String,
    pub entered: DateTime<Utc>,
    pub exited: DateTime<Utc>,
    pub outcome: GateOutcome,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_notes: Option<String>,
    /// Time spent in the gate, milliseconds.
    pub duration_ms: i64,
}

/// Rejection payload carried back to an earlier gate so the re-worker
/// knows what to fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewContext {
    pub from_gate: String,
    pub agent: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub rejected_at: DateTime<Utc>,
}

/// A free-form metadata value. Untagged so YAML/JSON scalars, lists,
/// and maps round-trip without a wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<MetaValue>),
    Map(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for MetaValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<u32> for MetaValue {
    fn from(n: u32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Well-known metadata keys.
pub mod meta_keys {
    pub const DISPATCH_FAILURES: &str = "dispatchFailures";
    pub const RETRY_COUNT: &str = "retryCount";
    pub const ERROR_CLASS: &str = "errorClass";
    pub const LAST_ERROR: &str = "lastError";
    pub const LAST_BLOCKED_AT: &str = "lastBlockedAt";
    pub const LAST_DISPATCH_FAILURE_REASON: &str = "lastDispatchFailureReason";
    pub const BLOCK_REASON: &str = "blockReason";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const SESSION_ID: &str = "sessionId";
    pub const DELEGATION_DEPTH: &str = "delegationDepth";
    pub const REVIEW_REQUIRED: &str = "reviewRequired";
}

/// A durable unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub project: String,
    pub title: String,
    /// Markdown body. Stored below the front-matter, never inside it.
    #[serde(skip)]
    pub body: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GatePosition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_history: Vec<GateHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_context: Option<ReviewContext>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetaValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    /// Front-matter keys this version does not model. Preserved verbatim
    /// across rewrites.
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Task {
    /// Create a new backlog task.
    pub fn new(id: TaskId, project: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            project: project.into(),
            title: title.into(),
            body: String::new(),
            status: TaskStatus::default(),
            priority: TaskPriority::default(),
            routing: Routing::default(),
            depends_on: Vec::new(),
            parent_id: None,
            resource: None,
            lease: None,
            gate: None,
            gate_history: Vec::new(),
            review_context: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            last_transition_at: now,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_dependency(mut self, dep: TaskId) -> Self {
        if dep != self.id && !self.depends_on.contains(&dep) {
            self.depends_on.push(dep);
        }
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// The agent authorized to mutate this task: the lease holder,
    /// falling back to the routed agent.
    pub fn authorized_agent(&self) -> Option<&str> {
        self.lease
            .as_ref()
            .map(|l| l.agent.as_str())
            .or(self.routing.agent.as_deref())
    }

    /// Whether the lease is present and unexpired.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    // ---- typed metadata accessors --------------------------------------

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(MetaValue::as_str)
    }

    pub fn meta_u32(&self, key: &str) -> Option<u32> {
        self.metadata
            .get(key)
            .and_then(MetaValue::as_i64)
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(MetaValue::as_bool)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn dispatch_failures(&self) -> u32 {
        self.meta_u32(meta_keys::DISPATCH_FAILURES).unwrap_or(0)
    }

    pub fn retry_count(&self) -> u32 {
        self.meta_u32(meta_keys::RETRY_COUNT).unwrap_or(0)
    }

    pub fn error_class(&self) -> Option<&str> {
        self.meta_str(meta_keys::ERROR_CLASS)
    }

    pub fn block_reason(&self) -> Option<&str> {
        self.meta_str(meta_keys::BLOCK_REASON)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.meta_str(meta_keys::CORRELATION_ID)
    }

    pub fn delegation_depth(&self) -> u32 {
        self.meta_u32(meta_keys::DELEGATION_DEPTH).unwrap_or(0)
    }

    pub fn review_required(&self) -> bool {
        self.meta_bool(meta_keys::REVIEW_REQUIRED).unwrap_or(false)
    }

    pub fn last_blocked_at(&self) -> Option<DateTime<Utc>> {
        self.meta_str(meta_keys::LAST_BLOCKED_AT)
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
    }
}
