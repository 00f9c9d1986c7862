//! Workflow and gate configuration.
//!
//! A workflow is an ordered list of review gates. Gates carry a role,
//! may be conditionally skipped, and may time out into escalation.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::task::Routing;

/// Parse a duration literal such as `30m`, `4h`, `90s`, or `1d`.
pub fn parse_duration(literal: &str) -> Option<chrono::Duration> {
    let literal = literal.trim();
    if literal.len() < 2 {
        return None;
    }
    let (digits, unit) = literal.split_at(literal.len() - 1);
    let value: i64 = digits.parse().ok()?;
    if value < 0 {
        return None;
    }
    match unit {
        "s" => Some(chrono::Duration::seconds(value)),
        "m" => Some(chrono::Duration::minutes(value)),
        "h" => Some(chrono::Duration::hours(value)),
        "d" => Some(chrono::Duration::days(value)),
        _ => None,
    }
}

/// A duration stored as a literal (`30m`) but compared as a duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationLit(pub chrono::Duration);

impl DurationLit {
    pub fn minutes(minutes: i64) -> Self {
        Self(chrono::Duration::minutes(minutes))
    }

    pub fn as_duration(&self) -> chrono::Duration {
        self.0
    }
}

impl fmt::Display for DurationLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.num_seconds();
        if secs % 86_400 == 0 && secs != 0 {
            write!(f, "{}d", secs / 86_400)
        } else if secs % 3_600 == 0 && secs != 0 {
            write!(f, "{}h", secs / 3_600)
        } else if secs % 60 == 0 && secs != 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl Serialize for DurationLit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DurationLit {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let literal = String::deserialize(deserializer)?;
        parse_duration(&literal)
            .map(DurationLit)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration literal: {literal}")))
    }
}

/// Condition deciding whether a gate applies to a task.
///
/// A gate with `tag` set is filtered out for tasks lacking that tag;
/// `notTag` inverts the check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateWhen {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_tag: Option<String>,
}

impl GateWhen {
    pub fn has_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            not_tag: None,
        }
    }

    pub fn lacks_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: None,
            not_tag: Some(tag.into()),
        }
    }

    pub fn is_satisfied_by(&self, routing: &Routing) -> bool {
        if let Some(tag) = &self.tag {
            if !routing.has_tag(tag) {
                return false;
            }
        }
        if let Some(tag) = &self.not_tag {
            if routing.has_tag(tag) {
                return false;
            }
        }
        true
    }
}

/// Where a rejection loops back to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectStrategy {
    /// The most recent prior gate held by a different role.
    #[default]
    OriginGate,
    /// The gate immediately before the rejecting one.
    PreviousGate,
    /// A named gate.
    Gate(String),
}

/// One stage of a review workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateConfig {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub can_reject: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<GateWhen>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationLit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_reject: Option<RejectStrategy>,
}

impl GateConfig {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            can_reject: false,
            when: None,
            timeout: None,
            escalate_to: None,
            on_reject: None,
        }
    }

    pub fn rejectable(mut self) -> Self {
        self.can_reject = true;
        self
    }

    pub fn with_when(mut self, when: GateWhen) -> Self {
        self.when = Some(when);
        self
    }

    pub fn with_timeout(mut self, timeout: DurationLit) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_escalation(mut self, role: impl Into<String>) -> Self {
        self.escalate_to = Some(role.into());
        self
    }

    /// Whether this gate applies to a task with the given routing.
    pub fn applies_to(&self, routing: &Routing) -> bool {
        self.when
            .as_ref()
            .is_none_or(|when| when.is_satisfied_by(routing))
    }
}

/// An ordered review pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    pub gates: Vec<GateConfig>,
}

impl WorkflowConfig {
    pub fn new(name: impl Into<String>, gates: Vec<GateConfig>) -> Self {
        Self {
            name: name.into(),
            gates,
        }
    }

    pub fn gate(&self, id: &str) -> Option<&GateConfig> {
        self.gates.iter().find(|g| g.id == id)
    }

    pub fn gate_index(&self, id: &str) -> Option<usize> {
        self.gates.iter().position(|g| g.id == id)
    }

    /// The first gate applicable to the given routing.
    pub fn first_applicable(&self, routing: &Routing) -> Option<&GateConfig> {
        self.gates.iter().find(|g| g.applies_to(routing))
    }
}
