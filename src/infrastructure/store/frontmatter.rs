//! Task file codec: YAML front-matter plus markdown body.
//!
//! Files look like:
//!
//! ```text
//! ---
//! id: TASK-2026-03-01-001
//! status: ready
//! ...
//! ---
//! Implement the retry path.
//! ```
//!
//! The body is preserved verbatim; only the front-matter is
//! reserialized on rewrite. Keys this version does not model ride
//! along in `Task::extra`.

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::Task;

const DELIMITER: &str = "---";

/// Split a task file into raw front-matter and body.
pub fn split(content: &str) -> DomainResult<(&str, &str)> {
    let rest = content
        .strip_prefix(DELIMITER)
        .and_then(|r| r.strip_prefix('\n'))
        .ok_or_else(|| DomainError::Storage("task file missing front-matter open".into()))?;

    let close = rest
        .find("\n---")
        .ok_or_else(|| DomainError::Storage("task file missing front-matter close".into()))?;

    let front = &rest[..close];
    let after = &rest[close + 4..];
    // The close delimiter line may end with \n; the body starts after it.
    let body = after.strip_prefix('\n').unwrap_or(after);
    Ok((front, body))
}

/// Parse a full task file.
pub fn parse(content: &str) -> DomainResult<Task> {
    let (front, body) = split(content)?;
    let mut task: Task = serde_yaml::from_str(front)?;
    task.body = body.to_string();
    Ok(task)
}

/// Render a task back to file form.
pub fn render(task: &Task) -> DomainResult<String> {
    let front = serde_yaml::to_string(task)?;
    let mut out = String::with_capacity(front.len() + task.body.len() + 16);
    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(&front);
    if !front.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(&task.body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Routing, TaskId, TaskPriority, TaskStatus};

    fn sample() -> Task {
        Task::new(TaskId::new("TASK-2026-03-01-001"), "proj-a", "Add retry path")
            .with_body("Implement the retry path.\n\n## Work Log\n")
            .with_priority(TaskPriority::High)
            .with_routing(Routing::to_agent("rust-dev").with_tag("feature"))
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let task = sample();
        let text = render(&task).unwrap();
        let back = parse(&text).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.priority, TaskPriority::High);
        assert_eq!(back.routing.agent.as_deref(), Some("rust-dev"));
        assert_eq!(back.body, task.body);
        assert_eq!(back.status, TaskStatus::Backlog);
    }

    #[test]
    fn unknown_front_matter_keys_survive_rewrite() {
        let text = "---\nid: TASK-2026-03-01-002\nproject: proj-a\ntitle: t\nstatus: backlog\npriority: normal\ncreatedAt: 2026-03-01T00:00:00Z\nupdatedAt: 2026-03-01T00:00:00Z\nlastTransitionAt: 2026-03-01T00:00:00Z\ncustomAnnotation: keep-me\n---\nbody text\n";
        let task = parse(text).unwrap();
        assert!(task.extra.contains_key("customAnnotation"));
        let rendered = render(&task).unwrap();
        assert!(rendered.contains("customAnnotation: keep-me"));
        assert!(rendered.ends_with("body text\n"));
    }

    #[test]
    fn body_may_contain_bare_delimiters() {
        // Parsing stops at the first close delimiter, which belongs to
        // the front-matter; `---` lines inside the body are content.
        let mut task = sample();
        task.body = "line one\n\n---\n\nsection two\n".into();
        let text = render(&task).unwrap();
        let back = parse(&text).unwrap();
        assert_eq!(back.body, task.body);
    }

    #[test]
    fn missing_delimiters_rejected() {
        assert!(parse("no front matter").is_err());
        assert!(parse("---\nid: X\nno close").is_err());
    }
}
