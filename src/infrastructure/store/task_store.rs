//! Filesystem-backed task store.
//!
//! Single source of truth for task records. Tasks live under
//! `tasks/<status>/<id>.md`; a transition is an atomic write into the
//! target status directory followed by removal of the source file, so
//! exactly one directory holds each id. An in-memory index mirrors the
//! tree for snapshot-consistent reads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::meta_keys;
use crate::domain::models::{MetaValue, Routing, Task, TaskId, TaskPriority, TaskStatus};

use super::atomic::write_atomic;
use super::frontmatter;

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    /// Matches the lease holder or the routed agent.
    pub agent: Option<String>,
}

/// Fields accepted when creating a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub project: String,
    pub title: String,
    pub body: String,
    pub priority: TaskPriority,
    pub routing: Routing,
    pub depends_on: Vec<TaskId>,
    pub parent_id: Option<TaskId>,
    pub resource: Option<String>,
    pub metadata: Vec<(String, MetaValue)>,
    /// Recorded as the creating actor in the task body header.
    pub creator: Option<String>,
}

/// Hook invoked after a transition commits on disk, awaited before
/// `transition` returns so subscribers observe events in commit order.
/// Arguments: the task (already moved) and the previous status.
pub type TransitionHook =
    Arc<dyn Fn(Task, TaskStatus) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Hook invoked after a create commits on disk. Awaited before
/// `create` returns so `task.created` precedes every other event for
/// the id.
pub type CreateHook = Arc<dyn Fn(Task) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

struct IdState {
    date: String,
    next: u32,
}

/// The filesystem-backed store.
pub struct TaskStore {
    data_dir: PathBuf,
    tasks_dir: PathBuf,
    index: RwLock<HashMap<TaskId, Task>>,
    id_state: Mutex<IdState>,
    after_transition: std::sync::RwLock<Option<TransitionHook>>,
    on_create: std::sync::RwLock<Option<CreateHook>>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("data_dir", &self.data_dir)
            .field("tasks_dir", &self.tasks_dir)
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    /// Open (or initialize) the store under `data_dir`.
    ///
    /// Scans every status directory, loads all task files, and fails
    /// when the same id appears in more than one directory.
    pub async fn open(data_dir: impl Into<PathBuf>) -> DomainResult<Self> {
        let data_dir = data_dir.into();
        let tasks_dir = data_dir.join("tasks");
        for status in TaskStatus::ALL {
            tokio::fs::create_dir_all(tasks_dir.join(status.as_str())).await?;
        }

        let mut index: HashMap<TaskId, Task> = HashMap::new();
        for status in TaskStatus::ALL {
            let dir = tasks_dir.join(status.as_str());
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let content = tokio::fs::read_to_string(&path).await?;
                let mut task = frontmatter::parse(&content).map_err(|err| {
                    DomainError::Storage(format!("{}: {err}", path.display()))
                })?;
                if task.status != status {
                    // The directory move is the transition commit point,
                    // so the directory wins over a stale front-matter field.
                    warn!(
                        task_id = %task.id,
                        dir = status.as_str(),
                        front_matter = task.status.as_str(),
                        "status mismatch; trusting directory"
                    );
                    task.status = status;
                }
                if let Some(existing) = index.get(&task.id) {
                    return Err(DomainError::Storage(format!(
                        "duplicate task id {} in {} and {}",
                        task.id,
                        existing.status.as_str(),
                        status.as_str()
                    )));
                }
                index.insert(task.id.clone(), task);
            }
        }

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let next = next_sequence_for(&index, &today);
        debug!(tasks = index.len(), "task store loaded");

        Ok(Self {
            data_dir,
            tasks_dir,
            index: RwLock::new(index),
            id_state: Mutex::new(IdState { date: today, next }),
            after_transition: std::sync::RwLock::new(None),
            on_create: std::sync::RwLock::new(None),
        })
    }

    /// Register the hook run after every committed transition.
    pub fn set_after_transition(&self, hook: TransitionHook) {
        *self
            .after_transition
            .write()
            .expect("after_transition lock poisoned") = Some(hook);
    }

    /// Register the hook run after every committed create.
    pub fn set_on_create(&self, hook: CreateHook) {
        *self.on_create.write().expect("on_create lock poisoned") = Some(hook);
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the task file in its current status directory.
    pub fn task_path(&self, task: &Task) -> PathBuf {
        self.tasks_dir
            .join(task.status.as_str())
            .join(format!("{}.md", task.id))
    }

    /// Directory for per-task input artifacts (handoffs).
    pub fn task_inputs_dir(&self, task: &Task) -> PathBuf {
        self.tasks_dir
            .join(task.status.as_str())
            .join(task.id.as_str())
            .join("inputs")
    }

    // ---- reads ---------------------------------------------------------

    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        self.index.read().await.get(id).cloned()
    }

    /// Resolve a unique id prefix, like short git hashes. Returns
    /// `None` when no task matches or the prefix is ambiguous.
    pub async fn get_by_prefix(&self, prefix: &str) -> Option<Task> {
        let index = self.index.read().await;
        let mut found: Option<&Task> = None;
        for (id, task) in index.iter() {
            if id.as_str().starts_with(prefix) {
                if found.is_some() {
                    return None;
                }
                found = Some(task);
            }
        }
        found.cloned()
    }

    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let index = self.index.read().await;
        let mut tasks: Vec<Task> = index
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                filter.agent.as_deref().is_none_or(|agent| {
                    t.lease.as_ref().is_some_and(|l| l.agent == agent)
                        || t.routing.agent.as_deref() == Some(agent)
                })
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// All tasks, unsorted. Snapshot-consistent with the last mutation.
    pub async fn snapshot(&self) -> Vec<Task> {
        self.index.read().await.values().cloned().collect()
    }

    pub async fn subtasks(&self, parent: &TaskId) -> Vec<Task> {
        let index = self.index.read().await;
        index
            .values()
            .filter(|t| t.parent_id.as_ref() == Some(parent))
            .cloned()
            .collect()
    }

    pub async fn count_by_status(&self) -> HashMap<TaskStatus, usize> {
        let index = self.index.read().await;
        let mut counts = HashMap::new();
        for task in index.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    // ---- mutations -----------------------------------------------------

    /// Create a task in `backlog`.
    pub async fn create(&self, new: NewTask) -> DomainResult<Task> {
        if !new.routing.is_valid() {
            return Err(DomainError::InvalidRouting(format!(
                "at most one of agent/role/team may be set, got {}",
                new.routing.target_count()
            )));
        }

        let id = self.allocate_id().await;

        {
            let index = self.index.read().await;
            for dep in &new.depends_on {
                if !index.contains_key(dep) {
                    return Err(DomainError::UnknownDependency {
                        task_id: id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        let mut task = Task::new(id, new.project, new.title)
            .with_body(new.body)
            .with_priority(new.priority)
            .with_routing(new.routing);
        for dep in new.depends_on {
            task = task.with_dependency(dep);
        }
        if let Some(parent) = new.parent_id {
            task = task.with_parent(parent);
        }
        if let Some(resource) = new.resource {
            task = task.with_resource(resource);
        }
        for (key, value) in new.metadata {
            task.metadata.insert(key, value);
        }
        if let Some(creator) = new.creator {
            task.set_meta("createdBy", creator);
        }

        self.persist(&task).await?;
        self.index.write().await.insert(task.id.clone(), task.clone());

        let hook = self
            .on_create
            .read()
            .expect("on_create lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(task.clone()).await;
        }
        Ok(task)
    }

    /// Apply a mutation to a task without changing its status.
    pub async fn update<F>(&self, id: &TaskId, mutate: F) -> DomainResult<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut index = self.index.write().await;
        let task = index
            .get(id)
            .ok_or_else(|| DomainError::TaskNotFound(id.clone()))?;
        let mut updated = task.clone();
        mutate(&mut updated);
        debug_assert_eq!(
            updated.status, task.status,
            "update must not change status; use transition"
        );
        updated.status = task.status;
        updated.updated_at = Utc::now();
        self.persist(&updated).await?;
        index.insert(id.clone(), updated.clone());
        Ok(updated)
    }

    /// Replace the markdown body, leaving the front-matter untouched.
    pub async fn update_body(&self, id: &TaskId, body: impl Into<String>) -> DomainResult<Task> {
        let body = body.into();
        self.update(id, |task| task.body = body).await
    }

    /// Append a dated entry to the body's `## Work Log` section,
    /// creating the section when absent.
    pub async fn append_work_log(&self, id: &TaskId, entry: &str) -> DomainResult<Task> {
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%SZ");
        let line = format!("- {stamp}: {entry}\n");
        self.update(id, move |task| {
            if !task.body.contains("## Work Log") {
                if !task.body.is_empty() && !task.body.ends_with('\n') {
                    task.body.push('\n');
                }
                task.body.push_str("\n## Work Log\n");
            }
            task.body.push_str(&line);
        })
        .await
    }

    /// Move a task along an allowed edge, atomically relocating its
    /// file. `from == to` is an idempotent no-op. The registered
    /// after-transition hook fires once the move is durable.
    pub async fn transition(&self, id: &TaskId, to: TaskStatus) -> DomainResult<Task> {
        self.transition_with(id, to, |_| {}).await
    }

    /// Transition with an extra mutation folded into the same write.
    pub async fn transition_with<F>(
        &self,
        id: &TaskId,
        to: TaskStatus,
        mutate: F,
    ) -> DomainResult<Task>
    where
        F: FnOnce(&mut Task),
    {
        let (task, from) = {
            let mut index = self.index.write().await;
            let task = index
                .get(id)
                .ok_or_else(|| DomainError::TaskNotFound(id.clone()))?;
            let from = task.status;

            if from == to {
                let mut updated = task.clone();
                mutate(&mut updated);
                updated.status = from;
                updated.updated_at = Utc::now();
                self.persist(&updated).await?;
                index.insert(id.clone(), updated.clone());
                return Ok(updated);
            }

            if !from.can_transition_to(to) {
                return Err(DomainError::InvalidTransition {
                    task_id: id.clone(),
                    from,
                    to,
                });
            }

            let old_path = self.task_path(task);
            let mut updated = task.clone();
            mutate(&mut updated);
            let now = Utc::now();
            updated.status = to;
            updated.updated_at = now;
            updated.last_transition_at = now;

            // Write the new location first; a crash between the two
            // steps leaves a duplicate that startup detects, never a
            // missing task.
            self.persist(&updated).await?;
            tokio::fs::remove_file(&old_path).await?;
            index.insert(id.clone(), updated.clone());
            (updated, from)
        };

        let hook = self
            .after_transition
            .read()
            .expect("after_transition lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(task.clone(), from).await;
        }
        Ok(task)
    }

    pub async fn add_dep(&self, id: &TaskId, dep: &TaskId) -> DomainResult<Task> {
        if !self.index.read().await.contains_key(dep) {
            return Err(DomainError::UnknownDependency {
                task_id: id.clone(),
                dep: dep.clone(),
            });
        }
        let dep = dep.clone();
        self.update(id, move |task| {
            if dep != task.id && !task.depends_on.contains(&dep) {
                task.depends_on.push(dep);
            }
        })
        .await
    }

    pub async fn remove_dep(&self, id: &TaskId, dep: &TaskId) -> DomainResult<Task> {
        let dep = dep.clone();
        self.update(id, move |task| {
            task.depends_on.retain(|d| d != &dep);
        })
        .await
    }

    /// Park a task in `blocked`, recording the reason.
    pub async fn block(&self, id: &TaskId, reason: impl Into<String>) -> DomainResult<Task> {
        let reason = reason.into();
        self.transition_with(id, TaskStatus::Blocked, move |task| {
            task.set_meta(meta_keys::BLOCK_REASON, reason);
            task.set_meta(meta_keys::LAST_BLOCKED_AT, Utc::now().to_rfc3339());
        })
        .await
    }

    /// Return a blocked task to `ready`, clearing the block reason.
    pub async fn unblock(&self, id: &TaskId) -> DomainResult<Task> {
        self.transition_with(id, TaskStatus::Ready, |task| {
            task.metadata.remove(meta_keys::BLOCK_REASON);
        })
        .await
    }

    /// Cancel an undispatched task. Leased or terminal tasks cannot be
    /// canceled here.
    pub async fn cancel(&self, id: &TaskId) -> DomainResult<Task> {
        {
            let index = self.index.read().await;
            let task = index
                .get(id)
                .ok_or_else(|| DomainError::TaskNotFound(id.clone()))?;
            if let Some(lease) = &task.lease {
                return Err(DomainError::AlreadyLeased {
                    task_id: id.clone(),
                    holder: lease.agent.clone(),
                });
            }
            if !matches!(task.status, TaskStatus::Backlog | TaskStatus::Ready) {
                return Err(DomainError::InvalidTransition {
                    task_id: id.clone(),
                    from: task.status,
                    to: TaskStatus::Blocked,
                });
            }
        }
        self.transition_with(id, TaskStatus::Blocked, |task| {
            task.set_meta(meta_keys::BLOCK_REASON, "canceled");
            task.set_meta(meta_keys::LAST_BLOCKED_AT, Utc::now().to_rfc3339());
        })
        .await
    }

    // ---- internals -----------------------------------------------------

    async fn persist(&self, task: &Task) -> DomainResult<()> {
        let path = self.task_path(task);
        let content = frontmatter::render(task)?;
        write_atomic(&path, &content).await?;
        Ok(())
    }

    async fn allocate_id(&self) -> TaskId {
        let mut state = self.id_state.lock().await;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if state.date != today {
            state.date.clone_from(&today);
            state.next = next_sequence_for(&*self.index.read().await, &today);
        }
        let id = TaskId::new(format!("TASK-{}-{:03}", today, state.next));
        state.next += 1;
        id
    }
}

fn next_sequence_for(index: &HashMap<TaskId, Task>, date: &str) -> u32 {
    let prefix = format!("TASK-{date}-");
    index
        .keys()
        .filter_map(|id| id.as_str().strip_prefix(&prefix))
        .filter_map(|seq| seq.parse::<u32>().ok())
        .max()
        .map_or(1, |max| max + 1)
}
