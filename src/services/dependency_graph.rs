//! Dependency-graph analysis over `depends_on` edges.
//!
//! Tasks reference each other by id only; the graph is rebuilt from a
//! snapshot each poll cycle and cycles are found with DFS.

use std::collections::{HashMap, HashSet};

use crate::domain::models::{Task, TaskId};

// Standalone helper for cycle detection (no self needed)
fn detect_cycle_util(
    node: &TaskId,
    graph: &HashMap<TaskId, Vec<TaskId>>,
    visited: &mut HashSet<TaskId>,
    rec_stack: &mut HashSet<TaskId>,
    path: &mut Vec<TaskId>,
) -> bool {
    visited.insert(node.clone());
    rec_stack.insert(node.clone());
    path.push(node.clone());

    if let Some(neighbors) = graph.get(node) {
        for neighbor in neighbors {
            if !visited.contains(neighbor) {
                if detect_cycle_util(neighbor, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(neighbor) {
                // Cycle detected
                if let Some(cycle_start) = path.iter().position(|id| id == neighbor) {
                    path.drain(0..cycle_start);
                    return true;
                }
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

/// Analyzes `depends_on` edges across a task snapshot.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph;

impl DependencyGraph {
    pub fn new() -> Self {
        Self
    }

    /// Find one dependency cycle, if any, returning the ids on it.
    pub fn detect_cycle(&self, tasks: &[Task]) -> Option<Vec<TaskId>> {
        let mut graph: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in tasks {
            graph
                .entry(task.id.clone())
                .or_default()
                .extend(task.depends_on.iter().cloned());
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        let mut roots: Vec<&TaskId> = graph.keys().collect();
        roots.sort();
        for task_id in roots {
            if !visited.contains(task_id)
                && detect_cycle_util(task_id, &graph, &mut visited, &mut rec_stack, &mut path)
            {
                return Some(path);
            }
        }

        None
    }

    /// The set of task ids that sit on any dependency cycle. These are
    /// unpromotable until an edge is removed.
    pub fn tasks_on_cycles(&self, tasks: &[Task]) -> HashSet<TaskId> {
        let mut cyclic = HashSet::new();
        let mut remaining: Vec<Task> = tasks.to_vec();
        // Peel one cycle at a time; each pass removes the cycle members
        // so disjoint cycles are all reported.
        while let Some(cycle) = self.detect_cycle(&remaining) {
            for id in &cycle {
                cyclic.insert(id.clone());
            }
            remaining.retain(|t| !cyclic.contains(&t.id));
        }
        cyclic
    }

    /// Whether every dependency of `task` is known and `done`.
    pub fn dependencies_met(task: &Task, by_id: &HashMap<TaskId, &Task>) -> bool {
        task.depends_on.iter().all(|dep| {
            by_id
                .get(dep)
                .is_some_and(|t| t.status == crate::domain::models::TaskStatus::Done)
        })
    }
}
