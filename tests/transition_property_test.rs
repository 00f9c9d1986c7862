//! Property tests for the task state machine.
//!
//! Any sequence of transition calls must be a walk in the allowed
//! graph: legal edges commit, illegal edges change nothing, and at
//! every point the task file exists in exactly one status directory.

use proptest::prelude::*;

use foreman::domain::models::{Routing, TaskStatus};
use foreman::infrastructure::store::{NewTask, TaskStore};

fn new_task() -> NewTask {
    NewTask {
        project: "proj-a".into(),
        title: "walker".into(),
        routing: Routing::to_agent("coder-1"),
        ..NewTask::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn transition_sequences_walk_the_allowed_graph(
        steps in proptest::collection::vec(0usize..TaskStatus::ALL.len(), 1..24)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = TaskStore::open(dir.path()).await.unwrap();
            let task = store.create(new_task()).await.unwrap();
            let mut expected = TaskStatus::Backlog;

            for step in steps {
                let target = TaskStatus::ALL[step];
                let result = store.transition(&task.id, target).await;
                if expected == target || expected.can_transition_to(target) {
                    assert!(result.is_ok(), "{expected} -> {target} should be legal");
                    expected = target;
                } else {
                    assert!(result.is_err(), "{expected} -> {target} should be rejected");
                }

                // Disallowed calls left the state untouched.
                let current = store.get(&task.id).await.unwrap().status;
                assert_eq!(current, expected);
                assert!(TaskStatus::ALL.contains(&current));

                // Exactly one directory entry for the id.
                let mut homes = 0;
                for status in TaskStatus::ALL {
                    let path = dir
                        .path()
                        .join("tasks")
                        .join(status.as_str())
                        .join(format!("{}.md", task.id));
                    if path.exists() {
                        homes += 1;
                    }
                }
                assert_eq!(homes, 1, "task must live in exactly one status dir");
            }

            // A reload sees exactly the committed state.
            drop(store);
            let store = TaskStore::open(dir.path()).await.unwrap();
            assert_eq!(store.get(&task.id).await.unwrap().status, expected);
        });
    }

    #[test]
    fn interleaved_walks_keep_ids_disjoint(
        steps in proptest::collection::vec((0usize..3, 0usize..TaskStatus::ALL.len()), 1..30)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = TaskStore::open(dir.path()).await.unwrap();
            let mut tasks = Vec::new();
            for _ in 0..3 {
                tasks.push(store.create(new_task()).await.unwrap());
            }

            for (which, step) in steps {
                let target = TaskStatus::ALL[step];
                // Ignore the verdict; only the invariants matter here.
                let _ = store.transition(&tasks[which].id, target).await;
            }

            let snapshot = store.snapshot().await;
            assert_eq!(snapshot.len(), 3);
            for task in &snapshot {
                assert!(TaskStatus::ALL.contains(&task.status));
            }

            // Reload succeeds, proving no id is duplicated on disk.
            drop(store);
            let store = TaskStore::open(dir.path()).await.unwrap();
            assert_eq!(store.snapshot().await.len(), 3);
        });
    }
}
