//! Run artifact storage under `runs/<task-id>/`.
//!
//! `run_result.json` is written by the agent before exit;
//! `status.json` carries the heartbeat. Recovery reads both.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{HeartbeatRecord, RunResult, TaskId};

use super::atomic::write_atomic;

const RUN_RESULT_FILE: &str = "run_result.json";
const STATUS_FILE: &str = "status.json";

/// Accessor for the per-task run directories.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    runs_dir: PathBuf,
}

impl RunArtifacts {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: data_dir.into().join("runs"),
        }
    }

    pub fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.runs_dir.join(task_id.as_str())
    }

    /// Create the run directory and seed a fresh heartbeat.
    pub async fn init_for_task(
        &self,
        task_id: &TaskId,
        agent: &str,
        heartbeat_ttl: chrono::Duration,
    ) -> DomainResult<()> {
        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let now = Utc::now();
        self.write_heartbeat(
            task_id,
            &HeartbeatRecord {
                agent_id: agent.to_string(),
                updated_at: now,
                expires_at: now + heartbeat_ttl,
            },
        )
        .await
    }

    pub async fn write_run_result(&self, result: &RunResult) -> DomainResult<()> {
        let dir = self.task_dir(&result.task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_string_pretty(result)?;
        write_atomic(&dir.join(RUN_RESULT_FILE), &json).await?;
        Ok(())
    }

    pub async fn read_run_result(&self, task_id: &TaskId) -> DomainResult<Option<RunResult>> {
        let path = self.task_dir(task_id).join(RUN_RESULT_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let result = serde_json::from_str(&content).map_err(|err| {
                    DomainError::Storage(format!("{}: {err}", path.display()))
                })?;
                Ok(Some(result))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Mark the run result expired so recovery will not re-apply it.
    /// A missing result is fine; expiry often races agent exit.
    pub async fn mark_expired(&self, task_id: &TaskId) -> DomainResult<()> {
        if let Some(mut result) = self.read_run_result(task_id).await? {
            result.expired = true;
            self.write_run_result(&result).await?;
        }
        Ok(())
    }

    pub async fn write_heartbeat(
        &self,
        task_id: &TaskId,
        heartbeat: &HeartbeatRecord,
    ) -> DomainResult<()> {
        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_string_pretty(heartbeat)?;
        write_atomic(&dir.join(STATUS_FILE), &json).await?;
        Ok(())
    }

    pub async fn read_heartbeat(&self, task_id: &TaskId) -> DomainResult<Option<HeartbeatRecord>> {
        let path = self.task_dir(task_id).join(STATUS_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Last agent activity for a task: heartbeat update time, if any.
    pub async fn last_heartbeat_at(&self, task_id: &TaskId) -> Option<DateTime<Utc>> {
        self.read_heartbeat(task_id)
            .await
            .ok()
            .flatten()
            .map(|hb| hb.updated_at)
    }
}
