//! Append-only NDJSON event log.
//!
//! One file per UTC day under `events/`. Every record is appended and
//! then fanned out synchronously to the subscribers registered at
//! construction. Logging is best-effort: an append or subscriber
//! failure is traced, never propagated.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::errors::DomainResult;
use crate::domain::models::{EventRecord, EventType, TaskId};
use crate::domain::ports::EventSubscriber;

/// The append-only journal.
pub struct EventLog {
    events_dir: PathBuf,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    io_lock: Mutex<()>,
}

impl EventLog {
    /// Open the log under `data_dir`. Subscribers are fixed for the
    /// lifetime of the log and called on every record.
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
    ) -> DomainResult<Self> {
        let events_dir = data_dir.into().join("events");
        tokio::fs::create_dir_all(&events_dir).await?;
        Ok(Self {
            events_dir,
            subscribers,
            io_lock: Mutex::new(()),
        })
    }

    /// Append a record and notify every subscriber before returning.
    ///
    /// Failures are contained: the scheduler must keep running even
    /// when the journal is unwritable.
    pub async fn log(&self, record: EventRecord) {
        if let Err(err) = self.append(&record).await {
            warn!(
                event_type = record.event_type.as_str(),
                error = %err,
                "failed to append event record"
            );
        }
        for subscriber in &self.subscribers {
            subscriber.on_event(&record);
        }
    }

    async fn append(&self, record: &EventRecord) -> DomainResult<()> {
        let line = serde_json::to_string(record)?;
        let file_name = format!(
            "events-{}.ndjson",
            record.timestamp.format("%Y-%m-%d")
        );
        let path = self.events_dir.join(file_name);

        let _guard = self.io_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every record, oldest file first, in append order.
    /// Unparseable lines are skipped with a warning.
    pub async fn read_all(&self) -> DomainResult<Vec<EventRecord>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.events_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("events-") && name.ends_with(".ndjson") {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut records = Vec::new();
        for path in files {
            let content = tokio::fs::read_to_string(&path).await?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<EventRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(err) => warn!(file = %path.display(), error = %err, "skipping bad event line"),
                }
            }
        }
        Ok(records)
    }

    pub async fn events_for_task(&self, task_id: &TaskId) -> DomainResult<Vec<EventRecord>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.task_id.as_ref() == Some(task_id))
            .collect())
    }

    pub async fn events_of_type(&self, event_type: EventType) -> DomainResult<Vec<EventRecord>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.event_type == event_type)
            .collect())
    }
}
