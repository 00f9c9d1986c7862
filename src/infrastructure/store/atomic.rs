//! Atomic file writes.
//!
//! Every store mutation writes to a temp file in the target directory
//! and renames it into place, so a concurrent reader never observes a
//! partially written file.

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Write `contents` to `path` atomically.
///
/// The temp file lives in the same directory as the destination so the
/// rename stays within one filesystem.
pub async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, contents).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(err)
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_name = format!(".{}.tmp-{}", file_name, Uuid::new_v4().simple());
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}
