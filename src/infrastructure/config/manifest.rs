//! Project manifest loading (`project.yaml` at the data-dir root).

use std::path::Path;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ProjectManifest;

/// Load `project.yaml`. The manifest is required: the scheduler
/// refuses to run against a directory that does not declare a project.
pub async fn load_manifest(data_dir: &Path) -> DomainResult<ProjectManifest> {
    let path = data_dir.join("project.yaml");
    let content = tokio::fs::read_to_string(&path).await.map_err(|err| {
        DomainError::Storage(format!("cannot read {}: {err}", path.display()))
    })?;
    let manifest: ProjectManifest = serde_yaml::from_str(&content)
        .map_err(|err| DomainError::Storage(format!("{}: {err}", path.display())))?;
    if manifest.id.trim().is_empty() {
        return Err(DomainError::Storage(format!(
            "{}: project id must not be empty",
            path.display()
        )));
    }
    Ok(manifest)
}

/// Write a manifest, used by tests and first-run setup.
pub async fn write_manifest(data_dir: &Path, manifest: &ProjectManifest) -> DomainResult<()> {
    let yaml = serde_yaml::to_string(manifest)?;
    tokio::fs::write(data_dir.join("project.yaml"), yaml).await?;
    Ok(())
}
