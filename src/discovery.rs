use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// A directory under the repository's source root that a session can target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetArea {
    pub name: String,
    pub path: PathBuf,
}

pub struct TargetDiscovery {
    repo: PathBuf,
    source_dir: String,
}

impl TargetDiscovery {
    pub fn new(repo: impl AsRef<Path>, source_dir: impl Into<String>) -> Self {
        Self {
            repo: repo.as_ref().to_path_buf(),
            source_dir: source_dir.into(),
        }
    }

    /// Subdirectories of `<repo>/<source_dir>`, sorted by name. Hidden
    /// directories are skipped.
    pub async fn list(&self) -> Result<Vec<TargetArea>> {
        let root = self.repo.join(&self.source_dir);
        if !tokio::fs::try_exists(&root).await? {
            return Ok(Vec::new());
        }

        let mut targets = Vec::new();
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            targets.push(TargetArea {
                name,
                path: entry.path(),
            });
        }
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(targets)
    }

    /// Directory the agent works in: the target area, or the repository root
    /// when the session has none.
    pub fn working_directory(&self, target_area: Option<&str>) -> Result<PathBuf> {
        match target_area.filter(|t| !t.is_empty()) {
            None => Ok(self.repo.clone()),
            Some(target) => {
                let is_plain_name = Path::new(target)
                    .components()
                    .all(|c| matches!(c, std::path::Component::Normal(_)))
                    && !target.contains('/')
                    && !target.contains('\\');
                if !is_plain_name {
                    return Err(AppError::BadRequest(format!(
                        "Invalid target area '{}'",
                        target
                    )));
                }
                Ok(self.repo.join(&self.source_dir).join(target))
            }
        }
    }
}
