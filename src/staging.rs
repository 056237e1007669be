//! Upload staging: saving archives, guarded extraction and a census of what
//! was extracted.

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    config::StagingConfig,
    error::{AppError, Result},
    logs::{LogBroadcaster, LogLevel},
};

const PROGRESS_EVERY: usize = 10;

/// File-type counts of an unpacked archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileCensus {
    pub total_files: usize,
    pub typescript_files: usize,
    pub javascript_files: usize,
    pub style_files: usize,
    pub json_files: usize,
    pub html_files: usize,
    pub total_size: u64,
}

impl FileCensus {
    fn record(&mut self, path: &Path, size: u64) {
        self.total_files += 1;
        self.total_size += size;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "ts" | "tsx" => self.typescript_files += 1,
            "js" | "jsx" => self.javascript_files += 1,
            "css" | "scss" => self.style_files += 1,
            "json" => self.json_files += 1,
            "html" => self.html_files += 1,
            _ => {}
        }
    }
}

#[derive(Clone)]
pub struct FileStaging {
    temp_root: PathBuf,
    max_upload_bytes: usize,
    logs: LogBroadcaster,
}

impl FileStaging {
    pub fn new(config: &StagingConfig, logs: LogBroadcaster) -> Self {
        Self {
            temp_root: config.temp_directory.clone(),
            max_upload_bytes: config.upload_max_size_mb * 1024 * 1024,
            logs,
        }
    }

    fn uploads_dir(&self, session_id: &str) -> PathBuf {
        self.temp_root.join("uploads").join(session_id)
    }

    fn unpacked_dir(&self, session_id: &str) -> PathBuf {
        self.temp_root.join("unpacked").join(session_id)
    }

    /// Store an uploaded archive under `<temp>/uploads/<session>/<sanitized name>`.
    pub async fn save_upload(
        &self,
        session_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        if bytes.len() > self.max_upload_bytes {
            return Err(AppError::BadRequest(format!(
                "Upload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.max_upload_bytes
            )));
        }

        let dir = self.uploads_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(sanitize_file_name(file_name));
        tokio::fs::write(&path, bytes).await?;

        self.logs.send(
            session_id,
            LogLevel::File,
            format!("Saved upload {} ({} bytes)", path.display(), bytes.len()),
        );
        Ok(path)
    }

    /// Extract `archive` into `<temp>/unpacked/<session>`, replacing any
    /// previous extraction. Nothing is written if any entry would land
    /// outside the destination.
    pub async fn unpack(&self, session_id: &str, archive: &Path) -> Result<PathBuf> {
        let destination = self.unpacked_dir(session_id);
        let archive = archive.to_path_buf();
        let logs = self.logs.clone();
        let session = session_id.to_string();

        let target = destination.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract_archive(&archive, &target, |count| {
                logs.send(&session, LogLevel::File, format!("Extracted {} files", count));
            })
        })
        .await
        .map_err(|e| anyhow::anyhow!("Extraction task failed: {}", e))??;

        info!(session_id = %session_id, files = extracted, "Unpacked archive");
        self.logs.send(
            session_id,
            LogLevel::File,
            format!("Unpacked {} files to {}", extracted, destination.display()),
        );
        Ok(destination)
    }

    pub async fn analyze(&self, session_id: &str, directory: &Path) -> Result<FileCensus> {
        self.logs.info(session_id, "Analyzing unpacked files...");
        let directory = directory.to_path_buf();
        let census = tokio::task::spawn_blocking(move || census(&directory))
            .await
            .map_err(|e| anyhow::anyhow!("Analysis task failed: {}", e))??;

        self.logs.info(
            session_id,
            format!(
                "Analysis: {} files, {} TS/TSX, {} JS/JSX, {} CSS, {} JSON, {} HTML, {:.2} MB total",
                census.total_files,
                census.typescript_files,
                census.javascript_files,
                census.style_files,
                census.json_files,
                census.html_files,
                census.total_size as f64 / 1024.0 / 1024.0
            ),
        );
        Ok(census)
    }

    /// Remove upload and extraction directories untouched for longer than `max_age`.
    pub async fn cleanup_old_sessions(&self, max_age: Duration) -> Result<usize> {
        let root = self.temp_root.clone();
        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for area in ["uploads", "unpacked"] {
                removed += remove_stale_dirs(&root.join(area), max_age)?;
            }
            Ok::<_, io::Error>(removed)
        })
        .await
        .map_err(|e| anyhow::anyhow!("Cleanup task failed: {}", e))??;

        if removed > 0 {
            info!("Removed {} stale staging directories", removed);
        }
        Ok(removed)
    }
}

/// Replace everything outside `[a-zA-Z0-9.-]` with `_`
pub fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.zip");
    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.trim_matches('.').is_empty() {
        "upload.zip".to_string()
    } else {
        sanitized
    }
}

/// Lexically resolve an archive entry name under `root`.
///
/// Returns `None` for absolute names and for names that climb above `root`.
pub fn entry_destination(root: &Path, name: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(root.join(relative))
}

fn invalid_archive(e: zip::result::ZipError) -> AppError {
    AppError::BadRequest(format!("Invalid archive: {}", e))
}

fn extract_archive<F>(archive: &Path, destination: &Path, mut progress: F) -> Result<usize>
where
    F: FnMut(usize),
{
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(invalid_archive)?;

    // Validate every entry before touching the destination
    let mut plan = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index(index).map_err(invalid_archive)?;
        let name = entry.name().to_string();
        let target = entry_destination(destination, &name).ok_or_else(|| {
            AppError::BadRequest(format!(
                "Archive entry '{}' resolves outside the extraction directory",
                name
            ))
        })?;
        plan.push((index, target, entry.is_dir()));
    }

    if destination.exists() {
        fs::remove_dir_all(destination)?;
    }
    fs::create_dir_all(destination)?;

    let mut extracted = 0;
    for (index, target, is_dir) in plan {
        if is_dir {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut entry = zip.by_index(index).map_err(invalid_archive)?;
        let mut out = fs::File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        extracted += 1;
        debug!("Extracted {}", target.display());
        if extracted % PROGRESS_EVERY == 0 {
            progress(extracted);
        }
    }
    Ok(extracted)
}

fn census(directory: &Path) -> Result<FileCensus> {
    let mut census = FileCensus::default();
    for entry in WalkDir::new(directory) {
        let entry = entry.map_err(|e| anyhow::anyhow!("Failed to walk {}: {}", directory.display(), e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        census.record(entry.path(), size);
    }
    Ok(census)
}

fn remove_stale_dirs(area: &Path, max_age: Duration) -> io::Result<usize> {
    if !area.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in fs::read_dir(area)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let age = entry
            .metadata()?
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age >= max_age) {
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
        }
    }
    Ok(removed)
}
