//! Working directories for uploads and conversion artifacts.
//!
//! Both roots come from [`StorageConfig`] and are injected at construction. Every conversion is
//! given its own `<root>/<job_id>/` directory under each root so concurrent requests that share a
//! base name never touch the same files.

use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::StorageConfig,
    types::{JobId, validate_segment},
};

/// Directory under the output root where edited models are saved.
pub const MODIFIED_DIR: &str = "modified";

#[derive(Debug, Clone)]
pub struct Storage {
    uploads_dir: PathBuf,
    output_dir: PathBuf,
    public_files_url: String,
}

impl Storage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            uploads_dir: config.uploads_dir.clone(),
            output_dir: config.output_dir.clone(),
            public_files_url: config.public_files_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Create both roots. Idempotent.
    pub async fn ensure_dirs(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.uploads_dir).await?;
        tokio::fs::create_dir_all(&self.output_dir).await
    }

    /// Persist an uploaded file as `<uploads>/<job_id>/<file_name>`.
    ///
    /// `file_name` must already be a sanitized single path segment.
    pub async fn stage_upload(&self, job_id: JobId, file_name: &str, bytes: &[u8]) -> io::Result<StagedUpload> {
        validate_segment(file_name).map_err(|reason| io::Error::new(io::ErrorKind::InvalidInput, reason))?;

        let dir = self.uploads_dir.join(job_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(file_name);
        // Guard is armed before the write so a partial file is still cleaned up
        let staged = StagedUpload {
            dir,
            path,
            removed: false,
        };
        tokio::fs::write(&staged.path, bytes).await?;

        debug!(path = %staged.path.display(), size = bytes.len(), "Stored upload");
        Ok(staged)
    }

    /// Create and return `<output>/<job_id>/`.
    pub async fn create_output_dir(&self, job_id: JobId) -> io::Result<PathBuf> {
        let dir = self.output_dir.join(job_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Public URL of a file inside a job's output directory.
    pub fn output_url(&self, job_id: JobId, file_name: &str) -> String {
        format!("{}/{}/{}", self.public_files_url, job_id, file_name)
    }

    /// Save an edited model as `<output>/modified/modified_<uuid>.glb`, returning its public URL.
    pub async fn save_edited_model(&self, bytes: &[u8]) -> io::Result<String> {
        let dir = self.output_dir.join(MODIFIED_DIR);
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = format!("modified_{}.glb", Uuid::new_v4());
        tokio::fs::write(dir.join(&file_name), bytes).await?;

        Ok(format!("{}/{}/{}", self.public_files_url, MODIFIED_DIR, file_name))
    }
}

/// Resolve a `/`-separated relative path under `root`, rejecting anything that could escape it.
///
/// This is a purely lexical check; callers serving files must still canonicalize to catch
/// symlinks.
pub fn resolve_relative(root: &Path, relative: &str) -> Result<PathBuf, &'static str> {
    let mut resolved = root.to_path_buf();
    for segment in relative.split('/') {
        validate_segment(segment)?;
        resolved.push(segment);
    }
    Ok(resolved)
}

/// An uploaded source file that is deleted once the conversion is done with it.
///
/// [`StagedUpload::remove`] deletes it asynchronously; a guard that is dropped without having been
/// removed (early return, cancelled request) falls back to a synchronous delete. Repeated removal
/// is a no-op.
#[derive(Debug)]
pub struct StagedUpload {
    dir: PathBuf,
    path: PathBuf,
    removed: bool,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort delete of the file and its job directory. Never fails.
    pub async fn remove(&mut self) {
        self.removed = true;
        self.log_file_removal(tokio::fs::remove_file(&self.path).await);
        // Only succeeds once the directory is empty
        self.log_dir_removal(tokio::fs::remove_dir(&self.dir).await);
    }

    fn log_file_removal(&self, result: io::Result<()>) {
        match result {
            Ok(()) => debug!(path = %self.path.display(), "Removed upload"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove upload"),
        }
    }

    fn log_dir_removal(&self, result: io::Result<()>) {
        if let Err(e) = result
            && e.kind() != io::ErrorKind::NotFound
        {
            debug!(dir = %self.dir.display(), error = %e, "Left upload directory in place");
        }
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.log_file_removal(std::fs::remove_file(&self.path));
        self.log_dir_removal(std::fs::remove_dir(&self.dir));
    }
}
