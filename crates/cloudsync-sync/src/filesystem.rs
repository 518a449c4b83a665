//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`IFileSystem`] over a sync root using `tokio::fs`.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: content goes to a hidden temp file in the target
//!   directory, then is renamed over the target, so a crash never leaves a
//!   partial file behind.
//! - **SHA-256**: content hashes are lowercase hex SHA-256, computed in
//!   chunks so large files are never held in memory.
//! - **Free space**: `statvfs(3)` on the sync root, run on the blocking pool.

use std::ffi::CString;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use cloudsync_core::domain::{ContentHash, SyncError, SyncPath};
use cloudsync_core::ports::{FileAttributes, IFileSystem};

/// Suffix of in-progress writes; never listed
const TEMP_SUFFIX: &str = ".cloudsync-tmp";

const HASH_BUFFER: usize = 64 * 1024;

// ============================================================================
// LocalFileSystem
// ============================================================================

/// Adapter mapping [`SyncPath`]s onto a directory on disk
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of `path` under the sync root
    pub fn resolve(&self, path: &SyncPath) -> PathBuf {
        if path.is_root() {
            return self.root.clone();
        }
        self.root.join(path.as_str().trim_start_matches('/'))
    }

    fn temp_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{name}{TEMP_SUFFIX}"))
    }
}

fn io_error(path: &SyncPath, err: &std::io::Error) -> SyncError {
    SyncError::from_io(path.as_str(), err)
}

fn modified_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .ok()
        .and_then(|st| st.duration_since(std::time::UNIX_EPOCH).ok())
        .and_then(|dur| DateTime::from_timestamp(dur.as_secs() as i64, dur.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

/// Free bytes for unprivileged users on the filesystem holding `path`
fn available_space(path: &Path) -> std::io::Result<u64> {
    // statvfs needs an existing path; fall back to the nearest ancestor
    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));
    let c_path = CString::new(existing.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out pointer
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

// ============================================================================
// IFileSystem implementation
// ============================================================================

#[async_trait::async_trait]
impl IFileSystem for LocalFileSystem {
    #[instrument(skip(self), fields(path = %path))]
    async fn read_file(&self, path: &SyncPath) -> Result<Vec<u8>, SyncError> {
        let data = tokio::fs::read(self.resolve(path))
            .await
            .map_err(|e| io_error(path, &e))?;
        debug!(bytes = data.len(), "file read complete");
        Ok(data)
    }

    #[instrument(skip(self, data), fields(path = %path, bytes = data.len()))]
    async fn write_file(&self, path: &SyncPath, data: &[u8]) -> Result<(), SyncError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, &e))?;
        }

        let tmp = Self::temp_path(&target);
        if let Err(e) = tokio::fs::write(&tmp, data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(path, &e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(path, &e));
        }
        debug!("write complete");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete_item(&self, path: &SyncPath) -> Result<(), SyncError> {
        if path.is_root() {
            return Err(SyncError::PermissionDenied(
                "refusing to delete the sync root".to_string(),
            ));
        }
        let target = self.resolve(path);
        let metadata = match tokio::fs::symlink_metadata(&target).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(path, &e)),
        };

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        match result {
            Ok(()) => {
                debug!(directory = metadata.is_dir(), "delete complete");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, &e)),
        }
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn create_directory(&self, path: &SyncPath) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(self.resolve(path))
            .await
            .map_err(|e| io_error(path, &e))
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn move_item(&self, from: &SyncPath, to: &SyncPath) -> Result<(), SyncError> {
        let target = self.resolve(to);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(to, &e))?;
        }
        tokio::fs::rename(self.resolve(from), &target)
            .await
            .map_err(|e| io_error(from, &e))
    }

    async fn get_file_attributes(
        &self,
        path: &SyncPath,
    ) -> Result<Option<FileAttributes>, SyncError> {
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(metadata) => Ok(Some(FileAttributes {
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified_at: modified_at(&metadata),
                is_directory: metadata.is_dir(),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, &e)),
        }
    }

    async fn list_directory(&self, path: &SyncPath) -> Result<Vec<SyncPath>, SyncError> {
        let mut dir = match tokio::fs::read_dir(self.resolve(path)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(path, &e)),
        };

        let mut children = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(path, &e))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!(name = ?entry.file_name(), "Skipping non UTF-8 name");
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            match path.join(name) {
                Ok(child) => children.push(child),
                Err(e) => debug!(name, error = %e, "Skipping unrepresentable name"),
            }
        }
        children.sort();
        Ok(children)
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn compute_hash(&self, path: &SyncPath) -> Result<ContentHash, SyncError> {
        let mut file = tokio::fs::File::open(self.resolve(path))
            .await
            .map_err(|e| io_error(path, &e))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER];
        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| io_error(path, &e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        let hex = format!("{:x}", hasher.finalize());
        Ok(ContentHash::new(hex)?)
    }

    async fn get_available_space(&self) -> Result<u64, SyncError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || available_space(&root))
            .await
            .map_err(|e| SyncError::Io(format!("statvfs task failed: {e}")))?
            .map_err(|e| SyncError::from_io(self.root.display().to_string(), &e))
    }
}

// ============================================================================
// Unit tests
// ============================================================================
