//! Working-tree filesystem adapter
//!
//! All operations treat "already in desired state" as success, so forward
//! steps and compensations stay retry-safe under at-least-once delivery.
//! Writes go through a temp file plus atomic rename; a crash mid-write
//! never leaves a partial record file.

use std::fmt::Debug;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use civica_common::Error;
use uuid::Uuid;

/// Filesystem under the records root
#[async_trait]
pub trait WorkingTree: Debug + Send + Sync {
    /// Write via temp file + atomic rename, replacing any existing file
    async fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<(), Error>;

    /// Create if absent, succeed if an identical file exists, and fail
    /// `Conflict` when a different file is already at the path
    async fn write_new(&self, path: &str, bytes: &[u8]) -> Result<(), Error>;

    /// Move a file; "source gone and destination present" is success
    async fn rename(&self, src: &str, dst: &str) -> Result<(), Error>;

    /// Remove a file; already absent is success
    async fn remove(&self, path: &str) -> Result<(), Error>;

    /// Whether a file exists at the path
    async fn exists(&self, path: &str) -> Result<bool, Error>;

    /// Read a file's contents
    async fn read(&self, path: &str) -> Result<Vec<u8>, Error>;
}

/// On-disk records tree rooted at a caller-chosen directory.
///
/// The root itself must exist; only subdirectories are created on demand.
#[derive(Debug, Clone)]
pub struct RecordsTree {
    root: PathBuf,
}

impl RecordsTree {
    /// Records tree at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, Error> {
        let rel = Path::new(path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(Error::Internal(format!(
                "Path escapes the records tree: {path}"
            )));
        }

        if !self.root.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("records root does not exist: {}", self.root.display()),
            )));
        }

        Ok(self.root.join(rel))
    }

    fn ensure_parent(target: &Path) -> Result<(), Error> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkingTree for RecordsTree {
    async fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<(), Error> {
        let target = self.resolve(path)?;
        Self::ensure_parent(&target)?;

        // Temp file in the target directory so the rename stays on one
        // filesystem
        let tmp = target.with_file_name(format!(".tmp-{}", Uuid::new_v4()));
        std::fs::write(&tmp, bytes)?;
        if let Err(err) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }

        Ok(())
    }

    async fn write_new(&self, path: &str, bytes: &[u8]) -> Result<(), Error> {
        let target = self.resolve(path)?;

        if target.is_file() {
            let existing = std::fs::read(&target)?;
            if existing == bytes {
                return Ok(());
            }
            return Err(Error::Conflict(format!(
                "A different file already exists at {path}"
            )));
        }

        self.write_atomic(path, bytes).await
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), Error> {
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;

        if !from.exists() {
            if to.exists() {
                return Ok(());
            }
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("nothing to move at {src}"),
            )));
        }

        Self::ensure_parent(&to)?;
        std::fs::rename(&from, &to)?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), Error> {
        let target = self.resolve(path)?;

        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self.resolve(path)?.is_file())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, Error> {
        Ok(std::fs::read(self.resolve(path)?)?)
    }
}
