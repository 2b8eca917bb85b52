//! Version-control adapter
//!
//! Commits are append-only; nothing in the orchestrator rewrites history.
//! The git implementation serializes all repository access behind an
//! application-level mutex because git2's index locking doesn't handle
//! concurrent writers well.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use civica_common::Error;
use git2::{Repository, Signature};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// One entry of the commit history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Commit id (hex)
    pub id: String,
    /// Commit message
    pub message: String,
    /// Author name
    pub author: String,
    /// Commit time (unix seconds)
    pub timestamp: i64,
}

/// Content-addressed version-control store over the records tree
#[async_trait]
pub trait Vcs: Debug + Send + Sync {
    /// Stage the given paths, recording deletions for missing files
    async fn stage(&self, paths: &[String]) -> Result<(), Error>;

    /// Commit the staged change set. Returns `None` without committing when
    /// the change set is empty.
    async fn commit(&self, message: &str, author: &str) -> Result<Option<String>, Error>;

    /// Most recent commits, newest first
    async fn history(&self, limit: usize) -> Result<Vec<CommitInfo>, Error>;
}

fn git_err(err: git2::Error) -> Error {
    Error::Vcs(err.message().to_string())
}

/// Git-backed [`Vcs`] over the records root.
#[derive(Debug, Clone)]
pub struct GitVcs {
    root: PathBuf,
    /// Serializes git operations; the working directory is a singleton
    /// resource
    git_lock: Arc<Mutex<()>>,
}

impl GitVcs {
    /// Open the repository at `root`, initializing one if none exists
    pub fn open_or_init<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        match Repository::open(&root) {
            Ok(_) => {}
            Err(_) => {
                Repository::init(&root).map_err(git_err)?;
            }
        }

        Ok(Self {
            root,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    fn repo(&self) -> Result<Repository, Error> {
        Repository::open(&self.root).map_err(git_err)
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn stage(&self, paths: &[String]) -> Result<(), Error> {
        let _guard = self.git_lock.lock().await;
        let repo = self.repo()?;
        let mut index = repo.index().map_err(git_err)?;

        for path in paths {
            let rel = Path::new(path);
            if self.root.join(rel).is_file() {
                index.add_path(rel).map_err(git_err)?;
            } else {
                // Missing on disk: stage the deletion if it was tracked
                match index.remove_path(rel) {
                    Ok(()) => {}
                    Err(err) if err.code() == git2::ErrorCode::NotFound => {}
                    Err(err) => return Err(git_err(err)),
                }
            }
        }

        index.write().map_err(git_err)?;
        Ok(())
    }

    async fn commit(&self, message: &str, author: &str) -> Result<Option<String>, Error> {
        let _guard = self.git_lock.lock().await;
        let repo = self.repo()?;
        let mut index = repo.index().map_err(git_err)?;
        let tree_id = index.write_tree().map_err(git_err)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit().map_err(git_err)?),
            Err(_) => None,
        };

        // Skip the commit when the staged tree matches the parent
        if let Some(parent) = &parent {
            if parent.tree_id() == tree_id {
                tracing::debug!("Empty change set, skipping commit");
                return Ok(None);
            }
        } else if index.is_empty() {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id).map_err(git_err)?;
        let signature = Signature::now(author, "records@civica.local").map_err(git_err)?;
        let parents: Vec<_> = parent.iter().collect();

        let oid = repo
            .commit(
                Some("HEAD"),
                &signature,
                &signature,
                message,
                &tree,
                &parents,
            )
            .map_err(git_err)?;

        Ok(Some(oid.to_string()))
    }

    async fn history(&self, limit: usize) -> Result<Vec<CommitInfo>, Error> {
        let _guard = self.git_lock.lock().await;
        let repo = self.repo()?;

        let mut revwalk = match repo.revwalk() {
            Ok(walk) => walk,
            Err(err) => return Err(git_err(err)),
        };
        if revwalk.push_head().is_err() {
            // No commits yet
            return Ok(Vec::new());
        }

        let mut commits = Vec::new();
        for oid in revwalk.take(limit) {
            let oid = oid.map_err(git_err)?;
            let commit = repo.find_commit(oid).map_err(git_err)?;
            commits.push(CommitInfo {
                id: oid.to_string(),
                message: commit.message().unwrap_or_default().to_string(),
                author: commit.author().name().unwrap_or_default().to_string(),
                timestamp: commit.time().seconds(),
            });
        }

        Ok(commits)
    }
}
