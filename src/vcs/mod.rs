//! Version-control adapter.
//!
//! The update engine drives repositories exclusively through the [`Vcs`]
//! capability set; everything git-specific (refspecs, the "origin" remote,
//! stashing) lives in the [`git`] implementation. An adapter for another
//! system only has to satisfy the same capability list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

mod git;

pub use git::Git;

/// The only protocol the engine currently understands.
pub const GIT_PROTOCOL: &str = "git";

/// Narrow VCS operations over a single working directory.
pub trait Vcs {
    /// Working directory this adapter operates on.
    fn dir(&self) -> &Path;

    fn clone_repo(&self, remote: &str, path: &Path) -> Result<()>;
    fn init(&self, path: &Path) -> Result<()>;

    /// Fetch a remote; with `refspec`, only that ref.
    fn fetch(&self, remote: &str, refspec: Option<&str>) -> Result<()>;
    fn set_remote_url(&self, name: &str, url: &str) -> Result<()>;
    fn remote_url(&self, name: &str) -> Result<String>;

    /// Current branch name; "HEAD" when detached.
    fn current_branch(&self) -> Result<String>;
    fn current_revision(&self) -> Result<String>;
    fn revision_of_branch(&self, branch: &str) -> Result<String>;

    fn reset_hard(&self, rev: &str) -> Result<()>;
    fn checkout(&self, branch: &str) -> Result<()>;
    /// Create `branch` at the current revision (or reset it there) and
    /// check it out.
    fn create_and_checkout(&self, branch: &str) -> Result<()>;
    fn delete_branch(&self, branch: &str, force: bool) -> Result<()>;

    /// Stash unstaged work; returns false when there was nothing to stash.
    fn stash(&self) -> Result<bool>;
    fn stash_pop(&self) -> Result<()>;

    fn has_uncommitted(&self) -> Result<bool>;
    fn has_untracked(&self) -> Result<bool>;
    fn remove_untracked(&self) -> Result<()>;

    fn branches(&self) -> Result<Vec<String>>;

    fn commit_all(&self, message: &str) -> Result<()>;
    fn commit_file(&self, file: &Path, message: &str) -> Result<()>;

    /// Subject lines of commits in `older..newer`, formatted per `format`.
    fn log(&self, newer: &str, older: &str, format: &str) -> Result<Vec<String>>;
    fn count_commits(&self, base: &str, head: &str) -> Result<usize>;

    fn top_level(&self) -> Result<PathBuf>;

    /// branch -> commit map of the heads advertised by `remote_url`.
    /// One query answers for every project sharing the remote.
    fn remote_heads(&self, remote_url: &str) -> Result<HashMap<String, String>>;
}

impl std::fmt::Debug for dyn Vcs + Send + Sync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<vcs adapter at {}>", self.dir().display())
    }
}

/// Construct the adapter for `protocol` rooted at `dir`.
pub fn for_protocol(protocol: &str, dir: impl Into<PathBuf>) -> Result<Box<dyn Vcs + Send + Sync>> {
    match protocol {
        GIT_PROTOCOL => Ok(Box::new(Git::at(dir))),
        other => Err(Error::UnsupportedProtocol {
            protocol: other.to_string(),
            name: dir.into().display().to_string(),
        }),
    }
}
