//! Git adapter: every capability is a `git` subprocess in the project
//! directory, run through [`crate::runner`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::runner;

use super::Vcs;

#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Git { dir: dir.into() }
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        runner::capture(&self.dir, "git", args).map_err(|e| Error::Vcs(e.to_string()))
    }

    fn git_status(&self, args: &[&str]) -> Result<bool> {
        runner::capture_status(&self.dir, "git", args).map_err(|e| Error::Vcs(e.to_string()))
    }
}

impl Vcs for Git {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn clone_repo(&self, remote: &str, path: &Path) -> Result<()> {
        let dest = path
            .to_str()
            .ok_or_else(|| Error::Vcs(format!("non-UTF-8 clone destination {path:?}")))?;
        self.git(&["clone", remote, dest])?;
        Ok(())
    }

    fn init(&self, path: &Path) -> Result<()> {
        let dest = path
            .to_str()
            .ok_or_else(|| Error::Vcs(format!("non-UTF-8 init destination {path:?}")))?;
        self.git(&["init", dest])?;
        Ok(())
    }

    fn fetch(&self, remote: &str, refspec: Option<&str>) -> Result<()> {
        match refspec {
            Some(refspec) => self.git(&["fetch", remote, refspec])?,
            None => self.git(&["fetch", remote])?,
        };
        Ok(())
    }

    fn set_remote_url(&self, name: &str, url: &str) -> Result<()> {
        self.git(&["remote", "set-url", name, url])?;
        Ok(())
    }

    fn remote_url(&self, name: &str) -> Result<String> {
        Ok(self.git(&["remote", "get-url", name])?.trim().to_string())
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self
            .git(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string())
    }

    fn current_revision(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn revision_of_branch(&self, branch: &str) -> Result<String> {
        let refname = format!("refs/heads/{branch}");
        Ok(self
            .git(&["rev-parse", "--verify", &refname])?
            .trim()
            .to_string())
    }

    fn reset_hard(&self, rev: &str) -> Result<()> {
        self.git(&["reset", "--hard", rev])?;
        Ok(())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", branch])?;
        Ok(())
    }

    fn create_and_checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", "-B", branch])?;
        Ok(())
    }

    fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.git(&["branch", flag, branch])?;
        Ok(())
    }

    fn stash(&self) -> Result<bool> {
        if !self.has_uncommitted()? {
            return Ok(false);
        }
        self.git(&["stash"])?;
        Ok(true)
    }

    fn stash_pop(&self) -> Result<()> {
        self.git(&["stash", "pop"])?;
        Ok(())
    }

    fn has_uncommitted(&self) -> Result<bool> {
        let clean = self.git_status(&["diff", "--quiet", "HEAD", "--exit-code"])?;
        Ok(!clean)
    }

    fn has_untracked(&self) -> Result<bool> {
        let listing = self.git(&["ls-files", "--others", "--exclude-standard"])?;
        Ok(!listing.trim().is_empty())
    }

    fn remove_untracked(&self) -> Result<()> {
        self.git(&["clean", "-f", "-d"])?;
        Ok(())
    }

    fn branches(&self) -> Result<Vec<String>> {
        let listing = self.git(&["branch", "--format=%(refname:short)"])?;
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "--allow-empty", "-m", message])?;
        Ok(())
    }

    fn commit_file(&self, file: &Path, message: &str) -> Result<()> {
        let file = file
            .to_str()
            .ok_or_else(|| Error::Vcs(format!("non-UTF-8 path {file:?}")))?;
        self.git(&["add", file])?;
        self.git(&["commit", "-m", message, "--", file])?;
        Ok(())
    }

    fn log(&self, newer: &str, older: &str, format: &str) -> Result<Vec<String>> {
        let range = format!("{older}..{newer}");
        let format = format!("--format={format}");
        let listing = self.git(&["log", &format, &range])?;
        Ok(listing.lines().map(str::to_owned).collect())
    }

    fn count_commits(&self, base: &str, head: &str) -> Result<usize> {
        let range = format!("{base}..{head}");
        let count = self.git(&["rev-list", "--count", &range])?;
        count
            .trim()
            .parse()
            .map_err(|e| Error::Vcs(format!("unparsable commit count {count:?}: {e}")))
    }

    fn top_level(&self) -> Result<PathBuf> {
        let top = self.git(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(top.trim()))
    }

    fn remote_heads(&self, remote_url: &str) -> Result<HashMap<String, String>> {
        let listing = self.git(&["ls-remote", "--heads", remote_url])?;
        parse_remote_heads(&listing)
    }
}

fn parse_remote_heads(listing: &str) -> Result<HashMap<String, String>> {
    let mut heads = HashMap::new();
    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((commit, refname)) = line.split_once('\t') else {
            return Err(Error::Vcs(format!("unparsable ls-remote line {line:?}")));
        };
        if let Some(branch) = refname.strip_prefix("refs/heads/") {
            heads.insert(branch.to_string(), commit.to_string());
        }
    }
    Ok(heads)
}
