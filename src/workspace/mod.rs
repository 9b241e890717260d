//! Workspace layout and discovery.
//!
//! A workspace is the directory tree under which every project lives.
//! Its identity on disk is the `.grove_root` state directory (root
//! manifest, update history, scratch import areas). Each project carries
//! a `.grove/metadata` file holding its own project record with the path
//! stored relative to the workspace root; that marker is what the local
//! scanner looks for.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::{Project, xml};

pub mod scan;

/// Per-project metadata directory.
pub const METADATA_DIR: &str = ".grove";
/// Metadata file inside [`METADATA_DIR`].
pub const METADATA_FILE: &str = "metadata";
/// Per-branch review-message files inside [`METADATA_DIR`], consulted by
/// the state reporter.
pub const REVIEW_MESSAGE_DIR: &str = "review";

/// Workspace state directory at the root.
pub const STATE_DIR: &str = ".grove_root";
/// Root manifest file inside [`STATE_DIR`].
pub const ROOT_MANIFEST: &str = "manifest";
/// Update-history directory inside [`STATE_DIR`].
pub const HISTORY_DIR: &str = "update_history";

/// Environment variable naming the workspace root.
pub const ROOT_ENV: &str = "GROVE_ROOT";
/// Older spelling, still honoured.
pub const LEGACY_ROOT_ENV: &str = "GROVE_WORKSPACE";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open the workspace rooted at `root`. Symbolic links are resolved so
    /// path comparisons against scanned directories are exact.
    pub fn at(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .map_err(|_| Error::NotFound(root.to_path_buf()))?;
        Ok(Workspace { root })
    }

    /// Locate the workspace: an explicit override wins, then [`ROOT_ENV`],
    /// then [`LEGACY_ROOT_ENV`].
    pub fn discover(override_root: Option<&Path>) -> Result<Self> {
        if let Some(root) = override_root {
            return Self::at(root);
        }
        for var in [ROOT_ENV, LEGACY_ROOT_ENV] {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    return Self::at(&value);
                }
            }
        }
        Err(Error::message(format!(
            "no workspace root: set {ROOT_ENV} or pass --root"
        )))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn root_manifest(&self) -> PathBuf {
        self.state_dir().join(ROOT_MANIFEST)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.state_dir().join(HISTORY_DIR)
    }

    /// Metadata file for the project checked out at `project_dir`.
    pub fn metadata_file(project_dir: &Path) -> PathBuf {
        project_dir.join(METADATA_DIR).join(METADATA_FILE)
    }

    /// Read the metadata record at `project_dir`; its path comes back
    /// absolutised against this workspace.
    pub fn read_metadata(&self, project_dir: &Path) -> Result<Project> {
        let file = Self::metadata_file(project_dir);
        if !file.exists() {
            return Err(Error::NotFound(file));
        }
        let bytes = std::fs::read(&file)?;
        let mut project = xml::project_from_bytes(&bytes)
            .map_err(|e| Error::Parse(format!("{}: {e}", file.display())))?;
        project.absolutize_path(&self.root, Path::new(""));
        Ok(project)
    }

    /// Write the metadata record for `project` into its checkout, path
    /// stored relative to the workspace root. The write is atomic.
    pub fn write_metadata(&self, project: &Project) -> Result<()> {
        self.write_metadata_in(project, &project.path)
    }

    /// Write `project`'s metadata under `checkout` instead of its final
    /// path. The executor stages new checkouts in a temp directory and
    /// renames them into place, so the record names the final path while
    /// the bytes land in the staging tree.
    pub fn write_metadata_in(&self, project: &Project, checkout: &Path) -> Result<()> {
        let dir = checkout.join(METADATA_DIR);
        std::fs::create_dir_all(&dir)?;
        let mut stored = project.clone();
        stored.relativize_path(&self.root);
        xml::write_atomic(&dir.join(METADATA_FILE), &xml::project_to_bytes(&stored)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_at(ws: &Workspace, name: &str) -> Project {
        let mut project = Project {
            name: name.to_string(),
            path: ws.root().join(name),
            remote: format!("https://example.com/{name}"),
            ..Project::default()
        };
        project.fill_defaults().unwrap();
        project
    }

    #[test]
    fn discover_prefers_override() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::discover(Some(dir.path())).unwrap();
        assert_eq!(ws.root(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn at_rejects_missing_directory() {
        let err = Workspace::at("/no/such/grove/workspace").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn metadata_round_trips_with_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::at(dir.path()).unwrap();
        let project = project_at(&ws, "p1");
        std::fs::create_dir_all(&project.path).unwrap();
        ws.write_metadata(&project).unwrap();

        // The stored form is relative...
        let raw = std::fs::read_to_string(Workspace::metadata_file(&project.path)).unwrap();
        assert!(raw.contains(r#"path="p1""#), "{raw}");

        // ...and reading absolutises it again.
        let read = ws.read_metadata(&project.path).unwrap();
        assert_eq!(read, project);
    }

    #[test]
    fn read_metadata_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::at(dir.path()).unwrap();
        let err = ws.read_metadata(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
