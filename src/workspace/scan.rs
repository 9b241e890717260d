//! Local project scanner.
//!
//! A local project is any directory holding a `.grove/metadata` file whose
//! record points back at that directory. The fast path trusts the latest
//! update snapshot when every project it lists is still on disk; the full
//! path walks the tree. Either way, each project's revision is refreshed
//! to the current tip of its tracking branch before the set is returned.

use std::path::Path;

use crate::error::{Error, Result};
use crate::history;
use crate::manifest::{LOCAL_BRANCH, Projects};
use crate::vcs;

use super::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Trust the latest snapshot when it still matches the disk.
    Fast,
    /// Always walk the workspace tree.
    Full,
}

/// Enumerate the projects currently on disk.
pub fn local_projects(ws: &Workspace, mode: ScanMode) -> Result<Projects> {
    let mut projects = match mode {
        ScanMode::Fast => match fast_scan(ws)? {
            Some(projects) => projects,
            None => full_scan(ws)?,
        },
        ScanMode::Full => full_scan(ws)?,
    };
    refresh_revisions(&mut projects)?;
    Ok(projects)
}

/// Replay the latest snapshot; `None` means it is stale (or absent) and
/// the caller should walk the tree instead.
fn fast_scan(ws: &Workspace) -> Result<Option<Projects>> {
    let Some(snapshot) = history::read_latest(&ws.history_dir())? else {
        return Ok(None);
    };
    let mut projects = Projects::new();
    for mut project in snapshot.projects {
        project.absolutize_path(ws.root(), Path::new(""));
        if !Workspace::metadata_file(&project.path).exists() {
            log::debug!(
                "fast scan miss: {} not on disk, walking the tree",
                project.path.display()
            );
            return Ok(None);
        }
        // Snapshots record what the manifest asked for; the metadata file
        // is what the executor actually wrote.
        let project = ws.read_metadata(&project.path)?;
        insert_scanned(&mut projects, project, ws)?;
    }
    Ok(Some(projects))
}

fn full_scan(ws: &Workspace) -> Result<Projects> {
    let mut projects = Projects::new();
    walk(ws, ws.root(), &mut projects)?;
    Ok(projects)
}

fn walk(ws: &Workspace, dir: &Path, projects: &mut Projects) -> Result<()> {
    if Workspace::metadata_file(dir).exists() {
        let project = ws.read_metadata(dir)?;
        if project.path != dir {
            return Err(Error::message(format!(
                "metadata in {} claims path {}",
                dir.display(),
                project.path.display()
            )));
        }
        insert_scanned(projects, project, ws)?;
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        // Hidden children hold VCS and grove state, never projects.
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        walk(ws, &entry.path(), projects)?;
    }
    Ok(())
}

fn insert_scanned(projects: &mut Projects, project: crate::manifest::Project, ws: &Workspace) -> Result<()> {
    let key = project.key();
    if projects.contains_key(&key) {
        return Err(Error::DuplicateProject {
            key: key.to_string(),
            file: ws.root().to_path_buf(),
        });
    }
    projects.insert(key, project);
    Ok(())
}

fn refresh_revisions(projects: &mut Projects) -> Result<()> {
    for project in projects.values_mut() {
        let git = vcs::for_protocol(&project.protocol, &project.path)?;
        project.revision = match git.revision_of_branch(LOCAL_BRANCH) {
            Ok(revision) => revision,
            // Detached or branchless checkout; the current commit still
            // describes what is on disk.
            Err(_) => git.current_revision()?,
        };
    }
    Ok(())
}
