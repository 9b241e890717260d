//! Project state reporter.
//!
//! A concurrent per-project scan of branch and cleanliness state, one
//! task per project with its own adapter instance. The first per-project
//! error fails the whole report.

use std::path::PathBuf;

use rayon::prelude::*;
use serde::Serialize;

use crate::error::Result;
use crate::manifest::{Project, Projects};
use crate::vcs;
use crate::workspace::{METADATA_DIR, REVIEW_MESSAGE_DIR, Workspace};
use crate::workspace::scan::{self, ScanMode};

#[derive(Debug, Clone, Serialize)]
pub struct BranchSummary {
    pub name: String,
    /// A review message has been drafted for this branch.
    pub has_review_message: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectState {
    pub name: String,
    pub path: PathBuf,
    pub current_branch: String,
    pub branches: Vec<BranchSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_uncommitted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_untracked: Option<bool>,
}

/// Collect the state of every local project. With `check_dirty`, also
/// report uncommitted/untracked flags (slower on large trees).
pub fn project_states(ws: &Workspace, check_dirty: bool) -> Result<Vec<ProjectState>> {
    let local = scan::local_projects(ws, ScanMode::Fast)?;
    states_of(&local, check_dirty)
}

pub fn states_of(projects: &Projects, check_dirty: bool) -> Result<Vec<ProjectState>> {
    let listed: Vec<&Project> = projects.values().collect();
    let mut states = listed
        .par_iter()
        .map(|project| state_of(project, check_dirty))
        .collect::<Result<Vec<_>>>()?;
    states.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
    Ok(states)
}

fn state_of(project: &Project, check_dirty: bool) -> Result<ProjectState> {
    let git = vcs::for_protocol(&project.protocol, &project.path)?;
    let review_dir = project.path.join(METADATA_DIR).join(REVIEW_MESSAGE_DIR);
    let branches = git
        .branches()?
        .into_iter()
        .map(|name| {
            let has_review_message = review_dir.join(&name).exists();
            BranchSummary {
                name,
                has_review_message,
            }
        })
        .collect();
    let (has_uncommitted, has_untracked) = if check_dirty {
        (Some(git.has_uncommitted()?), Some(git.has_untracked()?))
    } else {
        (None, None)
    };
    Ok(ProjectState {
        name: project.name.clone(),
        path: project.path.clone(),
        current_branch: git.current_branch()?,
        branches,
        has_uncommitted,
        has_untracked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_workspace_reports_nothing() {
        let projects = Projects::new();
        let states = states_of(&projects, false).unwrap();
        assert!(states.is_empty());
    }

    #[test]
    fn missing_repository_fails_the_report() {
        let mut project = Project {
            name: "ghost".to_string(),
            path: PathBuf::from("/no/such/checkout"),
            remote: "https://example.com/ghost".to_string(),
            ..Project::default()
        };
        project.fill_defaults().unwrap();
        let mut projects = Projects::new();
        projects.insert(project.key(), project);
        assert!(states_of(&projects, false).is_err());
    }

    #[test]
    fn states_serialize_to_json() {
        let state = ProjectState {
            name: "p".to_string(),
            path: PathBuf::from("/ws/p"),
            current_branch: "master".to_string(),
            branches: vec![BranchSummary {
                name: "master".to_string(),
                has_review_message: false,
            }],
            has_uncommitted: None,
            has_untracked: Some(true),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains(r#""current_branch":"master""#), "{json}");
        // Unchecked flags are elided entirely.
        assert!(!json.contains("has_uncommitted"), "{json}");
    }
}
