//! Bulk "HEAD" resolution.
//!
//! Before planning, projects whose revision floats at "HEAD" are upgraded
//! to concrete commit ids where possible: one advertised-heads query per
//! distinct remote answers for every project sharing it, and the queries
//! run in parallel. This is an optimisation only — a remote that fails to
//! answer is logged and its projects keep "HEAD" for the per-project
//! reset to resolve.

use std::collections::HashMap;
use std::path::Path;

use rayon::prelude::*;

use crate::manifest::Projects;
use crate::vcs::{Git, Vcs};

pub fn resolve_heads(workspace_root: &Path, projects: &mut Projects) {
    let mut remotes: Vec<String> = projects
        .values()
        .filter(|p| !p.has_pinned_revision())
        .map(|p| p.remote.clone())
        .collect();
    remotes.sort();
    remotes.dedup();
    if remotes.is_empty() {
        return;
    }

    let git = Git::at(workspace_root);
    let heads: HashMap<String, HashMap<String, String>> = remotes
        .par_iter()
        .filter_map(|remote| match git.remote_heads(remote) {
            Ok(heads) => Some((remote.clone(), heads)),
            Err(e) => {
                log::warn!("head resolution for {remote} failed (continuing): {e}");
                None
            }
        })
        .collect();

    for project in projects.values_mut() {
        if project.has_pinned_revision() {
            continue;
        }
        if let Some(commit) = heads
            .get(&project.remote)
            .and_then(|branches| branches.get(&project.remote_branch))
        {
            project.revision = commit.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Project;
    use std::path::PathBuf;

    #[test]
    fn unresolvable_remotes_are_non_fatal() {
        let mut project = Project {
            name: "p".to_string(),
            path: PathBuf::from("/ws/p"),
            remote: "/nonexistent/grove/remote.git".to_string(),
            ..Project::default()
        };
        project.fill_defaults().unwrap();
        let mut projects = Projects::new();
        projects.insert(project.key(), project);

        resolve_heads(Path::new("/"), &mut projects);
        // Still floating; the executor's reset will resolve it.
        assert_eq!(projects.values().next().unwrap().revision, "HEAD");
    }

    #[test]
    fn pinned_revisions_are_left_alone() {
        let mut project = Project {
            name: "p".to_string(),
            path: PathBuf::from("/ws/p"),
            remote: "/nonexistent/grove/remote.git".to_string(),
            revision: "abc123".to_string(),
            ..Project::default()
        };
        project.fill_defaults().unwrap();
        let mut projects = Projects::new();
        projects.insert(project.key(), project);

        resolve_heads(Path::new("/"), &mut projects);
        assert_eq!(projects.values().next().unwrap().revision, "abc123");
    }
}
