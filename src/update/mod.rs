//! The update engine.
//!
//! One update is one pass of: scan the disk, load and flatten the
//! manifest graph, resolve floating revisions, plan, execute, snapshot.
//! The manifest tree is immutable for the duration; the snapshot written
//! at the end is what the next update's fast scan replays.

use crate::error::{Error, Result};
use crate::history;
use crate::manifest::{LOCAL_BRANCH, Manifest, loader};
use crate::vcs;
use crate::workspace::Workspace;
use crate::workspace::scan::{self, ScanMode};

pub mod execute;
pub mod head;
pub mod plan;

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Actually delete projects that left the manifest (when clean).
    pub gc: bool,
    /// Skip the snapshot fast path when scanning.
    pub full_scan: bool,
}

/// What an update did, for the CLI to report.
#[derive(Debug, Default)]
pub struct UpdateSummary {
    pub operations: Vec<String>,
    pub advisories: Vec<String>,
}

/// Drive the workspace into conformance with its root manifest.
pub fn update_workspace(ws: &Workspace, opts: UpdateOptions) -> Result<UpdateSummary> {
    let mode = if opts.full_scan {
        ScanMode::Full
    } else {
        ScanMode::Fast
    };
    let local = scan::local_projects(ws, mode)?;
    let loaded = loader::load(ws, &ws.root_manifest(), &local, true)?;

    let mut want = loaded.projects.clone();
    head::resolve_heads(ws.root(), &mut want);

    let ops = plan::plan(&local, &want, opts.gc);
    let report = execute::execute(ws, &ops, &loaded.hosts)?;

    // Current-state snapshot: the manifest's projects plus whatever a
    // delete op left behind, pinned to the revisions now on disk.
    let mut state = want.clone();
    for kept in report.kept {
        state.insert(kept.key(), kept);
    }
    for project in state.values_mut() {
        if project.has_pinned_revision() {
            continue;
        }
        let git = vcs::for_protocol(&project.protocol, &project.path)?;
        if let Ok(revision) = git.revision_of_branch(LOCAL_BRANCH) {
            project.revision = revision;
        }
    }
    let snapshot = Manifest::snapshot_of(&state, ws.root(), "update");
    history::add_snapshot(&ws.history_dir(), &snapshot)?;

    // Manifest-level hooks run last; their failures are a sub-failure
    // batch, not a broken workspace.
    let hook_failures = execute::run_manifest_hooks(&loaded.hooks);
    let summary = UpdateSummary {
        operations: ops.iter().map(plan::Operation::describe).collect(),
        advisories: report.advisories,
    };
    if !hook_failures.is_empty() {
        for failure in &hook_failures {
            log::error!("{failure}");
        }
        return Err(Error::ExitCode(2));
    }
    Ok(summary)
}

/// Serialise the current on-disk workspace state as a manifest.
pub fn snapshot_workspace(ws: &Workspace) -> Result<Manifest> {
    let local = scan::local_projects(ws, ScanMode::Full)?;
    Ok(Manifest::snapshot_of(&local, ws.root(), "snapshot"))
}
