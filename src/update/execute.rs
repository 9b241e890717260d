//! Plan executor.
//!
//! Two phases. The test phase checks every operation's precondition
//! against the filesystem plus a scoreboard of directories the plan has
//! already promised to vacate or occupy; any failing test aborts before
//! anything runs. The run phase then applies operations sequentially in
//! planner order. New checkouts are staged in a temp directory and
//! renamed into place, so a failed create never leaves a half-populated
//! project under the workspace root.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::manifest::{HEAD_REVISION, Hooks, Host, LOCAL_BRANCH, Project};
use crate::runner;
use crate::vcs::{self, Vcs};
use crate::workspace::{METADATA_DIR, Workspace};

use super::plan::{OpKind, Operation};

/// Hooks that run longer than this are killed.
const HOOK_TIMEOUT: Duration = Duration::from_secs(300);

/// What actually happened, for the caller to fold into the snapshot and
/// the end-of-run report.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Standing advisories: non-tracking-branch notes, gc-refused and
    /// gc-disabled deletions with their `rm -rf` hint.
    pub advisories: Vec<String>,
    /// Local projects a delete op left on disk; they still belong in the
    /// current-state snapshot.
    pub kept: Vec<Project>,
}

pub fn execute(ws: &Workspace, ops: &[Operation], hosts: &[Host]) -> Result<ExecutionReport> {
    test_all(ops)?;
    let mut report = ExecutionReport::default();
    for op in ops {
        run_op(ws, op, hosts, &mut report)?;
    }
    run_project_hooks(ops)?;
    Ok(report)
}

// ---------------------------------------------------------------------------
// Test phase

/// Directories this plan has promised to vacate or occupy. A create whose
/// destination is currently a doomed project's directory passes its test
/// because the delete runs first; two operations claiming one destination
/// do not.
#[derive(Default)]
struct Scoreboard {
    vacated: HashSet<PathBuf>,
    claimed: HashSet<PathBuf>,
}

impl Scoreboard {
    fn free_for(&self, destination: &Path) -> bool {
        !destination.exists() || self.vacated.contains(destination)
    }

    fn claim(&mut self, op: &Operation, destination: &Path) -> Result<()> {
        if !self.claimed.insert(destination.to_path_buf()) {
            return Err(Error::message(format!(
                "cannot {}: destination already claimed by an earlier operation",
                op.describe()
            )));
        }
        Ok(())
    }
}

fn test_all(ops: &[Operation]) -> Result<()> {
    let mut board = Scoreboard::default();
    for op in ops {
        test_op(op, &mut board)?;
    }
    Ok(())
}

fn test_op(op: &Operation, board: &mut Scoreboard) -> Result<()> {
    match op.kind {
        OpKind::Delete => {
            let source = required(op, op.source.as_deref())?;
            if !source.exists() {
                return Err(Error::NotFound(source.to_path_buf()));
            }
            board.vacated.insert(source.to_path_buf());
        }
        OpKind::Move => {
            let source = required(op, op.source.as_deref())?;
            let destination = required(op, op.destination.as_deref())?;
            if !source.exists() {
                return Err(Error::NotFound(source.to_path_buf()));
            }
            if !board.free_for(destination) {
                return Err(Error::message(format!(
                    "cannot {}: destination exists",
                    op.describe()
                )));
            }
            board.claim(op, destination)?;
            board.vacated.insert(source.to_path_buf());
        }
        OpKind::Create => {
            let destination = required(op, op.destination.as_deref())?;
            if !board.free_for(destination) {
                return Err(Error::message(format!(
                    "cannot {}: destination exists",
                    op.describe()
                )));
            }
            board.claim(op, destination)?;
        }
        OpKind::Update | OpKind::Null => {
            let source = required(op, op.source.as_deref())?;
            if !source.exists() {
                return Err(Error::NotFound(source.to_path_buf()));
            }
        }
    }
    Ok(())
}

fn required<'a>(op: &Operation, path: Option<&'a Path>) -> Result<&'a Path> {
    path.ok_or_else(|| Error::message(format!("malformed operation: {}", op.describe())))
}

// ---------------------------------------------------------------------------
// Run phase

fn run_op(
    ws: &Workspace,
    op: &Operation,
    hosts: &[Host],
    report: &mut ExecutionReport,
) -> Result<()> {
    log::info!("{}", op.describe());
    match op.kind {
        OpKind::Create => run_create(ws, op, hosts),
        OpKind::Move => {
            let source = required(op, op.source.as_deref())?;
            let destination = required(op, op.destination.as_deref())?;
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(source, destination)?;
            run_update(ws, op, hosts, report)
        }
        OpKind::Update => run_update(ws, op, hosts, report),
        OpKind::Delete => run_delete(op, report),
        OpKind::Null => ws.write_metadata(&op.project),
    }
}

/// The reset protocol: point "origin" at the manifest remote, fetch the
/// tracking branch, then reset hard to the pinned revision or to the
/// fetched branch tip.
pub(crate) fn reset_to_manifest(git: &dyn Vcs, project: &Project) -> Result<()> {
    git.set_remote_url("origin", &project.remote)?;
    git.fetch("origin", Some(&project.remote_branch))?;
    if project.has_pinned_revision() {
        git.reset_hard(&project.revision)
    } else {
        git.reset_hard(&format!("origin/{}", project.remote_branch))
    }
}

/// Restores branch and stash when dropped, so the guarantee holds on
/// every exit path out of [`with_tracking_branch`], panics included.
/// Nested guards restore in LIFO order as their scopes unwind.
struct BranchRestore<'a> {
    git: &'a dyn Vcs,
    original: Option<String>,
    stashed: bool,
}

impl BranchRestore<'_> {
    fn restore(&mut self) -> Result<()> {
        if let Some(original) = self.original.take() {
            self.git.checkout(&original)?;
        }
        if std::mem::take(&mut self.stashed) {
            self.git.stash_pop()?;
        }
        Ok(())
    }
}

impl Drop for BranchRestore<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            log::warn!(
                "restoring {} after failure also failed: {e}",
                self.git.dir().display()
            );
        }
    }
}

/// Run `body` on the tracking branch, preserving work in progress:
/// unstaged changes are stashed, the original branch remembered, and both
/// restored on every exit path, success or failure.
pub fn with_tracking_branch<F>(git: &dyn Vcs, branch: &str, body: F) -> Result<()>
where
    F: FnOnce(&dyn Vcs) -> Result<()>,
{
    let stashed = git.stash()?;
    let original = {
        let name = git.current_branch()?;
        if name == HEAD_REVISION {
            // Detached: restore by revision.
            git.current_revision()?
        } else {
            name
        }
    };
    if original != branch && git.checkout(branch).is_err() {
        git.create_and_checkout(branch)?;
    }

    let mut guard = BranchRestore {
        git,
        original: (original != branch).then_some(original),
        stashed,
    };
    let result = body(git);
    match result {
        // Surface restoration failures only when the body itself was fine;
        // restore() empties the guard, so its drop becomes a no-op.
        Ok(()) => guard.restore(),
        Err(err) => Err(err),
    }
}

fn run_create(ws: &Workspace, op: &Operation, hosts: &[Host]) -> Result<()> {
    let project = &op.project;
    let destination = required(op, op.destination.as_deref())?;
    let parent = destination
        .parent()
        .ok_or_else(|| Error::message(format!("{} has no parent", destination.display())))?;
    std::fs::create_dir_all(parent)?;

    // Stage next to the destination so the final rename stays on one
    // filesystem; the staging directory is cleaned up on any failure.
    let staging = tempfile::Builder::new()
        .prefix(".grove-staging-")
        .tempdir_in(parent)?;
    let checkout = staging.path().to_path_buf();

    let git = vcs::for_protocol(&project.protocol, &checkout)?;
    git.clone_repo(&project.remote, &checkout)
        .map_err(|e| Error::Vcs(format!("cloning {}: {e}", project.remote)))?;
    // The clone checks out the remote's default branch; materialise the
    // conventional local branch before resetting.
    if git.checkout(LOCAL_BRANCH).is_err() {
        git.create_and_checkout(LOCAL_BRANCH)?;
    }
    reset_to_manifest(git.as_ref(), project)?;
    install_git_hooks(project, hosts, &checkout)?;
    write_metadata_exclusion(&checkout)?;
    ws.write_metadata_in(project, &checkout)?;

    std::fs::rename(staging.keep(), destination)?;
    Ok(())
}

fn run_update(
    ws: &Workspace,
    op: &Operation,
    hosts: &[Host],
    report: &mut ExecutionReport,
) -> Result<()> {
    let project = &op.project;
    let destination = required(op, op.destination.as_deref())?;
    let git = vcs::for_protocol(&project.protocol, destination)?;

    let current = git.current_branch()?;
    if current != LOCAL_BRANCH {
        report.advisories.push(format!(
            "project {:?} is on branch {:?}, not {LOCAL_BRANCH:?}; \
             {LOCAL_BRANCH:?} was updated in place",
            project.name, current
        ));
    }
    with_tracking_branch(git.as_ref(), LOCAL_BRANCH, |git| reset_to_manifest(git, project))?;
    install_git_hooks(project, hosts, destination)?;
    ws.write_metadata(project)
}

fn run_delete(op: &Operation, report: &mut ExecutionReport) -> Result<()> {
    let project = &op.project;
    let source = required(op, op.source.as_deref())?;
    if !op.gc {
        report.kept.push(project.clone());
        report.advisories.push(format!(
            "project {:?} is no longer in the manifest; to remove it, run: rm -rf {}",
            project.name,
            source.display()
        ));
        return Ok(());
    }

    let git = vcs::for_protocol(&project.protocol, source)?;
    if let Some(reason) = local_work(git.as_ref(), project)? {
        let err = Error::ProjectNotClean {
            name: project.name.clone(),
            reason,
        };
        report.kept.push(project.clone());
        report.advisories.push(format!(
            "{err}; left in place, remove it manually with: rm -rf {}",
            source.display()
        ));
        return Ok(());
    }
    std::fs::remove_dir_all(source)?;
    Ok(())
}

/// Why a checkout cannot be garbage-collected, if anything.
fn local_work(git: &dyn Vcs, _project: &Project) -> Result<Option<String>> {
    let extra: Vec<String> = git
        .branches()?
        .into_iter()
        .filter(|branch| branch.as_str() != LOCAL_BRANCH)
        .collect();
    if !extra.is_empty() {
        return Ok(Some(format!("it has extra branches {extra:?}")));
    }
    if git.has_uncommitted()? {
        return Ok(Some("it has uncommitted changes".to_string()));
    }
    if git.has_untracked()? {
        return Ok(Some("it has untracked files".to_string()));
    }
    Ok(None)
}

/// Copy git-hook payloads into `.git/hooks`: the project's own payload
/// directory first, then any payloads of a gerrit host when the project
/// names one. Existing hooks are overwritten; grove owns these files.
fn install_git_hooks(project: &Project, hosts: &[Host], checkout: &Path) -> Result<()> {
    let hooks_dir = checkout.join(".git").join("hooks");
    if let Some(payload_dir) = &project.git_hooks {
        let payload_dir = if payload_dir.is_absolute() {
            payload_dir.clone()
        } else {
            checkout.join(payload_dir)
        };
        copy_dir_files(&payload_dir, &hooks_dir)?;
    }
    if project.gerrit_host.is_some() {
        for host in hosts.iter().filter(|h| h.kind == "gerrit") {
            for payload in &host.git_hooks {
                std::fs::create_dir_all(&hooks_dir)?;
                std::fs::copy(&payload.path, hooks_dir.join(&payload.name))?;
            }
        }
    }
    Ok(())
}

fn copy_dir_files(from: &Path, to: &Path) -> Result<()> {
    if !from.is_dir() {
        return Err(Error::NotFound(from.to_path_buf()));
    }
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }
    Ok(())
}

/// Exclude the metadata directory through git itself so it never shows up
/// as untracked.
fn write_metadata_exclusion(checkout: &Path) -> Result<()> {
    use std::io::Write;
    let info_dir = checkout.join(".git").join("info");
    std::fs::create_dir_all(&info_dir)?;
    let exclude = info_dir.join("exclude");
    let entry = format!("/{METADATA_DIR}/");
    let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
    if existing.lines().any(|line| line.trim() == entry) {
        return Ok(());
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&exclude)?;
    writeln!(file, "{entry}")?;
    Ok(())
}

/// After all operations, run each touched project's `runhook` script with
/// the operation kind as its single argument. A failing hook aborts the
/// update.
fn run_project_hooks(ops: &[Operation]) -> Result<()> {
    for op in ops {
        if !matches!(op.kind, OpKind::Create | OpKind::Move | OpKind::Update) {
            continue;
        }
        let Some(hook) = &op.project.run_hook else {
            continue;
        };
        let dir = op
            .destination
            .as_deref()
            .unwrap_or_else(|| Path::new("."));
        let script = if hook.is_absolute() {
            hook.clone()
        } else {
            dir.join(hook)
        };
        let script = script.to_string_lossy().into_owned();
        let kind = op.kind.to_string();
        let mut seq = runner::Sequence::new(dir, false);
        seq.step()
            .timeout(HOOK_TIMEOUT)
            .run(&script, &[kind.as_str()]);
        seq.done().map_err(|e| Error::HookFailed {
            name: script.clone(),
            detail: e.to_string(),
        })?;
    }
    Ok(())
}

/// Run the manifest-level hooks after a successful update. Failures are
/// collected rather than aborting; the caller folds them into the
/// sub-failure exit code.
pub fn run_manifest_hooks(hooks: &Hooks) -> Vec<Error> {
    let mut failures = Vec::new();
    for hook in hooks.values() {
        let dir = hook
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let script = hook.path.to_string_lossy().into_owned();
        let args: Vec<&str> = hook.args.iter().map(String::as_str).collect();
        let mut seq = runner::Sequence::new(&dir, false);
        let step = seq.step().timeout(HOOK_TIMEOUT);
        match &hook.interpreter {
            Some(interpreter) => {
                let mut full = vec![script.as_str()];
                full.extend(args.iter().copied());
                step.run(interpreter, &full);
            }
            None => {
                step.run(&script, &args);
            }
        }
        if let Err(e) = seq.done() {
            failures.push(Error::HookFailed {
                name: hook.name.clone(),
                detail: e.to_string(),
            });
        }
    }
    failures
}
