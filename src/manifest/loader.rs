//! Manifest loader.
//!
//! Depth-first resolution of the import graph into flattened project,
//! tool and hook maps. Each visited file pushes a frame carrying the file
//! path and, for remote imports, a cycle key of `remote + " + " +
//! manifest`; re-entering either is a [`Error::CycleDetected`]. The two
//! keys are deliberately distinct: different local files may legitimately
//! import the same remote project, but the same remote+manifest pair
//! twice on the stack is a loop.
//!
//! Remote import repositories that are not already checked out locally
//! are cloned into a scratch directory under the workspace state dir; the
//! scratch area lives as long as the returned [`Loaded`] value.

use std::path::{Path, PathBuf};

use crate::error::{CycleKind, Error, Result};
use crate::update::execute::{reset_to_manifest, with_tracking_branch};
use crate::vcs;
use crate::workspace::Workspace;

use super::{Hook, Hooks, Host, Import, LOCAL_BRANCH, Project, Projects, Tools, xml};

/// Flattened load result.
#[derive(Debug)]
pub struct Loaded {
    pub projects: Projects,
    pub tools: Tools,
    pub hooks: Hooks,
    pub hosts: Vec<Host>,
    /// Scratch clone area, when any import repo had to be fetched.
    /// Dropping it removes the clones.
    pub scratch: Option<tempfile::TempDir>,
}

/// Resolve `root_manifest` and everything it imports.
///
/// `local` satisfies remote imports without cloning; with `update` set,
/// import repositories are fetched and reset before their manifests are
/// read (and missing ones cloned).
pub fn load(
    ws: &Workspace,
    root_manifest: &Path,
    local: &Projects,
    update: bool,
) -> Result<Loaded> {
    let mut loader = Loader {
        ws,
        local,
        update,
        stack: Vec::new(),
        projects: Projects::new(),
        tools: Tools::new(),
        hooks: Vec::new(),
        hosts: Vec::new(),
        scratch: None,
    };
    loader.load_file(root_manifest, Path::new(""), String::new())?;
    loader.finish()
}

struct Frame {
    file: PathBuf,
    cycle_key: String,
}

struct Loader<'a> {
    ws: &'a Workspace,
    local: &'a Projects,
    update: bool,
    stack: Vec<Frame>,
    projects: Projects,
    tools: Tools,
    hooks: Vec<Hook>,
    hosts: Vec<Host>,
    scratch: Option<tempfile::TempDir>,
}

impl Loader<'_> {
    fn load_file(&mut self, file: &Path, root: &Path, cycle_key: String) -> Result<()> {
        let file = file
            .canonicalize()
            .map_err(|_| Error::NotFound(file.to_path_buf()))?;
        for frame in &self.stack {
            if frame.file == file {
                return Err(Error::CycleDetected {
                    kind: CycleKind::Local,
                    have: frame.file.display().to_string(),
                    entered: file.display().to_string(),
                });
            }
            if !cycle_key.is_empty() && frame.cycle_key == cycle_key {
                return Err(Error::CycleDetected {
                    kind: CycleKind::Remote,
                    have: frame.cycle_key.clone(),
                    entered: file.display().to_string(),
                });
            }
        }
        self.stack.push(Frame {
            file: file.clone(),
            cycle_key,
        });
        let result = self.process(&file, root);
        self.stack.pop();
        result
    }

    fn process(&mut self, file: &Path, root: &Path) -> Result<()> {
        let manifest = xml::read_manifest(file)?;

        for import in &manifest.imports {
            self.remote_import(import, root)?;
        }
        let dir = file
            .parent()
            .ok_or_else(|| Error::message(format!("{} has no parent", file.display())))?;
        for file_import in &manifest.file_imports {
            self.load_file(&dir.join(&file_import.file), root, String::new())?;
        }

        for mut project in manifest.projects {
            project.absolutize_path(self.ws.root(), root);
            self.ingest_project(project, file)?;
        }
        for tool in manifest.tools {
            match self.tools.get(&tool.name) {
                Some(existing) if *existing == tool => {}
                Some(_) => {
                    return Err(Error::DuplicateTool {
                        name: tool.name,
                        file: file.to_path_buf(),
                    });
                }
                None => {
                    self.tools.insert(tool.name.clone(), tool);
                }
            }
        }
        self.hooks.extend(manifest.hooks);
        self.hosts.extend(manifest.hosts);
        Ok(())
    }

    fn ingest_project(&mut self, project: Project, file: &Path) -> Result<()> {
        let mut project = project;
        project.fill_defaults()?;
        let key = project.key();
        match self.projects.get(&key) {
            // Identical re-declaration is idempotent; any difference —
            // including diverging paths from two import roots — is fatal.
            Some(existing) if *existing == project => Ok(()),
            Some(_) => Err(Error::DuplicateProject {
                key: key.to_string(),
                file: file.to_path_buf(),
            }),
            None => {
                self.projects.insert(key, project);
                Ok(())
            }
        }
    }

    fn remote_import(&mut self, import: &Import, root: &Path) -> Result<()> {
        if import.is_old_style() {
            return self.old_style_import(import, root);
        }

        let mut repo = import.as_project();
        repo.fill_defaults()?;
        let dir = match self.local.get(&repo.key()) {
            Some(existing) => existing.path.clone(),
            None => self.scratch_clone(&repo)?,
        };

        if self.update {
            let git = vcs::for_protocol(&repo.protocol, &dir)?;
            with_tracking_branch(git.as_ref(), LOCAL_BRANCH, |git| reset_to_manifest(git, &repo))?;
        }

        let manifest_file = dir.join(&import.manifest);
        self.load_file(&manifest_file, &root.join(&import.root), import.cycle_key())
    }

    /// The old import form names only a project; it must already be local
    /// and its manifest file defaults to "manifest" at the project root.
    fn old_style_import(&mut self, import: &Import, root: &Path) -> Result<()> {
        let project = self
            .local
            .values()
            .find(|p| p.name == import.name)
            .ok_or_else(|| {
                Error::message(format!(
                    "import {:?} names no locally checked-out project",
                    import.name
                ))
            })?;
        let manifest_name = if import.manifest.is_empty() {
            "manifest"
        } else {
            &import.manifest
        };
        let cycle_key = format!("{} + {}", project.remote, manifest_name);
        let file = project.path.join(manifest_name);
        self.load_file(&file, root, cycle_key)
    }

    fn scratch_clone(&mut self, repo: &Project) -> Result<PathBuf> {
        if self.scratch.is_none() {
            let state_dir = self.ws.state_dir();
            std::fs::create_dir_all(&state_dir)?;
            self.scratch = Some(
                tempfile::Builder::new()
                    .prefix("imports.")
                    .tempdir_in(&state_dir)?,
            );
        }
        let scratch = self.scratch.as_ref().expect("just created");
        let dir = scratch.path().join(repo.name.replace('/', "_"));
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
            let git = vcs::for_protocol(&repo.protocol, scratch.path())?;
            git.clone_repo(&repo.remote, &dir)
                .map_err(|e| Error::Vcs(format!("cloning import {}: {e}", repo.remote)))?;
            // The clone checks out the remote default branch; keep the
            // conventional local branch like any other checkout.
            let clone = vcs::for_protocol(&repo.protocol, &dir)?;
            if clone.checkout(LOCAL_BRANCH).is_err() {
                clone.create_and_checkout(LOCAL_BRANCH)?;
            }
        }
        Ok(dir)
    }

    fn finish(self) -> Result<Loaded> {
        let Loader {
            projects,
            tools,
            hooks,
            hosts,
            scratch,
            ..
        } = self;

        let mut projects = projects;
        projects.sort_keys();

        let mut resolved = Hooks::new();
        for mut hook in hooks {
            let mut owners = projects.values().filter(|p| p.name == hook.project);
            let owner = owners.next().ok_or_else(|| Error::DanglingHook {
                hook: hook.name.clone(),
                project: hook.project.clone(),
            })?;
            if owners.next().is_some() {
                return Err(Error::message(format!(
                    "hook {:?} references ambiguous project name {:?}",
                    hook.name, hook.project
                )));
            }
            if !hook.path.is_absolute() {
                hook.path = owner.path.join(&hook.path);
            }
            match resolved.get(&hook.name) {
                Some(existing) if *existing == hook => {}
                Some(_) => {
                    return Err(Error::message(format!(
                        "duplicate hook {:?} with conflicting definition",
                        hook.name
                    )));
                }
                None => {
                    resolved.insert(hook.name.clone(), hook);
                }
            }
        }

        Ok(Loaded {
            projects,
            tools,
            hooks: resolved,
            hosts,
            scratch,
        })
    }
}
