//! Manifest model.
//!
//! A manifest declares the desired shape of the workspace: the projects to
//! check out, tools to build after an update, hooks to run, and imports
//! pulling in further manifests (from a relative file path or from another
//! repository). [`xml`] maps the model to the on-disk form; [`loader`]
//! resolves the import graph into flattened [`Projects`], [`Tools`] and
//! [`Hooks`] maps.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::vcs::GIT_PROTOCOL;

pub mod loader;
pub mod xml;

/// Separator between the name and remote halves of a [`ProjectKey`].
/// Forbidden in project names.
pub const KEY_SEPARATOR: char = '=';

/// Default tracking branch when a project declares none.
pub const DEFAULT_BRANCH: &str = "master";

/// The conventional local checkout branch. Every project's working copy
/// keeps one local branch of this name, reset to the tracking branch (or
/// pinned revision) at update time, whatever the remote branch is called.
pub const LOCAL_BRANCH: &str = "master";

/// Revision literal meaning "tip of the tracking branch at update time".
pub const HEAD_REVISION: &str = "HEAD";

/// Flattened project set, keyed by [`ProjectKey`].
pub type Projects = IndexMap<ProjectKey, Project>;
/// Flattened tool set, keyed by tool name.
pub type Tools = IndexMap<String, Tool>;
/// Flattened hook set, keyed by hook name.
pub type Hooks = IndexMap<String, Hook>;

/// Primary identity of a project: its name plus the remote it tracks.
/// Two checkouts of the same remote under different names are distinct
/// projects; so are two remotes published under one name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectKey(String);

impl ProjectKey {
    pub fn new(name: &str, remote: &str) -> Self {
        ProjectKey(format!("{name}{KEY_SEPARATOR}{remote}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A checked-out repository with an assigned path and tracked revision.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Project {
    pub name: String,
    /// Relative to the workspace root in files; absolutised at load time.
    pub path: PathBuf,
    pub protocol: String,
    pub remote: String,
    /// Branch on the remote this project follows.
    pub remote_branch: String,
    /// Commit-ish; [`HEAD_REVISION`] means tip-of-tracking-branch.
    pub revision: String,
    pub gerrit_host: Option<String>,
    /// Directory of git-hook payloads installed into `.git/hooks`.
    pub git_hooks: Option<PathBuf>,
    /// Script run after each create/move/update touching this project.
    pub run_hook: Option<PathBuf>,
}

impl Project {
    pub fn key(&self) -> ProjectKey {
        ProjectKey::new(&self.name, &self.remote)
    }

    /// Apply defaults and validate. Every project entering the engine goes
    /// through this; serialisation applies [`Project::unfill_defaults`] on
    /// the way out so the two are inverses.
    pub fn fill_defaults(&mut self) -> Result<()> {
        if self.name.contains(KEY_SEPARATOR) {
            return Err(Error::message(format!(
                "project name {:?} contains reserved character {KEY_SEPARATOR:?}",
                self.name
            )));
        }
        if self.protocol.is_empty() {
            self.protocol = GIT_PROTOCOL.to_string();
        }
        if self.protocol != GIT_PROTOCOL {
            return Err(Error::UnsupportedProtocol {
                protocol: self.protocol.clone(),
                name: self.name.clone(),
            });
        }
        if self.remote_branch.is_empty() {
            self.remote_branch = DEFAULT_BRANCH.to_string();
        }
        if self.revision.is_empty() {
            self.revision = HEAD_REVISION.to_string();
        }
        Ok(())
    }

    /// Strip default-valued fields before serialisation.
    pub fn unfill_defaults(&mut self) {
        if self.protocol == GIT_PROTOCOL {
            self.protocol.clear();
        }
        if self.remote_branch == DEFAULT_BRANCH {
            self.remote_branch.clear();
        }
        if self.revision == HEAD_REVISION {
            self.revision.clear();
        }
    }

    /// The revision is pinned to a concrete commit-ish rather than
    /// floating at the tracking branch tip.
    pub fn has_pinned_revision(&self) -> bool {
        self.revision != HEAD_REVISION
    }

    /// Rewrite `path` to be absolute under `root`, applying the import
    /// subtree `prefix` first.
    pub fn absolutize_path(&mut self, root: &Path, prefix: &Path) {
        if self.path.is_absolute() {
            return;
        }
        self.path = root.join(prefix).join(&self.path);
    }

    /// Rewrite `path` to be relative to `root` (the stored form).
    pub fn relativize_path(&mut self, root: &Path) {
        if let Ok(relative) = self.path.strip_prefix(root) {
            self.path = relative.to_path_buf();
        }
    }
}

/// A remote import: a manifest file inside another repository. The import
/// repo is itself a project (cloned into the scratch area when not
/// already local). An import with an empty `remote` is the old-style form
/// carrying only a name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Import {
    pub name: String,
    pub remote: String,
    /// Manifest file within the import repository.
    pub manifest: String,
    /// Prefix prepended to the paths of every project the import declares.
    pub root: String,
    pub protocol: String,
    pub remote_branch: String,
}

impl Import {
    pub fn is_old_style(&self) -> bool {
        self.remote.is_empty()
    }

    /// The project record describing the import repository itself.
    pub fn as_project(&self) -> Project {
        Project {
            name: self.name.clone(),
            path: PathBuf::from(&self.name),
            protocol: self.protocol.clone(),
            remote: self.remote.clone(),
            remote_branch: self.remote_branch.clone(),
            revision: String::new(),
            ..Project::default()
        }
    }

    /// Key distinguishing remote-import recursion on the cycle stack.
    /// The separator is not URL-legal, so `.../a/b` + `c` and `.../a` +
    /// `b/c` never collapse into one key.
    pub fn cycle_key(&self) -> String {
        format!("{} + {}", self.remote, self.manifest)
    }
}

/// A file import: another manifest file, relative to the importing one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileImport {
    pub file: String,
}

/// A helper binary built from a project's source after an update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tool {
    pub name: String,
    /// Name of the project containing the tool's source.
    pub project: String,
    /// Package path within the project.
    pub package: String,
    /// Data directory installed next to the binary.
    pub data: String,
}

/// A post-update script. `path` is declared relative to the named
/// project's directory; the loader resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hook {
    pub name: String,
    /// Name of the project supplying the script.
    pub project: String,
    pub path: PathBuf,
    pub interpreter: Option<String>,
    pub args: Vec<String>,
}

/// A git-hook payload installed into project `.git/hooks` directories.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostHook {
    pub name: String,
    pub path: PathBuf,
}

/// A named base URL for a class of remotes ("git", "gerrit"), optionally
/// carrying git-hook payloads for projects on that host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Host {
    pub kind: String,
    pub location: String,
    pub git_hooks: Vec<HostHook>,
}

/// An ordered manifest tree, as read from one file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    /// How this manifest was obtained, when it is a snapshot.
    pub label: Option<String>,
    pub imports: Vec<Import>,
    pub file_imports: Vec<FileImport>,
    pub projects: Vec<Project>,
    pub tools: Vec<Tool>,
    pub hooks: Vec<Hook>,
    pub hosts: Vec<Host>,
}

impl Manifest {
    /// Apply [`Project::fill_defaults`] to every project.
    pub fn fill_defaults(&mut self) -> Result<()> {
        for project in &mut self.projects {
            project.fill_defaults()?;
        }
        Ok(())
    }

    /// Build a snapshot manifest from a flattened project set, with paths
    /// stored relative to `root`.
    pub fn snapshot_of(projects: &Projects, root: &Path, label: &str) -> Manifest {
        let mut listed: Vec<Project> = projects.values().cloned().collect();
        listed.sort_by(|a, b| a.key().cmp(&b.key()));
        for project in &mut listed {
            project.relativize_path(root);
        }
        Manifest {
            label: Some(label.to_string()),
            projects: listed,
            ..Manifest::default()
        }
    }
}

/// Create or extend the manifest at `path` with a remote import.
/// Declaring the same import twice is an error.
pub fn add_remote_import(path: &Path, import: Import) -> Result<()> {
    let mut manifest = if path.exists() {
        xml::read_manifest(path)?
    } else {
        Manifest::default()
    };
    let duplicate = manifest
        .imports
        .iter()
        .any(|existing| existing.name == import.name && existing.remote == import.remote);
    if duplicate {
        return Err(Error::message(format!(
            "import {:?} from {:?} is already declared",
            import.name, import.remote
        )));
    }
    manifest.imports.push(import);
    xml::write_manifest(path, &manifest)
}
