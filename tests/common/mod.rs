// Helpers are shared across integration test files; not every file uses
// every helper.
#![allow(dead_code)]

//! Test harness: real git repositories in a temp directory.
//!
//! A [`TestUniverse`] holds a workspace root plus a set of bare "remote"
//! repositories, each with a seed working clone for authoring commits.
//! Git commands run with an isolated environment (no user or system
//! config, fixed committer identity) so tests behave the same on any
//! machine.

use std::path::{Path, PathBuf};
use std::process::Command;

use grove::error::Result;
use grove::manifest::{Manifest, Project, xml};
use grove::update::{self, UpdateOptions, UpdateSummary};
use grove::workspace::Workspace;
use tempfile::TempDir;

pub struct TestUniverse {
    pub dir: TempDir,
    pub ws: Workspace,
}

impl TestUniverse {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("ws/.grove_root")).unwrap();
        std::fs::create_dir_all(dir.path().join("remotes")).unwrap();
        std::fs::create_dir_all(dir.path().join("seeds")).unwrap();
        let ws = Workspace::at(dir.path().join("ws")).unwrap();
        TestUniverse { dir, ws }
    }

    /// Create a bare remote plus a seed clone, with one initial commit so
    /// `master` exists.
    pub fn create_remote(&self, name: &str) -> String {
        let remote = self.remote_path(name);
        git(self.dir.path(), &["init", "--bare", remote.to_str().unwrap()]);
        let seed = self.seed_path(name);
        git(
            self.dir.path(),
            &["clone", remote.to_str().unwrap(), seed.to_str().unwrap()],
        );
        // Deterministic identity for commits made through plain `git
        // commit` in this seed, and for any stash the engine creates.
        git(&seed, &["config", "user.name", "Grove Test"]);
        git(&seed, &["config", "user.email", "grove@test.invalid"]);
        self.commit_remote(name, "README", &format!("{name}\n"), "initial")
    }

    /// Commit `content` to `file` on master in `name`'s seed and push.
    /// Returns the new commit id.
    pub fn commit_remote(&self, name: &str, file: &str, content: &str, message: &str) -> String {
        let seed = self.seed_path(name);
        std::fs::write(seed.join(file), content).unwrap();
        git(&seed, &["add", "-A"]);
        git(&seed, &["commit", "-m", message]);
        git(&seed, &["push", "origin", "master"]);
        rev_parse(&seed, "HEAD")
    }

    /// Commit on a non-master branch of `name`'s remote; leaves the seed
    /// back on master.
    pub fn commit_remote_on(
        &self,
        name: &str,
        branch: &str,
        file: &str,
        content: &str,
        message: &str,
    ) -> String {
        let seed = self.seed_path(name);
        if git_ok(&seed, &["rev-parse", "--verify", &format!("refs/heads/{branch}")]) {
            git(&seed, &["checkout", branch]);
        } else {
            git(&seed, &["checkout", "-b", branch]);
        }
        std::fs::write(seed.join(file), content).unwrap();
        git(&seed, &["add", "-A"]);
        git(&seed, &["commit", "-m", message]);
        git(&seed, &["push", "origin", branch]);
        let revision = rev_parse(&seed, "HEAD");
        git(&seed, &["checkout", "master"]);
        revision
    }

    pub fn remote_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("remotes").join(format!("{name}.git"))
    }

    pub fn seed_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("seeds").join(name)
    }

    /// A manifest project record for `name`, path `name`, tracking master.
    pub fn project(&self, name: &str) -> Project {
        Project {
            name: name.to_string(),
            path: PathBuf::from(name),
            remote: self.remote_path(name).to_string_lossy().into_owned(),
            ..Project::default()
        }
    }

    pub fn write_root_manifest(&self, manifest: &Manifest) {
        xml::write_manifest(&self.ws.root_manifest(), manifest).unwrap();
    }

    pub fn write_projects(&self, projects: Vec<Project>) {
        self.write_root_manifest(&Manifest {
            projects,
            ..Manifest::default()
        });
    }

    pub fn update(&self) -> Result<UpdateSummary> {
        update::update_workspace(&self.ws, UpdateOptions::default())
    }

    pub fn update_gc(&self) -> Result<UpdateSummary> {
        update::update_workspace(
            &self.ws,
            UpdateOptions {
                gc: true,
                ..UpdateOptions::default()
            },
        )
    }

    pub fn checkout_dir(&self, name: &str) -> PathBuf {
        self.ws.root().join(name)
    }

    pub fn read_file(&self, rel: &str) -> String {
        std::fs::read_to_string(self.ws.root().join(rel)).unwrap()
    }
}

/// Run git with an isolated environment; panic on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "init.defaultBranch=master", "-c", "protocol.file.allow=always"])
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_SYSTEM", "/dev/null")
        .env("GIT_AUTHOR_NAME", "Grove Test")
        .env("GIT_AUTHOR_EMAIL", "grove@test.invalid")
        .env("GIT_COMMITTER_NAME", "Grove Test")
        .env("GIT_COMMITTER_EMAIL", "grove@test.invalid")
        .output()
        .expect("git should be installed");
    assert!(
        output.status.success(),
        "git {args:?} in {} failed:\n{}",
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Like [`git`], but report success instead of panicking.
pub fn git_ok(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_SYSTEM", "/dev/null")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn rev_parse(dir: &Path, rev: &str) -> String {
    git(dir, &["rev-parse", rev]).trim().to_string()
}
