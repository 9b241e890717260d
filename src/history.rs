//! Update-history store.
//!
//! An append-only directory of snapshot manifests, one per successful
//! update, named by RFC-3339 timestamp. Two symlinks track recency:
//! `latest` points at the newest snapshot, `second-latest` at the one
//! before it. Both are relative, so the directory can be moved or mounted
//! elsewhere without dangling.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::{Manifest, xml};

pub const LATEST: &str = "latest";
pub const SECOND_LATEST: &str = "second-latest";

/// Append a snapshot and rewire the `latest`/`second-latest` links.
pub fn add_snapshot(dir: &Path, manifest: &Manifest) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let file = dir.join(snapshot_name(dir));
    xml::write_manifest(&file, manifest)?;

    // The outgoing `latest` becomes `second-latest` before rewiring.
    if let Some(previous) = link_target(&dir.join(LATEST)) {
        relink(&dir.join(SECOND_LATEST), &previous)?;
    }
    let relative = pathdiff::diff_paths(&file, dir)
        .ok_or_else(|| Error::message("history snapshot is outside its own directory"))?;
    relink(&dir.join(LATEST), &relative)?;
    Ok(file)
}

/// The snapshot `latest` points at, if the store has one.
pub fn latest_snapshot(dir: &Path) -> Option<PathBuf> {
    let target = link_target(&dir.join(LATEST))?;
    let path = dir.join(target);
    path.exists().then_some(path)
}

pub fn read_latest(dir: &Path) -> Result<Option<Manifest>> {
    match latest_snapshot(dir) {
        Some(path) => Ok(Some(xml::read_manifest(&path)?)),
        None => Ok(None),
    }
}

/// Timestamped file name, disambiguated when two updates land within the
/// same clock reading.
fn snapshot_name(dir: &Path) -> String {
    let stamp = chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false);
    let mut name = stamp.clone();
    let mut counter = 1;
    while dir.join(&name).exists() {
        name = format!("{stamp}.{counter}");
        counter += 1;
    }
    name
}

fn link_target(link: &Path) -> Option<PathBuf> {
    std::fs::read_link(link).ok()
}

/// Atomic-enough rewire: remove-then-symlink. A reader racing the rename
/// sees either the old target or none, never a partial link.
fn relink(link: &Path, target: &Path) -> Result<()> {
    match std::fs::remove_file(link) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }
    symlink(target, link)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(Error::Io)
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    // No symlinks to speak of; a copy keeps `latest` readable.
    let source = link.parent().unwrap_or(Path::new(".")).join(target);
    std::fs::copy(source, link).map(|_| ()).map_err(Error::Io)
}
