//! Remote-import resolution against real git remotes.

mod common;

use std::path::PathBuf;

use common::{TestUniverse, git};
use grove::error::{CycleKind, Error};
use grove::manifest::{Import, Manifest, xml};

/// Write `manifest` as the file `name` inside the `layers` remote.
fn publish_manifest(universe: &TestUniverse, repo: &str, name: &str, manifest: &Manifest) {
    let seed = universe.seed_path(repo);
    std::fs::write(seed.join(name), xml::to_bytes(manifest).unwrap()).unwrap();
    git(&seed, &["add", "-A"]);
    git(&seed, &["commit", "-m", "publish manifest"]);
    git(&seed, &["push", "origin", "master"]);
}

fn layers_import(universe: &TestUniverse, root: &str) -> Import {
    Import {
        name: "layers".to_string(),
        remote: universe.remote_path("layers").to_string_lossy().into_owned(),
        manifest: "default".to_string(),
        root: root.to_string(),
        ..Import::default()
    }
}

#[test]
fn remote_import_clones_and_flattens() {
    let universe = TestUniverse::new();
    universe.create_remote("extra");
    universe.commit_remote("extra", "content", "imported", "first");
    universe.create_remote("layers");
    publish_manifest(
        &universe,
        "layers",
        "default",
        &Manifest {
            projects: vec![universe.project("extra")],
            ..Manifest::default()
        },
    );

    universe.write_root_manifest(&Manifest {
        imports: vec![layers_import(&universe, "")],
        ..Manifest::default()
    });
    universe.update().unwrap();

    assert_eq!(universe.read_file("extra/content"), "imported");

    // The scratch clone area is gone once the load is over.
    let leftovers: Vec<String> = std::fs::read_dir(universe.ws.state_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("imports."))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn import_root_prefix_reparents_projects() {
    let universe = TestUniverse::new();
    universe.create_remote("extra");
    universe.commit_remote("extra", "content", "imported", "first");
    universe.create_remote("layers");
    publish_manifest(
        &universe,
        "layers",
        "default",
        &Manifest {
            projects: vec![universe.project("extra")],
            ..Manifest::default()
        },
    );

    universe.write_root_manifest(&Manifest {
        imports: vec![layers_import(&universe, "third_party")],
        ..Manifest::default()
    });
    universe.update().unwrap();

    assert_eq!(
        universe.read_file("third_party/extra/content"),
        "imported"
    );
}

#[test]
fn remote_import_cycle_is_detected() {
    let universe = TestUniverse::new();
    universe.create_remote("layers");
    // The published manifest imports its own repository and file again.
    publish_manifest(
        &universe,
        "layers",
        "default",
        &Manifest {
            imports: vec![layers_import(&universe, "")],
            ..Manifest::default()
        },
    );

    universe.write_root_manifest(&Manifest {
        imports: vec![layers_import(&universe, "")],
        ..Manifest::default()
    });
    let err = universe.update().unwrap_err();
    assert!(
        matches!(
            err,
            Error::CycleDetected {
                kind: CycleKind::Remote,
                ..
            }
        ),
        "{err}"
    );
}

#[test]
fn update_refreshes_import_repositories() {
    let universe = TestUniverse::new();
    universe.create_remote("extra");
    universe.commit_remote("extra", "content", "v1", "first");
    universe.create_remote("layers");
    publish_manifest(
        &universe,
        "layers",
        "default",
        &Manifest {
            projects: vec![universe.project("extra")],
            ..Manifest::default()
        },
    );
    universe.write_root_manifest(&Manifest {
        imports: vec![layers_import(&universe, "")],
        ..Manifest::default()
    });
    universe.update().unwrap();

    // Re-publish the import manifest with the project re-parented; the
    // next update must read the fresh manifest, not a stale clone.
    let mut moved = universe.project("extra");
    moved.path = PathBuf::from("relocated/extra");
    publish_manifest(
        &universe,
        "layers",
        "default",
        &Manifest {
            projects: vec![moved],
            ..Manifest::default()
        },
    );
    universe.update().unwrap();
    assert_eq!(universe.read_file("relocated/extra/content"), "v1");
}

#[test]
fn snapshot_describes_the_workspace() {
    let universe = TestUniverse::new();
    universe.create_remote("p");
    let tip = universe.commit_remote("p", "content", "v1", "first");
    universe.write_projects(vec![universe.project("p")]);
    universe.update().unwrap();

    let snapshot = grove::update::snapshot_workspace(&universe.ws).unwrap();
    assert_eq!(snapshot.projects.len(), 1);
    let project = &snapshot.projects[0];
    assert_eq!(project.name, "p");
    assert_eq!(project.path, PathBuf::from("p"));
    assert_eq!(project.revision, tip);
}
