//! Project state reporting over a real workspace.

mod common;

use common::{TestUniverse, git};
use grove::report;
use grove::workspace::{METADATA_DIR, REVIEW_MESSAGE_DIR};

#[test]
fn reports_branches_dirt_and_review_markers() {
    let universe = TestUniverse::new();
    for name in ["a", "b"] {
        universe.create_remote(name);
        universe.commit_remote(name, "content", "v1", "first");
    }
    universe.write_projects(vec![universe.project("a"), universe.project("b")]);
    universe.update().unwrap();

    let a = universe.checkout_dir("a");
    git(&a, &["checkout", "-b", "feature"]);
    std::fs::write(a.join("content"), "dirty").unwrap();
    let review_dir = a.join(METADATA_DIR).join(REVIEW_MESSAGE_DIR);
    std::fs::create_dir_all(&review_dir).unwrap();
    std::fs::write(review_dir.join("feature"), "message draft").unwrap();

    let states = report::project_states(&universe.ws, true).unwrap();
    assert_eq!(states.len(), 2);

    let state_a = states.iter().find(|s| s.name == "a").unwrap();
    assert_eq!(state_a.current_branch, "feature");
    assert_eq!(state_a.has_uncommitted, Some(true));
    let feature = state_a
        .branches
        .iter()
        .find(|b| b.name == "feature")
        .unwrap();
    assert!(feature.has_review_message);
    let master = state_a.branches.iter().find(|b| b.name == "master").unwrap();
    assert!(!master.has_review_message);

    let state_b = states.iter().find(|s| s.name == "b").unwrap();
    assert_eq!(state_b.current_branch, "master");
    assert_eq!(state_b.has_uncommitted, Some(false));
    assert_eq!(state_b.has_untracked, Some(false));
}

#[test]
fn states_come_back_sorted_by_name() {
    let universe = TestUniverse::new();
    for name in ["zeta", "alpha"] {
        universe.create_remote(name);
        universe.commit_remote(name, "content", "v1", "first");
    }
    universe.write_projects(vec![universe.project("zeta"), universe.project("alpha")]);
    universe.update().unwrap();

    let states = report::project_states(&universe.ws, false).unwrap();
    let names: Vec<_> = states.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}
