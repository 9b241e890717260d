//! Reconciliation planner.
//!
//! Diffs the on-disk project set against the flattened manifest set and
//! emits a totally ordered operation list. Ordering is by kind first —
//! delete, move, create, update, null — so a delete vacates a directory
//! before a create reoccupies it and moves land before the creates that
//! may nest under their destinations; ties break by ascending project
//! path, putting outer creates ahead of inner ones.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::manifest::{Project, Projects};

/// Operation kind. Declaration order is execution priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OpKind {
    Delete,
    Move,
    Create,
    Update,
    Null,
}

/// One planned filesystem/VCS action.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    /// Target state for create/move/update/null; the local record for
    /// delete.
    pub project: Project,
    /// On-disk path the operation starts from (move/update/delete/null).
    pub source: Option<PathBuf>,
    /// Path the operation ends at (create/move/update/null).
    pub destination: Option<PathBuf>,
    /// Whether a delete may actually remove the tree.
    pub gc: bool,
}

impl Operation {
    /// Path used for tie-breaking within one kind.
    pub fn sort_path(&self) -> &Path {
        self.destination
            .as_deref()
            .or(self.source.as_deref())
            .unwrap_or_else(|| Path::new(""))
    }

    pub fn describe(&self) -> String {
        match self.kind {
            OpKind::Create => format!(
                "create project {:?} at {}",
                self.project.name,
                self.sort_path().display()
            ),
            OpKind::Move => format!(
                "move project {:?} from {} to {}",
                self.project.name,
                self.source.as_deref().unwrap_or_else(|| Path::new("?")).display(),
                self.sort_path().display()
            ),
            OpKind::Update => format!(
                "update project {:?} at {} to {}",
                self.project.name,
                self.sort_path().display(),
                self.project.revision
            ),
            OpKind::Delete => format!(
                "delete project {:?} at {}",
                self.project.name,
                self.sort_path().display()
            ),
            OpKind::Null => format!(
                "project {:?} at {} is up to date",
                self.project.name,
                self.sort_path().display()
            ),
        }
    }
}

/// Compute the ordered plan taking `local` to `remote`.
pub fn plan(local: &Projects, remote: &Projects, gc: bool) -> Vec<Operation> {
    let keys: BTreeSet<_> = local.keys().chain(remote.keys()).cloned().collect();
    let mut ops = Vec::with_capacity(keys.len());
    for key in keys {
        let op = match (local.get(&key), remote.get(&key)) {
            (None, Some(want)) => Operation {
                kind: OpKind::Create,
                project: want.clone(),
                source: None,
                destination: Some(want.path.clone()),
                gc: false,
            },
            (Some(have), None) => Operation {
                kind: OpKind::Delete,
                project: have.clone(),
                source: Some(have.path.clone()),
                destination: None,
                gc,
            },
            (Some(have), Some(want)) if have.path != want.path => Operation {
                kind: OpKind::Move,
                project: want.clone(),
                source: Some(have.path.clone()),
                destination: Some(want.path.clone()),
                gc: false,
            },
            (Some(have), Some(want)) if have.revision != want.revision => Operation {
                kind: OpKind::Update,
                project: want.clone(),
                source: Some(have.path.clone()),
                destination: Some(want.path.clone()),
                gc: false,
            },
            (Some(have), Some(want)) => Operation {
                kind: OpKind::Null,
                project: want.clone(),
                source: Some(have.path.clone()),
                destination: Some(want.path.clone()),
                gc: false,
            },
            (None, None) => unreachable!("key came from one of the maps"),
        };
        ops.push(op);
    }
    ops.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.sort_path().cmp(b.sort_path()))
    });
    ops
}
