//! Review-server change aggregation.
//!
//! Consumes already-parsed change records and answers two questions for
//! the review-integration flow: which cross-project multi-part change
//! sets are complete, and which changes are new since the previous
//! query. Wire parsing happens elsewhere; this module only mines commit
//! messages and groups records.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// A parsed change record from the review server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Project the change belongs to.
    pub project: String,
    /// Server-side topic; empty when the change has none.
    pub topic: String,
    /// `refs/changes/NN/CCCC/PP`; empty for changes without one.
    pub reference: String,
    /// Commit message of the change's current revision.
    pub commit_message: String,
}

impl Change {
    pub fn reference(&self) -> &str {
        &self.reference
    }
}

/// Which pre-submit tests a change asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresubmitTest {
    #[default]
    All,
    None,
}

/// `MultiPart: i/n` tag mined from a commit message, tied to the
/// change's topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiPartInfo {
    pub topic: String,
    pub index: u32,
    pub total: u32,
}

/// Everything mined from one commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeAttributes {
    pub multi_part: Option<MultiPartInfo>,
    pub presubmit: PresubmitTest,
    pub auto_submit: bool,
}

static MULTI_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"MultiPart:\s*(\d+)/(\d+)").expect("static regex"));
static PRESUBMIT_NONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"PresubmitTest:\s*none").expect("static regex"));

/// Mine the multi-part tag, pre-submit selector and auto-submit flag
/// from a change's commit message.
pub fn mine_attributes(change: &Change) -> Result<ChangeAttributes> {
    let message = &change.commit_message;
    let multi_part = match MULTI_PART.captures(message) {
        Some(captures) => {
            let index: u32 = captures[1]
                .parse()
                .map_err(|_| Error::Parse(format!("multi-part index {:?} overflows", &captures[1])))?;
            let total: u32 = captures[2]
                .parse()
                .map_err(|_| Error::Parse(format!("multi-part total {:?} overflows", &captures[2])))?;
            if index == 0 || index > total {
                return Err(Error::Parse(format!(
                    "multi-part tag {index}/{total} is out of range"
                )));
            }
            if change.topic.is_empty() {
                return Err(Error::Parse(format!(
                    "change {} declares MultiPart but has no topic",
                    change.reference
                )));
            }
            Some(MultiPartInfo {
                topic: change.topic.clone(),
                index,
                total,
            })
        }
        None => None,
    };
    let presubmit = if PRESUBMIT_NONE.is_match(message) {
        PresubmitTest::None
    } else {
        PresubmitTest::All
    };
    Ok(ChangeAttributes {
        multi_part,
        presubmit,
        auto_submit: message.contains("AutoSubmit"),
    })
}

/// A multi-part change set accumulating under one topic.
#[derive(Debug, Default)]
pub struct MultiPartSet {
    parts: BTreeMap<u32, Change>,
    expected_total: u32,
    expected_topic: String,
}

impl MultiPartSet {
    pub fn new() -> Self {
        MultiPartSet::default()
    }

    /// Add one piece. Fails when the change carries no multi-part info,
    /// disagrees with the set's established topic or total, or collides
    /// with a piece already stored at its index.
    pub fn add(&mut self, change: Change) -> Result<()> {
        let attrs = mine_attributes(&change)?;
        let Some(info) = attrs.multi_part else {
            return Err(Error::message(format!(
                "change {} has no multi-part info",
                change.reference
            )));
        };
        if self.parts.is_empty() {
            self.expected_total = info.total;
            self.expected_topic = info.topic.clone();
        } else {
            if info.total != self.expected_total {
                return Err(Error::message(format!(
                    "change {} expects {} parts, set expects {}",
                    change.reference, info.total, self.expected_total
                )));
            }
            if info.topic != self.expected_topic {
                return Err(Error::message(format!(
                    "change {} has topic {:?}, set has {:?}",
                    change.reference, info.topic, self.expected_topic
                )));
            }
        }
        if self.parts.contains_key(&info.index) {
            return Err(Error::message(format!(
                "set already holds part {} of topic {:?}",
                info.index, self.expected_topic
            )));
        }
        self.parts.insert(info.index, change);
        Ok(())
    }

    /// Every declared part has arrived.
    pub fn is_complete(&self) -> bool {
        self.expected_total > 0 && self.parts.len() as u32 == self.expected_total
    }

    pub fn topic(&self) -> &str {
        &self.expected_topic
    }

    /// Pieces in part order.
    pub fn into_parts(self) -> Vec<Change> {
        self.parts.into_values().collect()
    }
}

/// A parsed `refs/changes/NN/CCCC/PP` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRef {
    pub change_number: u32,
    pub patchset: u32,
}

/// Parse a change reference: exactly five slash-separated segments, a
/// two-digit suffix, and positive change/patchset numbers.
pub fn parse_reference(reference: &str) -> Result<ChangeRef> {
    let invalid = || Error::InvalidReference(reference.to_string());
    let segments: Vec<&str> = reference.split('/').collect();
    if segments.len() != 5 {
        return Err(invalid());
    }
    if segments[0] != "refs" || segments[1] != "changes" {
        return Err(invalid());
    }
    let suffix = segments[2];
    if suffix.len() != 2 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let change_number: u32 = segments[3].parse().map_err(|_| invalid())?;
    let patchset: u32 = segments[4].parse().map_err(|_| invalid())?;
    if change_number == 0 || patchset == 0 {
        return Err(invalid());
    }
    Ok(ChangeRef {
        change_number,
        patchset,
    })
}

/// Group the changes that are new since the previous query.
///
/// `previous` holds the references the last query saw. New single-part
/// changes come back as one-element groups; new multi-part changes pull
/// in *every* current piece of their topic, and only complete sets are
/// emitted. Per-piece errors are collected alongside the groups; they
/// are for logging, not for aborting.
pub fn new_open_changes(
    previous: &HashSet<String>,
    current: &[Change],
) -> (Vec<Vec<Change>>, Vec<Error>) {
    let mut groups = Vec::new();
    let mut errors = Vec::new();
    let mut new_topics = BTreeSet::new();

    for change in current {
        if change.reference.is_empty() {
            continue;
        }
        if previous.contains(&change.reference) {
            continue;
        }
        let attrs = match mine_attributes(change) {
            Ok(attrs) => attrs,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        match attrs.multi_part {
            None => groups.push(vec![change.clone()]),
            Some(info) => {
                new_topics.insert(info.topic);
            }
        }
    }

    for topic in new_topics {
        let mut set = MultiPartSet::new();
        for change in current {
            if change.reference.is_empty() || change.topic != topic {
                continue;
            }
            let is_multi_part = matches!(
                mine_attributes(change),
                Ok(ChangeAttributes {
                    multi_part: Some(_),
                    ..
                })
            );
            if !is_multi_part {
                continue;
            }
            if let Err(e) = set.add(change.clone()) {
                errors.push(e);
            }
        }
        if set.is_complete() {
            groups.push(set.into_parts());
        }
    }

    (groups, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(reference: &str, topic: &str, message: &str) -> Change {
        Change {
            project: "p".to_string(),
            topic: topic.to_string(),
            reference: reference.to_string(),
            commit_message: message.to_string(),
        }
    }

    fn part(reference: &str, topic: &str, index: u32, total: u32) -> Change {
        change(
            reference,
            topic,
            &format!("Do things\n\nMultiPart: {index}/{total}\n"),
        )
    }

    #[test]
    fn mines_multi_part_tag() {
        let attrs = mine_attributes(&part("refs/changes/00/1000/1", "T1", 1, 2)).unwrap();
        let info = attrs.multi_part.unwrap();
        assert_eq!(info.topic, "T1");
        assert_eq!(info.index, 1);
        assert_eq!(info.total, 2);
    }

    #[test]
    fn index_above_total_is_a_parse_error() {
        let c = part("refs/changes/00/1000/1", "T1", 3, 2);
        assert!(mine_attributes(&c).is_err());
    }

    #[test]
    fn index_zero_is_a_parse_error() {
        let c = part("refs/changes/00/1000/1", "T1", 0, 2);
        assert!(mine_attributes(&c).is_err());
    }

    #[test]
    fn presubmit_defaults_to_all() {
        let attrs = mine_attributes(&change("r", "", "Fix a bug\n")).unwrap();
        assert_eq!(attrs.presubmit, PresubmitTest::All);
        assert!(!attrs.auto_submit);
    }

    #[test]
    fn presubmit_none_and_auto_submit_are_mined() {
        let attrs = mine_attributes(&change(
            "r",
            "",
            "Fix a bug\n\nPresubmitTest: none\nAutoSubmit\n",
        ))
        .unwrap();
        assert_eq!(attrs.presubmit, PresubmitTest::None);
        assert!(attrs.auto_submit);
    }

    #[test]
    fn add_rejects_single_part_changes() {
        let mut set = MultiPartSet::new();
        assert!(set.add(change("r", "T", "no tag")).is_err());
    }

    #[test]
    fn add_rejects_total_mismatch() {
        let mut set = MultiPartSet::new();
        set.add(part("r1", "T", 1, 2)).unwrap();
        assert!(set.add(part("r2", "T", 2, 3)).is_err());
    }

    #[test]
    fn add_rejects_topic_mismatch() {
        let mut set = MultiPartSet::new();
        set.add(part("r1", "T", 1, 2)).unwrap();
        assert!(set.add(part("r2", "U", 2, 2)).is_err());
    }

    #[test]
    fn add_rejects_duplicate_index() {
        let mut set = MultiPartSet::new();
        set.add(part("r1", "T", 1, 2)).unwrap();
        assert!(set.add(part("r2", "T", 1, 2)).is_err());
    }

    #[test]
    fn completion_needs_every_part() {
        let mut set = MultiPartSet::new();
        set.add(part("r1", "T", 1, 2)).unwrap();
        assert!(!set.is_complete());
        set.add(part("r2", "T", 2, 2)).unwrap();
        assert!(set.is_complete());
    }

    #[test]
    fn add_order_does_not_matter() {
        let pieces = [
            part("r1", "T", 1, 3),
            part("r2", "T", 2, 3),
            part("r3", "T", 3, 3),
        ];
        let mut forward = MultiPartSet::new();
        for piece in pieces.iter().cloned() {
            forward.add(piece).unwrap();
        }
        let mut backward = MultiPartSet::new();
        for piece in pieces.iter().rev().cloned() {
            backward.add(piece).unwrap();
        }
        assert_eq!(forward.into_parts(), backward.into_parts());
    }

    #[test]
    fn parse_reference_accepts_well_formed() {
        let parsed = parse_reference("refs/changes/00/1000/1").unwrap();
        assert_eq!(parsed.change_number, 1000);
        assert_eq!(parsed.patchset, 1);
    }

    #[test]
    fn parse_reference_rejects_malformed() {
        for bad in [
            "",
            "refs/changes/00/1000",
            "refs/changes/00/1000/1/extra",
            "refs/tags/00/1000/1",
            "refs/changes/0x/1000/1",
            "refs/changes/000/1000/1",
            "refs/changes/00/zero/1",
            "refs/changes/00/0/1",
            "refs/changes/00/1000/0",
        ] {
            assert!(
                matches!(parse_reference(bad), Err(Error::InvalidReference(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn new_single_part_changes_form_their_own_groups() {
        let previous: HashSet<String> = ["refs/changes/00/900/1".to_string()].into();
        let current = [
            change("refs/changes/00/900/1", "", "old\n"),
            change("refs/changes/00/901/1", "", "new\n"),
        ];
        let (groups, errors) = new_open_changes(&previous, &current);
        assert!(errors.is_empty());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0][0].reference, "refs/changes/00/901/1");
    }

    #[test]
    fn new_patchset_pulls_in_the_whole_topic() {
        // Previous query saw patchset 1 of both parts; part 2 gained a
        // new patchset, so the whole T1 set comes back, in part order.
        let previous: HashSet<String> = [
            "refs/changes/00/1000/1".to_string(),
            "refs/changes/01/1001/1".to_string(),
        ]
        .into();
        let current = [
            part("refs/changes/00/1000/1", "T1", 1, 2),
            part("refs/changes/01/1001/2", "T1", 2, 2),
            part("refs/changes/02/1002/2", "T2", 1, 2),
        ];
        let (groups, _errors) = new_open_changes(&previous, &current);
        assert_eq!(groups.len(), 1, "incomplete T2 must be dropped");
        let refs: Vec<_> = groups[0].iter().map(|c| c.reference()).collect();
        assert_eq!(
            refs,
            vec!["refs/changes/00/1000/1", "refs/changes/01/1001/2"]
        );
    }

    #[test]
    fn changes_without_references_are_skipped() {
        let previous = HashSet::new();
        let current = [change("", "", "whatever\n")];
        let (groups, errors) = new_open_changes(&previous, &current);
        assert!(groups.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn piece_errors_are_collected_not_fatal() {
        let previous = HashSet::new();
        let current = [
            // Two pieces claiming the same index: the set stays
            // incomplete and the collision is reported.
            part("refs/changes/00/1000/1", "T", 1, 2),
            part("refs/changes/01/1001/1", "T", 1, 2),
            change("refs/changes/02/1002/1", "", "fine\n"),
        ];
        let (groups, errors) = new_open_changes(&previous, &current);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0][0].reference, "refs/changes/02/1002/1");
        assert_eq!(errors.len(), 1);
    }
}
