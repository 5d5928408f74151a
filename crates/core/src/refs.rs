//! Non-stale ref selection and tip visibility.
//!
//! The default branch always counts. Any other branch or tag counts only while
//! its creation date lies within the max-age window for its kind; refs without
//! a creation date are stale.

use crate::graph::{RefDescription, RefDescriptions, RefType};
use crate::upload::UploadId;
use crate::visibility::VisibilityGraph;
use std::collections::BTreeMap;
use time::{Duration, OffsetDateTime};

/// Max-age windows for refs that are not the default branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaleRefPolicy {
    pub max_age_for_non_stale_branches: Duration,
    pub max_age_for_non_stale_tags: Duration,
}

impl StaleRefPolicy {
    pub fn new(max_age_for_non_stale_branches: Duration, max_age_for_non_stale_tags: Duration) -> Self {
        Self {
            max_age_for_non_stale_branches,
            max_age_for_non_stale_tags,
        }
    }

    pub fn max_age(&self, ref_type: RefType) -> Duration {
        match ref_type {
            RefType::Branch => self.max_age_for_non_stale_branches,
            RefType::Tag => self.max_age_for_non_stale_tags,
        }
    }

    /// Check whether a ref still protects the uploads visible at its tip.
    pub fn is_non_stale(&self, description: &RefDescription, now: OffsetDateTime) -> bool {
        if description.is_default_branch {
            return true;
        }
        match description.created_date {
            Some(created) => now - created <= self.max_age(description.ref_type),
            None => false,
        }
    }
}

/// Non-stale refs pointing at one commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TipRefs {
    /// Sorted, comma-joined ref names.
    pub names: String,
    pub is_default_branch: bool,
}

/// Group the non-stale refs by tip commit. Commits left without any
/// non-stale ref are dropped.
pub fn non_stale_tips(
    refs: &RefDescriptions,
    policy: &StaleRefPolicy,
    now: OffsetDateTime,
) -> BTreeMap<String, TipRefs> {
    let mut tips = BTreeMap::new();
    for (commit, descriptions) in refs {
        let mut names: Vec<&str> = Vec::with_capacity(descriptions.len());
        let mut is_default_branch = false;
        for description in descriptions {
            if !policy.is_non_stale(description, now) {
                continue;
            }
            is_default_branch |= description.is_default_branch;
            names.push(&description.name);
        }
        if names.is_empty() {
            continue;
        }
        names.sort_unstable();
        tips.insert(
            commit.clone(),
            TipRefs {
                names: names.join(","),
                is_default_branch,
            },
        );
    }
    tips
}

/// An upload visible at the tip of at least one non-stale ref.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefVisibility {
    pub upload_id: UploadId,
    pub branch_or_tag_names: String,
    pub is_default_branch: bool,
}

/// Uploads visible at each non-stale tip. An upload visible from several tip
/// commits yields one row per commit.
pub fn visible_at_tips(graph: &VisibilityGraph, tips: &BTreeMap<String, TipRefs>) -> Vec<RefVisibility> {
    let mut rows = Vec::new();
    for (commit, tip) in tips {
        for meta in graph.uploads_visible_at_commit(commit) {
            rows.push(RefVisibility {
                upload_id: meta.upload_id,
                branch_or_tag_names: tip.names.clone(),
                is_default_branch: tip.is_default_branch,
            });
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommitGraph, CommitGraphView};
    use std::collections::HashMap;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 00:00 UTC);

    fn policy() -> StaleRefPolicy {
        StaleRefPolicy::new(Duration::days(30), Duration::days(365))
    }

    #[test]
    fn test_default_branch_never_stale() {
        let main = RefDescription::default_branch("main");
        assert!(policy().is_non_stale(&main, NOW));
    }

    #[test]
    fn test_branch_and_tag_windows() {
        let fresh = RefDescription::branch("feat", Some(NOW - Duration::days(10)));
        let old = RefDescription::branch("old", Some(NOW - Duration::days(31)));
        let release = RefDescription::tag("v1", Some(NOW - Duration::days(200)));
        let undated = RefDescription::tag("v0", None);

        assert!(policy().is_non_stale(&fresh, NOW));
        assert!(!policy().is_non_stale(&old, NOW));
        assert!(policy().is_non_stale(&release, NOW));
        assert!(!policy().is_non_stale(&undated, NOW));
    }

    #[test]
    fn test_tips_join_sorted_names() {
        let refs: RefDescriptions = HashMap::from([
            (
                "c1".to_string(),
                vec![
                    RefDescription::tag("v2", Some(NOW - Duration::days(1))),
                    RefDescription::default_branch("main"),
                    RefDescription::branch("stale", Some(NOW - Duration::days(90))),
                ],
            ),
            (
                "c2".to_string(),
                vec![RefDescription::branch("gone", None)],
            ),
        ]);

        let tips = non_stale_tips(&refs, &policy(), NOW);
        assert_eq!(tips.len(), 1);
        assert_eq!(
            tips["c1"],
            TipRefs {
                names: "main,v2".to_string(),
                is_default_branch: true
            }
        );
    }

    #[test]
    fn test_visible_at_tips_resolves_links() {
        let graph = CommitGraph::parse("c3 c2\nc2 c1\nc1\n").unwrap();
        let mut view = CommitGraphView::new();
        view.add_upload(UploadId::new(7), "c1", "", "idx");
        let graph = VisibilityGraph::new(&graph, &view).unwrap();

        let refs: RefDescriptions = HashMap::from([
            ("c3".to_string(), vec![RefDescription::default_branch("main")]),
            (
                "c2".to_string(),
                vec![RefDescription::branch("feat", Some(NOW - Duration::days(1)))],
            ),
        ]);
        let tips = non_stale_tips(&refs, &policy(), NOW);
        let mut rows = visible_at_tips(&graph, &tips);
        rows.sort();

        assert_eq!(
            rows,
            vec![
                RefVisibility {
                    upload_id: UploadId::new(7),
                    branch_or_tag_names: "feat".to_string(),
                    is_default_branch: false,
                },
                RefVisibility {
                    upload_id: UploadId::new(7),
                    branch_or_tag_names: "main".to_string(),
                    is_default_branch: true,
                },
            ]
        );
    }
}
