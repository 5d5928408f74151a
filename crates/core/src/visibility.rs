//! Upload visibility over a commit graph.
//!
//! Every commit reachable from a seeded commit sees a set of uploads: the
//! union of its parents' sets (one hop further away) and its own seeds, keeping
//! per token only the nearest upload (lowest upload ID on equal distance).
//!
//! Storing that set per commit does not scale to long histories, so the graph
//! is compressed. A commit is materialized as a **landmark** (full map) only
//! when it has seeds of its own, or when its visible parents resolve to more
//! than one landmark. Every other commit becomes a **link**: "same set as
//! landmark `ancestor`, shifted by `distance`". Links always point directly at
//! a landmark, so readers resolve any commit with at most one indirection.

use crate::token::VisibilityToken;
use crate::upload::{UploadId, UploadMeta};
use crate::view::CommitGraphView;
use crate::{CommitGraph, Error, Result};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{BTreeMap, HashMap};

/// Link row: `commit` sees the landmark set of `ancestor_commit`, shifted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkRelationship {
    pub commit: String,
    pub ancestor_commit: String,
    pub distance: u32,
}

/// Landmark row: the full visible set at `commit`, ordered by upload ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NearestUploads {
    pub commit: String,
    pub uploads: Vec<UploadMeta>,
}

/// One compressed visibility record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VisibilityRow {
    Landmark(NearestUploads),
    Link(LinkRelationship),
}

impl VisibilityRow {
    pub fn commit(&self) -> &str {
        match self {
            Self::Landmark(row) => &row.commit,
            Self::Link(row) => &row.commit,
        }
    }
}

#[derive(Clone, Debug)]
enum Entry {
    Landmark(Vec<UploadMeta>),
    Link { ancestor: String, distance: u32 },
}

/// Nearest upload per token.
#[derive(Default)]
struct ShadowSet {
    nearest: HashMap<VisibilityToken, UploadMeta>,
}

impl ShadowSet {
    fn offer(&mut self, meta: UploadMeta, token: VisibilityToken) {
        match self.nearest.entry(token) {
            MapEntry::Vacant(slot) => {
                slot.insert(meta);
            }
            MapEntry::Occupied(mut slot) => {
                if meta.precedence() < slot.get().precedence() {
                    slot.insert(meta);
                }
            }
        }
    }

    fn into_sorted(self) -> Vec<UploadMeta> {
        let mut uploads: Vec<UploadMeta> = self.nearest.into_values().collect();
        uploads.sort_by_key(|meta| meta.upload_id);
        uploads
    }
}

/// Compressed visibility for one commit graph.
#[derive(Clone, Debug, Default)]
pub struct VisibilityGraph {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    tokens: HashMap<UploadId, VisibilityToken>,
}

impl VisibilityGraph {
    /// Propagate the seeds of `view` through `graph`.
    pub fn new(graph: &CommitGraph, view: &CommitGraphView) -> Result<Self> {
        let mut this = Self::default();

        for commit in graph.order() {
            // Landmarks reachable through visible parents, with their offsets.
            let mut sources: Vec<(String, u32)> = Vec::new();
            for parent in graph.parents(commit) {
                match this.entries.get(parent) {
                    None => {}
                    Some(Entry::Landmark(_)) => sources.push((parent.clone(), 1)),
                    Some(Entry::Link { ancestor, distance }) => {
                        sources.push((ancestor.clone(), distance + 1))
                    }
                }
            }

            let seeds = view.meta(commit);
            if seeds.is_empty() {
                let Some((first, _)) = sources.first() else {
                    continue;
                };
                if sources.iter().all(|(ancestor, _)| ancestor == first) {
                    let ancestor = first.clone();
                    let distance = sources.iter().map(|(_, d)| *d).min().unwrap_or(1);
                    this.insert(commit, Entry::Link { ancestor, distance });
                    continue;
                }
            }

            let mut shadow = ShadowSet::default();
            for (ancestor, offset) in &sources {
                let Some(Entry::Landmark(uploads)) = this.entries.get(ancestor) else {
                    return Err(Error::InvariantViolation(format!(
                        "link target {ancestor} of {commit} is not a landmark"
                    )));
                };
                for meta in uploads {
                    let token = this.token_of(meta.upload_id)?;
                    shadow.offer(UploadMeta::new(meta.upload_id, meta.distance + offset), token);
                }
            }
            for seed in seeds {
                let token = view.token(seed.upload_id).ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "upload {} seeded at {commit} has no token",
                        seed.upload_id
                    ))
                })?;
                this.tokens.insert(seed.upload_id, token);
                shadow.offer(*seed, token);
            }
            this.insert(commit, Entry::Landmark(shadow.into_sorted()));
        }

        tracing::trace!(
            commits = graph.len(),
            landmarks = this.landmark_count(),
            links = this.link_count(),
            "computed commit graph visibility"
        );
        Ok(this)
    }

    fn insert(&mut self, commit: &str, entry: Entry) {
        self.order.push(commit.to_string());
        self.entries.insert(commit.to_string(), entry);
    }

    fn token_of(&self, upload_id: UploadId) -> Result<VisibilityToken> {
        self.tokens.get(&upload_id).copied().ok_or_else(|| {
            Error::InvariantViolation(format!("upload {upload_id} has no token"))
        })
    }

    /// Token of an upload visible somewhere in the graph.
    pub fn token(&self, upload_id: UploadId) -> Option<VisibilityToken> {
        self.tokens.get(&upload_id).copied()
    }

    /// Uploads visible at `commit`, ordered by upload ID. Empty for commits
    /// outside the closure.
    pub fn uploads_visible_at_commit(&self, commit: &str) -> Vec<UploadMeta> {
        match self.entries.get(commit) {
            None => Vec::new(),
            Some(Entry::Landmark(uploads)) => uploads.clone(),
            Some(Entry::Link { ancestor, distance }) => match self.entries.get(ancestor) {
                Some(Entry::Landmark(uploads)) => uploads
                    .iter()
                    .map(|meta| UploadMeta::new(meta.upload_id, meta.distance + distance))
                    .collect(),
                _ => Vec::new(),
            },
        }
    }

    /// Compressed rows in topological order.
    pub fn rows(&self) -> impl Iterator<Item = VisibilityRow> + '_ {
        self.order.iter().filter_map(|commit| {
            let row = match self.entries.get(commit)? {
                Entry::Landmark(uploads) => VisibilityRow::Landmark(NearestUploads {
                    commit: commit.clone(),
                    uploads: uploads.clone(),
                }),
                Entry::Link { ancestor, distance } => VisibilityRow::Link(LinkRelationship {
                    commit: commit.clone(),
                    ancestor_commit: ancestor.clone(),
                    distance: *distance,
                }),
            };
            Some(row)
        })
    }

    /// Landmark maps and link rows keyed by commit.
    pub fn gather(
        &self,
    ) -> (
        BTreeMap<String, Vec<UploadMeta>>,
        BTreeMap<String, LinkRelationship>,
    ) {
        let mut landmarks = BTreeMap::new();
        let mut links = BTreeMap::new();
        for row in self.rows() {
            match row {
                VisibilityRow::Landmark(row) => {
                    landmarks.insert(row.commit, row.uploads);
                }
                VisibilityRow::Link(row) => {
                    links.insert(row.commit.clone(), row);
                }
            }
        }
        (landmarks, links)
    }

    /// Number of commits within the closure.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn landmark_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry, Entry::Landmark(_)))
            .count()
    }

    pub fn link_count(&self) -> usize {
        self.entries.len() - self.landmark_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(upload_id: i64, distance: u32) -> UploadMeta {
        UploadMeta::new(UploadId::new(upload_id), distance)
    }

    fn link(commit: &str, ancestor: &str, distance: u32) -> LinkRelationship {
        LinkRelationship {
            commit: commit.to_string(),
            ancestor_commit: ancestor.to_string(),
            distance,
        }
    }

    fn build(graph: &str, uploads: &[(i64, &str, &str, &str)]) -> VisibilityGraph {
        let graph = CommitGraph::parse(graph).unwrap();
        let mut view = CommitGraphView::new();
        for (id, commit, root, indexer) in uploads {
            view.add_upload(UploadId::new(*id), commit, root, indexer);
        }
        VisibilityGraph::new(&graph, &view).unwrap()
    }

    #[test]
    fn test_linear_history_single_upload() {
        let graph = build("c3 c2\nc2 c1\nc1\n", &[(1, "c1", "", "idx")]);

        assert_eq!(graph.uploads_visible_at_commit("c1"), vec![meta(1, 0)]);
        assert_eq!(graph.uploads_visible_at_commit("c2"), vec![meta(1, 1)]);
        assert_eq!(graph.uploads_visible_at_commit("c3"), vec![meta(1, 2)]);

        let (landmarks, links) = graph.gather();
        assert_eq!(landmarks.len(), 1);
        assert_eq!(links["c2"], link("c2", "c1", 1));
        assert_eq!(links["c3"], link("c3", "c1", 2));
    }

    #[test]
    fn test_nearest_upload_wins_for_shared_token() {
        let graph = build(
            "c3 c2\nc2 c1\nc1\n",
            &[(1, "c1", "", "idx"), (2, "c3", "", "idx")],
        );

        assert_eq!(graph.uploads_visible_at_commit("c2"), vec![meta(1, 1)]);
        assert_eq!(graph.uploads_visible_at_commit("c3"), vec![meta(2, 0)]);
    }

    #[test]
    fn test_scip_upload_shadows_lsif_upload() {
        let graph = build(
            "c4 c3\nc3 c2\nc2 c1\nc1\n",
            &[
                (1, "c1", "", "lsif-lol"),
                (2, "c2", "", "lsif-zzz"),
                (3, "c3", "", "scip-lol"),
            ],
        );

        let (landmarks, links) = graph.gather();
        let expected: BTreeMap<String, Vec<UploadMeta>> = BTreeMap::from([
            ("c1".to_string(), vec![meta(1, 0)]),
            ("c2".to_string(), vec![meta(1, 1), meta(2, 0)]),
            ("c3".to_string(), vec![meta(2, 1), meta(3, 0)]),
        ]);
        assert_eq!(landmarks, expected);
        assert_eq!(links.len(), 1);
        assert_eq!(links["c4"], link("c4", "c3", 1));
    }

    #[test]
    fn test_merge_of_distinct_landmarks_materializes() {
        // r -- a(2) -- m
        //  \__ b ____/
        let graph = build(
            "m a b\nb r\na r\nr\n",
            &[(1, "r", "", "idx"), (2, "a", "sub/", "idx")],
        );

        let (landmarks, links) = graph.gather();
        assert_eq!(landmarks["m"], vec![meta(1, 2), meta(2, 1)]);
        assert_eq!(links["b"], link("b", "r", 1));
        assert!(!links.contains_key("m"));
    }

    #[test]
    fn test_merge_onto_same_landmark_stays_a_link() {
        // r -- x -- a -- m -- t
        //  \__ b _______/
        let graph = build("t m\nm a b\nb r\na x\nx r\nr\n", &[(1, "r", "", "idx")]);

        assert_eq!(graph.landmark_count(), 1);
        let (_, links) = graph.gather();
        assert_eq!(links["m"], link("m", "r", 2));
        assert_eq!(links["t"], link("t", "r", 3));
        assert_eq!(graph.uploads_visible_at_commit("m"), vec![meta(1, 2)]);
    }

    #[test]
    fn test_equal_distance_tie_prefers_lower_upload_id() {
        let graph = build(
            "m r1 r2\nr1\nr2\n",
            &[(5, "r1", "", "idx"), (3, "r2", "", "idx")],
        );
        assert_eq!(graph.uploads_visible_at_commit("m"), vec![meta(3, 1)]);
    }

    #[test]
    fn test_commits_above_first_upload_see_nothing() {
        let graph = build("c3 c2\nc2 c1\nc1\n", &[(1, "c2", "", "idx")]);

        assert!(graph.uploads_visible_at_commit("c1").is_empty());
        assert_eq!(graph.len(), 2);
        assert!(graph.rows().all(|row| row.commit() != "c1"));
    }

    #[test]
    fn test_seeds_with_known_distance_extend_fragment() {
        let graph = CommitGraph::parse("c12 c11\nc11 c10\n").unwrap();
        let mut view = CommitGraphView::new();
        view.add(meta(1, 4), "c10", VisibilityToken::new("", "idx"));
        view.add(meta(2, 7), "c10", VisibilityToken::new("sub/", "idx"));
        let graph = VisibilityGraph::new(&graph, &view).unwrap();

        assert_eq!(
            graph.uploads_visible_at_commit("c12"),
            vec![meta(1, 6), meta(2, 9)]
        );
    }

    #[test]
    fn test_every_commit_in_closure_has_exactly_one_row() {
        let graph = build(
            "f e\ne d c\nd b\nc b\nb a\na\n",
            &[(1, "a", "", "idx"), (2, "c", "", "other"), (3, "d", "", "idx")],
        );

        let commits: Vec<String> = graph.rows().map(|row| row.commit().to_string()).collect();
        let mut deduped = commits.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(commits.len(), deduped.len());
        assert_eq!(commits.len(), 6);

        // At e, upload 3 (one hop via d) shadows upload 1 (three hops via c).
        assert_eq!(
            graph.uploads_visible_at_commit("e"),
            vec![meta(2, 1), meta(3, 1)]
        );
        assert_eq!(
            graph.uploads_visible_at_commit("f"),
            vec![meta(2, 2), meta(3, 2)]
        );
    }
}
