//! Sparse per-repository seed view used as input to the visibility graph.

use crate::token::VisibilityToken;
use crate::upload::{UploadId, UploadMeta};
use std::collections::HashMap;

/// Uploads keyed by the commit they are seeded at, plus the token of every
/// upload that appears in the view.
///
/// During a full recompute every seed has distance zero and sits at the
/// upload's own commit. When resolving a graph fragment the seeds come from
/// the persisted tables and carry the distance already known there.
#[derive(Clone, Debug, Default)]
pub struct CommitGraphView {
    meta: HashMap<String, Vec<UploadMeta>>,
    tokens: HashMap<UploadId, VisibilityToken>,
}

impl CommitGraphView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `meta` at `commit`.
    pub fn add(&mut self, meta: UploadMeta, commit: impl Into<String>, token: VisibilityToken) {
        self.meta.entry(commit.into()).or_default().push(meta);
        self.tokens.insert(meta.upload_id, token);
    }

    /// Seed a completed upload at its own commit.
    pub fn add_upload(&mut self, upload_id: UploadId, commit: &str, root: &str, indexer: &str) {
        self.add(
            UploadMeta::new(upload_id, 0),
            commit,
            VisibilityToken::new(root, indexer),
        );
    }

    pub fn meta(&self, commit: &str) -> &[UploadMeta] {
        self.meta.get(commit).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn token(&self, upload_id: UploadId) -> Option<VisibilityToken> {
        self.tokens.get(&upload_id).copied()
    }

    /// Number of commits carrying at least one seed.
    pub fn seeded_commits(&self) -> usize {
        self.meta.len()
    }

    /// Number of distinct uploads in the view.
    pub fn upload_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }
}
