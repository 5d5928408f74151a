//! Closest-upload resolution.

use crate::error::MetadataResult;
use crate::models::{ClosestUploadQuery, DumpRow};
use async_trait::async_trait;
use lodestar_core::CommitGraph;

/// Repository answering "which uploads can serve this commit and path".
#[async_trait]
pub trait ClosestUploadRepo: Send + Sync {
    /// Resolve from the persisted visibility tables. Results are completed
    /// uploads whose root covers the path, newest first.
    async fn find_closest_uploads(&self, query: &ClosestUploadQuery)
    -> MetadataResult<Vec<DumpRow>>;

    /// Resolve a commit the tables may not know yet, by running the
    /// visibility algorithm over `fragment` seeded with whatever the tables
    /// already say about the fragment's commits.
    async fn find_closest_uploads_from_graph_fragment(
        &self,
        query: &ClosestUploadQuery,
        fragment: &CommitGraph,
    ) -> MetadataResult<Vec<DumpRow>>;
}
