//! Commit graph visibility repository.

use crate::error::MetadataResult;
use crate::models::{
    CommitGraphMetadata, RetentionConfigurationRow, VisibilitySnapshot, VisibilityUpdateStats,
};
use async_trait::async_trait;
use lodestar_core::{CommitGraph, CommitGraphView, RefDescriptions, StaleRefPolicy, UploadId};
use time::OffsetDateTime;

/// Repository for the persisted visibility tables.
#[async_trait]
pub trait CommitGraphRepo: Send + Sync {
    /// Completed uploads of a repository, seeded at their own commits.
    async fn get_commit_graph_view(&self, repository_id: i64) -> MetadataResult<CommitGraphView>;

    /// Recompute and replace the visibility tables of a repository.
    ///
    /// Runs in one transaction: the tables are replaced by a diff against
    /// freshly staged rows, the update token is raised to `dirty_token`
    /// (unless zero) and uploads in `deleting` move to `deleted`. On any
    /// error nothing is changed.
    ///
    /// `policy` supplies the default stale-ref windows; a per-repository
    /// retention configuration overrides them.
    async fn update_uploads_visible_to_commits(
        &self,
        repository_id: i64,
        graph: &CommitGraph,
        refs: &RefDescriptions,
        policy: StaleRefPolicy,
        dirty_token: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<VisibilityUpdateStats>;

    /// Commits from which an upload is visible, paged by commit in ascending
    /// order. Returns the page and the cursor for the next one.
    async fn get_commits_visible_to_upload(
        &self,
        upload_id: UploadId,
        limit: u32,
        after: Option<&str>,
    ) -> MetadataResult<(Vec<String>, Option<String>)>;

    /// Staleness of the repository's visibility tables.
    async fn get_commit_graph_metadata(
        &self,
        repository_id: i64,
    ) -> MetadataResult<CommitGraphMetadata>;

    /// Persisted visibility rows of a repository.
    async fn get_visibility_snapshot(&self, repository_id: i64)
    -> MetadataResult<VisibilitySnapshot>;

    async fn get_retention_configuration(
        &self,
        repository_id: i64,
    ) -> MetadataResult<Option<RetentionConfigurationRow>>;

    /// Insert or replace a repository's stale-ref windows. Negative windows
    /// are rejected.
    async fn set_retention_configuration(
        &self,
        config: &RetentionConfigurationRow,
    ) -> MetadataResult<()>;
}
