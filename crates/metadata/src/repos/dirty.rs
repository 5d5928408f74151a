//! Dirty repository tracking.

use crate::error::MetadataResult;
use crate::models::DirtyRepositoryRow;
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

/// Repository for dirty/update token bookkeeping.
#[async_trait]
pub trait DirtyRepositoryRepo: Send + Sync {
    /// Increment a repository's dirty token and return the new value.
    async fn mark_repository_dirty(&self, repository_id: i64) -> MetadataResult<i64>;

    /// Repositories whose dirty token is ahead of their update token,
    /// ordered by repository ID.
    async fn get_dirty_repositories(&self) -> MetadataResult<Vec<DirtyRepositoryRow>>;

    /// Time since the oldest still-dirty repository was marked, or zero.
    async fn get_repositories_max_stale_age(&self, now: OffsetDateTime)
    -> MetadataResult<Duration>;
}
