//! Upload retention by package reference.

use crate::error::MetadataResult;
use crate::models::{ReferenceReclaimStats, TraversalReclaimStats};
use async_trait::async_trait;

/// Repository for reference-aware upload reclamation.
///
/// Both passes only ever move `completed` uploads to `deleting`; the next
/// recompute of each touched repository finishes the deletion.
#[async_trait]
pub trait RetentionRepo: Send + Sync {
    /// Examine up to `batch_size` expired uploads, least recently scanned
    /// first. Each is retained when it is the canonical provider of a package
    /// that another upload references, and moved to `deleting` otherwise.
    async fn reclaim_by_reference(&self, batch_size: u32) -> MetadataResult<ReferenceReclaimStats>;

    /// Expand the reference graph from one expired canonical provider that is
    /// still referenced. When the reachable set stays within
    /// `traversal_limit` and every member is expired, the whole set moves to
    /// `deleting`. Otherwise only the scan timestamps change.
    async fn reclaim_by_traversal(
        &self,
        traversal_limit: u32,
    ) -> MetadataResult<TraversalReclaimStats>;
}
