//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use lodestar_core::{UploadId, UploadMeta, UploadState};
use serde::Serialize;
use sqlx::FromRow;
use std::collections::BTreeMap;
use time::OffsetDateTime;

// =============================================================================
// Uploads
// =============================================================================

/// Upload record. `id` doubles as the upload identifier in every other table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UploadRow {
    pub id: i64,
    pub repository_id: i64,
    pub commit_sha: String,
    /// Directory prefix the index covers; empty for the repository root.
    pub root: String,
    pub indexer: String,
    pub indexer_version: Option<String>,
    pub state: String,
    /// Set by the retention policy; expired uploads are reclaim candidates.
    pub expired: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_referenced_scan_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_traversal_scan_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reconcile_at: Option<OffsetDateTime>,
    pub associated_index_id: Option<i64>,
}

impl UploadRow {
    pub fn upload_id(&self) -> UploadId {
        UploadId::new(self.id)
    }

    /// Parse the stored state column.
    pub fn upload_state(&self) -> MetadataResult<UploadState> {
        Ok(self.state.parse()?)
    }
}

/// New upload to insert into the catalog.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub repository_id: i64,
    pub commit_sha: String,
    pub root: String,
    pub indexer: String,
    pub indexer_version: Option<String>,
    pub state: UploadState,
    pub uploaded_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub associated_index_id: Option<i64>,
}

impl NewUpload {
    /// A completed upload finished at `at`.
    pub fn completed(
        repository_id: i64,
        commit_sha: impl Into<String>,
        root: impl Into<String>,
        indexer: impl Into<String>,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            repository_id,
            commit_sha: commit_sha.into(),
            root: root.into(),
            indexer: indexer.into(),
            indexer_version: None,
            state: UploadState::Completed,
            uploaded_at: at,
            finished_at: Some(at),
            associated_index_id: None,
        }
    }
}

/// Completed upload returned by closest-upload resolution.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DumpRow {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub upload: UploadRow,
    /// Visible at the tip of the repository's default branch.
    pub visible_at_tip: bool,
}

/// Parameters of a closest-upload lookup.
#[derive(Debug, Clone)]
pub struct ClosestUploadQuery {
    pub repository_id: i64,
    pub commit: String,
    pub path: String,
    /// When true the upload root must be a prefix of `path`; otherwise either
    /// may contain the other.
    pub root_must_enclose_path: bool,
    /// Restrict to one indexer name.
    pub indexer: Option<String>,
}

// =============================================================================
// Packages
// =============================================================================

/// Package provided by an upload.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PackageRow {
    pub dump_id: i64,
    pub scheme: String,
    pub manager: String,
    pub name: String,
    pub version: String,
}

/// Package consumed by an upload.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PackageReferenceRow {
    pub dump_id: i64,
    pub scheme: String,
    pub manager: String,
    pub name: String,
    pub version: String,
}

// =============================================================================
// Commit graph state
// =============================================================================

/// Dirty-tracking row for one repository.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DirtyRepositoryRow {
    pub repository_id: i64,
    pub dirty_token: i64,
    pub update_token: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub set_dirty_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

/// Freshness of a repository's visibility tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitGraphMetadata {
    /// A newer dirty token has been issued than the last applied one.
    pub stale: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

/// Per-repository override of the stale-ref windows.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct RetentionConfigurationRow {
    pub repository_id: i64,
    pub max_age_for_non_stale_branches_seconds: i64,
    pub max_age_for_non_stale_tags_seconds: i64,
}

/// Persisted visibility tables of one repository, sorted for comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VisibilitySnapshot {
    /// `(commit, uploads)` sorted by commit.
    pub nearest_uploads: Vec<(String, Vec<UploadMeta>)>,
    /// `(commit, ancestor_commit, distance)` sorted by commit.
    pub links: Vec<(String, String, i64)>,
    /// `(upload_id, branch_or_tag_names, is_default_branch)`, sorted.
    pub visible_at_tip: Vec<(i64, String, bool)>,
}

// =============================================================================
// Stats
// =============================================================================

/// Row movement for one visibility table during a recompute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub staged: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl TransferStats {
    pub fn is_unchanged(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Result of a commit graph recompute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VisibilityUpdateStats {
    pub nearest_uploads: TransferStats,
    pub links: TransferStats,
    pub visible_at_tip: TransferStats,
    /// Uploads moved from `deleting` to `deleted`.
    pub uploads_deleted: u64,
}

/// Result of one reference-count reclaim batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReferenceReclaimStats {
    pub scanned: u64,
    pub deleted: u64,
    /// Repositories marked dirty because uploads moved to `deleting`.
    pub repositories: Vec<i64>,
}

/// Result of one reference-graph traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraversalReclaimStats {
    pub root: Option<i64>,
    pub visited: u64,
    pub deleted: u64,
    /// The traversal limit was reached; no state changed.
    pub capped: bool,
    pub repositories: Vec<i64>,
}

// =============================================================================
// Encoded upload lists
// =============================================================================

/// Encode landmark uploads as a JSON object keyed by upload ID.
///
/// Keys are emitted in ascending ID order so identical inputs produce
/// identical bytes.
pub fn encode_uploads(uploads: &[UploadMeta]) -> MetadataResult<String> {
    let map: BTreeMap<i64, u32> = uploads
        .iter()
        .map(|meta| (meta.upload_id.get(), meta.distance))
        .collect();
    Ok(serde_json::to_string(&map)?)
}

/// Decode a landmark upload list, adding `offset` to every distance.
pub fn decode_uploads(encoded: &str, offset: u32) -> MetadataResult<Vec<UploadMeta>> {
    let map: BTreeMap<String, u32> = serde_json::from_str(encoded)?;
    let mut uploads = map
        .into_iter()
        .map(|(id, distance)| {
            let id: i64 = id.parse().map_err(|_| {
                MetadataError::Serialization(format!("invalid upload id key '{id}'"))
            })?;
            Ok(UploadMeta::new(UploadId::new(id), distance.saturating_add(offset)))
        })
        .collect::<MetadataResult<Vec<_>>>()?;
    uploads.sort_by_key(|meta| meta.upload_id);
    Ok(uploads)
}
