//! Upload catalog repository.

use crate::error::MetadataResult;
use crate::models::{NewUpload, PackageReferenceRow, PackageRow, UploadRow};
use async_trait::async_trait;
use lodestar_core::{UploadId, UploadState};
use time::OffsetDateTime;

/// Repository for the upload catalog and the package tables retention reads.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Insert an upload and return its identifier.
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<UploadId>;

    /// Get an upload by ID.
    async fn get_upload(&self, upload_id: UploadId) -> MetadataResult<Option<UploadRow>>;

    /// Get uploads by ID in any state, ordered by ID. Unknown IDs are skipped.
    async fn get_uploads_by_ids(&self, upload_ids: &[UploadId]) -> MetadataResult<Vec<UploadRow>>;

    /// Move an upload along its lifecycle.
    ///
    /// Rejects illegal transitions. Entering `completed` stamps `finished_at`
    /// and marks the repository dirty.
    async fn update_upload_state(
        &self,
        upload_id: UploadId,
        state: UploadState,
    ) -> MetadataResult<()>;

    /// Apply a retention policy decision: clear `expired` on `protected`,
    /// set it on `expired`.
    async fn update_upload_retention(
        &self,
        protected: &[UploadId],
        expired: &[UploadId],
    ) -> MetadataResult<()>;

    /// Soft-delete an upload. Completed uploads move to `deleting` so the next
    /// recompute can finish them; anything not yet completed goes straight to
    /// `deleted`. Returns false when the upload is unknown or already deleted.
    async fn delete_upload_by_id(&self, upload_id: UploadId) -> MetadataResult<bool>;

    /// Record packages provided by uploads.
    async fn insert_packages(&self, packages: &[PackageRow]) -> MetadataResult<()>;

    /// Record packages referenced by uploads.
    async fn insert_package_references(
        &self,
        references: &[PackageReferenceRow],
    ) -> MetadataResult<()>;

    /// Record commit dates used to order package providers. Existing dates
    /// are kept.
    async fn update_commit_dates(
        &self,
        repository_id: i64,
        dates: &[(String, OffsetDateTime)],
    ) -> MetadataResult<()>;
}
