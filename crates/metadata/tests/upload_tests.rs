//! Integration tests for the upload catalog.

mod common;

use common::*;
use lodestar_core::{UploadId, UploadState};
use lodestar_metadata::MetadataError;
use lodestar_metadata::models::NewUpload;
use lodestar_metadata::repos::{DirtyRepositoryRepo, UploadRepo};
use time::OffsetDateTime;

fn queued(repository_id: i64, commit: &str) -> NewUpload {
    let now = OffsetDateTime::now_utc();
    NewUpload {
        state: UploadState::Queued,
        finished_at: None,
        indexer_version: Some("0.3.1".to_string()),
        ..NewUpload::completed(repository_id, commit, "", "scip-go", now)
    }
}

#[tokio::test]
async fn test_insert_and_get_upload() {
    run_metadata_test_both(|store| async move {
        let id = store.insert_upload(&queued(REPO, "c1")).await.unwrap();

        let row = store.get_upload(id).await.unwrap().expect("upload");
        assert_eq!(row.upload_id(), id);
        assert_eq!(row.repository_id, REPO);
        assert_eq!(row.commit_sha, "c1");
        assert_eq!(row.indexer, "scip-go");
        assert_eq!(row.indexer_version.as_deref(), Some("0.3.1"));
        assert_eq!(row.upload_state().unwrap(), UploadState::Queued);
        assert!(!row.expired);
        assert!(row.finished_at.is_none());

        assert!(store.get_upload(UploadId::new(9999)).await.unwrap().is_none());
    })
    .await;
}

#[tokio::test]
async fn test_only_completed_inserts_mark_repository_dirty() {
    run_metadata_test_both(|store| async move {
        store.insert_upload(&queued(REPO, "c1")).await.unwrap();
        assert!(store.get_dirty_repositories().await.unwrap().is_empty());

        completed_upload(&store, REPO, "c2", "", "scip-go").await;
        let dirty = store.get_dirty_repositories().await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].repository_id, REPO);
        assert_eq!(dirty[0].dirty_token, 1);
        assert_eq!(dirty[0].update_token, 0);
    })
    .await;
}

#[tokio::test]
async fn test_lifecycle_transitions() {
    run_metadata_test_both(|store| async move {
        let id = store.insert_upload(&queued(REPO, "c1")).await.unwrap();

        store
            .update_upload_state(id, UploadState::Processing)
            .await
            .unwrap();
        assert_eq!(dirty_token(&store, REPO).await, 0);

        store
            .update_upload_state(id, UploadState::Completed)
            .await
            .unwrap();
        let row = store.get_upload(id).await.unwrap().unwrap();
        assert_eq!(row.upload_state().unwrap(), UploadState::Completed);
        assert!(row.finished_at.is_some());
        assert_eq!(dirty_token(&store, REPO).await, 1);

        store
            .update_upload_state(id, UploadState::Deleting)
            .await
            .unwrap();
        assert_eq!(dirty_token(&store, REPO).await, 2);
    })
    .await;
}

#[tokio::test]
async fn test_illegal_transition_is_rejected() {
    run_metadata_test_both(|store| async move {
        let id = completed_upload(&store, REPO, "c1", "", "scip-go").await;

        let err = store
            .update_upload_state(id, UploadState::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));

        let row = store.get_upload(id).await.unwrap().unwrap();
        assert_eq!(row.upload_state().unwrap(), UploadState::Completed);

        let err = store
            .update_upload_state(UploadId::new(9999), UploadState::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));
    })
    .await;
}

#[tokio::test]
async fn test_soft_delete_depends_on_state() {
    run_metadata_test_both(|store| async move {
        let pending = store.insert_upload(&queued(REPO, "c1")).await.unwrap();
        let done = completed_upload(&store, REPO, "c2", "", "scip-go").await;

        assert!(store.delete_upload_by_id(pending).await.unwrap());
        assert!(store.delete_upload_by_id(done).await.unwrap());

        let rows = store.get_uploads_by_ids(&[done, pending]).await.unwrap();
        let states: Vec<(UploadId, UploadState)> = rows
            .iter()
            .map(|row| (row.upload_id(), row.upload_state().unwrap()))
            .collect();
        assert_eq!(
            states,
            vec![
                (pending, UploadState::Deleted),
                (done, UploadState::Deleting),
            ]
        );

        assert!(!store.delete_upload_by_id(pending).await.unwrap());
        assert!(!store.delete_upload_by_id(done).await.unwrap());
        assert!(!store.delete_upload_by_id(UploadId::new(9999)).await.unwrap());
    })
    .await;
}

#[tokio::test]
async fn test_get_uploads_by_ids_skips_unknown() {
    run_metadata_test_both(|store| async move {
        let a = completed_upload(&store, REPO, "c1", "", "scip-go").await;
        let b = completed_upload(&store, REPO, "c2", "", "scip-go").await;

        let rows = store
            .get_uploads_by_ids(&[b, UploadId::new(9999), a])
            .await
            .unwrap();
        let ids: Vec<UploadId> = rows.iter().map(|row| row.upload_id()).collect();
        assert_eq!(ids, vec![a, b]);

        assert!(store.get_uploads_by_ids(&[]).await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_retention_flags() {
    run_metadata_test_both(|store| async move {
        let a = completed_upload(&store, REPO, "c1", "", "scip-go").await;
        let b = completed_upload(&store, REPO, "c2", "", "scip-go").await;

        store.update_upload_retention(&[], &[a, b]).await.unwrap();
        store.update_upload_retention(&[b], &[]).await.unwrap();

        let rows = store.get_uploads_by_ids(&[a, b]).await.unwrap();
        assert!(rows[0].expired);
        assert!(!rows[1].expired);
    })
    .await;
}

#[tokio::test]
async fn test_commit_dates_keep_first_value() {
    let metadata = TestMetadata::new().await.expect("metadata");
    let store = metadata.store();
    let first = OffsetDateTime::now_utc() - time::Duration::days(3);

    store
        .update_commit_dates(REPO, &[("c1".to_string(), first)])
        .await
        .unwrap();
    store
        .update_commit_dates(REPO, &[("c1".to_string(), OffsetDateTime::now_utc())])
        .await
        .unwrap();

    let stored: OffsetDateTime = sqlx::query_scalar(
        "SELECT committed_at FROM commit_dates WHERE repository_id = ? AND commit_sha = ?",
    )
    .bind(REPO)
    .bind("c1")
    .fetch_one(metadata.pool())
    .await
    .unwrap();
    assert!(stored < OffsetDateTime::now_utc() - time::Duration::days(2));
}

#[tokio::test]
async fn test_mark_repository_dirty_counts_up() {
    run_metadata_test_both(|store| async move {
        assert_eq!(store.mark_repository_dirty(REPO).await.unwrap(), 1);
        assert_eq!(store.mark_repository_dirty(REPO).await.unwrap(), 2);
        assert_eq!(store.mark_repository_dirty(REPO + 1).await.unwrap(), 1);

        let repositories: Vec<i64> = store
            .get_dirty_repositories()
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.repository_id)
            .collect();
        assert_eq!(repositories, vec![REPO, REPO + 1]);
    })
    .await;
}
