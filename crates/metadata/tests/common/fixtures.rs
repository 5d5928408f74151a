//! Test fixtures for building repositories, uploads and commit graphs.

use lodestar_core::config::VisibilityConfig;
use lodestar_core::{CommitGraph, RefDescription, RefDescriptions, StaleRefPolicy, UploadId};
use lodestar_metadata::MetadataStore;
use lodestar_metadata::models::{
    ClosestUploadQuery, NewUpload, PackageReferenceRow, PackageRow, VisibilityUpdateStats,
};
use lodestar_metadata::repos::{CommitGraphRepo, DirtyRepositoryRepo, UploadRepo};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Repository used by tests that only need one.
pub const REPO: i64 = 42;

/// Default stale-ref windows.
#[allow(dead_code)]
pub fn default_policy() -> StaleRefPolicy {
    VisibilityConfig::default().stale_ref_policy()
}

/// Refs with `main` as the default branch at `commit`.
#[allow(dead_code)]
pub fn main_at(commit: &str) -> RefDescriptions {
    HashMap::from([(
        commit.to_string(),
        vec![RefDescription::default_branch("main")],
    )])
}

/// Parse `git log --pretty='%H %P'` style text.
#[allow(dead_code)]
pub fn graph(text: &str) -> CommitGraph {
    CommitGraph::parse(text).expect("valid commit graph")
}

/// Insert a completed upload finished at `finished_at`.
#[allow(dead_code)]
pub async fn completed_upload_at(
    store: &Arc<dyn MetadataStore>,
    repository_id: i64,
    commit: &str,
    root: &str,
    indexer: &str,
    finished_at: OffsetDateTime,
) -> UploadId {
    store
        .insert_upload(&NewUpload::completed(
            repository_id,
            commit,
            root,
            indexer,
            finished_at,
        ))
        .await
        .expect("insert upload")
}

/// Insert a completed upload finished now.
#[allow(dead_code)]
pub async fn completed_upload(
    store: &Arc<dyn MetadataStore>,
    repository_id: i64,
    commit: &str,
    root: &str,
    indexer: &str,
) -> UploadId {
    completed_upload_at(
        store,
        repository_id,
        commit,
        root,
        indexer,
        OffsetDateTime::now_utc(),
    )
    .await
}

/// Current dirty token of a repository, or 0 when it was never marked.
#[allow(dead_code)]
pub async fn dirty_token(store: &Arc<dyn MetadataStore>, repository_id: i64) -> i64 {
    store
        .get_dirty_repositories()
        .await
        .expect("dirty repositories")
        .into_iter()
        .find(|row| row.repository_id == repository_id)
        .map(|row| row.dirty_token)
        .unwrap_or(0)
}

/// Recompute with the current dirty token and default windows.
#[allow(dead_code)]
pub async fn recompute(
    store: &Arc<dyn MetadataStore>,
    repository_id: i64,
    graph_text: &str,
    refs: &RefDescriptions,
) -> VisibilityUpdateStats {
    let token = dirty_token(store, repository_id).await;
    store
        .update_uploads_visible_to_commits(
            repository_id,
            &graph(graph_text),
            refs,
            default_policy(),
            token,
            OffsetDateTime::now_utc(),
        )
        .await
        .expect("recompute")
}

/// Closest-upload query over the whole repository.
#[allow(dead_code)]
pub fn query(repository_id: i64, commit: &str, path: &str) -> ClosestUploadQuery {
    ClosestUploadQuery {
        repository_id,
        commit: commit.to_string(),
        path: path.to_string(),
        root_must_enclose_path: false,
        indexer: None,
    }
}

#[allow(dead_code)]
pub fn package(dump_id: UploadId, name: &str) -> PackageRow {
    PackageRow {
        dump_id: dump_id.get(),
        scheme: "npm".to_string(),
        manager: String::new(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
    }
}

#[allow(dead_code)]
pub fn reference(dump_id: UploadId, name: &str) -> PackageReferenceRow {
    PackageReferenceRow {
        dump_id: dump_id.get(),
        scheme: "npm".to_string(),
        manager: String::new(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
    }
}

/// Upload IDs of closest-upload results, in result order.
#[allow(dead_code)]
pub fn ids(dumps: &[lodestar_metadata::models::DumpRow]) -> Vec<UploadId> {
    dumps.iter().map(|dump| dump.upload.upload_id()).collect()
}
