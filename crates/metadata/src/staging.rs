//! Streaming of recomputed visibility rows into per-transaction staging
//! tables.
//!
//! The graph is computed on the blocking pool, then a producer task walks it
//! and sends landmark, link and tip rows over three bounded channels. A
//! single consumer drains all three and writes batches through a
//! [`StagingWriter`] bound to the recompute transaction. There is one
//! consumer because the transaction owns one connection, and writes on a
//! connection cannot interleave. The first failure on
//! either side cancels the shared token; the caller then drops the
//! transaction, which rolls everything back.

use crate::error::{MetadataError, MetadataResult};
use crate::models::RetentionConfigurationRow;
use async_trait::async_trait;
use lodestar_core::refs::{self, TipRefs};
use lodestar_core::{
    CommitGraph, CommitGraphView, LinkRelationship, NearestUploads, RefVisibility,
    StaleRefPolicy, VisibilityGraph, VisibilityRow,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Channel and batch sizing for a recompute.
#[derive(Clone, Copy, Debug)]
pub struct StagingOptions {
    pub channel_capacity: usize,
    pub insert_batch_size: usize,
}

impl Default for StagingOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            insert_batch_size: 200,
        }
    }
}

impl From<&lodestar_core::config::VisibilityConfig> for StagingOptions {
    fn from(config: &lodestar_core::config::VisibilityConfig) -> Self {
        Self {
            channel_capacity: config.channel_capacity.max(1),
            insert_batch_size: config.insert_batch_size.max(1),
        }
    }
}

/// Destination of staged rows. Implementations write into temporary tables
/// through the recompute transaction.
#[async_trait]
pub(crate) trait StagingWriter: Send {
    async fn stage_nearest_uploads(&mut self, rows: &[NearestUploads]) -> MetadataResult<()>;
    async fn stage_links(&mut self, rows: &[LinkRelationship]) -> MetadataResult<()>;
    async fn stage_visible_at_tip(&mut self, rows: &[RefVisibility]) -> MetadataResult<()>;
}

/// Rows staged per table.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StagedCounts {
    pub nearest_uploads: u64,
    pub links: u64,
    pub visible_at_tip: u64,
}

pub(crate) struct StagingRows {
    nearest_uploads: mpsc::Receiver<NearestUploads>,
    links: mpsc::Receiver<LinkRelationship>,
    visible_at_tip: mpsc::Receiver<RefVisibility>,
}

/// Run the visibility algorithm off the async runtime.
pub(crate) async fn compute_visibility(
    graph: &CommitGraph,
    view: CommitGraphView,
) -> MetadataResult<VisibilityGraph> {
    let graph = graph.clone();
    let visibility = tokio::task::spawn_blocking(move || VisibilityGraph::new(&graph, &view))
        .await
        .map_err(|e| MetadataError::Internal(format!("visibility task failed: {e}")))??;
    Ok(visibility)
}

/// Stale-ref windows for one repository: the stored override when it is
/// well-formed, the defaults otherwise.
pub(crate) fn resolve_stale_ref_policy(
    repository_id: i64,
    stored: Option<&RetentionConfigurationRow>,
    defaults: StaleRefPolicy,
) -> StaleRefPolicy {
    let Some(stored) = stored else {
        return defaults;
    };
    let branches = stored.max_age_for_non_stale_branches_seconds;
    let tags = stored.max_age_for_non_stale_tags_seconds;
    if branches < 0 || tags < 0 {
        tracing::warn!(
            repository_id,
            branches,
            tags,
            "Ignoring malformed retention configuration, using defaults"
        );
        return defaults;
    }
    StaleRefPolicy::new(Duration::seconds(branches), Duration::seconds(tags))
}

/// Start the producer. It stops early once `token` is cancelled or the
/// consumer goes away.
pub(crate) fn spawn_producer(
    graph: Arc<VisibilityGraph>,
    tips: BTreeMap<String, TipRefs>,
    channel_capacity: usize,
    token: CancellationToken,
) -> (StagingRows, JoinHandle<()>) {
    let (nearest_tx, nearest_rx) = mpsc::channel(channel_capacity);
    let (links_tx, links_rx) = mpsc::channel(channel_capacity);
    let (tips_tx, tips_rx) = mpsc::channel(channel_capacity);

    let handle = tokio::spawn(async move {
        for row in graph.rows() {
            let sent = match row {
                VisibilityRow::Landmark(row) => send(&token, &nearest_tx, row).await,
                VisibilityRow::Link(row) => send(&token, &links_tx, row).await,
            };
            if !sent {
                return;
            }
        }
        drop(nearest_tx);
        drop(links_tx);

        for row in refs::visible_at_tips(&graph, &tips) {
            if !send(&token, &tips_tx, row).await {
                return;
            }
        }
    });

    let rows = StagingRows {
        nearest_uploads: nearest_rx,
        links: links_rx,
        visible_at_tip: tips_rx,
    };
    (rows, handle)
}

async fn send<T>(token: &CancellationToken, tx: &mpsc::Sender<T>, value: T) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        result = tx.send(value) => result.is_ok(),
    }
}

/// Drain every channel into `writer`. Cancels `token` on failure.
pub(crate) async fn drain<W: StagingWriter>(
    writer: &mut W,
    rows: StagingRows,
    batch_size: usize,
    token: &CancellationToken,
) -> MetadataResult<StagedCounts> {
    let result = drain_rows(writer, rows, batch_size.max(1), token).await;
    if result.is_err() {
        token.cancel();
    }
    result
}

async fn drain_rows<W: StagingWriter>(
    writer: &mut W,
    mut rows: StagingRows,
    batch_size: usize,
    token: &CancellationToken,
) -> MetadataResult<StagedCounts> {
    let mut counts = StagedCounts::default();
    let mut commits: HashSet<String> = HashSet::new();
    let mut nearest = Vec::with_capacity(batch_size);
    let mut links = Vec::with_capacity(batch_size);
    let mut tips = Vec::with_capacity(batch_size);
    let (mut nearest_open, mut links_open, mut tips_open) = (true, true, true);

    while nearest_open || links_open || tips_open {
        tokio::select! {
            _ = token.cancelled() => {
                return Err(MetadataError::Cancelled("recompute cancelled while staging".to_string()));
            }
            row = rows.nearest_uploads.recv(), if nearest_open => match row {
                Some(row) => {
                    claim_commit(&mut commits, &row.commit)?;
                    nearest.push(row);
                    if nearest.len() >= batch_size {
                        writer.stage_nearest_uploads(&nearest).await?;
                        counts.nearest_uploads += nearest.len() as u64;
                        nearest.clear();
                    }
                }
                None => nearest_open = false,
            },
            row = rows.links.recv(), if links_open => match row {
                Some(row) => {
                    claim_commit(&mut commits, &row.commit)?;
                    links.push(row);
                    if links.len() >= batch_size {
                        writer.stage_links(&links).await?;
                        counts.links += links.len() as u64;
                        links.clear();
                    }
                }
                None => links_open = false,
            },
            row = rows.visible_at_tip.recv(), if tips_open => match row {
                Some(row) => {
                    tips.push(row);
                    if tips.len() >= batch_size {
                        writer.stage_visible_at_tip(&tips).await?;
                        counts.visible_at_tip += tips.len() as u64;
                        tips.clear();
                    }
                }
                None => tips_open = false,
            },
        }
    }

    if !nearest.is_empty() {
        writer.stage_nearest_uploads(&nearest).await?;
        counts.nearest_uploads += nearest.len() as u64;
    }
    if !links.is_empty() {
        writer.stage_links(&links).await?;
        counts.links += links.len() as u64;
    }
    if !tips.is_empty() {
        writer.stage_visible_at_tip(&tips).await?;
        counts.visible_at_tip += tips.len() as u64;
    }
    Ok(counts)
}

/// Every commit gets at most one landmark or link row.
fn claim_commit(commits: &mut HashSet<String>, commit: &str) -> MetadataResult<()> {
    if !commits.insert(commit.to_string()) {
        return Err(MetadataError::InvariantViolation(format!(
            "commit {commit} staged more than once"
        )));
    }
    Ok(())
}
