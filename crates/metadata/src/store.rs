//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    ClosestUploadRepo, CommitGraphRepo, DirtyRepositoryRepo, RetentionRepo, UploadRepo,
};
use crate::staging::StagingOptions;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    UploadRepo
    + CommitGraphRepo
    + DirtyRepositoryRepo
    + ClosestUploadRepo
    + RetentionRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    /// Upper bound on a single recompute. SQLite cannot cancel a running
    /// statement, so the bound applies between statements.
    query_timeout_secs: u64,
    staging: StagingOptions,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection: every statement of a recompute shares the
        // transaction's connection, and temp tables live on it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout_secs,
            staging: StagingOptions::default(),
        };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs,
            "Opened SQLite metadata store"
        );

        Ok(store)
    }

    /// Override channel and batch sizing for recomputes.
    pub fn with_staging_options(mut self, staging: StagingOptions) -> Self {
        self.staging = staging;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::reclaim::{self, ReferenceGraph, ReferenceNode};
    use crate::resolver;
    use crate::staging::{self, StagedCounts, StagingWriter};
    use lodestar_core::refs;
    use lodestar_core::{
        CommitGraph, CommitGraphView, LinkRelationship, NearestUploads, RefDescriptions,
        RefVisibility, StaleRefPolicy, UploadId, UploadMeta, UploadState,
    };
    use sqlx::SqliteConnection;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use time::{OffsetDateTime, UtcOffset};
    use tokio_util::sync::CancellationToken;

    /// Bound parameters per statement, below SQLite's historical limit of 999.
    const BIND_CHUNK: usize = 400;

    fn placeholders(n: usize) -> String {
        vec!["?"; n].join(", ")
    }

    /// Timestamps are stored as RFC 3339 text, so every bound value is
    /// normalized to UTC before it reaches the database.
    fn utc(at: OffsetDateTime) -> OffsetDateTime {
        at.to_offset(UtcOffset::UTC)
    }

    fn distance_from_db(distance: i64) -> MetadataResult<u32> {
        u32::try_from(distance)
            .map_err(|_| MetadataError::Serialization(format!("invalid distance {distance}")))
    }

    // =========================================================================
    // Shared transaction helpers
    // =========================================================================

    async fn mark_dirty(
        conn: &mut SqliteConnection,
        repository_id: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<i64> {
        let dirty_token: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO dirty_repositories (repository_id, dirty_token, update_token, set_dirty_at)
            VALUES (?, 1, 0, ?)
            ON CONFLICT (repository_id) DO UPDATE SET
                set_dirty_at = CASE
                    WHEN dirty_repositories.dirty_token = dirty_repositories.update_token
                    THEN excluded.set_dirty_at
                    ELSE dirty_repositories.set_dirty_at
                END,
                dirty_token = dirty_repositories.dirty_token + 1
            RETURNING dirty_token
            "#,
        )
        .bind(repository_id)
        .bind(utc(now))
        .fetch_one(conn)
        .await?;
        Ok(dirty_token)
    }

    async fn load_commit_graph_view(
        conn: &mut SqliteConnection,
        repository_id: i64,
    ) -> MetadataResult<CommitGraphView> {
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            "SELECT id, commit_sha, root, indexer FROM uploads WHERE repository_id = ? AND state = 'completed' ORDER BY id",
        )
        .bind(repository_id)
        .fetch_all(conn)
        .await?;

        let mut view = CommitGraphView::new();
        for (id, commit, root, indexer) in rows {
            view.add_upload(UploadId::new(id), &commit, &root, &indexer);
        }
        Ok(view)
    }

    async fn load_retention_configuration(
        conn: &mut SqliteConnection,
        repository_id: i64,
    ) -> MetadataResult<Option<RetentionConfigurationRow>> {
        let row = sqlx::query_as::<_, RetentionConfigurationRow>(
            "SELECT * FROM retention_configuration WHERE repository_id = ?",
        )
        .bind(repository_id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Landmark uploads of each commit, resolving links through their
    /// ancestor. Commits outside the tables are absent from the result.
    async fn visible_uploads_for_commits(
        conn: &mut SqliteConnection,
        repository_id: i64,
        commits: &[String],
    ) -> MetadataResult<Vec<(String, Vec<UploadMeta>)>> {
        let mut visible = Vec::new();
        for chunk in commits.chunks(BIND_CHUNK) {
            let ph = placeholders(chunk.len());
            let sql = format!(
                r#"
                SELECT nu.commit_sha, nu.uploads, 0 AS distance
                FROM nearest_uploads nu
                WHERE nu.repository_id = ? AND nu.commit_sha IN ({ph})
                UNION ALL
                SELECT l.commit_sha, nu.uploads, l.distance
                FROM nearest_uploads_links l
                JOIN nearest_uploads nu
                  ON nu.repository_id = l.repository_id
                 AND nu.commit_sha = l.ancestor_commit_sha
                WHERE l.repository_id = ? AND l.commit_sha IN ({ph})
                "#
            );
            let mut query = sqlx::query_as::<_, (String, String, i64)>(&sql).bind(repository_id);
            for commit in chunk {
                query = query.bind(commit);
            }
            query = query.bind(repository_id);
            for commit in chunk {
                query = query.bind(commit);
            }
            for (commit, uploads, distance) in query.fetch_all(&mut *conn).await? {
                visible.push((commit, decode_uploads(&uploads, distance_from_db(distance)?)?));
            }
        }
        Ok(visible)
    }

    /// Completed uploads among `upload_ids`, newest first.
    async fn fetch_dumps(
        conn: &mut SqliteConnection,
        upload_ids: &[UploadId],
        indexer: Option<&str>,
    ) -> MetadataResult<Vec<DumpRow>> {
        let mut dumps = Vec::new();
        for chunk in upload_ids.chunks(BIND_CHUNK) {
            let indexer_filter = if indexer.is_some() {
                "AND u.indexer = ?"
            } else {
                ""
            };
            let sql = format!(
                r#"
                SELECT u.*,
                       EXISTS (
                           SELECT 1 FROM uploads_visible_at_tip t
                           WHERE t.repository_id = u.repository_id
                             AND t.upload_id = u.id
                             AND t.is_default_branch = 1
                       ) AS visible_at_tip
                FROM uploads u
                WHERE u.state = 'completed' AND u.id IN ({}) {indexer_filter}
                "#,
                placeholders(chunk.len())
            );
            let mut query = sqlx::query_as::<_, DumpRow>(&sql);
            for id in chunk {
                query = query.bind(id.get());
            }
            if let Some(indexer) = indexer {
                query = query.bind(indexer);
            }
            dumps.extend(query.fetch_all(&mut *conn).await?);
        }
        dumps.sort_by(|a, b| {
            b.upload
                .finished_at
                .cmp(&a.upload.finished_at)
                .then(a.upload.id.cmp(&b.upload.id))
        });
        Ok(dumps)
    }

    async fn load_upload_identities(
        conn: &mut SqliteConnection,
        upload_ids: &[i64],
    ) -> MetadataResult<HashMap<i64, (String, String)>> {
        let mut identities = HashMap::new();
        for chunk in upload_ids.chunks(BIND_CHUNK) {
            let sql = format!(
                "SELECT id, root, indexer FROM uploads WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query_as::<_, (i64, String, String)>(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for (id, root, indexer) in query.fetch_all(&mut *conn).await? {
                identities.insert(id, (root, indexer));
            }
        }
        Ok(identities)
    }

    /// Run `sql` once per chunk of `ids`; `{ids}` in `sql` is replaced by the
    /// chunk's placeholders and `leading` is bound first.
    async fn execute_for_ids(
        conn: &mut SqliteConnection,
        sql: &str,
        leading: Option<OffsetDateTime>,
        ids: &[i64],
    ) -> MetadataResult<u64> {
        let mut affected = 0;
        for chunk in ids.chunks(BIND_CHUNK) {
            let sql = sql.replace("{ids}", &placeholders(chunk.len()));
            let mut query = sqlx::query(&sql);
            if let Some(at) = leading {
                query = query.bind(utc(at));
            }
            for id in chunk {
                query = query.bind(id);
            }
            affected += query.execute(&mut *conn).await?.rows_affected();
        }
        Ok(affected)
    }

    // =========================================================================
    // Uploads
    // =========================================================================

    #[async_trait]
    impl UploadRepo for SqliteStore {
        async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<UploadId> {
            let mut tx = self.pool.begin().await?;
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO uploads (
                    repository_id, commit_sha, root, indexer, indexer_version, state,
                    expired, uploaded_at, finished_at, associated_index_id
                )
                VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(upload.repository_id)
            .bind(&upload.commit_sha)
            .bind(&upload.root)
            .bind(&upload.indexer)
            .bind(&upload.indexer_version)
            .bind(upload.state.as_str())
            .bind(utc(upload.uploaded_at))
            .bind(upload.finished_at.map(utc))
            .bind(upload.associated_index_id)
            .fetch_one(&mut *tx)
            .await?;

            if upload.state == UploadState::Completed {
                mark_dirty(&mut tx, upload.repository_id, OffsetDateTime::now_utc()).await?;
            }
            tx.commit().await?;
            Ok(UploadId::new(id))
        }

        async fn get_upload(&self, upload_id: UploadId) -> MetadataResult<Option<UploadRow>> {
            let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ?")
                .bind(upload_id.get())
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_uploads_by_ids(
            &self,
            upload_ids: &[UploadId],
        ) -> MetadataResult<Vec<UploadRow>> {
            let mut rows = Vec::new();
            for chunk in upload_ids.chunks(BIND_CHUNK) {
                let sql = format!(
                    "SELECT * FROM uploads WHERE id IN ({}) ORDER BY id",
                    placeholders(chunk.len())
                );
                let mut query = sqlx::query_as::<_, UploadRow>(&sql);
                for id in chunk {
                    query = query.bind(id.get());
                }
                rows.extend(query.fetch_all(&self.pool).await?);
            }
            rows.sort_by_key(|row| row.id);
            Ok(rows)
        }

        async fn update_upload_state(
            &self,
            upload_id: UploadId,
            state: UploadState,
        ) -> MetadataResult<()> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            let current: Option<(String, i64)> =
                sqlx::query_as("SELECT state, repository_id FROM uploads WHERE id = ?")
                    .bind(upload_id.get())
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some((current, repository_id)) = current else {
                return Err(MetadataError::NotFound(format!("upload {upload_id}")));
            };
            current.parse::<UploadState>()?.transition_to(state)?;

            sqlx::query(
                r#"
                UPDATE uploads
                SET state = ?,
                    finished_at = CASE WHEN ? THEN COALESCE(finished_at, ?) ELSE finished_at END
                WHERE id = ?
                "#,
            )
            .bind(state.as_str())
            .bind(state == UploadState::Completed)
            .bind(utc(now))
            .bind(upload_id.get())
            .execute(&mut *tx)
            .await?;

            if matches!(state, UploadState::Completed | UploadState::Deleting) {
                mark_dirty(&mut tx, repository_id, now).await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn update_upload_retention(
            &self,
            protected: &[UploadId],
            expired: &[UploadId],
        ) -> MetadataResult<()> {
            let protected: Vec<i64> = protected.iter().map(|id| id.get()).collect();
            let expired: Vec<i64> = expired.iter().map(|id| id.get()).collect();

            let mut tx = self.pool.begin().await?;
            execute_for_ids(
                &mut tx,
                "UPDATE uploads SET expired = 0 WHERE id IN ({ids})",
                None,
                &protected,
            )
            .await?;
            execute_for_ids(
                &mut tx,
                "UPDATE uploads SET expired = 1 WHERE id IN ({ids})",
                None,
                &expired,
            )
            .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn delete_upload_by_id(&self, upload_id: UploadId) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;
            let current: Option<(String, i64)> =
                sqlx::query_as("SELECT state, repository_id FROM uploads WHERE id = ?")
                    .bind(upload_id.get())
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some((current, repository_id)) = current else {
                return Ok(false);
            };
            let Some(next) = current.parse::<UploadState>()?.soft_deleted() else {
                return Ok(false);
            };

            sqlx::query("UPDATE uploads SET state = ? WHERE id = ?")
                .bind(next.as_str())
                .bind(upload_id.get())
                .execute(&mut *tx)
                .await?;
            mark_dirty(&mut tx, repository_id, OffsetDateTime::now_utc()).await?;
            tx.commit().await?;

            tracing::info!(upload_id = %upload_id, state = %next, "Deleted upload");
            Ok(true)
        }

        async fn insert_packages(&self, packages: &[PackageRow]) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            for package in packages {
                sqlx::query(
                    "INSERT INTO packages (dump_id, scheme, manager, name, version) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(package.dump_id)
                .bind(&package.scheme)
                .bind(&package.manager)
                .bind(&package.name)
                .bind(&package.version)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn insert_package_references(
            &self,
            references: &[PackageReferenceRow],
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            for reference in references {
                sqlx::query(
                    "INSERT INTO package_references (dump_id, scheme, manager, name, version) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(reference.dump_id)
                .bind(&reference.scheme)
                .bind(&reference.manager)
                .bind(&reference.name)
                .bind(&reference.version)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn update_commit_dates(
            &self,
            repository_id: i64,
            dates: &[(String, OffsetDateTime)],
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            for (commit, committed_at) in dates {
                sqlx::query(
                    r#"
                    INSERT INTO commit_dates (repository_id, commit_sha, committed_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT (repository_id, commit_sha) DO NOTHING
                    "#,
                )
                .bind(repository_id)
                .bind(commit)
                .bind(utc(*committed_at))
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        }
    }

    // =========================================================================
    // Commit graph
    // =========================================================================

    struct SqliteStagingWriter<'c> {
        conn: &'c mut SqliteConnection,
    }

    #[async_trait]
    impl StagingWriter for SqliteStagingWriter<'_> {
        async fn stage_nearest_uploads(&mut self, rows: &[NearestUploads]) -> MetadataResult<()> {
            for chunk in rows.chunks(BIND_CHUNK / 2) {
                let sql = format!(
                    "INSERT INTO t_nearest_uploads (commit_sha, uploads) VALUES {}",
                    vec!["(?, ?)"; chunk.len()].join(", ")
                );
                let mut query = sqlx::query(&sql);
                for row in chunk {
                    query = query
                        .bind(row.commit.as_str())
                        .bind(encode_uploads(&row.uploads)?);
                }
                query.execute(&mut *self.conn).await?;
            }
            Ok(())
        }

        async fn stage_links(&mut self, rows: &[LinkRelationship]) -> MetadataResult<()> {
            for chunk in rows.chunks(BIND_CHUNK / 3) {
                let sql = format!(
                    "INSERT INTO t_nearest_uploads_links (commit_sha, ancestor_commit_sha, distance) VALUES {}",
                    vec!["(?, ?, ?)"; chunk.len()].join(", ")
                );
                let mut query = sqlx::query(&sql);
                for row in chunk {
                    query = query
                        .bind(row.commit.as_str())
                        .bind(row.ancestor_commit.as_str())
                        .bind(i64::from(row.distance));
                }
                query.execute(&mut *self.conn).await?;
            }
            Ok(())
        }

        async fn stage_visible_at_tip(&mut self, rows: &[RefVisibility]) -> MetadataResult<()> {
            for chunk in rows.chunks(BIND_CHUNK / 3) {
                let sql = format!(
                    "INSERT INTO t_uploads_visible_at_tip (upload_id, branch_or_tag_names, is_default_branch) VALUES {}",
                    vec!["(?, ?, ?)"; chunk.len()].join(", ")
                );
                let mut query = sqlx::query(&sql);
                for row in chunk {
                    query = query
                        .bind(row.upload_id.get())
                        .bind(row.branch_or_tag_names.as_str())
                        .bind(row.is_default_branch);
                }
                query.execute(&mut *self.conn).await?;
            }
            Ok(())
        }
    }

    async fn create_staging_tables(conn: &mut SqliteConnection) -> MetadataResult<()> {
        drop_staging_tables(conn).await?;
        sqlx::query(
            r#"
            CREATE TEMP TABLE t_nearest_uploads (
                commit_sha TEXT PRIMARY KEY,
                uploads TEXT NOT NULL
            );
            CREATE TEMP TABLE t_nearest_uploads_links (
                commit_sha TEXT PRIMARY KEY,
                ancestor_commit_sha TEXT NOT NULL,
                distance INTEGER NOT NULL
            );
            CREATE TEMP TABLE t_uploads_visible_at_tip (
                upload_id INTEGER NOT NULL,
                branch_or_tag_names TEXT NOT NULL,
                is_default_branch INTEGER NOT NULL
            );
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn drop_staging_tables(conn: &mut SqliteConnection) -> MetadataResult<()> {
        sqlx::query(
            r#"
            DROP TABLE IF EXISTS temp.t_nearest_uploads;
            DROP TABLE IF EXISTS temp.t_nearest_uploads_links;
            DROP TABLE IF EXISTS temp.t_uploads_visible_at_tip;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Apply the staged rows to the permanent tables as a minimal diff.
    async fn transfer_staged_rows(
        conn: &mut SqliteConnection,
        repository_id: i64,
        staged: StagedCounts,
    ) -> MetadataResult<(TransferStats, TransferStats, TransferStats)> {
        let mut nearest_uploads = TransferStats {
            staged: staged.nearest_uploads,
            ..TransferStats::default()
        };
        nearest_uploads.inserted = sqlx::query(
            r#"
            INSERT INTO nearest_uploads (repository_id, commit_sha, uploads)
            SELECT ?, t.commit_sha, t.uploads
            FROM t_nearest_uploads t
            WHERE NOT EXISTS (
                SELECT 1 FROM nearest_uploads nu
                WHERE nu.repository_id = ? AND nu.commit_sha = t.commit_sha
            )
            "#,
        )
        .bind(repository_id)
        .bind(repository_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        nearest_uploads.updated = sqlx::query(
            r#"
            UPDATE nearest_uploads
            SET uploads = (
                SELECT t.uploads FROM t_nearest_uploads t
                WHERE t.commit_sha = nearest_uploads.commit_sha
            )
            WHERE repository_id = ?
              AND EXISTS (
                SELECT 1 FROM t_nearest_uploads t
                WHERE t.commit_sha = nearest_uploads.commit_sha
                  AND t.uploads != nearest_uploads.uploads
              )
            "#,
        )
        .bind(repository_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        nearest_uploads.deleted = sqlx::query(
            r#"
            DELETE FROM nearest_uploads
            WHERE repository_id = ?
              AND NOT EXISTS (
                SELECT 1 FROM t_nearest_uploads t
                WHERE t.commit_sha = nearest_uploads.commit_sha
              )
            "#,
        )
        .bind(repository_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        let mut links = TransferStats {
            staged: staged.links,
            ..TransferStats::default()
        };
        links.inserted = sqlx::query(
            r#"
            INSERT INTO nearest_uploads_links (repository_id, commit_sha, ancestor_commit_sha, distance)
            SELECT ?, t.commit_sha, t.ancestor_commit_sha, t.distance
            FROM t_nearest_uploads_links t
            WHERE NOT EXISTS (
                SELECT 1 FROM nearest_uploads_links l
                WHERE l.repository_id = ? AND l.commit_sha = t.commit_sha
            )
            "#,
        )
        .bind(repository_id)
        .bind(repository_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        links.updated = sqlx::query(
            r#"
            UPDATE nearest_uploads_links
            SET ancestor_commit_sha = (
                    SELECT t.ancestor_commit_sha FROM t_nearest_uploads_links t
                    WHERE t.commit_sha = nearest_uploads_links.commit_sha
                ),
                distance = (
                    SELECT t.distance FROM t_nearest_uploads_links t
                    WHERE t.commit_sha = nearest_uploads_links.commit_sha
                )
            WHERE repository_id = ?
              AND EXISTS (
                SELECT 1 FROM t_nearest_uploads_links t
                WHERE t.commit_sha = nearest_uploads_links.commit_sha
                  AND (t.ancestor_commit_sha != nearest_uploads_links.ancestor_commit_sha
                       OR t.distance != nearest_uploads_links.distance)
              )
            "#,
        )
        .bind(repository_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        links.deleted = sqlx::query(
            r#"
            DELETE FROM nearest_uploads_links
            WHERE repository_id = ?
              AND NOT EXISTS (
                SELECT 1 FROM t_nearest_uploads_links t
                WHERE t.commit_sha = nearest_uploads_links.commit_sha
              )
            "#,
        )
        .bind(repository_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        let mut visible_at_tip = TransferStats {
            staged: staged.visible_at_tip,
            ..TransferStats::default()
        };
        visible_at_tip.inserted = sqlx::query(
            r#"
            INSERT INTO uploads_visible_at_tip (repository_id, upload_id, branch_or_tag_names, is_default_branch)
            SELECT ?, t.upload_id, t.branch_or_tag_names, t.is_default_branch
            FROM t_uploads_visible_at_tip t
            WHERE NOT EXISTS (
                SELECT 1 FROM uploads_visible_at_tip v
                WHERE v.repository_id = ?
                  AND v.upload_id = t.upload_id
                  AND v.branch_or_tag_names = t.branch_or_tag_names
                  AND v.is_default_branch = t.is_default_branch
            )
            "#,
        )
        .bind(repository_id)
        .bind(repository_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        visible_at_tip.deleted = sqlx::query(
            r#"
            DELETE FROM uploads_visible_at_tip
            WHERE repository_id = ?
              AND NOT EXISTS (
                SELECT 1 FROM t_uploads_visible_at_tip t
                WHERE t.upload_id = uploads_visible_at_tip.upload_id
                  AND t.branch_or_tag_names = uploads_visible_at_tip.branch_or_tag_names
                  AND t.is_default_branch = uploads_visible_at_tip.is_default_branch
              )
            "#,
        )
        .bind(repository_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        Ok((nearest_uploads, links, visible_at_tip))
    }

    impl SqliteStore {
        async fn recompute(
            &self,
            repository_id: i64,
            graph: &CommitGraph,
            refs: &RefDescriptions,
            policy: StaleRefPolicy,
            dirty_token: i64,
            now: OffsetDateTime,
        ) -> MetadataResult<VisibilityUpdateStats> {
            let started = std::time::Instant::now();
            let mut tx = self.pool.begin().await?;

            let view = load_commit_graph_view(&mut tx, repository_id).await?;
            let stored = load_retention_configuration(&mut tx, repository_id).await?;
            let policy = staging::resolve_stale_ref_policy(repository_id, stored.as_ref(), policy);
            let visibility = Arc::new(staging::compute_visibility(graph, view).await?);
            let tips = refs::non_stale_tips(refs, &policy, now);

            create_staging_tables(&mut tx).await?;
            let token = CancellationToken::new();
            let (rows, producer) = staging::spawn_producer(
                Arc::clone(&visibility),
                tips,
                self.staging.channel_capacity,
                token.clone(),
            );
            let staged = {
                let mut writer = SqliteStagingWriter { conn: &mut *tx };
                staging::drain(&mut writer, rows, self.staging.insert_batch_size, &token).await
            };
            producer.await.map_err(|e| {
                MetadataError::Internal(format!("visibility producer failed: {e}"))
            })?;
            let staged = staged?;

            let (nearest_uploads, links, visible_at_tip) =
                transfer_staged_rows(&mut tx, repository_id, staged).await?;

            if dirty_token != 0 {
                sqlx::query(
                    "UPDATE dirty_repositories SET update_token = MAX(update_token, ?), updated_at = ? WHERE repository_id = ?",
                )
                .bind(dirty_token)
                .bind(utc(now))
                .bind(repository_id)
                .execute(&mut *tx)
                .await?;
            }

            let uploads_deleted = sqlx::query(
                "UPDATE uploads SET state = 'deleted' WHERE repository_id = ? AND state = 'deleting'",
            )
            .bind(repository_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            drop_staging_tables(&mut tx).await?;
            tx.commit().await?;

            tracing::info!(
                repository_id,
                commits = visibility.len(),
                landmarks = visibility.landmark_count(),
                links = visibility.link_count(),
                inserted = nearest_uploads.inserted + links.inserted + visible_at_tip.inserted,
                updated = nearest_uploads.updated + links.updated,
                deleted = nearest_uploads.deleted + links.deleted + visible_at_tip.deleted,
                uploads_deleted,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Updated commit graph visibility"
            );

            Ok(VisibilityUpdateStats {
                nearest_uploads,
                links,
                visible_at_tip,
                uploads_deleted,
            })
        }
    }

    #[async_trait]
    impl CommitGraphRepo for SqliteStore {
        async fn get_commit_graph_view(
            &self,
            repository_id: i64,
        ) -> MetadataResult<CommitGraphView> {
            let mut conn = self.pool.acquire().await?;
            load_commit_graph_view(&mut conn, repository_id).await
        }

        async fn update_uploads_visible_to_commits(
            &self,
            repository_id: i64,
            graph: &CommitGraph,
            refs: &RefDescriptions,
            policy: StaleRefPolicy,
            dirty_token: i64,
            now: OffsetDateTime,
        ) -> MetadataResult<VisibilityUpdateStats> {
            let timeout = Duration::from_secs(self.query_timeout_secs);
            let recompute = self.recompute(repository_id, graph, refs, policy, dirty_token, now);
            match tokio::time::timeout(timeout, recompute).await {
                Ok(result) => result,
                Err(_) => Err(MetadataError::Cancelled(format!(
                    "recompute of repository {repository_id} exceeded {}s",
                    self.query_timeout_secs
                ))),
            }
        }

        async fn get_commits_visible_to_upload(
            &self,
            upload_id: UploadId,
            limit: u32,
            after: Option<&str>,
        ) -> MetadataResult<(Vec<String>, Option<String>)> {
            if limit == 0 {
                return Ok((Vec::new(), None));
            }
            let commits: Vec<String> = sqlx::query_scalar(
                r#"
                WITH direct AS (
                    SELECT nu.repository_id, nu.commit_sha
                    FROM nearest_uploads nu
                    WHERE nu.repository_id IN (SELECT repository_id FROM uploads WHERE id = ?)
                      AND json_extract(nu.uploads, '$."' || ? || '"') IS NOT NULL
                ),
                combined AS (
                    SELECT commit_sha FROM direct
                    UNION
                    SELECT l.commit_sha
                    FROM nearest_uploads_links l
                    JOIN direct d
                      ON d.repository_id = l.repository_id
                     AND d.commit_sha = l.ancestor_commit_sha
                )
                SELECT commit_sha FROM combined
                WHERE commit_sha > ?
                ORDER BY commit_sha
                LIMIT ?
                "#,
            )
            .bind(upload_id.get())
            .bind(upload_id.get().to_string())
            .bind(after.unwrap_or(""))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

            let next = if commits.len() == limit as usize {
                commits.last().cloned()
            } else {
                None
            };
            Ok((commits, next))
        }

        async fn get_commit_graph_metadata(
            &self,
            repository_id: i64,
        ) -> MetadataResult<CommitGraphMetadata> {
            let row = sqlx::query_as::<_, DirtyRepositoryRow>(
                "SELECT * FROM dirty_repositories WHERE repository_id = ?",
            )
            .bind(repository_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(match row {
                Some(row) => CommitGraphMetadata {
                    stale: row.update_token != row.dirty_token,
                    updated_at: row.updated_at,
                },
                None => CommitGraphMetadata {
                    stale: false,
                    updated_at: None,
                },
            })
        }

        async fn get_visibility_snapshot(
            &self,
            repository_id: i64,
        ) -> MetadataResult<VisibilitySnapshot> {
            let landmarks: Vec<(String, String)> = sqlx::query_as(
                "SELECT commit_sha, uploads FROM nearest_uploads WHERE repository_id = ? ORDER BY commit_sha",
            )
            .bind(repository_id)
            .fetch_all(&self.pool)
            .await?;
            let links: Vec<(String, String, i64)> = sqlx::query_as(
                "SELECT commit_sha, ancestor_commit_sha, distance FROM nearest_uploads_links WHERE repository_id = ? ORDER BY commit_sha",
            )
            .bind(repository_id)
            .fetch_all(&self.pool)
            .await?;
            let visible_at_tip: Vec<(i64, String, bool)> = sqlx::query_as(
                r#"
                SELECT upload_id, branch_or_tag_names, is_default_branch
                FROM uploads_visible_at_tip
                WHERE repository_id = ?
                ORDER BY upload_id, branch_or_tag_names, is_default_branch
                "#,
            )
            .bind(repository_id)
            .fetch_all(&self.pool)
            .await?;

            let nearest_uploads = landmarks
                .into_iter()
                .map(|(commit, uploads)| Ok((commit, decode_uploads(&uploads, 0)?)))
                .collect::<MetadataResult<Vec<_>>>()?;
            Ok(VisibilitySnapshot {
                nearest_uploads,
                links,
                visible_at_tip,
            })
        }

        async fn get_retention_configuration(
            &self,
            repository_id: i64,
        ) -> MetadataResult<Option<RetentionConfigurationRow>> {
            let mut conn = self.pool.acquire().await?;
            load_retention_configuration(&mut conn, repository_id).await
        }

        async fn set_retention_configuration(
            &self,
            config: &RetentionConfigurationRow,
        ) -> MetadataResult<()> {
            if config.max_age_for_non_stale_branches_seconds < 0
                || config.max_age_for_non_stale_tags_seconds < 0
            {
                return Err(MetadataError::Config(
                    "stale-ref windows must not be negative".to_string(),
                ));
            }
            sqlx::query(
                r#"
                INSERT INTO retention_configuration (
                    repository_id, max_age_for_non_stale_branches_seconds, max_age_for_non_stale_tags_seconds
                )
                VALUES (?, ?, ?)
                ON CONFLICT (repository_id) DO UPDATE SET
                    max_age_for_non_stale_branches_seconds = excluded.max_age_for_non_stale_branches_seconds,
                    max_age_for_non_stale_tags_seconds = excluded.max_age_for_non_stale_tags_seconds
                "#,
            )
            .bind(config.repository_id)
            .bind(config.max_age_for_non_stale_branches_seconds)
            .bind(config.max_age_for_non_stale_tags_seconds)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    // =========================================================================
    // Dirty repositories
    // =========================================================================

    #[async_trait]
    impl DirtyRepositoryRepo for SqliteStore {
        async fn mark_repository_dirty(&self, repository_id: i64) -> MetadataResult<i64> {
            let mut conn = self.pool.acquire().await?;
            mark_dirty(&mut conn, repository_id, OffsetDateTime::now_utc()).await
        }

        async fn get_dirty_repositories(&self) -> MetadataResult<Vec<DirtyRepositoryRow>> {
            let rows = sqlx::query_as::<_, DirtyRepositoryRow>(
                "SELECT * FROM dirty_repositories WHERE dirty_token > update_token ORDER BY repository_id",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_repositories_max_stale_age(
            &self,
            now: OffsetDateTime,
        ) -> MetadataResult<time::Duration> {
            let oldest: Option<OffsetDateTime> = sqlx::query_scalar(
                r#"
                SELECT set_dirty_at FROM dirty_repositories
                WHERE dirty_token > update_token
                ORDER BY julianday(set_dirty_at)
                LIMIT 1
                "#,
            )
            .fetch_optional(&self.pool)
            .await?;
            Ok(oldest
                .map(|at| now - at)
                .filter(|age| age.is_positive())
                .unwrap_or(time::Duration::ZERO))
        }
    }

    // =========================================================================
    // Closest uploads
    // =========================================================================

    #[async_trait]
    impl ClosestUploadRepo for SqliteStore {
        async fn find_closest_uploads(
            &self,
            query: &ClosestUploadQuery,
        ) -> MetadataResult<Vec<DumpRow>> {
            let mut conn = self.pool.acquire().await?;
            let visible = visible_uploads_for_commits(
                &mut conn,
                query.repository_id,
                std::slice::from_ref(&query.commit),
            )
            .await?;
            let ids: Vec<UploadId> = visible
                .iter()
                .flat_map(|(_, uploads)| resolver::ids_of(uploads))
                .collect();
            let dumps = fetch_dumps(&mut conn, &ids, query.indexer.as_deref()).await?;
            Ok(resolver::covering_dumps(dumps, query))
        }

        async fn find_closest_uploads_from_graph_fragment(
            &self,
            query: &ClosestUploadQuery,
            fragment: &CommitGraph,
        ) -> MetadataResult<Vec<DumpRow>> {
            if !fragment.contains(&query.commit) {
                return self.find_closest_uploads(query).await;
            }

            let mut conn = self.pool.acquire().await?;
            let visible =
                visible_uploads_for_commits(&mut conn, query.repository_id, fragment.order())
                    .await?;
            let identities =
                load_upload_identities(&mut conn, &resolver::upload_ids(&visible)).await?;
            let view = resolver::fragment_view(visible, &identities);
            let visibility = staging::compute_visibility(fragment, view).await?;
            let uploads = visibility.uploads_visible_at_commit(&query.commit);

            let dumps = fetch_dumps(
                &mut conn,
                &resolver::ids_of(&uploads),
                query.indexer.as_deref(),
            )
            .await?;
            Ok(resolver::covering_dumps(dumps, query))
        }
    }

    // =========================================================================
    // Retention
    // =========================================================================

    struct SqliteReferenceGraph<'c> {
        conn: &'c mut SqliteConnection,
    }

    #[async_trait]
    impl ReferenceGraph for SqliteReferenceGraph<'_> {
        async fn dependents(&mut self, providers: &[i64]) -> MetadataResult<Vec<ReferenceNode>> {
            let mut nodes = Vec::new();
            for chunk in providers.chunks(BIND_CHUNK) {
                let sql = format!(
                    r#"
                    SELECT DISTINCT u.id, u.repository_id, u.expired
                    FROM ranked_package_providers pp
                    JOIN package_references r
                      ON r.scheme = pp.scheme
                     AND r.manager = pp.manager
                     AND r.name = pp.name
                     AND r.version = pp.version
                    JOIN uploads u ON u.id = r.dump_id
                    WHERE pp.upload_id IN ({})
                      AND pp.provider_rank = 1
                      AND r.dump_id != pp.upload_id
                      AND u.state = 'completed'
                    ORDER BY u.id
                    "#,
                    placeholders(chunk.len())
                );
                let mut query = sqlx::query_as::<_, ReferenceNode>(&sql);
                for id in chunk {
                    query = query.bind(id);
                }
                nodes.extend(query.fetch_all(&mut *self.conn).await?);
            }
            Ok(nodes)
        }
    }

    /// Candidates that canonically provide a package some other live upload
    /// references.
    async fn referenced_canonical_providers(
        conn: &mut SqliteConnection,
        upload_ids: &[i64],
    ) -> MetadataResult<HashSet<i64>> {
        let mut retained = HashSet::new();
        for chunk in upload_ids.chunks(BIND_CHUNK) {
            let sql = format!(
                r#"
                SELECT DISTINCT pp.upload_id
                FROM ranked_package_providers pp
                WHERE pp.upload_id IN ({})
                  AND pp.provider_rank = 1
                  AND EXISTS (
                    SELECT 1
                    FROM package_references r
                    JOIN uploads ru ON ru.id = r.dump_id
                    WHERE r.scheme = pp.scheme
                      AND r.manager = pp.manager
                      AND r.name = pp.name
                      AND r.version = pp.version
                      AND r.dump_id != pp.upload_id
                      AND ru.state NOT IN ('deleting', 'deleted')
                  )
                "#,
                placeholders(chunk.len())
            );
            let mut query = sqlx::query_scalar::<_, i64>(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            retained.extend(query.fetch_all(&mut *conn).await?);
        }
        Ok(retained)
    }

    #[async_trait]
    impl RetentionRepo for SqliteStore {
        async fn reclaim_by_reference(
            &self,
            batch_size: u32,
        ) -> MetadataResult<ReferenceReclaimStats> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let candidates = sqlx::query_as::<_, ReferenceNode>(
                r#"
                SELECT id, repository_id, expired
                FROM uploads
                WHERE state = 'completed' AND expired = 1
                ORDER BY julianday(last_referenced_scan_at) NULLS FIRST, julianday(finished_at), id
                LIMIT ?
                "#,
            )
            .bind(i64::from(batch_size))
            .fetch_all(&mut *tx)
            .await?;
            if candidates.is_empty() {
                tx.commit().await?;
                return Ok(ReferenceReclaimStats::default());
            }

            let ids: Vec<i64> = candidates.iter().map(|node| node.id).collect();
            let retained = referenced_canonical_providers(&mut tx, &ids).await?;
            let doomed: Vec<ReferenceNode> = candidates
                .iter()
                .filter(|node| !retained.contains(&node.id))
                .copied()
                .collect();
            let doomed_ids: Vec<i64> = doomed.iter().map(|node| node.id).collect();

            execute_for_ids(
                &mut tx,
                "UPDATE uploads SET last_referenced_scan_at = ? WHERE id IN ({ids})",
                Some(now),
                &ids,
            )
            .await?;
            let deleted = execute_for_ids(
                &mut tx,
                "UPDATE uploads SET state = 'deleting' WHERE state = 'completed' AND id IN ({ids})",
                None,
                &doomed_ids,
            )
            .await?;

            let repositories = reclaim::repositories_of(&doomed);
            for repository_id in &repositories {
                mark_dirty(&mut tx, *repository_id, now).await?;
            }
            tx.commit().await?;

            tracing::info!(
                scanned = ids.len(),
                deleted,
                repositories = repositories.len(),
                "Reclaimed unreferenced expired uploads"
            );
            Ok(ReferenceReclaimStats {
                scanned: ids.len() as u64,
                deleted,
                repositories,
            })
        }

        async fn reclaim_by_traversal(
            &self,
            traversal_limit: u32,
        ) -> MetadataResult<TraversalReclaimStats> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let root = sqlx::query_as::<_, ReferenceNode>(
                r#"
                SELECT u.id, u.repository_id, u.expired
                FROM uploads u
                WHERE u.state = 'completed'
                  AND u.expired = 1
                  AND EXISTS (
                    SELECT 1
                    FROM ranked_package_providers pp
                    JOIN package_references r
                      ON r.scheme = pp.scheme
                     AND r.manager = pp.manager
                     AND r.name = pp.name
                     AND r.version = pp.version
                    JOIN uploads ru ON ru.id = r.dump_id
                    WHERE pp.upload_id = u.id
                      AND pp.provider_rank = 1
                      AND r.dump_id != u.id
                      AND ru.state NOT IN ('deleting', 'deleted')
                  )
                ORDER BY julianday(u.last_traversal_scan_at) NULLS FIRST, julianday(u.finished_at), u.id
                LIMIT 1
                "#,
            )
            .fetch_optional(&mut *tx)
            .await?;
            let Some(root) = root else {
                tx.commit().await?;
                return Ok(TraversalReclaimStats::default());
            };

            let expansion = {
                let mut graph = SqliteReferenceGraph { conn: &mut *tx };
                reclaim::expand(&mut graph, root, traversal_limit).await?
            };
            let ids = expansion.ids();

            execute_for_ids(
                &mut tx,
                "UPDATE uploads SET last_traversal_scan_at = ? WHERE id IN ({ids})",
                Some(now),
                &ids,
            )
            .await?;

            let (deleted, repositories) = if expansion.deletable() {
                let deleted = execute_for_ids(
                    &mut tx,
                    "UPDATE uploads SET state = 'deleting' WHERE state = 'completed' AND id IN ({ids})",
                    None,
                    &ids,
                )
                .await?;
                let repositories = expansion.repositories();
                for repository_id in &repositories {
                    mark_dirty(&mut tx, *repository_id, now).await?;
                }
                (deleted, repositories)
            } else {
                (0, Vec::new())
            };
            tx.commit().await?;

            tracing::info!(
                root = root.id,
                visited = ids.len(),
                capped = expansion.capped,
                deleted,
                "Traversed package reference graph"
            );
            Ok(TraversalReclaimStats {
                root: Some(root.id),
                visited: ids.len() as u64,
                deleted,
                capped: expansion.capped,
                repositories,
            })
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Upload catalog
CREATE TABLE IF NOT EXISTS uploads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    root TEXT NOT NULL DEFAULT '',
    indexer TEXT NOT NULL,
    indexer_version TEXT,
    state TEXT NOT NULL,
    expired INTEGER NOT NULL DEFAULT 0,
    uploaded_at TEXT NOT NULL,
    finished_at TEXT,
    last_referenced_scan_at TEXT,
    last_traversal_scan_at TEXT,
    last_reconcile_at TEXT,
    associated_index_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_uploads_repository_state ON uploads(repository_id, state);
CREATE INDEX IF NOT EXISTS idx_uploads_expired ON uploads(state, expired);

-- Packages provided by uploads
CREATE TABLE IF NOT EXISTS packages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dump_id INTEGER NOT NULL REFERENCES uploads(id),
    scheme TEXT NOT NULL,
    manager TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL,
    version TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_packages_identity ON packages(scheme, manager, name, version);
CREATE INDEX IF NOT EXISTS idx_packages_dump ON packages(dump_id);

-- Packages referenced by uploads
CREATE TABLE IF NOT EXISTS package_references (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dump_id INTEGER NOT NULL REFERENCES uploads(id),
    scheme TEXT NOT NULL,
    manager TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL,
    version TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_package_references_identity ON package_references(scheme, manager, name, version);
CREATE INDEX IF NOT EXISTS idx_package_references_dump ON package_references(dump_id);

-- Commit dates, used to rank package providers
CREATE TABLE IF NOT EXISTS commit_dates (
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    committed_at TEXT,
    PRIMARY KEY (repository_id, commit_sha)
);

-- Landmark commits and the uploads visible from them
CREATE TABLE IF NOT EXISTS nearest_uploads (
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    uploads TEXT NOT NULL,
    PRIMARY KEY (repository_id, commit_sha)
);

-- Commits that see exactly what a landmark ancestor sees
CREATE TABLE IF NOT EXISTS nearest_uploads_links (
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    ancestor_commit_sha TEXT NOT NULL,
    distance INTEGER NOT NULL,
    PRIMARY KEY (repository_id, commit_sha)
);

CREATE INDEX IF NOT EXISTS idx_nearest_uploads_links_ancestor ON nearest_uploads_links(repository_id, ancestor_commit_sha);

-- Uploads visible at the tip of a non-stale branch or tag
CREATE TABLE IF NOT EXISTS uploads_visible_at_tip (
    repository_id INTEGER NOT NULL,
    upload_id INTEGER NOT NULL,
    branch_or_tag_names TEXT NOT NULL,
    is_default_branch INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_uploads_visible_at_tip_repository ON uploads_visible_at_tip(repository_id, upload_id);

-- Dirty/update token handshake per repository
CREATE TABLE IF NOT EXISTS dirty_repositories (
    repository_id INTEGER PRIMARY KEY,
    dirty_token INTEGER NOT NULL DEFAULT 0,
    update_token INTEGER NOT NULL DEFAULT 0,
    set_dirty_at TEXT NOT NULL,
    updated_at TEXT
);

-- Per-repository stale-ref windows
CREATE TABLE IF NOT EXISTS retention_configuration (
    repository_id INTEGER PRIMARY KEY,
    max_age_for_non_stale_branches_seconds INTEGER NOT NULL,
    max_age_for_non_stale_tags_seconds INTEGER NOT NULL
);

-- Providers of each package ranked by commit date within
-- (repository, indexer, root); rank 1 is the canonical provider.
DROP VIEW IF EXISTS ranked_package_providers;
CREATE VIEW ranked_package_providers AS
SELECT
    u.id AS upload_id,
    u.repository_id,
    u.expired,
    p.scheme,
    p.manager,
    p.name,
    p.version,
    rank() OVER (
        PARTITION BY p.scheme, p.manager, p.name, p.version, u.repository_id, u.indexer, u.root
        ORDER BY julianday(cd.committed_at) NULLS LAST, u.id
    ) AS provider_rank
FROM uploads u
JOIN packages p ON p.dump_id = u.id
LEFT JOIN commit_dates cd ON cd.repository_id = u.repository_id AND cd.commit_sha = u.commit_sha
WHERE u.state = 'completed';
"#;
