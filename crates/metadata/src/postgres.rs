//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::reclaim::{self, ReferenceGraph, ReferenceNode};
use crate::repos::{
    ClosestUploadRepo, CommitGraphRepo, DirtyRepositoryRepo, RetentionRepo, UploadRepo,
};
use crate::resolver;
use crate::staging::{self, StagedCounts, StagingOptions, StagingWriter};
use crate::store::MetadataStore;
use async_trait::async_trait;
use lodestar_core::config::PgSslMode;
use lodestar_core::refs;
use lodestar_core::{
    CommitGraph, CommitGraphView, LinkRelationship, NearestUploads, RefDescriptions,
    RefVisibility, StaleRefPolicy, UploadId, UploadMeta, UploadState,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{PgConnection, Pool, Postgres};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
    staging: StagingOptions,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters,
    /// so the password can come from the environment.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            staging: StagingOptions::default(),
        };
        store.migrate().await?;

        Ok(store)
    }

    /// Override channel and batch sizing for recomputes.
    pub fn with_staging_options(mut self, staging: StagingOptions) -> Self {
        self.staging = staging;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements hold one statement each.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn distance_from_db(distance: i64) -> MetadataResult<u32> {
    u32::try_from(distance)
        .map_err(|_| MetadataError::Serialization(format!("invalid distance {distance}")))
}

fn raw_ids(upload_ids: &[UploadId]) -> Vec<i64> {
    upload_ids.iter().map(|id| id.get()).collect()
}

// =============================================================================
// Shared transaction helpers
// =============================================================================

async fn mark_dirty(
    conn: &mut PgConnection,
    repository_id: i64,
    now: OffsetDateTime,
) -> MetadataResult<i64> {
    let dirty_token: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO dirty_repositories (repository_id, dirty_token, update_token, set_dirty_at)
        VALUES ($1, 1, 0, $2)
        ON CONFLICT (repository_id) DO UPDATE SET
            set_dirty_at = CASE
                WHEN dirty_repositories.dirty_token = dirty_repositories.update_token
                THEN EXCLUDED.set_dirty_at
                ELSE dirty_repositories.set_dirty_at
            END,
            dirty_token = dirty_repositories.dirty_token + 1
        RETURNING dirty_token
        "#,
    )
    .bind(repository_id)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(dirty_token)
}

async fn load_commit_graph_view(
    conn: &mut PgConnection,
    repository_id: i64,
) -> MetadataResult<CommitGraphView> {
    let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
        "SELECT id, commit_sha, root, indexer FROM uploads WHERE repository_id = $1 AND state = 'completed' ORDER BY id",
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
    conn: &mut PgConnection,
    repository_id: i64,
) -> MetadataResult<Option<RetentionConfigurationRow>> {
    let row = sqlx::query_as::<_, RetentionConfigurationRow>(
        "SELECT * FROM retention_configuration WHERE repository_id = $1",
    )
    .bind(repository_id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

async fn visible_uploads_for_commits(
    conn: &mut PgConnection,
    repository_id: i64,
    commits: &[String],
) -> MetadataResult<Vec<(String, Vec<UploadMeta>)>> {
    let rows: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT nu.commit_sha, nu.uploads::text, 0::bigint AS distance
        FROM nearest_uploads nu
        WHERE nu.repository_id = $1 AND nu.commit_sha = ANY($2)
        UNION ALL
        SELECT l.commit_sha, nu.uploads::text, l.distance
        FROM nearest_uploads_links l
        JOIN nearest_uploads nu
          ON nu.repository_id = l.repository_id
         AND nu.commit_sha = l.ancestor_commit_sha
        WHERE l.repository_id = $1 AND l.commit_sha = ANY($2)
        "#,
    )
    .bind(repository_id)
    .bind(commits)
    .fetch_all(conn)
    .await?;

    rows.into_iter()
        .map(|(commit, uploads, distance)| {
            Ok((commit, decode_uploads(&uploads, distance_from_db(distance)?)?))
        })
        .collect()
}

/// Completed uploads among `upload_ids`, newest first.
async fn fetch_dumps(
    conn: &mut PgConnection,
    upload_ids: &[UploadId],
    indexer: Option<&str>,
) -> MetadataResult<Vec<DumpRow>> {
    if upload_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query_as::<_, DumpRow>(
        r#"
        SELECT u.*,
               EXISTS (
                   SELECT 1 FROM uploads_visible_at_tip t
                   WHERE t.repository_id = u.repository_id
                     AND t.upload_id = u.id
                     AND t.is_default_branch
               ) AS visible_at_tip
        FROM uploads u
        WHERE u.state = 'completed'
          AND u.id = ANY($1)
          AND ($2::text IS NULL OR u.indexer = $2)
        ORDER BY u.finished_at DESC NULLS LAST, u.id
        "#,
    )
    .bind(raw_ids(upload_ids))
    .bind(indexer)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

async fn load_upload_identities(
    conn: &mut PgConnection,
    upload_ids: &[i64],
) -> MetadataResult<HashMap<i64, (String, String)>> {
    let rows: Vec<(i64, String, String)> =
        sqlx::query_as("SELECT id, root, indexer FROM uploads WHERE id = ANY($1)")
            .bind(upload_ids)
            .fetch_all(conn)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(id, root, indexer)| (id, (root, indexer)))
        .collect())
}

// =============================================================================
// Uploads
// =============================================================================

#[async_trait]
impl UploadRepo for PostgresStore {
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<UploadId> {
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO uploads (
                repository_id, commit_sha, root, indexer, indexer_version, state,
                expired, uploaded_at, finished_at, associated_index_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(upload.repository_id)
        .bind(&upload.commit_sha)
        .bind(&upload.root)
        .bind(&upload.indexer)
        .bind(&upload.indexer_version)
        .bind(upload.state.as_str())
        .bind(upload.uploaded_at)
        .bind(upload.finished_at)
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
        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = $1")
            .bind(upload_id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_uploads_by_ids(&self, upload_ids: &[UploadId]) -> MetadataResult<Vec<UploadRow>> {
        let rows =
            sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ANY($1) ORDER BY id")
                .bind(raw_ids(upload_ids))
                .fetch_all(&self.pool)
                .await?;
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
            sqlx::query_as("SELECT state, repository_id FROM uploads WHERE id = $1 FOR UPDATE")
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
            SET state = $1,
                finished_at = CASE WHEN $2 THEN COALESCE(finished_at, $3) ELSE finished_at END
            WHERE id = $4
            "#,
        )
        .bind(state.as_str())
        .bind(state == UploadState::Completed)
        .bind(now)
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
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE uploads SET expired = FALSE WHERE id = ANY($1)")
            .bind(raw_ids(protected))
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE uploads SET expired = TRUE WHERE id = ANY($1)")
            .bind(raw_ids(expired))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_upload_by_id(&self, upload_id: UploadId) -> MetadataResult<bool> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(String, i64)> =
            sqlx::query_as("SELECT state, repository_id FROM uploads WHERE id = $1 FOR UPDATE")
                .bind(upload_id.get())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((current, repository_id)) = current else {
            return Ok(false);
        };
        let Some(next) = current.parse::<UploadState>()?.soft_deleted() else {
            return Ok(false);
        };

        sqlx::query("UPDATE uploads SET state = $1 WHERE id = $2")
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
                "INSERT INTO packages (dump_id, scheme, manager, name, version) VALUES ($1, $2, $3, $4, $5)",
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
                "INSERT INTO package_references (dump_id, scheme, manager, name, version) VALUES ($1, $2, $3, $4, $5)",
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
                VALUES ($1, $2, $3)
                ON CONFLICT (repository_id, commit_sha) DO NOTHING
                "#,
            )
            .bind(repository_id)
            .bind(commit)
            .bind(committed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// =============================================================================
// Commit graph
// =============================================================================

struct PgStagingWriter<'c> {
    conn: &'c mut PgConnection,
}

#[async_trait]
impl StagingWriter for PgStagingWriter<'_> {
    async fn stage_nearest_uploads(&mut self, rows: &[NearestUploads]) -> MetadataResult<()> {
        let commits: Vec<&str> = rows.iter().map(|row| row.commit.as_str()).collect();
        let uploads = rows
            .iter()
            .map(|row| encode_uploads(&row.uploads))
            .collect::<MetadataResult<Vec<_>>>()?;
        sqlx::query(
            r#"
            INSERT INTO t_nearest_uploads (commit_sha, uploads)
            SELECT c, u::jsonb FROM UNNEST($1::text[], $2::text[]) AS t(c, u)
            "#,
        )
        .bind(commits)
        .bind(uploads)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn stage_links(&mut self, rows: &[LinkRelationship]) -> MetadataResult<()> {
        let commits: Vec<&str> = rows.iter().map(|row| row.commit.as_str()).collect();
        let ancestors: Vec<&str> = rows.iter().map(|row| row.ancestor_commit.as_str()).collect();
        let distances: Vec<i64> = rows.iter().map(|row| i64::from(row.distance)).collect();
        sqlx::query(
            r#"
            INSERT INTO t_nearest_uploads_links (commit_sha, ancestor_commit_sha, distance)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::bigint[])
            "#,
        )
        .bind(commits)
        .bind(ancestors)
        .bind(distances)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn stage_visible_at_tip(&mut self, rows: &[RefVisibility]) -> MetadataResult<()> {
        let upload_ids: Vec<i64> = rows.iter().map(|row| row.upload_id.get()).collect();
        let names: Vec<&str> = rows
            .iter()
            .map(|row| row.branch_or_tag_names.as_str())
            .collect();
        let defaults: Vec<bool> = rows.iter().map(|row| row.is_default_branch).collect();
        sqlx::query(
            r#"
            INSERT INTO t_uploads_visible_at_tip (upload_id, branch_or_tag_names, is_default_branch)
            SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::boolean[])
            "#,
        )
        .bind(upload_ids)
        .bind(names)
        .bind(defaults)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }
}

async fn create_staging_tables(conn: &mut PgConnection) -> MetadataResult<()> {
    for statement in [
        "CREATE TEMPORARY TABLE t_nearest_uploads (commit_sha TEXT PRIMARY KEY, uploads JSONB NOT NULL) ON COMMIT DROP",
        "CREATE TEMPORARY TABLE t_nearest_uploads_links (commit_sha TEXT PRIMARY KEY, ancestor_commit_sha TEXT NOT NULL, distance BIGINT NOT NULL) ON COMMIT DROP",
        "CREATE TEMPORARY TABLE t_uploads_visible_at_tip (upload_id BIGINT NOT NULL, branch_or_tag_names TEXT NOT NULL, is_default_branch BOOLEAN NOT NULL) ON COMMIT DROP",
    ] {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn transfer_staged_rows(
    conn: &mut PgConnection,
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
        SELECT $1, t.commit_sha, t.uploads
        FROM t_nearest_uploads t
        WHERE NOT EXISTS (
            SELECT 1 FROM nearest_uploads nu
            WHERE nu.repository_id = $1 AND nu.commit_sha = t.commit_sha
        )
        "#,
    )
    .bind(repository_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    nearest_uploads.updated = sqlx::query(
        r#"
        UPDATE nearest_uploads nu
        SET uploads = t.uploads
        FROM t_nearest_uploads t
        WHERE nu.repository_id = $1
          AND nu.commit_sha = t.commit_sha
          AND nu.uploads != t.uploads
        "#,
    )
    .bind(repository_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    nearest_uploads.deleted = sqlx::query(
        r#"
        DELETE FROM nearest_uploads nu
        WHERE nu.repository_id = $1
          AND NOT EXISTS (SELECT 1 FROM t_nearest_uploads t WHERE t.commit_sha = nu.commit_sha)
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
        SELECT $1, t.commit_sha, t.ancestor_commit_sha, t.distance
        FROM t_nearest_uploads_links t
        WHERE NOT EXISTS (
            SELECT 1 FROM nearest_uploads_links l
            WHERE l.repository_id = $1 AND l.commit_sha = t.commit_sha
        )
        "#,
    )
    .bind(repository_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    links.updated = sqlx::query(
        r#"
        UPDATE nearest_uploads_links l
        SET ancestor_commit_sha = t.ancestor_commit_sha, distance = t.distance
        FROM t_nearest_uploads_links t
        WHERE l.repository_id = $1
          AND l.commit_sha = t.commit_sha
          AND (l.ancestor_commit_sha != t.ancestor_commit_sha OR l.distance != t.distance)
        "#,
    )
    .bind(repository_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    links.deleted = sqlx::query(
        r#"
        DELETE FROM nearest_uploads_links l
        WHERE l.repository_id = $1
          AND NOT EXISTS (SELECT 1 FROM t_nearest_uploads_links t WHERE t.commit_sha = l.commit_sha)
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
        SELECT $1, t.upload_id, t.branch_or_tag_names, t.is_default_branch
        FROM t_uploads_visible_at_tip t
        WHERE NOT EXISTS (
            SELECT 1 FROM uploads_visible_at_tip v
            WHERE v.repository_id = $1
              AND v.upload_id = t.upload_id
              AND v.branch_or_tag_names = t.branch_or_tag_names
              AND v.is_default_branch = t.is_default_branch
        )
        "#,
    )
    .bind(repository_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    visible_at_tip.deleted = sqlx::query(
        r#"
        DELETE FROM uploads_visible_at_tip v
        WHERE v.repository_id = $1
          AND NOT EXISTS (
            SELECT 1 FROM t_uploads_visible_at_tip t
            WHERE t.upload_id = v.upload_id
              AND t.branch_or_tag_names = v.branch_or_tag_names
              AND t.is_default_branch = v.is_default_branch
          )
        "#,
    )
    .bind(repository_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok((nearest_uploads, links, visible_at_tip))
}

#[async_trait]
impl CommitGraphRepo for PostgresStore {
    async fn get_commit_graph_view(&self, repository_id: i64) -> MetadataResult<CommitGraphView> {
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
        let started = std::time::Instant::now();
        let mut tx = self.pool.begin().await?;

        // Serialize recomputes of the same repository.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(repository_id)
            .execute(&mut *tx)
            .await?;

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
            let mut writer = PgStagingWriter { conn: &mut *tx };
            staging::drain(&mut writer, rows, self.staging.insert_batch_size, &token).await
        };
        producer
            .await
            .map_err(|e| MetadataError::Internal(format!("visibility producer failed: {e}")))?;
        let staged = staged?;

        let (nearest_uploads, links, visible_at_tip) =
            transfer_staged_rows(&mut tx, repository_id, staged).await?;

        if dirty_token != 0 {
            sqlx::query(
                "UPDATE dirty_repositories SET update_token = GREATEST(update_token, $1), updated_at = $2 WHERE repository_id = $3",
            )
            .bind(dirty_token)
            .bind(now)
            .bind(repository_id)
            .execute(&mut *tx)
            .await?;
        }

        let uploads_deleted = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT id FROM uploads
                WHERE repository_id = $1 AND state = 'deleting'
                ORDER BY id
                FOR UPDATE
            )
            UPDATE uploads u
            SET state = 'deleted'
            FROM candidates c
            WHERE u.id = c.id
            "#,
        )
        .bind(repository_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

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
                WHERE nu.repository_id IN (SELECT repository_id FROM uploads WHERE id = $1)
                  AND nu.uploads ? $2
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
            WHERE commit_sha > $3
            ORDER BY commit_sha
            LIMIT $4
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
            "SELECT * FROM dirty_repositories WHERE repository_id = $1",
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
            "SELECT commit_sha, uploads::text FROM nearest_uploads WHERE repository_id = $1 ORDER BY commit_sha",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        let links: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT commit_sha, ancestor_commit_sha, distance FROM nearest_uploads_links WHERE repository_id = $1 ORDER BY commit_sha",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        let visible_at_tip: Vec<(i64, String, bool)> = sqlx::query_as(
            r#"
            SELECT upload_id, branch_or_tag_names, is_default_branch
            FROM uploads_visible_at_tip
            WHERE repository_id = $1
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
            VALUES ($1, $2, $3)
            ON CONFLICT (repository_id) DO UPDATE SET
                max_age_for_non_stale_branches_seconds = EXCLUDED.max_age_for_non_stale_branches_seconds,
                max_age_for_non_stale_tags_seconds = EXCLUDED.max_age_for_non_stale_tags_seconds
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

// =============================================================================
// Dirty repositories
// =============================================================================

#[async_trait]
impl DirtyRepositoryRepo for PostgresStore {
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
            ORDER BY set_dirty_at
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

// =============================================================================
// Closest uploads
// =============================================================================

#[async_trait]
impl ClosestUploadRepo for PostgresStore {
    async fn find_closest_uploads(&self, query: &ClosestUploadQuery) -> MetadataResult<Vec<DumpRow>> {
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
            visible_uploads_for_commits(&mut conn, query.repository_id, fragment.order()).await?;
        let identities = load_upload_identities(&mut conn, &resolver::upload_ids(&visible)).await?;
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

// =============================================================================
// Retention
// =============================================================================

struct PgReferenceGraph<'c> {
    conn: &'c mut PgConnection,
}

#[async_trait]
impl ReferenceGraph for PgReferenceGraph<'_> {
    async fn dependents(&mut self, providers: &[i64]) -> MetadataResult<Vec<ReferenceNode>> {
        let nodes = sqlx::query_as::<_, ReferenceNode>(
            r#"
            SELECT DISTINCT u.id, u.repository_id, u.expired
            FROM ranked_package_providers pp
            JOIN package_references r
              ON r.scheme = pp.scheme
             AND r.manager = pp.manager
             AND r.name = pp.name
             AND r.version = pp.version
            JOIN uploads u ON u.id = r.dump_id
            WHERE pp.upload_id = ANY($1)
              AND pp.provider_rank = 1
              AND r.dump_id != pp.upload_id
              AND u.state = 'completed'
            ORDER BY u.id
            "#,
        )
        .bind(providers)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(nodes)
    }
}

async fn referenced_canonical_providers(
    conn: &mut PgConnection,
    upload_ids: &[i64],
) -> MetadataResult<HashSet<i64>> {
    let retained: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT pp.upload_id
        FROM ranked_package_providers pp
        WHERE pp.upload_id = ANY($1)
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
    )
    .bind(upload_ids)
    .fetch_all(conn)
    .await?;
    Ok(retained.into_iter().collect())
}

#[async_trait]
impl RetentionRepo for PostgresStore {
    async fn reclaim_by_reference(&self, batch_size: u32) -> MetadataResult<ReferenceReclaimStats> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        // Concurrent passes skip each other's candidates.
        let candidates = sqlx::query_as::<_, ReferenceNode>(
            r#"
            SELECT id, repository_id, expired
            FROM uploads
            WHERE state = 'completed' AND expired
            ORDER BY last_referenced_scan_at NULLS FIRST, finished_at, id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
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

        sqlx::query("UPDATE uploads SET last_referenced_scan_at = $1 WHERE id = ANY($2)")
            .bind(now)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query(
            "UPDATE uploads SET state = 'deleting' WHERE state = 'completed' AND id = ANY($1)",
        )
        .bind(&doomed_ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();

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

        // Concurrent passes skip each other's roots.
        let root = sqlx::query_as::<_, ReferenceNode>(
            r#"
            SELECT u.id, u.repository_id, u.expired
            FROM uploads u
            WHERE u.state = 'completed'
              AND u.expired
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
            ORDER BY u.last_traversal_scan_at NULLS FIRST, u.finished_at, u.id
            LIMIT 1
            FOR UPDATE OF u SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(root) = root else {
            tx.commit().await?;
            return Ok(TraversalReclaimStats::default());
        };

        let expansion = {
            let mut graph = PgReferenceGraph { conn: &mut *tx };
            reclaim::expand(&mut graph, root, traversal_limit).await?
        };
        let ids = expansion.ids();

        // A component that overlaps a concurrent pass is left to that pass.
        let locked: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM uploads WHERE id = ANY($1) ORDER BY id FOR UPDATE SKIP LOCKED",
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;
        if locked.len() < ids.len() {
            tx.commit().await?;
            tracing::debug!(
                root = root.id,
                visited = ids.len(),
                locked = locked.len(),
                "Reference graph component is held by a concurrent pass"
            );
            return Ok(TraversalReclaimStats {
                root: Some(root.id),
                visited: ids.len() as u64,
                capped: expansion.capped,
                ..TraversalReclaimStats::default()
            });
        }
        sqlx::query("UPDATE uploads SET last_traversal_scan_at = $1 WHERE id = ANY($2)")
            .bind(now)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        let (deleted, repositories) = if expansion.deletable() {
            let deleted = sqlx::query(
                "UPDATE uploads SET state = 'deleting' WHERE state = 'completed' AND id = ANY($1)",
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();
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
