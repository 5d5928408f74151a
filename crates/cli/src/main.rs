//! Operator CLI for lodestar.

mod input;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use lodestar_core::config::AppConfig;
use lodestar_core::UploadId;
use lodestar_metadata::models::{ClosestUploadQuery, DirtyRepositoryRow, NewUpload};
use lodestar_metadata::repos::{
    ClosestUploadRepo, CommitGraphRepo, DirtyRepositoryRepo, RetentionRepo, UploadRepo,
};
use lodestar_metadata::{MetadataStore, StagingOptions};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "lodestar")]
#[command(version, about = "Commit graph visibility and upload retention for code intelligence", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "LODESTAR_CONFIG",
        default_value = "config/lodestar.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recompute the visibility tables of a repository
    Recompute {
        #[arg(long)]
        repository: i64,
        /// Output of `git log --pretty='%H %P'`
        #[arg(long)]
        graph: PathBuf,
        /// JSON object mapping commits to ref descriptions
        #[arg(long)]
        refs: Option<PathBuf>,
        /// Dirty token this recompute satisfies (default: the current one)
        #[arg(long)]
        dirty_token: Option<i64>,
    },
    /// List repositories whose visibility tables are out of date
    Dirty,
    /// Reclaim expired uploads nothing references
    ReclaimReferences {
        /// Expired uploads to examine (default: retention.batch_size)
        #[arg(long)]
        batch_size: Option<u32>,
    },
    /// Reclaim one fully expired component of the reference graph
    ReclaimTraversal {
        /// Uploads to visit before giving up (default: retention.traversal_limit)
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Find the uploads that can answer queries at a commit and path
    Closest {
        #[arg(long)]
        repository: i64,
        #[arg(long)]
        commit: String,
        #[arg(long, default_value = "")]
        path: String,
        /// Only match uploads whose root contains the path
        #[arg(long, default_value_t = false)]
        root_must_enclose_path: bool,
        #[arg(long)]
        indexer: Option<String>,
        /// Graph fragment for commits the tables do not know yet
        #[arg(long)]
        graph: Option<PathBuf>,
    },
    /// List commits from which an upload is visible
    Commits {
        #[arg(long)]
        upload: i64,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        /// Continue after this commit
        #[arg(long)]
        after: Option<String>,
    },
    /// Show whether a repository's visibility tables are stale
    Status {
        #[arg(long)]
        repository: i64,
    },
    /// Request a recompute of a repository
    MarkDirty {
        #[arg(long)]
        repository: i64,
    },
    /// Upload catalog commands
    Upload {
        #[command(subcommand)]
        command: UploadCommands,
    },
}

#[derive(Subcommand, Debug)]
enum UploadCommands {
    /// Register a completed upload
    Add {
        #[arg(long)]
        repository: i64,
        #[arg(long)]
        commit: String,
        #[arg(long, default_value = "")]
        root: String,
        #[arg(long)]
        indexer: String,
    },
    /// Show an upload
    Show {
        #[arg(long)]
        id: i64,
    },
    /// Soft-delete an upload
    Delete {
        #[arg(long)]
        id: i64,
    },
    /// Mark uploads as expired (or protected) for retention
    Expire {
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
        /// Clear the expired flag instead
        #[arg(long, default_value_t = false)]
        protect: bool,
    },
}

#[derive(Serialize)]
struct DirtyReport {
    repositories: Vec<DirtyRepositoryRow>,
    max_stale_age_secs: i64,
}

#[derive(Serialize)]
struct CommitsPage {
    commits: Vec<String>,
    next: Option<String>,
}

#[derive(Serialize)]
struct DirtyToken {
    repository_id: i64,
    dirty_token: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries JSON results.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli.config)?;
    let store = lodestar_metadata::from_config(
        &config.metadata,
        StagingOptions::from(&config.visibility),
    )
    .await
    .context("failed to initialize metadata store")?;

    run(cli.command, &config, store).await
}

fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        tracing::debug!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {path}, using defaults");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("LODESTAR_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn run(command: Commands, config: &AppConfig, store: Arc<dyn MetadataStore>) -> Result<()> {
    match command {
        Commands::Recompute {
            repository,
            graph,
            refs,
            dirty_token,
        } => {
            let graph = input::read_graph(&graph).await?;
            let refs = input::read_refs(refs.as_deref()).await?;
            let dirty_token = match dirty_token {
                Some(token) => token,
                None => current_dirty_token(&store, repository).await?,
            };
            let stats = store
                .update_uploads_visible_to_commits(
                    repository,
                    &graph,
                    &refs,
                    config.visibility.stale_ref_policy(),
                    dirty_token,
                    OffsetDateTime::now_utc(),
                )
                .await
                .with_context(|| format!("failed to recompute repository {repository}"))?;
            print_json(&stats)
        }
        Commands::Dirty => {
            let repositories = store.get_dirty_repositories().await?;
            let age = store
                .get_repositories_max_stale_age(OffsetDateTime::now_utc())
                .await?;
            print_json(&DirtyReport {
                repositories,
                max_stale_age_secs: age.whole_seconds(),
            })
        }
        Commands::ReclaimReferences { batch_size } => {
            let stats = store
                .reclaim_by_reference(batch_size.unwrap_or(config.retention.batch_size))
                .await?;
            print_json(&stats)
        }
        Commands::ReclaimTraversal { limit } => {
            let stats = store
                .reclaim_by_traversal(limit.unwrap_or(config.retention.traversal_limit))
                .await?;
            print_json(&stats)
        }
        Commands::Closest {
            repository,
            commit,
            path,
            root_must_enclose_path,
            indexer,
            graph,
        } => {
            let query = ClosestUploadQuery {
                repository_id: repository,
                commit,
                path,
                root_must_enclose_path,
                indexer,
            };
            let dumps = match graph {
                Some(graph) => {
                    let fragment = input::read_graph(&graph).await?;
                    store
                        .find_closest_uploads_from_graph_fragment(&query, &fragment)
                        .await?
                }
                None => store.find_closest_uploads(&query).await?,
            };
            print_json(&dumps)
        }
        Commands::Commits {
            upload,
            limit,
            after,
        } => {
            let (commits, next) = store
                .get_commits_visible_to_upload(UploadId::new(upload), limit, after.as_deref())
                .await?;
            print_json(&CommitsPage { commits, next })
        }
        Commands::Status { repository } => {
            let metadata = store.get_commit_graph_metadata(repository).await?;
            print_json(&metadata)
        }
        Commands::MarkDirty { repository } => {
            let dirty_token = store.mark_repository_dirty(repository).await?;
            print_json(&DirtyToken {
                repository_id: repository,
                dirty_token,
            })
        }
        Commands::Upload { command } => handle_upload_command(command, store).await,
    }
}

async fn handle_upload_command(command: UploadCommands, store: Arc<dyn MetadataStore>) -> Result<()> {
    match command {
        UploadCommands::Add {
            repository,
            commit,
            root,
            indexer,
        } => {
            let upload = NewUpload::completed(
                repository,
                commit,
                root,
                indexer,
                OffsetDateTime::now_utc(),
            );
            let id = store.insert_upload(&upload).await?;
            let row = store
                .get_upload(id)
                .await?
                .with_context(|| format!("upload {id} vanished after insert"))?;
            print_json(&row)
        }
        UploadCommands::Show { id } => {
            let row = store
                .get_upload(UploadId::new(id))
                .await?
                .with_context(|| format!("upload {id} not found"))?;
            print_json(&row)
        }
        UploadCommands::Delete { id } => {
            let id = UploadId::new(id);
            if !store.delete_upload_by_id(id).await? {
                anyhow::bail!("upload {id} not found or already deleted");
            }
            let row = store
                .get_upload(id)
                .await?
                .with_context(|| format!("upload {id} not found"))?;
            print_json(&row)
        }
        UploadCommands::Expire { ids, protect } => {
            let ids: Vec<UploadId> = ids.into_iter().map(UploadId::new).collect();
            if protect {
                store.update_upload_retention(&ids, &[]).await?;
            } else {
                store.update_upload_retention(&[], &ids).await?;
            }
            print_json(&store.get_uploads_by_ids(&ids).await?)
        }
    }
}

async fn current_dirty_token(store: &Arc<dyn MetadataStore>, repository_id: i64) -> Result<i64> {
    let token = store
        .get_dirty_repositories()
        .await?
        .into_iter()
        .find(|row| row.repository_id == repository_id)
        .map(|row| row.dirty_token)
        .unwrap_or(0);
    Ok(token)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{output}");
    Ok(())
}
