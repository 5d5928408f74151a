//! Metadata store abstraction and implementations for lodestar.
//!
//! This crate persists what the visibility algorithm computes and serves
//! the read path:
//! - Upload catalog, packages and package references
//! - Landmark, link and tip visibility tables with diff-based replacement
//! - Dirty/update token handshake per repository
//! - Closest-upload resolution, including unseen graph fragments
//! - Reference-aware upload retention

pub mod error;
pub mod models;
pub mod postgres;
mod reclaim;
pub mod repos;
mod resolver;
pub mod staging;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use postgres::PostgresStore;
pub use staging::StagingOptions;
pub use store::{MetadataStore, SqliteStore};

use lodestar_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(
    config: &MetadataConfig,
    staging: StagingOptions,
) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs)
                .await?
                .with_staging_options(staging);
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                // URL takes precedence over individual fields
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store.with_staging_options(staging)) as Arc<dyn MetadataStore>)
        }
    }
}
