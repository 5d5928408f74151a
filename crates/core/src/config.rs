//! Configuration types shared across crates.

use crate::refs::StaleRefPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database, for tests and single-node deployments.
    Sqlite {
        /// Database file path, or `:memory:`.
        path: PathBuf,
        /// Advisory only: SQLite cannot cancel a running statement.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over the individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer LODESTAR_METADATA__PASSWORD over storing it in the file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Server-side statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300_000) // 5 minutes
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/lodestar.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Commit graph recompute configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisibilityConfig {
    /// Default window (seconds) in which a non-default branch protects the
    /// uploads visible at its tip. Overridable per repository.
    #[serde(default = "default_max_age_for_non_stale_branches_secs")]
    pub max_age_for_non_stale_branches_secs: u64,
    /// Same window for tags.
    #[serde(default = "default_max_age_for_non_stale_tags_secs")]
    pub max_age_for_non_stale_tags_secs: u64,
    /// Capacity of each row channel between the graph producer and the
    /// staging writer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Rows per multi-row insert into the staging tables.
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
}

fn default_max_age_for_non_stale_branches_secs() -> u64 {
    90 * 24 * 3600 // 90 days
}

fn default_max_age_for_non_stale_tags_secs() -> u64 {
    365 * 24 * 3600 // 1 year
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_insert_batch_size() -> usize {
    200
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            max_age_for_non_stale_branches_secs: default_max_age_for_non_stale_branches_secs(),
            max_age_for_non_stale_tags_secs: default_max_age_for_non_stale_tags_secs(),
            channel_capacity: default_channel_capacity(),
            insert_batch_size: default_insert_batch_size(),
        }
    }
}

impl VisibilityConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.channel_capacity == 0 {
            return Err("visibility channel_capacity must be at least 1".to_string());
        }
        if self.insert_batch_size == 0 {
            return Err("visibility insert_batch_size must be at least 1".to_string());
        }
        Ok(())
    }

    /// Default stale-ref windows as a policy.
    pub fn stale_ref_policy(&self) -> StaleRefPolicy {
        StaleRefPolicy::new(
            Duration::seconds(clamp_secs(self.max_age_for_non_stale_branches_secs)),
            Duration::seconds(clamp_secs(self.max_age_for_non_stale_tags_secs)),
        )
    }
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Upload retention configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Expired uploads examined per reference-count pass.
    #[serde(default = "default_retention_batch_size")]
    pub batch_size: u32,
    /// Maximum number of uploads a traversal may visit before giving up on
    /// its root without changing any state.
    #[serde(default = "default_traversal_limit")]
    pub traversal_limit: u32,
}

fn default_retention_batch_size() -> u32 {
    100
}

fn default_traversal_limit() -> u32 {
    100
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_retention_batch_size(),
            traversal_limit: default_traversal_limit(),
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("retention batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub visibility: VisibilityConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl AppConfig {
    /// In-memory SQLite and default windows.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            metadata: MetadataConfig::Sqlite {
                path: PathBuf::from(":memory:"),
                query_timeout_secs: None,
            },
            visibility: VisibilityConfig::default(),
            retention: RetentionConfig::default(),
        }
    }

    /// Validate every section, prefixing errors with the section name.
    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate().map_err(|e| format!("metadata: {e}"))?;
        self.visibility
            .validate()
            .map_err(|e| format!("visibility: {e}"))?;
        self.retention
            .validate()
            .map_err(|e| format!("retention: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_defaults_when_fields_missing() {
        let config: VisibilityConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_age_for_non_stale_branches_secs, 90 * 24 * 3600);
        assert_eq!(config.channel_capacity, 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_stale_ref_policy_from_config() {
        let config = VisibilityConfig {
            max_age_for_non_stale_branches_secs: 60,
            max_age_for_non_stale_tags_secs: 120,
            ..VisibilityConfig::default()
        };
        let policy = config.stale_ref_policy();
        assert_eq!(policy.max_age_for_non_stale_branches, Duration::seconds(60));
        assert_eq!(policy.max_age_for_non_stale_tags, Duration::seconds(120));
    }

    #[test]
    fn test_metadata_config_tagged_sqlite() {
        let json = r#"{"type": "sqlite", "path": "/tmp/lodestar.db"}"#;
        let config: MetadataConfig = serde_json::from_str(json).unwrap();
        match config {
            MetadataConfig::Sqlite {
                path,
                query_timeout_secs,
            } => {
                assert_eq!(path, PathBuf::from("/tmp/lodestar.db"));
                assert_eq!(query_timeout_secs, Some(600));
            }
            MetadataConfig::Postgres { .. } => panic!("expected sqlite"),
        }
    }

    #[test]
    fn test_postgres_config_requires_database_with_host() {
        let json = r#"{"type": "postgres", "host": "db"}"#;
        let config: MetadataConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().unwrap_err().contains("'database'"));

        let json = r#"{"type": "postgres", "url": "postgres://localhost/lodestar"}"#;
        let config: MetadataConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_app_config_validation_names_section() {
        let mut config = AppConfig::for_testing();
        config.retention.batch_size = 0;
        assert_eq!(
            config.validate().unwrap_err(),
            "retention: retention batch_size must be at least 1"
        );
    }
}
