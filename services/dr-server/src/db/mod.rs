//! Postgres pool setup and schema migrations for [`crate::store::PgStore`].

mod error;

pub use error::DbError;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// Connections idle longer than this are closed.
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/dynroute".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl DbConfig {
    /// `None` when `DATABASE_URL` is unset, which selects the in-memory store.
    pub fn from_env() -> Option<Self> {
        let database_url = std::env::var("DATABASE_URL").ok()?;
        let defaults = Self::default();

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);
        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.min_connections);

        Some(Self {
            database_url,
            max_connections,
            min_connections,
            ..defaults
        })
    }
}

/// Places the migrations directory may live, depending on where the binary
/// was started from.
fn migration_dirs() -> [PathBuf; 3] {
    [
        PathBuf::from("migrations"),
        PathBuf::from("services/dr-server/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ]
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to postgres"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from the first directory that loads.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let dirs = migration_dirs();
        let mut cause = String::from("no candidate directories");

        for dir in &dirs {
            let migrator = match Migrator::new(dir.clone()).await {
                Ok(migrator) => migrator,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Migrations not found here");
                    cause = e.to_string();
                    continue;
                }
            };

            migrator.run(&self.pool).await.map_err(DbError::Migration)?;
            info!(dir = %dir.display(), "Migrations applied");
            return Ok(());
        }

        Err(DbError::MigrationsMissing {
            searched: dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            cause,
        })
    }
}
