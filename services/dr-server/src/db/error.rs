use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("cannot reach postgres: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("applying migrations failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// None of the known locations held a migrations directory.
    #[error("no migrations found (looked in {searched}): {cause}")]
    MigrationsMissing { searched: String, cause: String },
}
