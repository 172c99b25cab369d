//! # Database Migrations
//!
//! Migrations are embedded from the `migrations/` directory at compile time
//! and named `YYYYMMDDHHMMSS_description.sql`. The sqlx migrator takes a
//! PostgreSQL advisory lock, so concurrent processes starting together apply
//! each migration exactly once.

use sqlx::migrate::Migrator;
use sqlx::PgPool;
use tracing::{error, info};

use crate::error::{EventflowError, Result};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Run all pending migrations in order.
    pub async fn run_all(pool: &PgPool) -> Result<()> {
        MIGRATOR.run(pool).await.map_err(|e| {
            error!("Database migration failed: {}", e);
            EventflowError::database("migrate", e)
        })?;
        info!(
            migrations = MIGRATOR.iter().count(),
            "✅ Database schema up to date"
        );
        Ok(())
    }

    /// Versions of the embedded migrations, oldest first.
    pub fn versions() -> Vec<i64> {
        MIGRATOR.iter().map(|migration| migration.version).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_migrations_are_ordered() {
        let versions = DatabaseMigrations::versions();
        assert!(!versions.is_empty());
        assert!(versions.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
