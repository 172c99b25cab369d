//! # Database Operations
//!
//! Connection pooling and schema migrations for the PostgreSQL backends
//! ([`crate::store::PgStore`], [`crate::queue::PgTaskQueue`] and
//! [`crate::logs::PgLogStore`]).
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use eventflow_core::config::DatabaseConfig;
//! use eventflow_core::database::{DatabaseConnection, DatabaseMigrations};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = DatabaseConnection::connect(&DatabaseConfig::default()).await?;
//! DatabaseMigrations::run_all(db.pool()).await?;
//! assert!(db.health_check().await?);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod migrations;

pub use connection::DatabaseConnection;
pub use migrations::DatabaseMigrations;
