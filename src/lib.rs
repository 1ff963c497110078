//! # Lockstep
//!
//! Versioned SQL schema migrations for `PostgreSQL`, serialized across
//! processes with an advisory lock.
//!
//! - [`migration::splitter`] turns a SQL script into executable statements
//! - [`migration::Registry`] collects SQL-file and programmatic migrations
//! - [`migration::Migrator`] plans and runs them against an [`Executor`]

pub mod config;
pub mod connection;
pub mod executor;
pub mod migration;

pub use config::MigrateSettings;
pub use connection::{connect, ConnectionError};
pub use executor::{DbError, Executor, PgExecutor};
pub use migration::MigrationError;
