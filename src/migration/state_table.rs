//! Versioning table SQL
//!
//! The table stores one row per applied migration:
//! - Version (timestamp) and namespace, together the primary key
//! - Name (human-readable)
//! - Checksum (SHA-256 of the migration source)
//! - Applied timestamp and execution time

use once_cell::sync::Lazy;
use regex::Regex;
use sea_query::{Alias, ColumnDef, Expr, Index, PostgresQueryBuilder, Table, TableCreateStatement};

/// Default versioning table name
pub const DEFAULT_STATE_TABLE: &str = "schema_migrations";

static TABLE_NAME: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}(\.[A-Za-z_][A-Za-z0-9_]{0,62})?$"));

/// Whether `table` is safe to splice into SQL: a plain or schema-qualified identifier
pub fn is_valid_table_name(table: &str) -> bool {
    TABLE_NAME.as_ref().is_ok_and(|re| re.is_match(table))
}

/// `CREATE TABLE IF NOT EXISTS` statement for the versioning table
pub fn create_state_table(table: &str) -> TableCreateStatement {
    let mut statement = Table::create();
    match table.split_once('.') {
        Some((schema, name)) => statement.table((Alias::new(schema), Alias::new(name))),
        None => statement.table(Alias::new(table)),
    };
    statement
        .if_not_exists()
        .col(ColumnDef::new("version").big_integer().not_null())
        .col(ColumnDef::new("namespace").text().not_null())
        .col(ColumnDef::new("name").text().not_null())
        .col(ColumnDef::new("checksum").text().not_null().default(""))
        .col(
            ColumnDef::new("applied_at")
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(ColumnDef::new("execution_time_ms").big_integer().null())
        .primary_key(Index::create().col("version").col("namespace"))
        .to_owned()
}

/// Rendered DDL for the versioning table
pub fn create_state_table_sql(table: &str) -> String {
    create_state_table(table).build(PostgresQueryBuilder)
}

/// Quote each part of a validated table name, matching the identifiers sea-query emits
fn quoted(table: &str) -> String {
    table
        .split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}

pub fn select_applied_sql(table: &str) -> String {
    format!(
        "SELECT version, namespace, name, checksum, applied_at, execution_time_ms \
         FROM {} WHERE namespace = $1 ORDER BY version ASC",
        quoted(table)
    )
}

pub fn insert_applied_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} (version, namespace, name, checksum, execution_time_ms) \
         VALUES ($1, $2, $3, $4, $5)",
        quoted(table)
    )
}

pub fn delete_applied_sql(table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE version = $1 AND namespace = $2",
        quoted(table)
    )
}
