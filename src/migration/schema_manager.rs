//! SchemaManager - Provides methods for schema operations in programmatic migrations

use crate::executor::{DbError, Executor};
use sea_query::{
    IndexCreateStatement, IndexDropStatement, PostgresQueryBuilder, TableAlterStatement,
    TableCreateStatement, TableDropStatement,
};
use std::cell::RefCell;

/// Handle given to programmatic migrations
///
/// Wraps the run's [`Executor`] and remembers the last statement it sent, so a
/// failure can be reported together with the SQL that caused it.
pub struct SchemaManager<'a> {
    executor: &'a dyn Executor,
    last_sql: RefCell<Option<String>>,
}

impl<'a> SchemaManager<'a> {
    pub fn new(executor: &'a dyn Executor) -> Self {
        Self {
            executor,
            last_sql: RefCell::new(None),
        }
    }

    /// Execute raw SQL
    pub fn execute(&self, sql: &str) -> Result<u64, DbError> {
        *self.last_sql.borrow_mut() = Some(sql.to_string());
        self.executor.execute(sql)
    }

    /// Create a table
    ///
    /// # Example
    /// ```rust,no_run
    /// use sea_query::{Table, ColumnDef};
    /// # fn up(manager: &lockstep::migration::SchemaManager<'_>) -> Result<(), lockstep::DbError> {
    ///
    /// let table = Table::create()
    ///     .table("users")
    ///     .col(ColumnDef::new("id").big_integer().not_null().primary_key())
    ///     .col(ColumnDef::new("email").string().not_null().unique_key())
    ///     .to_owned();
    ///
    /// manager.create_table(table)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn create_table(&self, table: TableCreateStatement) -> Result<(), DbError> {
        self.execute(&table.build(PostgresQueryBuilder)).map(|_| ())
    }

    pub fn drop_table(&self, table: TableDropStatement) -> Result<(), DbError> {
        self.execute(&table.build(PostgresQueryBuilder)).map(|_| ())
    }

    pub fn alter_table(&self, alter: TableAlterStatement) -> Result<(), DbError> {
        self.execute(&alter.build(PostgresQueryBuilder)).map(|_| ())
    }

    pub fn create_index(&self, index: IndexCreateStatement) -> Result<(), DbError> {
        self.execute(&index.build(PostgresQueryBuilder)).map(|_| ())
    }

    pub fn drop_index(&self, index: IndexDropStatement) -> Result<(), DbError> {
        self.execute(&index.build(PostgresQueryBuilder)).map(|_| ())
    }

    /// The most recent statement sent through this manager
    pub fn last_sql(&self) -> Option<String> {
        self.last_sql.borrow().clone()
    }
}
