//! `MigrationRecord` - Represents rows in the versioning table

use crate::migration::version::Version;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One applied migration, as stored in the versioning table
///
/// Rows are keyed by `(version, namespace)` so independent migration sets can
/// share one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub version: Version,
    pub namespace: String,
    pub name: String,

    /// `SHA-256` of the migration source; empty for programmatic migrations
    pub checksum: String,

    /// Set by the database on insert; `None` on records not read back yet
    pub applied_at: Option<DateTime<Utc>>,

    pub execution_time_ms: Option<i64>,
}

impl MigrationRecord {
    #[must_use]
    pub fn new(
        version: Version,
        namespace: impl Into<String>,
        name: impl Into<String>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            version,
            namespace: namespace.into(),
            name: name.into(),
            checksum: checksum.into(),
            applied_at: None,
            execution_time_ms: None,
        }
    }

    #[must_use]
    pub fn with_execution_time_ms(mut self, ms: i64) -> Self {
        self.execution_time_ms = Some(ms);
        self
    }
}
