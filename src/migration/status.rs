//! Migration status tracking

use crate::migration::record::MigrationRecord;
use crate::migration::version::Version;
use serde::Serialize;

/// Migration status information
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Applied migrations (from the versioning table)
    pub applied: Vec<MigrationRecord>,

    /// Pending migrations (from the registry), oldest first
    pub pending: Vec<PendingMigration>,

    /// Total number of migrations (applied + pending)
    pub total: usize,

    pub applied_count: usize,
    pub pending_count: usize,
}

/// A registered migration that has not been applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: Version,
    pub name: String,
    /// Empty for programmatic migrations
    pub checksum: String,
}

impl MigrationStatus {
    #[must_use]
    pub fn new(applied: Vec<MigrationRecord>, pending: Vec<PendingMigration>) -> Self {
        let applied_count = applied.len();
        let pending_count = pending.len();

        Self {
            applied,
            pending,
            total: applied_count + pending_count,
            applied_count,
            pending_count,
        }
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    #[must_use]
    pub fn latest_applied_version(&self) -> Option<Version> {
        self.applied.iter().map(|m| m.version).max()
    }

    #[must_use]
    pub fn next_pending_version(&self) -> Option<Version> {
        self.pending.first().map(|m| m.version)
    }
}
