//! Migration definition
//!
//! SQL-file migrations and programmatic migrations both end up as a
//! [`Migration`]: a version, a name and one [`Executable`] per direction. The
//! migrator never needs to know where a migration came from.

use crate::executor::DbError;
use crate::migration::directive::{Hazard, Section};
use crate::migration::error::MigrationError;
use crate::migration::schema_manager::SchemaManager;
use crate::migration::version::Version;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Which way a migration run moves the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Apply pending migrations, oldest first
    Up,
    /// Roll back applied migrations, newest first
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

impl FromStr for Direction {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            _ => Err(MigrationError::UnknownDirection(s.to_string())),
        }
    }
}

/// Body of a programmatic migration
pub type MigrationFn = Arc<dyn Fn(&SchemaManager<'_>) -> Result<(), DbError> + Send + Sync>;

/// What runs for one direction of a migration
#[derive(Clone)]
pub enum Executable {
    /// Statements split from a SQL file, executed in order
    Sql {
        statements: Vec<String>,
        hazards: Vec<Hazard>,
        transactional: bool,
    },
    /// A function registered from code
    Func {
        func: MigrationFn,
        transactional: bool,
    },
    /// Nothing to run; used as the rollback of irreversible migrations
    Noop,
}

impl Executable {
    pub(crate) fn from_section(section: Section, transactional: bool) -> Self {
        Executable::Sql {
            statements: section.statements,
            hazards: section.hazards,
            transactional,
        }
    }

    /// Whether this runs inside a transaction scoped to its migration
    pub fn is_transactional(&self) -> bool {
        match self {
            Executable::Sql { transactional, .. } | Executable::Func { transactional, .. } => {
                *transactional
            }
            Executable::Noop => true,
        }
    }

    pub fn hazards(&self) -> &[Hazard] {
        match self {
            Executable::Sql { hazards, .. } => hazards,
            _ => &[],
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Executable::Noop)
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executable::Sql {
                statements,
                hazards,
                transactional,
            } => f
                .debug_struct("Sql")
                .field("statements", statements)
                .field("hazards", hazards)
                .field("transactional", transactional)
                .finish(),
            Executable::Func { transactional, .. } => f
                .debug_struct("Func")
                .field("transactional", transactional)
                .finish_non_exhaustive(),
            Executable::Noop => f.write_str("Noop"),
        }
    }
}

/// A versioned schema change
#[derive(Debug, Clone)]
pub struct Migration {
    version: Version,
    name: String,
    checksum: String,
    up: Executable,
    down: Executable,
}

impl Migration {
    pub fn new(version: Version, name: impl Into<String>, up: Executable, down: Executable) -> Self {
        Self {
            version,
            name: name.into(),
            checksum: String::new(),
            up,
            down,
        }
    }

    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checksum of the migration source, empty when there is no source text
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn up(&self) -> &Executable {
        &self.up
    }

    pub fn down(&self) -> &Executable {
        &self.down
    }

    pub fn executable(&self, direction: Direction) -> &Executable {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    /// Whether the migration can actually undo itself
    pub fn is_reversible(&self) -> bool {
        !self.down.is_noop()
    }
}
