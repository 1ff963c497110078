//! Migration-specific error types

use crate::executor::DbError;
use crate::migration::directive::Hazard;
use crate::migration::splitter::ParseError;
use crate::migration::version::Version;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Everything the registry and the migrator can fail with
///
/// Variants fall into the classes exposed by [`MigrationError::class`]; callers
/// should branch on the class when deciding between fixing a file, retrying
/// with an override, or reconciling the versioning table by hand.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration script could not be split into statements
    #[error("failed to parse {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: ParseError,
    },

    /// A migration file or source marker does not follow the naming convention
    #[error("invalid migration file name '{name}': {reason}")]
    InvalidFileName { name: String, reason: String },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("duplicate up migration for version {version}")]
    DuplicateUp { version: Version },

    #[error("duplicate down migration for version {version}")]
    DuplicateDown { version: Version },

    #[error("down migration for version {version} has no matching up migration")]
    DownWithoutUp { version: Version },

    /// The same version was registered from two sources
    #[error("migration version {version} is already registered (as '{existing}')")]
    DuplicateVersion { version: Version, existing: String },

    #[error("unknown migration direction '{0}': expected 'up' or 'down'")]
    UnknownDirection(String),

    #[error("invalid step count: steps must be at least 1 (use all steps to run everything)")]
    InvalidSteps,

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Hazardous statements found and hazards were not allowed
    #[error(
        "migration {version} '{name}' contains hazards: {}. \
         Re-run with allow_hazards enabled to apply it anyway",
        format_hazards(.hazards)
    )]
    HazardsDetected {
        version: Version,
        name: String,
        hazards: Vec<Hazard>,
    },

    #[error("failed to acquire migration lock: {0}")]
    Lock(#[source] DbError),

    #[error(
        "timed out after {0:?} waiting for the migration lock. \
         Another process may be running migrations"
    )]
    LockTimeout(Duration),

    #[error("migration run was cancelled")]
    Cancelled,

    #[error("migration run exceeded its deadline")]
    DeadlineExceeded,

    /// A statement failed while running a migration
    #[error("migration {version} '{name}' failed: {source}\nSQL: {sql}")]
    Execution {
        version: Version,
        name: String,
        sql: String,
        #[source]
        source: DbError,
    },

    /// The migration ran but the versioning table could not be updated
    #[error(
        "migration {version} '{name}' was executed but recording it failed: {source}. \
         The versioning table may no longer match the database schema and needs manual reconciliation"
    )]
    StateUpdate {
        version: Version,
        name: String,
        #[source]
        source: DbError,
    },

    /// An applied migration's source changed after it was applied
    #[error(
        "migration {version} '{name}' has been modified after being applied \
         (stored checksum {stored}, current checksum {current})"
    )]
    Drift {
        version: Version,
        name: String,
        stored: String,
        current: String,
    },

    /// The versioning table lists a version the registry does not know
    #[error("applied migration {version} '{name}' is not present in the registry")]
    MissingMigration { version: Version, name: String },

    #[error("database error: {0}")]
    Database(#[from] DbError),
}

/// Broad category of a [`MigrationError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Parse,
    Registration,
    InputValidation,
    Policy,
    Execution,
    Consistency,
    Lock,
    Interrupted,
    Database,
}

impl MigrationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Parse { .. } | Self::InvalidFileName { .. } | Self::Io { .. } => ErrorClass::Parse,
            Self::DuplicateUp { .. }
            | Self::DuplicateDown { .. }
            | Self::DownWithoutUp { .. }
            | Self::DuplicateVersion { .. } => ErrorClass::Registration,
            Self::UnknownDirection(_) | Self::InvalidSteps | Self::Config(_) => {
                ErrorClass::InputValidation
            }
            Self::HazardsDetected { .. } | Self::Drift { .. } | Self::MissingMigration { .. } => {
                ErrorClass::Policy
            }
            Self::Execution { .. } => ErrorClass::Execution,
            Self::StateUpdate { .. } => ErrorClass::Consistency,
            Self::Lock(_) | Self::LockTimeout(_) => ErrorClass::Lock,
            Self::Cancelled | Self::DeadlineExceeded => ErrorClass::Interrupted,
            Self::Database(_) => ErrorClass::Database,
        }
    }

    pub fn is_policy(&self) -> bool {
        self.class() == ErrorClass::Policy
    }

    pub fn is_consistency(&self) -> bool {
        self.class() == ErrorClass::Consistency
    }

    pub fn is_input_validation(&self) -> bool {
        self.class() == ErrorClass::InputValidation
    }
}

fn format_hazards(hazards: &[Hazard]) -> String {
    hazards
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version() -> Version {
        "20240120120000".parse().expect("version")
    }

    #[test]
    fn test_hazard_error_mentions_override() {
        let err = MigrationError::HazardsDetected {
            version: version(),
            name: "drop_users".to_string(),
            hazards: vec![Hazard {
                kind: "DELETES_DATA".to_string(),
                message: "drops users".to_string(),
                statement: Some("DROP TABLE users".to_string()),
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("DELETES_DATA: drops users"));
        assert!(msg.contains("allow_hazards"));
        assert!(err.is_policy());
        assert!(!err.is_consistency());
    }

    #[test]
    fn test_execution_and_state_update_are_distinct() {
        let exec = MigrationError::Execution {
            version: version(),
            name: "create_users".to_string(),
            sql: "CREATE TABLE users ()".to_string(),
            source: DbError::Other("boom".to_string()),
        };
        let state = MigrationError::StateUpdate {
            version: version(),
            name: "create_users".to_string(),
            source: DbError::Other("boom".to_string()),
        };
        assert_eq!(exec.class(), ErrorClass::Execution);
        assert!(exec.to_string().contains("SQL: CREATE TABLE users ()"));
        assert!(state.is_consistency());
        assert!(state.to_string().contains("manual reconciliation"));
    }

    #[test]
    fn test_input_validation_class() {
        assert!(MigrationError::InvalidSteps.is_input_validation());
        assert!(MigrationError::UnknownDirection("sideways".to_string()).is_input_validation());
        assert!(MigrationError::Config("missing registry".to_string()).is_input_validation());
    }
}
