//! Migration file discovery and name parsing

use crate::migration::error::MigrationError;
use crate::migration::migration::Direction;
use crate::migration::version::Version;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

static SQL_FILE: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^(\d{14})_([^.]+)\.(up|down)\.sql$"));
static SOURCE_MARKER: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^m?(\d{14})_([^.]+)\.rs$"));

/// Parsed `<version>_<name>.<up|down>.sql` file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFileName {
    pub version: Version,
    pub name: String,
    pub direction: Direction,
}

fn invalid(name: &str, reason: impl Into<String>) -> MigrationError {
    MigrationError::InvalidFileName {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Parse a SQL migration file name
///
/// Expected format: `{YYYYMMDDHHMMSS}_{name}.{up|down}.sql`
///
/// # Example
/// - `20240120120000_create_users.up.sql` → version 20240120120000, name "create_users", up
///
/// # Errors
///
/// Returns `MigrationError::InvalidFileName` for anything else, including a bare
/// `.sql` file with no direction.
pub fn parse_sql_filename(filename: &str) -> Result<SqlFileName, MigrationError> {
    let re = SQL_FILE
        .as_ref()
        .map_err(|e| invalid(filename, format!("invalid file name pattern: {e}")))?;

    let Some(caps) = re.captures(filename) else {
        let reason = if filename.ends_with(".sql")
            && !filename.ends_with(".up.sql")
            && !filename.ends_with(".down.sql")
        {
            "SQL migrations must end in .up.sql or .down.sql"
        } else {
            "expected {YYYYMMDDHHMMSS}_{name}.up.sql or {YYYYMMDDHHMMSS}_{name}.down.sql"
        };
        return Err(invalid(filename, reason));
    };

    let version = caps[1]
        .parse::<Version>()
        .map_err(|e| invalid(filename, e.to_string()))?;
    let direction = if &caps[3] == "up" {
        Direction::Up
    } else {
        Direction::Down
    };

    Ok(SqlFileName {
        version,
        name: caps[2].to_string(),
        direction,
    })
}

/// Parse the version and name of a programmatic migration from its source path
///
/// `source` is normally `file!()` of the module defining the migration; only
/// the file name matters: `[m]{YYYYMMDDHHMMSS}_{name}.rs`.
///
/// # Errors
///
/// Returns `MigrationError::InvalidFileName` when the file name does not match.
pub fn parse_source_marker(source: &str) -> Result<(Version, String), MigrationError> {
    let filename = Path::new(source)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| invalid(source, "source marker has no file name"))?;

    let re = SOURCE_MARKER
        .as_ref()
        .map_err(|e| invalid(source, format!("invalid source marker pattern: {e}")))?;
    let caps = re.captures(filename).ok_or_else(|| {
        invalid(
            source,
            "programmatic migrations must live in [m]{YYYYMMDDHHMMSS}_{name}.rs",
        )
    })?;

    let version = caps[1]
        .parse::<Version>()
        .map_err(|e| invalid(source, e.to_string()))?;
    Ok((version, caps[2].to_string()))
}

/// A SQL file found on disk
#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub path: PathBuf,
    /// File name without directories, used for name parsing
    pub file_name: String,
    pub contents: String,
}

/// Discover all SQL migration files below a directory
///
/// Walks the whole subtree. Only `.sql` files are collected; hidden entries are
/// skipped. Files come back sorted by name so registry errors are reported
/// deterministically.
///
/// # Errors
///
/// Returns `MigrationError::Io` if the directory or a file cannot be read.
pub fn discover_migrations(migrations_dir: &Path) -> Result<Vec<MigrationFile>, MigrationError> {
    let mut files = Vec::new();
    collect(migrations_dir, &mut files)?;
    files.sort_by(|a, b| a.file_name.cmp(&b.file_name).then_with(|| a.path.cmp(&b.path)));
    Ok(files)
}

fn collect(dir: &Path, files: &mut Vec<MigrationFile>) -> Result<(), MigrationError> {
    let io_err = |path: &Path, source: std::io::Error| MigrationError::Io {
        path: path.to_path_buf(),
        source,
    };

    let entries = fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_dir() {
            collect(&path, files)?;
        } else if path.extension().and_then(|s| s.to_str()) == Some("sql") {
            let contents = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            files.push(MigrationFile {
                path,
                file_name,
                contents,
            });
        }
    }
    Ok(())
}
