//! Migration registry
//!
//! A [`Registry`] is the versioned set of migrations one namespace knows
//! about. It is assembled from SQL files, from functions registered in code, or
//! both, and is then handed to a [`Migrator`](crate::migration::Migrator),
//! which only ever reads it.
//!
//! Every loading call is all-or-nothing: if any file in a batch is malformed,
//! duplicated or unpaired, the registry is left exactly as it was.

use crate::executor::DbError;
use crate::migration::checksum::calculate_pair_checksum;
use crate::migration::directive;
use crate::migration::error::MigrationError;
use crate::migration::file::{discover_migrations, parse_source_marker, parse_sql_filename, MigrationFile};
use crate::migration::migration::{Direction, Executable, Migration, MigrationFn};
use crate::migration::schema_manager::SchemaManager;
use crate::migration::splitter::split;
use crate::migration::version::Version;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "default";

/// Versioned set of migrations for one namespace
#[derive(Debug, Clone)]
pub struct Registry {
    namespace: String,
    migrations: HashMap<Version, Migration>,
}

/// One version's pieces collected from a batch of SQL files
#[derive(Default)]
struct SqlParts {
    name: Option<String>,
    up_source: String,
    down_source: Option<String>,
    up: Option<Executable>,
    down: Option<Executable>,
}

impl Registry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            migrations: HashMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get(&self, version: Version) -> Option<&Migration> {
        self.migrations.get(&version)
    }

    pub fn contains(&self, version: Version) -> bool {
        self.migrations.contains_key(&version)
    }

    pub fn migrations(&self) -> &HashMap<Version, Migration> {
        &self.migrations
    }

    /// Migrations in ascending version order
    pub fn sorted(&self) -> Vec<&Migration> {
        let mut all: Vec<&Migration> = self.migrations.values().collect();
        all.sort_by_key(|m| m.version());
        all
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Load every SQL migration below `dir`
    ///
    /// # Errors
    ///
    /// Fails without registering anything if a file cannot be read, has an
    /// invalid name, cannot be split, duplicates another file's direction, is a
    /// down file without an up file, or collides with an already registered
    /// version.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), MigrationError> {
        let files = discover_migrations(dir.as_ref())?;
        log::debug!(
            "Discovered {} migration file(s) in {}",
            files.len(),
            dir.as_ref().display()
        );
        self.add_sql_files(files.into_iter().map(|f| {
            let MigrationFile {
                file_name, contents, ..
            } = f;
            (file_name, contents)
        }))
    }

    /// Register a single SQL file's text, e.g. from `include_str!`
    pub fn add_sql(
        &mut self,
        file_name: impl Into<String>,
        contents: impl Into<String>,
    ) -> Result<(), MigrationError> {
        self.add_sql_files([(file_name.into(), contents.into())])
    }

    /// Register a batch of `(file name, contents)` pairs
    ///
    /// Files for the same version pair up within the batch, so an up file and
    /// its down file must arrive in the same call.
    pub fn add_sql_files<I, N, C>(&mut self, files: I) -> Result<(), MigrationError>
    where
        I: IntoIterator<Item = (N, C)>,
        N: AsRef<str>,
        C: AsRef<str>,
    {
        let mut parts: BTreeMap<Version, SqlParts> = BTreeMap::new();

        for (file_name, contents) in files {
            let (file_name, contents) = (file_name.as_ref(), contents.as_ref());
            let parsed = parse_sql_filename(file_name)?;
            let statements = split(contents).map_err(|source| MigrationError::Parse {
                file: file_name.to_string(),
                source,
            })?;
            let script = directive::scan(&statements);
            let transactional = !script.disable_tx;
            let entry = parts.entry(parsed.version).or_default();

            match parsed.direction {
                Direction::Up => {
                    if entry.up.is_some() {
                        return Err(MigrationError::DuplicateUp {
                            version: parsed.version,
                        });
                    }
                    entry.up = Some(Executable::from_section(script.up, transactional));
                    entry.name = Some(parsed.name);
                    entry.up_source = contents.to_string();
                    if let Some(down) = script.down {
                        if entry.down.is_some() {
                            return Err(MigrationError::DuplicateDown {
                                version: parsed.version,
                            });
                        }
                        entry.down = Some(Executable::from_section(down, transactional));
                    }
                }
                Direction::Down => {
                    if entry.down.is_some() {
                        return Err(MigrationError::DuplicateDown {
                            version: parsed.version,
                        });
                    }
                    entry.down_source = Some(contents.to_string());
                    // A separator means nothing in a down file; run everything.
                    let mut section = script.up;
                    if let Some(mut rest) = script.down {
                        section.statements.append(&mut rest.statements);
                        section.hazards.append(&mut rest.hazards);
                    }
                    entry.down = Some(Executable::from_section(section, transactional));
                }
            }
        }

        let mut staged = Vec::with_capacity(parts.len());
        for (version, part) in parts {
            let (Some(up), Some(name)) = (part.up, part.name) else {
                return Err(MigrationError::DownWithoutUp { version });
            };
            let checksum = calculate_pair_checksum(
                part.up_source.as_bytes(),
                part.down_source.as_deref().map(str::as_bytes),
            );
            let down = part.down.unwrap_or(Executable::Noop);
            staged.push(Migration::new(version, name, up, down).with_checksum(checksum));
        }

        self.insert_all(staged)
    }

    /// Register a programmatic migration that runs outside a transaction
    ///
    /// `source` identifies the migration; pass `file!()` (see
    /// [`migration_source!`](crate::migration_source)) from a module named
    /// `[m]{YYYYMMDDHHMMSS}_{name}.rs`.
    pub fn add<U, D>(&mut self, source: &str, up: U, down: D) -> Result<(), MigrationError>
    where
        U: Fn(&SchemaManager<'_>) -> Result<(), DbError> + Send + Sync + 'static,
        D: Fn(&SchemaManager<'_>) -> Result<(), DbError> + Send + Sync + 'static,
    {
        self.add_func(source, Arc::new(up), Arc::new(down), false)
    }

    /// Register a programmatic migration that runs inside a transaction
    pub fn add_tx<U, D>(&mut self, source: &str, up: U, down: D) -> Result<(), MigrationError>
    where
        U: Fn(&SchemaManager<'_>) -> Result<(), DbError> + Send + Sync + 'static,
        D: Fn(&SchemaManager<'_>) -> Result<(), DbError> + Send + Sync + 'static,
    {
        self.add_func(source, Arc::new(up), Arc::new(down), true)
    }

    fn add_func(
        &mut self,
        source: &str,
        up: MigrationFn,
        down: MigrationFn,
        transactional: bool,
    ) -> Result<(), MigrationError> {
        let (version, name) = parse_source_marker(source)?;
        let migration = Migration::new(
            version,
            name,
            Executable::Func {
                func: up,
                transactional,
            },
            Executable::Func {
                func: down,
                transactional,
            },
        );
        self.add_migration(migration)
    }

    /// Register a fully built migration
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::DuplicateVersion` if the version is taken.
    pub fn add_migration(&mut self, migration: Migration) -> Result<(), MigrationError> {
        self.insert_all(vec![migration])
    }

    fn insert_all(&mut self, staged: Vec<Migration>) -> Result<(), MigrationError> {
        for migration in &staged {
            if let Some(existing) = self.migrations.get(&migration.version()) {
                return Err(MigrationError::DuplicateVersion {
                    version: migration.version(),
                    existing: existing.name().to_string(),
                });
            }
        }
        for migration in staged {
            log::trace!(
                "Registered migration {} '{}' in namespace '{}'",
                migration.version(),
                migration.name(),
                self.namespace
            );
            self.migrations.insert(migration.version(), migration);
        }
        Ok(())
    }
}

/// Expands to the current source file, for [`Registry::add`] and [`register`]
#[macro_export]
macro_rules! migration_source {
    () => {
        file!()
    };
}

/// Process-wide registry for code that prefers registering from anywhere
///
/// Nothing in the migrator reads it; take it with [`take_default_registry`]
/// and pass it in like any other registry.
static DEFAULT_REGISTRY: Lazy<Mutex<Registry>> =
    Lazy::new(|| Mutex::new(Registry::new(DEFAULT_NAMESPACE)));

/// Register a non-transactional programmatic migration in the default registry
pub fn register<U, D>(source: &str, up: U, down: D) -> Result<(), MigrationError>
where
    U: Fn(&SchemaManager<'_>) -> Result<(), DbError> + Send + Sync + 'static,
    D: Fn(&SchemaManager<'_>) -> Result<(), DbError> + Send + Sync + 'static,
{
    DEFAULT_REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .add(source, up, down)
}

/// Register a transactional programmatic migration in the default registry
pub fn register_tx<U, D>(source: &str, up: U, down: D) -> Result<(), MigrationError>
where
    U: Fn(&SchemaManager<'_>) -> Result<(), DbError> + Send + Sync + 'static,
    D: Fn(&SchemaManager<'_>) -> Result<(), DbError> + Send + Sync + 'static,
{
    DEFAULT_REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .add_tx(source, up, down)
}

/// Move everything registered so far out of the default registry
pub fn take_default_registry() -> Registry {
    let mut registry = DEFAULT_REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *registry, Registry::new(DEFAULT_NAMESPACE))
}
