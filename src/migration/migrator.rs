//! Migrator - Core migration execution engine
//!
//! One [`Migrator::migrate`] call takes the migration lock, reads the applied
//! set for the registry's namespace, plans the delta, checks it against the
//! hazard and drift policies and then runs it, one migration at a time.
//!
//! Each migration is its own unit of work. A transactional migration runs its
//! statements and its versioning-table write inside one transaction; a
//! non-transactional one sends each statement on its own and records itself
//! afterwards. A failure stops the run, leaving earlier migrations applied.
//!
//! Inside a caller's transaction ([`Session::Transaction`]) each migration
//! gets a savepoint instead, and nothing is committed: the caller decides.

use crate::executor::{DbError, Executor};
use crate::migration::context::Context;
use crate::migration::error::MigrationError;
use crate::migration::lock::{MigrationLockGuard, DEFAULT_LOCK_TIMEOUT};
use crate::migration::migration::{Direction, Executable, Migration};
use crate::migration::record::MigrationRecord;
use crate::migration::registry::Registry;
use crate::migration::schema_manager::SchemaManager;
use crate::migration::state_table::{is_valid_table_name, DEFAULT_STATE_TABLE};
use crate::migration::status::{MigrationStatus, PendingMigration};
use crate::migration::version::Version;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How many migrations a run may execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Steps {
    /// Every candidate in the plan
    #[default]
    All,
    /// At most this many; zero is rejected
    Limit(usize),
}

impl Steps {
    fn validate(self) -> Result<(), MigrationError> {
        match self {
            Steps::Limit(0) => Err(MigrationError::InvalidSteps),
            _ => Ok(()),
        }
    }
}

/// Savepoint wrapping each migration run inside a caller's transaction
const SAVEPOINT: &str = "lockstep_migration";

/// The database session a run works through
///
/// `Connection` is a session with no open transaction; the migrator opens and
/// commits one per transactional migration. `Transaction` is a session whose
/// transaction the caller already opened and will finish; migrations run
/// under savepoints and non-transactional ones are refused.
#[derive(Clone, Copy)]
pub enum Session<'a> {
    Connection(&'a dyn Executor),
    Transaction(&'a dyn Executor),
}

impl<'a> Session<'a> {
    pub fn executor(self) -> &'a dyn Executor {
        match self {
            Session::Connection(executor) | Session::Transaction(executor) => executor,
        }
    }

    pub fn is_transaction(self) -> bool {
        matches!(self, Session::Transaction(_))
    }
}

impl<'a, E: Executor> From<&'a E> for Session<'a> {
    fn from(executor: &'a E) -> Self {
        Session::Connection(executor)
    }
}

/// Per-call options for [`Migrator::migrate`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrateOptions {
    pub steps: Steps,
    /// Run migrations carrying hazard annotations
    pub allow_hazards: bool,
}

impl MigrateOptions {
    #[must_use]
    pub fn steps(mut self, steps: Steps) -> Self {
        self.steps = steps;
        self
    }

    #[must_use]
    pub fn allow_hazards(mut self, allow: bool) -> Self {
        self.allow_hazards = allow;
        self
    }
}

/// A migration executed by one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: Version,
    pub name: String,
    pub namespace: String,
    pub duration: Duration,
}

/// Outcome of one [`Migrator::migrate`] call, in execution order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrateResult {
    pub direction: Direction,
    pub migrations: Vec<AppliedMigration>,
}

impl MigrateResult {
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn versions(&self) -> Vec<Version> {
        self.migrations.iter().map(|m| m.version).collect()
    }
}

/// Construction parameters for a [`Migrator`]
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Required; the migrator refuses to start without one
    pub registry: Option<Arc<Registry>>,
    /// Versioning table, optionally schema-qualified
    pub table: String,
    pub lock_timeout: Duration,
    /// Default for [`MigrateOptions::allow_hazards`]; either one enables it
    pub allow_hazards: bool,
    pub skip_drift_check: bool,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            registry: None,
            table: DEFAULT_STATE_TABLE.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            allow_hazards: false,
            skip_drift_check: false,
        }
    }
}

impl MigratorConfig {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Some(Arc::new(registry)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_allow_hazards(mut self, allow: bool) -> Self {
        self.allow_hazards = allow;
        self
    }

    #[must_use]
    pub fn with_skip_drift_check(mut self, skip: bool) -> Self {
        self.skip_drift_check = skip;
        self
    }
}

/// Core migration execution engine
///
/// Holds the registry read-only; one migrator can serve any number of runs,
/// each against the executor passed to it.
#[derive(Debug, Clone)]
pub struct Migrator {
    registry: Arc<Registry>,
    table: String,
    lock_timeout: Duration,
    allow_hazards: bool,
    skip_drift_check: bool,
}

impl Migrator {
    /// Validate `config` and build a migrator
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Config` when the registry is missing, its
    /// namespace is empty, or the table name is not a plain or
    /// schema-qualified identifier.
    pub fn new(config: MigratorConfig) -> Result<Self, MigrationError> {
        let registry = config
            .registry
            .ok_or_else(|| MigrationError::Config("a migration registry is required".to_string()))?;
        if registry.namespace().trim().is_empty() {
            return Err(MigrationError::Config(
                "the registry namespace must not be empty".to_string(),
            ));
        }
        if !is_valid_table_name(&config.table) {
            return Err(MigrationError::Config(format!(
                "invalid versioning table name '{}'",
                config.table
            )));
        }

        Ok(Self {
            registry,
            table: config.table,
            lock_timeout: config.lock_timeout,
            allow_hazards: config.allow_hazards,
            skip_drift_check: config.skip_drift_check,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn namespace(&self) -> &str {
        self.registry.namespace()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Move the schema in `direction`
    ///
    /// Rolling forward applies pending migrations oldest first; rolling back
    /// undoes applied ones newest first. `session` is either a plain session
    /// (any `&impl Executor` converts to [`Session::Connection`]) or a
    /// [`Session::Transaction`] the caller has opened. The lock and every
    /// per-migration transaction or savepoint are scoped to it.
    ///
    /// The applied-set read and planning are not wrapped in a transaction of
    /// their own: every writer of the versioning table holds the same advisory
    /// lock, so the set cannot change between the read and the run.
    ///
    /// # Errors
    ///
    /// - `InvalidSteps` for `Steps::Limit(0)`, before any database I/O
    /// - `Lock` / `LockTimeout` when the migration lock cannot be taken
    /// - `Drift` / `MissingMigration` when the applied set no longer matches the registry
    /// - `HazardsDetected` when a planned migration is annotated and hazards are not allowed
    /// - `Config` when a planned migration cannot run outside a transaction
    ///   but the session is a caller's transaction
    /// - `Execution` when a statement fails; earlier migrations stay applied
    /// - `StateUpdate` when a migration ran but could not be recorded
    /// - `Cancelled` / `DeadlineExceeded` from `ctx`
    pub fn migrate<'a>(
        &self,
        ctx: &Context,
        direction: Direction,
        session: impl Into<Session<'a>>,
        options: MigrateOptions,
    ) -> Result<MigrateResult, MigrationError> {
        options.steps.validate()?;
        let session = session.into();
        let executor = session.executor();

        let _lock = MigrationLockGuard::acquire(executor, ctx, self.lock_timeout)?;
        log::info!(
            "Acquired migration lock for namespace '{}' ({direction})",
            self.namespace()
        );

        ctx.check()?;
        executor.ensure_state_table(&self.table)?;
        ctx.check()?;
        let applied = executor.applied_migrations(&self.table, self.namespace())?;

        if !self.skip_drift_check {
            self.check_drift(&applied)?;
        }

        let plan = self.plan(direction, &applied, options.steps);
        if plan.is_empty() {
            log::info!("No migrations to run {direction} in namespace '{}'", self.namespace());
            return Ok(MigrateResult {
                direction,
                migrations: Vec::new(),
            });
        }
        log::info!(
            "Planned {} migration(s) {direction}: {}",
            plan.len(),
            plan.iter()
                .map(|m| m.version().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        if !(options.allow_hazards || self.allow_hazards) {
            Self::check_hazards(direction, &plan)?;
        }
        if session.is_transaction() {
            Self::check_transactional(direction, &plan)?;
        }

        let mut migrations = Vec::with_capacity(plan.len());
        for migration in plan {
            migrations.push(self.apply(ctx, session, direction, migration)?);
        }

        log::info!(
            "Ran {} migration(s) {direction} in namespace '{}'",
            migrations.len(),
            self.namespace()
        );
        Ok(MigrateResult {
            direction,
            migrations,
        })
    }

    /// Applied and pending migrations, without taking the lock
    pub fn status(
        &self,
        ctx: &Context,
        executor: &dyn Executor,
    ) -> Result<MigrationStatus, MigrationError> {
        ctx.check()?;
        executor.ensure_state_table(&self.table)?;
        ctx.check()?;
        let applied = executor.applied_migrations(&self.table, self.namespace())?;

        let applied_versions: HashSet<Version> = applied.iter().map(|r| r.version).collect();
        let pending = self
            .registry
            .sorted()
            .into_iter()
            .filter(|m| !applied_versions.contains(&m.version()))
            .map(|m| PendingMigration {
                version: m.version(),
                name: m.name().to_string(),
                checksum: m.checksum().to_string(),
            })
            .collect();

        Ok(MigrationStatus::new(applied, pending))
    }

    /// Compare applied records with the registry
    fn check_drift(&self, applied: &[MigrationRecord]) -> Result<(), MigrationError> {
        for record in applied {
            let Some(migration) = self.registry.get(record.version) else {
                return Err(MigrationError::MissingMigration {
                    version: record.version,
                    name: record.name.clone(),
                });
            };
            // Programmatic migrations have no source text to compare.
            if migration.checksum().is_empty() || record.checksum.is_empty() {
                continue;
            }
            if migration.checksum() != record.checksum {
                return Err(MigrationError::Drift {
                    version: record.version,
                    name: record.name.clone(),
                    stored: record.checksum.clone(),
                    current: migration.checksum().to_string(),
                });
            }
        }
        Ok(())
    }

    fn plan(&self, direction: Direction, applied: &[MigrationRecord], steps: Steps) -> Vec<&Migration> {
        let mut plan: Vec<&Migration> = match direction {
            Direction::Up => {
                let applied: HashSet<Version> = applied.iter().map(|r| r.version).collect();
                self.registry
                    .sorted()
                    .into_iter()
                    .filter(|m| !applied.contains(&m.version()))
                    .collect()
            }
            Direction::Down => {
                let mut versions: Vec<Version> = applied.iter().map(|r| r.version).collect();
                versions.sort_unstable_by(|a, b| b.cmp(a));
                versions
                    .into_iter()
                    .filter_map(|v| {
                        let found = self.registry.get(v);
                        if found.is_none() {
                            log::warn!("Applied migration {v} is not registered; it cannot be rolled back");
                        }
                        found
                    })
                    .collect()
            }
        };

        if let Steps::Limit(n) = steps {
            plan.truncate(n);
        }
        plan
    }

    fn check_hazards(direction: Direction, plan: &[&Migration]) -> Result<(), MigrationError> {
        for migration in plan {
            let hazards = migration.executable(direction).hazards();
            if !hazards.is_empty() {
                log::warn!(
                    "Migration {} '{}' is annotated with {} hazard(s); refusing to run",
                    migration.version(),
                    migration.name(),
                    hazards.len()
                );
                return Err(MigrationError::HazardsDetected {
                    version: migration.version(),
                    name: migration.name().to_string(),
                    hazards: hazards.to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Every planned migration must be able to run under a savepoint
    fn check_transactional(direction: Direction, plan: &[&Migration]) -> Result<(), MigrationError> {
        match plan
            .iter()
            .find(|m| !m.executable(direction).is_transactional())
        {
            Some(migration) => Err(non_transactional_in_transaction(migration)),
            None => Ok(()),
        }
    }

    fn apply(
        &self,
        ctx: &Context,
        session: Session<'_>,
        direction: Direction,
        migration: &Migration,
    ) -> Result<AppliedMigration, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "lockstep.migration",
            version = %migration.version(),
            name = %migration.name(),
            direction = %direction,
        )
        .entered();

        let executable = migration.executable(direction);
        let start = Instant::now();
        log::info!(
            "Running migration {} '{}' {direction}",
            migration.version(),
            migration.name()
        );

        let executor = session.executor();
        let body = || {
            self.run(ctx, executor, migration, executable)
                .and_then(|()| self.persist(executor, direction, migration, start.elapsed()))
        };

        match session {
            Session::Connection(_) if !executable.is_transactional() => body()?,
            Session::Connection(_) => {
                ctx.check()?;
                executor
                    .begin()
                    .map_err(|source| execution_error(migration, "BEGIN", source))?;
                let outcome = body().and_then(|()| {
                    ctx.check()?;
                    executor
                        .commit()
                        .map_err(|source| execution_error(migration, "COMMIT", source))
                });
                if let Err(e) = outcome {
                    if let Err(rollback) = executor.rollback() {
                        log::error!(
                            "Rollback of migration {} '{}' failed: {rollback}",
                            migration.version(),
                            migration.name()
                        );
                    }
                    return Err(e);
                }
            }
            Session::Transaction(_) if !executable.is_transactional() => {
                return Err(non_transactional_in_transaction(migration));
            }
            Session::Transaction(_) => {
                ctx.check()?;
                executor
                    .savepoint(SAVEPOINT)
                    .map_err(|source| execution_error(migration, "SAVEPOINT", source))?;
                let outcome = body().and_then(|()| {
                    ctx.check()?;
                    executor
                        .release_savepoint(SAVEPOINT)
                        .map_err(|source| execution_error(migration, "RELEASE SAVEPOINT", source))
                });
                if let Err(e) = outcome {
                    let undone = executor
                        .rollback_to_savepoint(SAVEPOINT)
                        .and_then(|()| executor.release_savepoint(SAVEPOINT));
                    if let Err(rollback) = undone {
                        log::error!(
                            "Rollback to savepoint for migration {} '{}' failed: {rollback}",
                            migration.version(),
                            migration.name()
                        );
                    }
                    return Err(e);
                }
            }
        }

        let duration = start.elapsed();
        log::info!(
            "Migration {} '{}' {direction} finished in {}ms",
            migration.version(),
            migration.name(),
            duration.as_millis()
        );
        Ok(AppliedMigration {
            version: migration.version(),
            name: migration.name().to_string(),
            namespace: self.namespace().to_string(),
            duration,
        })
    }

    fn run(
        &self,
        ctx: &Context,
        executor: &dyn Executor,
        migration: &Migration,
        executable: &Executable,
    ) -> Result<(), MigrationError> {
        match executable {
            Executable::Sql { statements, .. } => {
                for sql in statements {
                    ctx.check()?;
                    log::debug!("Executing: {sql}");
                    executor
                        .execute(sql)
                        .map_err(|source| execution_error(migration, sql, source))?;
                }
                Ok(())
            }
            Executable::Func { func, .. } => {
                ctx.check()?;
                let manager = SchemaManager::new(executor);
                func(&manager).map_err(|source| {
                    let sql = manager.last_sql().unwrap_or_default();
                    execution_error(migration, &sql, source)
                })
            }
            Executable::Noop => {
                log::debug!(
                    "Migration {} '{}' has nothing to run",
                    migration.version(),
                    migration.name()
                );
                Ok(())
            }
        }
    }

    /// Write the versioning-table change for a migration that just ran
    ///
    /// Not cancellable: once the migration body has run, recording it is part
    /// of the same unit of work.
    fn persist(
        &self,
        executor: &dyn Executor,
        direction: Direction,
        migration: &Migration,
        elapsed: Duration,
    ) -> Result<(), MigrationError> {
        let written = match direction {
            Direction::Up => {
                let record = MigrationRecord::new(
                    migration.version(),
                    self.namespace(),
                    migration.name(),
                    migration.checksum(),
                )
                .with_execution_time_ms(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
                executor.insert_migration(&self.table, &record)
            }
            Direction::Down => {
                executor.delete_migration(&self.table, self.namespace(), migration.version())
            }
        };

        written.map_err(|source| {
            log::error!(
                "Migration {} '{}' ran {direction} but the versioning table '{}' could not be updated: {source}. \
                 The recorded state may not match the schema",
                migration.version(),
                migration.name(),
                self.table
            );
            MigrationError::StateUpdate {
                version: migration.version(),
                name: migration.name().to_string(),
                source,
            }
        })
    }
}

fn non_transactional_in_transaction(migration: &Migration) -> MigrationError {
    MigrationError::Config(format!(
        "migration {} '{}' disables transactions and cannot run inside the caller's transaction",
        migration.version(),
        migration.name()
    ))
}

fn execution_error(migration: &Migration, sql: &str, source: DbError) -> MigrationError {
    MigrationError::Execution {
        version: migration.version(),
        name: migration.name().to_string(),
        sql: sql.to_string(),
        source,
    }
}
