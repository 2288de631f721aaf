//! Migrator - applies, reverts and reports migrations
//!
//! A run moves through `Idle → Locking → Planning → Applying(i)` and ends in
//! `Committed` or `Aborted`:
//!
//! 1. take the exclusive migration lock (bounded wait)
//! 2. create the ledger if needed and read the applied ids, *after* the lock
//!    is held, so overlapping runs never apply a migration twice
//! 3. apply each pending migration in id order, one transaction per
//!    migration, with its ledger row written inside that transaction
//! 4. stop at the first failure; everything before it stays committed
//!
//! The lock is released when the run ends, whichever way it ends.

use super::error::MigrationError;
use super::ledger::VersionLedger;
use super::lock::{MigrationLockGuard, DEFAULT_LOCK_KEY};
use super::migration::{Migration, MigrationId, Revert};
use super::registry::MigrationRegistry;
use super::schema_manager::SchemaManager;
use super::script::ScriptLoader;
use super::status::MigrationStatus;
use crate::config::MigratorConfig;
use crate::executor::SchemaExecutor;
use crate::transaction::Transaction;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Every pending migration (up to the step limit) was applied
    Success,
    /// `migration_id` failed and was rolled back; later migrations were not attempted
    Failed {
        migration_id: MigrationId,
        name: String,
        cause: MigrationError,
    },
    /// Cancelled between migrations; the ledger reflects what was committed
    Cancelled,
}

/// Result of [`Migrator::run_pending`]
#[derive(Debug)]
pub struct RunResult {
    /// Ids committed by this run, in application order
    pub applied_migration_ids: Vec<MigrationId>,
    pub outcome: RunOutcome,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Success)
    }

    /// `0` on success or cancellation, `3` when a migration failed
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Success | RunOutcome::Cancelled => 0,
            RunOutcome::Failed { .. } => 3,
        }
    }

    /// The applied ids, or the failure as `MigrationError::ExecutionFailed`
    pub fn into_result(self) -> Result<Vec<MigrationId>, MigrationError> {
        match self.outcome {
            RunOutcome::Success | RunOutcome::Cancelled => Ok(self.applied_migration_ids),
            RunOutcome::Failed {
                migration_id,
                name,
                cause,
            } => Err(MigrationError::ExecutionFailed {
                migration_id,
                name,
                source: Box::new(cause),
            }),
        }
    }
}

/// Result of a successful [`Migrator::revert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertResult {
    pub migration_id: MigrationId,
    pub name: String,
    pub elapsed: Duration,
}

/// Cooperative cancellation flag, checked between migrations
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Resets the session statement timeout when dropped
struct StatementTimeout<'a> {
    executor: &'a dyn SchemaExecutor,
}

impl<'a> StatementTimeout<'a> {
    fn set(
        executor: &'a dyn SchemaExecutor,
        timeout: Option<Duration>,
    ) -> Result<Option<Self>, MigrationError> {
        let Some(timeout) = timeout else {
            return Ok(None);
        };
        executor.set_statement_timeout(Some(timeout))?;
        Ok(Some(Self { executor }))
    }
}

impl Drop for StatementTimeout<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.executor.set_statement_timeout(None) {
            log::warn!("Failed to reset statement timeout: {e}");
        }
    }
}

/// Migration runner
///
/// Holds the registry and settings; the database session is passed to each
/// call, so one `Migrator` can be shared between threads.
pub struct Migrator {
    registry: MigrationRegistry,
    scripts: Arc<dyn ScriptLoader>,
    ledger: VersionLedger,
    lock_key: i64,
    lock_timeout: Duration,
    lock_poll_interval: Duration,
    statement_timeout: Option<Duration>,
}

impl Migrator {
    /// Runner with default settings
    pub fn new(registry: MigrationRegistry, scripts: impl ScriptLoader + 'static) -> Self {
        let defaults = MigratorConfig::default();
        Self {
            registry,
            scripts: Arc::new(scripts),
            ledger: VersionLedger::default(),
            lock_key: DEFAULT_LOCK_KEY,
            lock_timeout: defaults.lock_timeout(),
            lock_poll_interval: defaults.lock_poll_interval(),
            statement_timeout: defaults.statement_timeout(),
        }
    }

    /// Runner configured from `config`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidIdentifier` if the configured ledger
    /// table name is not a plain identifier.
    pub fn from_config(
        registry: MigrationRegistry,
        scripts: impl ScriptLoader + 'static,
        config: &MigratorConfig,
    ) -> Result<Self, MigrationError> {
        Ok(Self {
            registry,
            scripts: Arc::new(scripts),
            ledger: VersionLedger::new(config.ledger_table.clone())?,
            lock_key: config.lock_key,
            lock_timeout: config.lock_timeout(),
            lock_poll_interval: config.lock_poll_interval(),
            statement_timeout: config.statement_timeout(),
        })
    }

    pub fn with_ledger(mut self, ledger: VersionLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_lock_key(mut self, key: i64) -> Self {
        self.lock_key = key;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// `None` disables the per-statement timeout
    pub fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    /// Apply every pending migration in id order
    ///
    /// Per-migration failures are reported in the returned [`RunResult`].
    ///
    /// # Errors
    ///
    /// `LockTimeout` if the lock is not acquired in time; `Database` if the
    /// ledger cannot be created or read.
    pub fn run_pending(&self, executor: &dyn SchemaExecutor) -> Result<RunResult, MigrationError> {
        self.run_pending_with(executor, &CancelToken::new(), None)
    }

    /// Like [`Migrator::run_pending`], applying at most `max_steps` migrations
    /// and stopping early once `cancel` is set
    pub fn run_pending_with(
        &self,
        executor: &dyn SchemaExecutor,
        cancel: &CancelToken,
        max_steps: Option<usize>,
    ) -> Result<RunResult, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::run_pending_span().entered();

        let _lock = self.acquire_lock(executor)?;
        let _timeout = StatementTimeout::set(executor, self.statement_timeout)?;

        self.ledger.ensure_initialized(executor)?;
        let applied = self.ledger.applied_ids(executor)?;
        let pending: Vec<&Migration> = self.registry.pending(&applied).collect();
        log::debug!(
            "{} migration(s) applied, {} pending",
            applied.len(),
            pending.len()
        );

        let mut applied_migration_ids = Vec::new();
        let limit = max_steps.unwrap_or(usize::MAX);
        for migration in pending.into_iter().take(limit) {
            if cancel.is_cancelled() {
                log::info!(
                    "Run cancelled after {} migration(s)",
                    applied_migration_ids.len()
                );
                return Ok(RunResult {
                    applied_migration_ids,
                    outcome: RunOutcome::Cancelled,
                });
            }

            if let Err(cause) = self.apply_one(executor, migration) {
                log::warn!(
                    "Migration {} ({}) failed and was rolled back: {cause}",
                    migration.id(),
                    migration.name()
                );
                #[cfg(feature = "metrics")]
                crate::metrics::METRICS.record_failed(migration.id());

                return Ok(RunResult {
                    applied_migration_ids,
                    outcome: RunOutcome::Failed {
                        migration_id: migration.id(),
                        name: migration.name().to_string(),
                        cause,
                    },
                });
            }
            applied_migration_ids.push(migration.id());
        }

        if !applied_migration_ids.is_empty() {
            log::info!("Applied {} migration(s)", applied_migration_ids.len());
        }
        Ok(RunResult {
            applied_migration_ids,
            outcome: RunOutcome::Success,
        })
    }

    /// Undo an applied migration and remove its ledger row
    ///
    /// # Errors
    ///
    /// `UnknownMigration` if `id` is not registered, `IrreversibleMigration` if
    /// it declares no revert (nothing is touched), `LockTimeout`, `NotApplied`
    /// if it has no ledger row, and `ExecutionFailed` if a revert operation
    /// fails (the revert is rolled back).
    pub fn revert(
        &self,
        executor: &dyn SchemaExecutor,
        id: MigrationId,
    ) -> Result<RevertResult, MigrationError> {
        let migration = self
            .registry
            .get(id)
            .ok_or(MigrationError::UnknownMigration(id))?;
        let Revert::Operations(operations) = migration.revert() else {
            return Err(MigrationError::IrreversibleMigration {
                id,
                name: migration.name().to_string(),
            });
        };

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::revert_migration_span(id, migration.name()).entered();

        let _lock = self.acquire_lock(executor)?;
        let _timeout = StatementTimeout::set(executor, self.statement_timeout)?;

        self.ledger.ensure_initialized(executor)?;
        if !self.ledger.contains(executor, id)? {
            return Err(MigrationError::NotApplied(id));
        }

        let start = Instant::now();
        self.in_transaction(executor, id, |manager| {
            manager.run_all(id, operations)?;
            self.ledger.unrecord(manager.executor(), id)
        })
        .map_err(|cause| MigrationError::ExecutionFailed {
            migration_id: id,
            name: migration.name().to_string(),
            source: Box::new(cause),
        })?;

        let elapsed = start.elapsed();
        log::info!("Reverted migration {id} ({}) in {elapsed:?}", migration.name());
        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_reverted(id, elapsed);

        Ok(RevertResult {
            migration_id: id,
            name: migration.name().to_string(),
            elapsed,
        })
    }

    /// Applied, pending and unknown migrations
    pub fn status(&self, executor: &dyn SchemaExecutor) -> Result<MigrationStatus, MigrationError> {
        self.ledger.ensure_initialized(executor)?;
        let applied = self.ledger.entries(executor)?;
        let applied_ids: BTreeSet<MigrationId> = applied.iter().map(|e| e.migration_id).collect();

        let pending = self.registry.pending(&applied_ids).map(Migration::id).collect();
        let unknown = applied_ids
            .iter()
            .copied()
            .filter(|id| !self.registry.contains(*id))
            .collect();

        Ok(MigrationStatus::new(applied, pending, unknown))
    }

    fn acquire_lock<'a>(
        &self,
        executor: &'a dyn SchemaExecutor,
    ) -> Result<MigrationLockGuard<'a>, MigrationError> {
        let guard = MigrationLockGuard::acquire(
            executor,
            self.lock_key,
            self.lock_timeout,
            self.lock_poll_interval,
        )?;
        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.observe_lock_wait(guard.waited());
        Ok(guard)
    }

    fn apply_one(
        &self,
        executor: &dyn SchemaExecutor,
        migration: &Migration,
    ) -> Result<(), MigrationError> {
        let id = migration.id();

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::apply_migration_span(id, migration.name()).entered();

        log::info!("Applying migration {id} ({})", migration.name());
        let start = Instant::now();

        self.in_transaction(executor, id, |manager| {
            manager.run_all(id, migration.apply())?;
            self.ledger.record(manager.executor(), id, Utc::now())
        })?;

        let elapsed = start.elapsed();
        log::info!("Applied migration {id} ({}) in {elapsed:?}", migration.name());
        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_applied(id, elapsed);
        Ok(())
    }

    /// Run `body` in a transaction of its own, committing on success and
    /// rolling back on failure
    fn in_transaction<F>(
        &self,
        executor: &dyn SchemaExecutor,
        id: MigrationId,
        body: F,
    ) -> Result<(), MigrationError>
    where
        F: FnOnce(&SchemaManager<'_>) -> Result<(), MigrationError>,
    {
        let tx = Transaction::begin(executor).map_err(|source| MigrationError::Transaction {
            migration_id: id,
            source,
        })?;
        let manager = SchemaManager::new(executor, self.scripts.as_ref());

        match body(&manager) {
            Ok(()) => tx.commit().map_err(|source| MigrationError::Transaction {
                migration_id: id,
                source,
            }),
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    log::warn!("Rollback of migration {id} failed: {rollback}");
                }
                Err(e)
            }
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::migration::operation::{ColumnType, DefaultValue, SchemaOperation};
    use crate::migration::script::StaticScriptLoader;
    use crate::sqlite::SqliteExecutor;

    fn flag(id: i64, column: &str) -> Migration {
        Migration::reversible(
            id,
            format!("add_{column}"),
            vec![SchemaOperation::add_column(
                "User",
                column,
                ColumnType::Boolean,
                false,
                Some(DefaultValue::Bool(false)),
            )],
            vec![SchemaOperation::drop_column("User", column)],
        )
    }

    fn setup(migrations: Vec<Migration>) -> (SqliteExecutor, Migrator) {
        let db = SqliteExecutor::open_in_memory().unwrap();
        db.batch_execute(r#"CREATE TABLE "User" (Id INTEGER PRIMARY KEY)"#)
            .unwrap();
        let registry = MigrationRegistry::new(migrations).unwrap();
        (db, Migrator::new(registry, StaticScriptLoader::new()))
    }

    #[test]
    fn test_step_limit() {
        let (db, migrator) = setup(vec![flag(1, "A"), flag(2, "B"), flag(3, "C")]);
        let result = migrator
            .run_pending_with(&db, &CancelToken::new(), Some(2))
            .unwrap();
        assert!(result.is_success());
        assert_eq!(
            result.applied_migration_ids,
            vec![MigrationId::new(1), MigrationId::new(2)]
        );
        let status = migrator.status(&db).unwrap();
        assert_eq!(status.pending, vec![MigrationId::new(3)]);
    }

    #[test]
    fn test_cancel_before_start_applies_nothing() {
        let (db, migrator) = setup(vec![flag(1, "A")]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = migrator.run_pending_with(&db, &cancel, None).unwrap();
        assert!(matches!(result.outcome, RunOutcome::Cancelled));
        assert!(result.applied_migration_ids.is_empty());
        assert_eq!(result.exit_code(), 0);
    }

    #[test]
    fn test_failed_run_into_result() {
        let bad = Migration::irreversible(
            2,
            "broken",
            vec![SchemaOperation::raw_script("does_not_exist")],
        );
        let (db, migrator) = setup(vec![flag(1, "A"), bad]);
        let result = migrator.run_pending(&db).unwrap();
        assert_eq!(result.exit_code(), 3);
        assert_eq!(result.applied_migration_ids, vec![MigrationId::new(1)]);
        let err = result.into_result().unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_revert_unknown_and_not_applied() {
        let (db, migrator) = setup(vec![flag(1, "A")]);
        assert!(matches!(
            migrator.revert(&db, MigrationId::new(99)),
            Err(MigrationError::UnknownMigration(_))
        ));
        assert!(matches!(
            migrator.revert(&db, MigrationId::new(1)),
            Err(MigrationError::NotApplied(_))
        ));
    }

    #[test]
    fn test_statement_timeout_is_reset_after_run() {
        let (db, migrator) = setup(vec![flag(1, "A")]);
        let migrator = migrator.with_statement_timeout(Some(Duration::from_secs(1)));
        migrator.run_pending(&db).unwrap();
        // A second run on the same session still works after the reset
        assert!(migrator.run_pending(&db).unwrap().applied_migration_ids.is_empty());
    }

    #[test]
    fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
