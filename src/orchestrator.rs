//! Startup sequencing: config, database, lock, migrations, seeds, release.
//!
//! ```text
//! Idle -> ResolvingConfig -> [Disabled | Unconfigured] -> Done
//!      -> EnsuringDatabaseExists -> AcquiringLock
//!         -> LockAcquired -> CheckingPending
//!            -> NonePending  -> RunningSeeds
//!            -> SomePending  -> RunningMigrations -> RunningSeeds
//!                                                 -> Terminating
//!         -> LockTimedOut -> SkippingMigration
//!      -> ReleasingLock -> Done
//! ```
//!
//! A failed migration batch is fatal: the lock is released and the process is terminated with
//! a non-zero exit code so a supervisor restarts it. Every other failure, a failed seed batch
//! included, is reported to the caller and startup continues.

use crate::config::MigrationConfig;
use crate::connection::{resolve_connection_string, resolve_maintenance_connection_string};
use crate::executor::{Database, DbError, PgDatabase, Session};
use crate::lock::{Clock, LockCoordinator, SystemClock};
use crate::migration::{MigrationEngine, ScriptFailure};
use crate::script::{DirectoryScriptSource, ScriptSource, ScriptSourceError};
use crate::seed::{InvalidEnvironment, SeedEngine, SeedEnvironment};
use config::ConfigError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Exit code used when a migration batch fails.
pub const MIGRATION_FAILURE_EXIT_CODE: i32 = 1;

/// Ends the hosting process
pub trait Terminator: Send + Sync {
    fn terminate(&self, exit_code: i32);
}

/// Flushes the logger and calls [`std::process::exit`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, exit_code: i32) {
        log::error!("terminating process exit_code={}", exit_code);
        log::logger().flush();
        std::process::exit(exit_code);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    ResolvingConfig,
    Disabled,
    Unconfigured,
    EnsuringDatabaseExists,
    AcquiringLock,
    LockAcquired,
    LockTimedOut,
    SkippingMigration,
    CheckingPending,
    NonePending,
    SomePending,
    RunningMigrations,
    RunningSeeds,
    Terminating,
    ReleasingLock,
    Done,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a run that did not fail ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `enabled = false`; no database calls were made
    Disabled,
    /// Connection settings incomplete; no database calls were made
    Unconfigured,
    /// Another replica held the lock for the whole wait
    LockTimedOut,
    /// Script ids committed by this run
    Completed { migrations: Vec<String>, seeds: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: Outcome,
    /// Every state visited, in order
    pub states: Vec<OrchestratorState>,
}

/// What [`MigrationOrchestrator::run_then`] hands back once the continuation has run
#[derive(Debug)]
pub struct Continued<T> {
    /// Return value of the continuation
    pub output: T,
    /// The migration run. `Err` holds a non-fatal failure (seeds, connection, config).
    pub report: Result<RunReport, OrchestratorError>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Only observable when the terminator returns (tests)
    #[error("migration failed: {0}")]
    MigrationFailed(#[source] ScriptFailure),
    #[error("seeding environment '{environment}' failed: {failure}")]
    SeedFailed {
        environment: String,
        #[source]
        failure: ScriptFailure,
    },
    #[error("failed to list scripts: {0}")]
    ScriptSource(#[from] ScriptSourceError),
    #[error(transparent)]
    InvalidEnvironment(#[from] InvalidEnvironment),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Only a failed migration batch stops the service from starting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestratorError::MigrationFailed(_))
    }
}

/// Owns the lock-holding session for the critical section.
///
/// The lock is released and the session closed on every exit path, including early returns
/// and panics.
struct CriticalSection<'a, S: Session> {
    session: S,
    key: i64,
    coordinator: &'a LockCoordinator,
    finished: bool,
}

impl<'a, S: Session> CriticalSection<'a, S> {
    fn new(session: S, key: i64, coordinator: &'a LockCoordinator) -> Self {
        Self {
            session,
            key,
            coordinator,
            finished: false,
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.coordinator.release(self.key, &self.session);
        self.session.close();
    }
}

impl<S: Session> Drop for CriticalSection<'_, S> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Runs the startup migration sequence once per process
pub struct MigrationOrchestrator<D: Database> {
    config: MigrationConfig,
    database: D,
    scripts: Box<dyn ScriptSource>,
    terminator: Box<dyn Terminator>,
    clock: Arc<dyn Clock>,
}

impl MigrationOrchestrator<PgDatabase> {
    /// PostgreSQL database, scripts read from `config.scripts_dir`.
    pub fn from_config(config: MigrationConfig) -> Self {
        let scripts = DirectoryScriptSource::new(&config.scripts_dir);
        Self::new(config, PgDatabase, scripts)
    }
}

impl<D: Database> MigrationOrchestrator<D> {
    pub fn new(config: MigrationConfig, database: D, scripts: impl ScriptSource + 'static) -> Self {
        Self {
            config,
            database,
            scripts: Box::new(scripts),
            terminator: Box::new(ProcessTerminator),
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_terminator(mut self, terminator: impl Terminator + 'static) -> Self {
        self.terminator = Box::new(terminator);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Run the sequence, then hand control to `continuation`.
    ///
    /// `continuation` runs unless the run failed fatally (see [`OrchestratorError::is_fatal`]),
    /// in which case that error is returned. Seed and other non-fatal failures are logged and
    /// returned next to the continuation's output.
    pub fn run_then<T, F: FnOnce() -> T>(&self, continuation: F) -> Result<Continued<T>, OrchestratorError> {
        let report = match self.run() {
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::error!("startup migration step failed, continuing startup: {}", e);
                Err(e)
            }
            Ok(report) => Ok(report),
        };
        Ok(Continued {
            output: continuation(),
            report,
        })
    }

    pub fn run(&self) -> Result<RunReport, OrchestratorError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::orchestrator_span(&self.config.application_name).entered();

        let mut states = Vec::new();
        let outcome = self.run_inner(&mut states)?;
        log::info!("migration orchestrator finished outcome={:?}", outcome);
        Ok(RunReport { outcome, states })
    }

    fn run_inner(&self, states: &mut Vec<OrchestratorState>) -> Result<Outcome, OrchestratorError> {
        let config = &self.config;
        enter(states, OrchestratorState::Idle);
        enter(states, OrchestratorState::ResolvingConfig);

        if !config.enabled {
            log::info!("migrations disabled, skipping application_name={}", config.application_name);
            enter(states, OrchestratorState::Disabled);
            enter(states, OrchestratorState::Done);
            return Ok(Outcome::Disabled);
        }
        config.validate()?;

        let connection_string = resolve_connection_string(&config.database, &config.application_name);
        if connection_string.is_empty() {
            log::warn!(
                "migration connection not configured, skipping missing={}",
                config.database.missing_fields().join(",")
            );
            enter(states, OrchestratorState::Unconfigured);
            enter(states, OrchestratorState::Done);
            return Ok(Outcome::Unconfigured);
        }

        let environment = SeedEnvironment::new(config.environment.as_str())?;
        let migrations = self.scripts.list(&config.migrations_location)?;
        let seeds = self
            .scripts
            .list(&environment.location(&config.seeds_location))?;
        log::info!(
            "discovered scripts migrations={} seeds={} environment={}",
            migrations.len(),
            seeds.len(),
            environment
        );

        enter(states, OrchestratorState::EnsuringDatabaseExists);
        if let Some(name) = config.database.name.as_deref() {
            let maintenance =
                resolve_maintenance_connection_string(&config.database, &config.application_name);
            if self.database.ensure_database_exists(&maintenance, name)? {
                log::info!("created database {}", name);
            }
        }

        let session = self.database.open(&connection_string)?;
        let coordinator = LockCoordinator::new(self.clock.clone());
        let key = config.resolved_lock_key();
        let mut critical = CriticalSection::new(session, key, &coordinator);

        enter(states, OrchestratorState::AcquiringLock);
        let acquired = coordinator.acquire(
            key,
            &critical.session,
            config.lock_max_wait(),
            config.lock_poll_interval(),
        )?;
        if !acquired {
            log::warn!(
                "migration lock not acquired within {}s, assuming another instance migrates lock_key={}",
                config.lock_max_wait_seconds,
                key
            );
            enter(states, OrchestratorState::LockTimedOut);
            enter(states, OrchestratorState::SkippingMigration);
            enter(states, OrchestratorState::ReleasingLock);
            critical.finish();
            enter(states, OrchestratorState::Done);
            return Ok(Outcome::LockTimedOut);
        }
        enter(states, OrchestratorState::LockAcquired);

        let engine = MigrationEngine::new(config.ledger_table.as_str(), self.clock.clone())
            .with_variables(self.variables());

        enter(states, OrchestratorState::CheckingPending);
        let run = match engine.pending(&migrations, &critical.session) {
            Ok(pending) if pending.is_empty() => {
                log::info!("schema up to date, no pending migrations");
                enter(states, OrchestratorState::NonePending);
                None
            }
            Ok(pending) => {
                enter(states, OrchestratorState::SomePending);
                enter(states, OrchestratorState::RunningMigrations);
                Some(engine.apply(&pending, &critical.session, config.execution_timeout()))
            }
            Err(failure) => Some(crate::migration::MigrationRun::failed(failure)),
        };

        let applied_migrations = match run {
            Some(run) => match run.failure {
                Some(failure) => {
                    enter(states, OrchestratorState::Terminating);
                    log::error!(
                        "migration failed, terminating script_id={} error={}",
                        failure.script_id.as_deref().unwrap_or("-"),
                        failure.error
                    );
                    enter(states, OrchestratorState::ReleasingLock);
                    critical.finish();
                    self.terminator.terminate(MIGRATION_FAILURE_EXIT_CODE);
                    return Err(OrchestratorError::MigrationFailed(failure));
                }
                None => run.applied,
            },
            None => Vec::new(),
        };

        enter(states, OrchestratorState::RunningSeeds);
        let seed_run = SeedEngine::new(self.clock.clone()).run(
            &environment,
            &seeds,
            &critical.session,
            config.execution_timeout(),
        );

        enter(states, OrchestratorState::ReleasingLock);
        critical.finish();

        if let Some(failure) = seed_run.failure {
            return Err(OrchestratorError::SeedFailed {
                environment: environment.to_string(),
                failure,
            });
        }

        enter(states, OrchestratorState::Done);
        Ok(Outcome::Completed {
            migrations: applied_migrations,
            seeds: seed_run.applied,
        })
    }

    /// Configured variables plus `application_name` and `environment`, which configured
    /// values override.
    fn variables(&self) -> BTreeMap<String, String> {
        let mut variables = BTreeMap::from([
            ("application_name".to_string(), self.config.application_name.clone()),
            ("environment".to_string(), self.config.environment.clone()),
        ]);
        variables.extend(self.config.variables.clone());
        variables
    }
}

fn enter(states: &mut Vec<OrchestratorState>, state: OrchestratorState) {
    log::debug!("migration orchestrator state={}", state);
    states.push(state);
}
