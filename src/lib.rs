//! # Launchguard
//!
//! Startup schema-migration orchestrator for PostgreSQL services on the `may` runtime.
//!
//! Every replica of a service calls [`MigrationOrchestrator::run_then`] once before it starts
//! serving traffic. The orchestrator takes a PostgreSQL advisory lock shared by all replicas,
//! applies pending migration scripts in a single transaction, records them in the version
//! ledger, applies the environment's seed scripts and then hands control back to the host.
//! A failed migration terminates the process so that an external supervisor restarts it.

pub mod config;
pub mod connection;
pub mod executor;
pub mod lock;
pub mod metrics;
pub mod migration;
pub mod orchestrator;
pub mod script;
pub mod seed;
pub mod transaction;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use config::MigrationConfig;
pub use connection::{resolve_connection_string, ConnectionSettings};
pub use executor::{AdvisoryLock, Database, DbError, PgDatabase, PgSession, ScriptExecutor, Session};
pub use lock::{Clock, LockCoordinator, SystemClock};
pub use migration::{MigrationEngine, MigrationError, MigrationRun, SchemaVersionRecord, ScriptFailure};
pub use orchestrator::{
    Continued, MigrationOrchestrator, OrchestratorError, OrchestratorState, Outcome,
    ProcessTerminator, RunReport, Terminator,
};
pub use script::{DirectoryScriptSource, Script, ScriptSource, ScriptSourceError, StaticScriptSource};
pub use seed::{SeedEngine, SeedEnvironment, SeedRun};
