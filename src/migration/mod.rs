//! Versioned migrations.
//!
//! Migration scripts are applied exactly once per database. Each applied script gets a row in
//! the version ledger, written in the same transaction as the script itself, so the ledger can
//! never disagree with the schema.
//!
//! # Example
//!
//! ```rust,ignore
//! use launchguard::migration::MigrationEngine;
//! use launchguard::testing::{InMemoryDatabase, ManualClock};
//! use launchguard::{Database, Script};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let db = InMemoryDatabase::new();
//! let session = db.open("memory").unwrap();
//! let scripts = vec![Script::new("20240120-120000-CreateProducts", "CREATE products", "db")];
//!
//! let engine = MigrationEngine::new("schema_versions", Arc::new(ManualClock::new()));
//! let run = engine.run(&scripts, &session, Duration::from_secs(300));
//! assert_eq!(run.applied, vec!["20240120-120000-CreateProducts".to_string()]);
//! ```

pub(crate) mod batch;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod status;
pub mod substitution;

pub use batch::{BatchKind, BatchRun};
pub use engine::{MigrationEngine, MigrationRun};
pub use error::{MigrationError, ScriptFailure};
pub use ledger::SchemaVersionRecord;
pub use status::MigrationStatus;
pub use substitution::substitute;
