//! MigrationEngine - applies pending migration scripts exactly once.
//!
//! 1. Create the ledger table if absent and read the applied ids.
//! 2. `pending = scripts - applied`, in script order.
//! 3. Nothing pending: succeed without opening a transaction.
//! 4. Otherwise run every pending script and insert its ledger row inside one transaction,
//!    committing once at the end. Any failure rolls back the whole batch.

use super::batch::{run_batch, BatchKind, BatchOptions, BatchRun};
use super::status::MigrationStatus;
use super::{MigrationError, ScriptFailure};
use crate::executor::ScriptExecutor;
use crate::lock::Clock;
use crate::script::checksum::checksum_matches;
use crate::script::Script;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub type MigrationRun = BatchRun;

/// Core migration execution engine
#[derive(Clone)]
pub struct MigrationEngine {
    ledger_table: String,
    variables: BTreeMap<String, String>,
    clock: Arc<dyn Clock>,
}

impl MigrationEngine {
    pub fn new(ledger_table: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger_table: ledger_table.into(),
            variables: BTreeMap::new(),
            clock,
        }
    }

    /// Values for `$name$` tokens in script bodies.
    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn ledger_table(&self) -> &str {
        &self.ledger_table
    }

    /// Scripts not yet in the ledger, preserving script order.
    ///
    /// Applied scripts whose body changed since they ran are logged and skipped.
    pub fn pending<'s, E: ScriptExecutor + ?Sized>(
        &self,
        scripts: &'s [Script],
        executor: &E,
    ) -> Result<Vec<&'s Script>, ScriptFailure> {
        let applied = self.applied_checksums(executor).map_err(ScriptFailure::batch)?;

        let mut pending = Vec::new();
        for script in scripts {
            match applied.get(script.id()) {
                Some(stored) => {
                    if !checksum_matches(stored.as_deref(), script.checksum()) {
                        log::warn!(
                            "migration script changed after it was applied script_id={} stored_checksum={} current_checksum={}",
                            script.id(),
                            stored.as_deref().unwrap_or("-"),
                            script.checksum()
                        );
                    }
                }
                None => pending.push(script),
            }
        }
        Ok(pending)
    }

    /// Apply an already computed pending set in a single transaction.
    pub fn apply<E: ScriptExecutor + ?Sized>(
        &self,
        pending: &[&Script],
        executor: &E,
        execution_timeout: Duration,
    ) -> MigrationRun {
        if pending.is_empty() {
            return MigrationRun::succeeded(Vec::new());
        }

        log::info!("applying {} pending migration script(s)", pending.len());
        let options = BatchOptions {
            kind: BatchKind::Migration,
            timeout: execution_timeout,
            variables: Some(&self.variables),
            ledger_table: Some(&self.ledger_table),
        };
        let run = run_batch(executor, pending, self.clock.as_ref(), &options);

        match &run.failure {
            None => log::info!("migrations committed applied={}", run.applied.len()),
            Some(failure) => log::error!(
                "migration batch rolled back script_id={} error={}",
                failure.script_id.as_deref().unwrap_or("-"),
                failure.error
            ),
        }
        run
    }

    /// Compute the pending set and apply it.
    pub fn run<E: ScriptExecutor + ?Sized>(
        &self,
        scripts: &[Script],
        executor: &E,
        execution_timeout: Duration,
    ) -> MigrationRun {
        match self.pending(scripts, executor) {
            Ok(pending) => self.apply(&pending, executor, execution_timeout),
            Err(failure) => MigrationRun::failed(failure),
        }
    }

    /// Applied, pending, drifted and unknown scripts.
    ///
    /// Read-only: safe without the migration lock. A missing ledger means nothing is applied.
    pub fn status<E: ScriptExecutor + ?Sized>(
        &self,
        scripts: &[Script],
        executor: &E,
    ) -> Result<MigrationStatus, MigrationError> {
        let exists = executor
            .ledger_exists(&self.ledger_table)
            .map_err(MigrationError::Ledger)?;
        let applied = if exists {
            executor
                .applied_records(&self.ledger_table)
                .map_err(MigrationError::Ledger)?
        } else {
            Vec::new()
        };
        Ok(MigrationStatus::new(scripts, applied))
    }

    fn applied_checksums<E: ScriptExecutor + ?Sized>(
        &self,
        executor: &E,
    ) -> Result<HashMap<String, Option<String>>, MigrationError> {
        executor
            .ensure_ledger(&self.ledger_table)
            .map_err(MigrationError::Ledger)?;
        let records = executor
            .applied_records(&self.ledger_table)
            .map_err(MigrationError::Ledger)?;
        Ok(records
            .into_iter()
            .map(|r| (r.script_id, r.checksum))
            .collect())
    }
}
