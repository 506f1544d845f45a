//! Transactional execution of an ordered script batch, shared by migrations and seeds.

use super::{substitute, MigrationError, SchemaVersionRecord, ScriptFailure};
use crate::executor::{ScriptExecutor, ScriptTransaction};
use crate::lock::Clock;
use crate::script::Script;
use chrono::Utc;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Migration,
    Seed,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Migration => "migration",
            BatchKind::Seed => "seed",
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one engine invocation. Consumed by the orchestrator, never persisted.
#[derive(Debug, Default)]
pub struct BatchRun {
    /// Ids committed by this run, in apply order. Empty on failure.
    pub applied: Vec<String>,
    pub failure: Option<ScriptFailure>,
}

impl BatchRun {
    pub fn succeeded(applied: Vec<String>) -> Self {
        Self { applied, failure: None }
    }

    pub fn failed(failure: ScriptFailure) -> Self {
        Self {
            applied: Vec::new(),
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failed_script(&self) -> Option<&str> {
        self.failure.as_ref().and_then(|f| f.script_id.as_deref())
    }
}

pub(crate) struct BatchOptions<'a> {
    pub kind: BatchKind,
    pub timeout: Duration,
    /// `None` disables `$name$` substitution.
    pub variables: Option<&'a BTreeMap<String, String>>,
    /// Ledger table to record each script in, inside the batch transaction.
    pub ledger_table: Option<&'a str>,
}

/// Run every script in one transaction. Commits once at the end or rolls everything back.
pub(crate) fn run_batch<E: ScriptExecutor + ?Sized>(
    executor: &E,
    scripts: &[&Script],
    clock: &dyn Clock,
    options: &BatchOptions<'_>,
) -> BatchRun {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::script_batch_span(options.kind.as_str(), scripts.len()).entered();

    let result = begin_and_apply(executor, scripts, clock, options);

    #[cfg(feature = "metrics")]
    {
        match &result {
            Ok(applied) => crate::metrics::METRICS.record_scripts_applied(options.kind.as_str(), applied.len()),
            Err(_) => crate::metrics::METRICS.record_batch_failure(options.kind.as_str()),
        }
    }

    match result {
        Ok(applied) => BatchRun::succeeded(applied),
        Err(failure) => BatchRun::failed(failure),
    }
}

fn begin_and_apply<E: ScriptExecutor + ?Sized>(
    executor: &E,
    scripts: &[&Script],
    clock: &dyn Clock,
    options: &BatchOptions<'_>,
) -> Result<Vec<String>, ScriptFailure> {
    let mut tx = executor
        .begin()
        .map_err(|e| ScriptFailure::batch(MigrationError::Transaction(e)))?;

    match apply_all(tx.as_mut(), scripts, clock, options) {
        Ok(applied) => {
            tx.commit()
                .map_err(|e| ScriptFailure::batch(MigrationError::Transaction(e)))?;
            Ok(applied)
        }
        Err(failure) => {
            if let Err(e) = tx.rollback() {
                log::warn!("rollback of failed {} batch failed: {}", options.kind, e);
            }
            Err(failure)
        }
    }
}

fn apply_all<T: ScriptTransaction + ?Sized>(
    tx: &mut T,
    scripts: &[&Script],
    clock: &dyn Clock,
    options: &BatchOptions<'_>,
) -> Result<Vec<String>, ScriptFailure> {
    let deadline = clock.now().checked_add(options.timeout).unwrap_or(Duration::MAX);
    let timeout = || MigrationError::Timeout { timeout: options.timeout };
    let mut applied = Vec::with_capacity(scripts.len());

    for script in scripts {
        let id = script.id();
        let now = clock.now();
        if now >= deadline {
            return Err(ScriptFailure::script(id, timeout()));
        }
        tx.set_statement_timeout(deadline - now)
            .map_err(|e| ScriptFailure::script(id, MigrationError::Transaction(e)))?;

        let sql = match options.variables {
            Some(variables) => {
                substitute(script.content(), variables).map_err(|e| ScriptFailure::script(id, e))?
            }
            None => Cow::Borrowed(script.content()),
        };

        log::info!("applying {} script script_id={}", options.kind, id);
        let started = clock.now();
        if let Err(e) = tx.execute_script(&sql) {
            let error = if e.is_statement_timeout() || clock.now() >= deadline {
                timeout()
            } else {
                MigrationError::Execution(e)
            };
            return Err(ScriptFailure::script(id, error));
        }
        if clock.now() > deadline {
            return Err(ScriptFailure::script(id, timeout()));
        }
        let elapsed = clock.now().saturating_sub(started);

        if let Some(table) = options.ledger_table {
            let record = SchemaVersionRecord::new(
                id,
                Some(script.checksum().to_string()),
                Utc::now(),
                Some(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)),
            );
            tx.record_applied(table, &record)
                .map_err(|e| ScriptFailure::script(id, MigrationError::Transaction(e)))?;
        }

        log::debug!(
            "{} script executed script_id={} elapsed_ms={}",
            options.kind,
            id,
            elapsed.as_millis()
        );
        applied.push(id.to_string());
    }

    Ok(applied)
}
