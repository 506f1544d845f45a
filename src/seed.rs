//! Environment-scoped seed scripts.
//!
//! Seeds are not recorded in the version ledger. The full seed set for the active environment
//! runs on every boot inside one transaction, so each seed script has to guard its own writes
//! (`INSERT ... ON CONFLICT DO NOTHING`, `WHERE NOT EXISTS`, ...). Seed bodies are executed
//! verbatim: `$name$` substitution is never applied because dollar-quoted function bodies
//! would be mangled.

use crate::executor::ScriptExecutor;
use crate::lock::Clock;
use crate::migration::batch::{run_batch, BatchKind, BatchOptions, BatchRun};
use crate::script::Script;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type SeedRun = BatchRun;

/// Deployment environment name that selects a seed subset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedEnvironment(String);

/// Environment names must be a single path segment
#[derive(Debug, thiserror::Error)]
#[error("invalid seed environment '{0}'")]
pub struct InvalidEnvironment(pub String);

impl SeedEnvironment {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidEnvironment> {
        let name = name.into();
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(Self(name))
        } else {
            Err(InvalidEnvironment(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Location key of this environment's seeds under `seeds_location`.
    pub fn location(&self, seeds_location: &str) -> String {
        format!("{}/{}", seeds_location.trim_end_matches('/'), self.0)
    }
}

impl fmt::Display for SeedEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runs the seed scripts of one environment as a single transaction
#[derive(Clone)]
pub struct SeedEngine {
    clock: Arc<dyn Clock>,
}

impl SeedEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn run<E: ScriptExecutor + ?Sized>(
        &self,
        environment: &SeedEnvironment,
        scripts: &[Script],
        executor: &E,
        execution_timeout: Duration,
    ) -> SeedRun {
        if scripts.is_empty() {
            log::debug!("no seed scripts for environment={}", environment);
            return SeedRun::succeeded(Vec::new());
        }

        log::info!(
            "applying {} seed script(s) environment={}",
            scripts.len(),
            environment
        );
        let batch: Vec<&Script> = scripts.iter().collect();
        let options = BatchOptions {
            kind: BatchKind::Seed,
            timeout: execution_timeout,
            variables: None,
            ledger_table: None,
        };
        let run = run_batch(executor, &batch, self.clock.as_ref(), &options);

        match &run.failure {
            None => log::info!(
                "seeds committed environment={} applied={}",
                environment,
                run.applied.len()
            ),
            Some(failure) => log::error!(
                "seed batch rolled back environment={} script_id={} error={}",
                environment,
                failure.script_id.as_deref().unwrap_or("-"),
                failure.error
            ),
        }
        run
    }
}
