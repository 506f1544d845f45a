//! Migration-specific error types

use crate::executor::DbError;
use std::fmt;
use std::time::Duration;

/// Why a script batch failed
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A script was rejected by the database
    #[error("script execution failed: {0}")]
    Execution(#[source] DbError),
    /// The batch did not finish within its execution timeout
    #[error("batch exceeded the execution timeout of {}s", .timeout.as_secs())]
    Timeout { timeout: Duration },
    /// A `$name$` token has no configured value
    #[error("variable '${0}$' has no value defined")]
    UndefinedVariable(String),
    /// Reading or creating the version ledger failed
    #[error("version ledger error: {0}")]
    Ledger(#[source] DbError),
    /// Begin, commit or ledger insert failed
    #[error("transaction error: {0}")]
    Transaction(#[source] DbError),
}

/// A failed batch: the offending script (when one is to blame) and the cause
#[derive(Debug)]
pub struct ScriptFailure {
    /// `None` when the failure is not attributable to one script (ledger read, commit)
    pub script_id: Option<String>,
    pub error: MigrationError,
}

impl ScriptFailure {
    pub fn script(script_id: impl Into<String>, error: MigrationError) -> Self {
        Self {
            script_id: Some(script_id.into()),
            error,
        }
    }

    pub fn batch(error: MigrationError) -> Self {
        Self { script_id: None, error }
    }
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.script_id {
            Some(id) => write!(f, "script '{}' failed: {}", id, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for ScriptFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
