//! PostgreSQL transaction in which a script batch runs.
//!
//! A batch is all-or-nothing: statements and ledger inserts share one `BEGIN ... COMMIT`.
//! A transaction dropped without [`commit`](ScriptTransaction::commit) is rolled back.

use crate::executor::{DbError, ScriptTransaction};
use crate::migration::ledger;
use crate::migration::SchemaVersionRecord;
use may_postgres::Client;
use std::time::Duration;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// `statement_timeout` value for `timeout`. 0 would disable the timeout and the setting is
/// an `i32`, so the result is clamped to `1..=i32::MAX`.
fn statement_timeout_millis(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX).max(1)
}

/// A database transaction over a may_postgres client
pub struct PgTransaction {
    client: Client,
    closed: bool,
}

impl PgTransaction {
    /// Start a transaction with the default isolation level (`READ COMMITTED`).
    pub fn begin(client: Client) -> Result<Self, DbError> {
        client.execute("BEGIN", &[])?;
        Ok(Self {
            client,
            closed: false,
        })
    }

    /// Check if the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::Query("Transaction has already been committed or rolled back".to_string()));
        }
        Ok(())
    }
}

impl ScriptTransaction for PgTransaction {
    fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DbError> {
        self.ensure_open()?;
        self.client.batch_execute(&format!(
            "SET LOCAL statement_timeout = {}",
            statement_timeout_millis(timeout)
        ))?;
        Ok(())
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), DbError> {
        self.ensure_open()?;
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_script_span().entered();

        self.client.batch_execute(sql)?;
        Ok(())
    }

    fn record_applied(&mut self, table: &str, record: &SchemaVersionRecord) -> Result<(), DbError> {
        self.ensure_open()?;
        self.client.execute(
            ledger::insert_sql(table).as_str(),
            &[
                &record.script_id,
                &record.checksum,
                &record.applied_at,
                &record.execution_time_ms,
            ],
        )?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        self.ensure_open()?;
        self.closed = true;
        self.client.execute("COMMIT", &[])?;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        self.ensure_open()?;
        self.closed = true;
        self.client.execute("ROLLBACK", &[])?;
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.client.execute("ROLLBACK", &[]) {
                log::warn!("rollback of abandoned transaction failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_timeout_is_clamped() {
        assert_eq!(statement_timeout_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(statement_timeout_millis(Duration::ZERO), 1);
        assert_eq!(statement_timeout_millis(Duration::from_micros(300)), 1);
        assert_eq!(statement_timeout_millis(Duration::from_secs(30 * 24 * 3600)), i32::MAX);
        assert_eq!(statement_timeout_millis(Duration::MAX), i32::MAX);
    }
}
