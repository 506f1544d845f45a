//! Database seams used by the orchestrator, and their may_postgres implementations.
//!
//! The orchestrator never talks to `may_postgres` directly. It goes through three small traits:
//!
//! - [`AdvisoryLock`] - session-scoped `pg_try_advisory_lock` / `pg_advisory_unlock`
//! - [`ScriptExecutor`] - version ledger access and script transactions
//! - [`Database`] - database creation and session opening
//!
//! [`PgDatabase`] and [`PgSession`] implement them against PostgreSQL; the in-memory
//! doubles in [`crate::testing`] implement them for unit tests.

use crate::connection::{self, quote_identifier, ConnectionError};
use crate::migration::ledger;
use crate::migration::SchemaVersionRecord;
use crate::transaction::PgTransaction;
use may_postgres::error::SqlState;
use may_postgres::{Client, Error as PostgresError};
use std::time::Duration;

/// Error type for every database seam
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PostgresError),
    /// Connection could not be established
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    /// Statement rejected or failed
    #[error("Query error: {0}")]
    Query(String),
    /// The session was already closed
    #[error("Session is closed")]
    Closed,
    /// Statement cancelled by a non-PostgreSQL executor for exceeding its timeout
    #[error("canceling statement due to statement timeout")]
    StatementTimeout,
}

impl DbError {
    /// SQLSTATE reported by the server, if any.
    pub fn code(&self) -> Option<&SqlState> {
        match self {
            DbError::Postgres(e) => e.code(),
            _ => None,
        }
    }

    /// Whether the statement was cancelled because of `statement_timeout` (SQLSTATE 57014).
    pub fn is_statement_timeout(&self) -> bool {
        matches!(self, DbError::StatementTimeout) || self.code() == Some(&SqlState::QUERY_CANCELED)
    }
}

/// A session-scoped advisory lock primitive
pub trait AdvisoryLock {
    /// One non-blocking attempt to take the lock identified by `key`.
    fn try_advisory_lock(&self, key: i64) -> Result<bool, DbError>;

    /// Release the lock. Returns `false` when the session did not hold it.
    fn advisory_unlock(&self, key: i64) -> Result<bool, DbError>;

    /// Whether the underlying connection is still usable.
    fn is_open(&self) -> bool;
}

/// Version ledger access plus transactional script execution
pub trait ScriptExecutor {
    /// Create the ledger table if it does not exist.
    fn ensure_ledger(&self, table: &str) -> Result<(), DbError>;

    /// Whether the ledger table exists. Never creates it.
    fn ledger_exists(&self, table: &str) -> Result<bool, DbError>;

    /// All ledger rows, ordered by script id.
    fn applied_records(&self, table: &str) -> Result<Vec<SchemaVersionRecord>, DbError>;

    /// Open a transaction. Dropping it without commit rolls it back.
    fn begin(&self) -> Result<Box<dyn ScriptTransaction + '_>, DbError>;
}

/// An open transaction in which a script batch runs
pub trait ScriptTransaction {
    /// Bound every following statement in this transaction (`SET LOCAL statement_timeout`).
    fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DbError>;

    /// Run a script body. Scripts may contain several statements.
    fn execute_script(&mut self, sql: &str) -> Result<(), DbError>;

    /// Insert a ledger row inside this transaction.
    fn record_applied(&mut self, table: &str, record: &SchemaVersionRecord) -> Result<(), DbError>;

    fn commit(self: Box<Self>) -> Result<(), DbError>;

    fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// A connection that can both hold the advisory lock and run scripts
pub trait Session: AdvisoryLock + ScriptExecutor {
    /// Close the connection. Session-scoped advisory locks are freed by the server.
    fn close(&mut self);
}

/// Entry point for opening sessions against the target database
pub trait Database {
    type Session: Session;

    /// Create `database` through the maintenance connection when missing.
    ///
    /// Returns `true` when the database was created by this call.
    fn ensure_database_exists(&self, maintenance_connection: &str, database: &str) -> Result<bool, DbError>;

    fn open(&self, connection_string: &str) -> Result<Self::Session, DbError>;
}

/// [`Database`] backed by may_postgres
#[derive(Debug, Default, Clone, Copy)]
pub struct PgDatabase;

impl Database for PgDatabase {
    type Session = PgSession;

    fn ensure_database_exists(&self, maintenance_connection: &str, database: &str) -> Result<bool, DbError> {
        let client = connection::connect(maintenance_connection)?;
        let rows = client.query("SELECT 1 FROM pg_database WHERE datname = $1", &[&database])?;
        if !rows.is_empty() {
            return Ok(false);
        }

        let sql = format!("CREATE DATABASE {}", quote_identifier(database));
        match client.batch_execute(&sql) {
            Ok(()) => Ok(true),
            // Another replica created it between our check and our CREATE.
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_DATABASE) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn open(&self, connection_string: &str) -> Result<PgSession, DbError> {
        PgSession::connect(connection_string)
    }
}

/// A single may_postgres connection used for the whole critical section
pub struct PgSession {
    client: Option<Client>,
}

impl PgSession {
    pub fn connect(connection_string: &str) -> Result<Self, DbError> {
        Ok(Self::new(connection::connect(connection_string)?))
    }

    pub fn new(client: Client) -> Self {
        Self { client: Some(client) }
    }

    fn client(&self) -> Result<&Client, DbError> {
        self.client.as_ref().ok_or(DbError::Closed)
    }
}

impl AdvisoryLock for PgSession {
    fn try_advisory_lock(&self, key: i64) -> Result<bool, DbError> {
        let row = self.client()?.query_one("SELECT pg_try_advisory_lock($1)", &[&key])?;
        Ok(row.get(0))
    }

    fn advisory_unlock(&self, key: i64) -> Result<bool, DbError> {
        let row = self.client()?.query_one("SELECT pg_advisory_unlock($1)", &[&key])?;
        Ok(row.get(0))
    }

    fn is_open(&self) -> bool {
        self.client.is_some()
    }
}

impl ScriptExecutor for PgSession {
    fn ensure_ledger(&self, table: &str) -> Result<(), DbError> {
        self.client()?.batch_execute(&ledger::create_table_sql(table))?;
        Ok(())
    }

    fn ledger_exists(&self, table: &str) -> Result<bool, DbError> {
        let row = self
            .client()?
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&table])?;
        Ok(row.get(0))
    }

    fn applied_records(&self, table: &str) -> Result<Vec<SchemaVersionRecord>, DbError> {
        let rows = self.client()?.query(ledger::select_sql(table).as_str(), &[])?;
        Ok(rows.iter().map(SchemaVersionRecord::from_row).collect())
    }

    fn begin(&self) -> Result<Box<dyn ScriptTransaction + '_>, DbError> {
        let transaction = PgTransaction::begin(self.client()?.clone())?;
        Ok(Box::new(transaction))
    }
}

impl Session for PgSession {
    fn close(&mut self) {
        if self.client.take().is_some() {
            log::debug!("closed migration session");
        }
    }
}
