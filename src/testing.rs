//! In-memory doubles for the database seams, the clock and the terminator.
//!
//! Available in unit tests and, for downstream crates, behind the `test-helpers` feature.
//!
//! [`InMemoryDatabase`] does not parse SQL. Script bodies are interpreted line by line with a
//! tiny command language instead:
//!
//! | line                        | effect                                                     |
//! |-----------------------------|------------------------------------------------------------|
//! | `CREATE t`                  | create table `t` if absent                                 |
//! | `INSERT t v`                | append row `v` to `t` (fails when `t` does not exist)      |
//! | `INSERT_IF_ABSENT t v`      | append `v` unless `t` already contains it                  |
//! | `SKIP_IF_NOT_EMPTY t`       | stop executing this script when `t` has rows              |
//! | `ELAPSE ms`                 | advance the attached [`ManualClock`]                       |
//! | `FAIL message`              | fail the statement with `message`                          |
//!
//! Blank lines and lines starting with `--` are ignored.

use crate::executor::{AdvisoryLock, Database, DbError, ScriptExecutor, ScriptTransaction, Session};
use crate::lock::Clock;
use crate::migration::SchemaVersionRecord;
use crate::orchestrator::Terminator;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Session id used by [`InMemoryDatabase::hold_lock_elsewhere`].
const FOREIGN_SESSION: u64 = 0;

#[derive(Debug, Clone, Default)]
struct Schema {
    tables: BTreeMap<String, Vec<String>>,
    ledgers: BTreeMap<String, Vec<SchemaVersionRecord>>,
}

#[derive(Debug, Default)]
struct State {
    schema: Schema,
    databases: BTreeSet<String>,
    created_databases: Vec<String>,
    locks: HashMap<i64, u64>,
    next_session: u64,
    calls: usize,
    sessions_opened: usize,
    sessions_closed: usize,
    lock_attempts: usize,
    unlock_calls: usize,
    transactions_started: usize,
    ledger_writes: usize,
    executed_sql: Vec<String>,
    fail_ledger_reads: bool,
    fail_connections: bool,
}

/// A shared fake PostgreSQL server. Clones talk to the same server.
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
    clock: Option<Arc<ManualClock>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ELAPSE` lines advance `clock`.
    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        Self {
            state: Arc::default(),
            clock: Some(clock),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock_state(&self.state)
    }

    /// Simulate another replica holding `key`.
    pub fn hold_lock_elsewhere(&self, key: i64) {
        self.state().locks.insert(key, FOREIGN_SESSION);
    }

    pub fn release_lock_elsewhere(&self, key: i64) {
        let mut state = self.state();
        if state.locks.get(&key) == Some(&FOREIGN_SESSION) {
            state.locks.remove(&key);
        }
    }

    pub fn is_lock_held(&self, key: i64) -> bool {
        self.state().locks.contains_key(&key)
    }

    /// Make every ledger read fail.
    pub fn fail_ledger_reads(&self) {
        self.state().fail_ledger_reads = true;
    }

    /// Make `open` and `ensure_database_exists` fail.
    pub fn fail_connections(&self) {
        self.state().fail_connections = true;
    }

    /// Mark a database as already present.
    pub fn with_database(self, name: &str) -> Self {
        self.state().databases.insert(name.to_string());
        self
    }

    /// Total number of calls made through the database seams.
    pub fn calls(&self) -> usize {
        self.state().calls
    }

    pub fn sessions_opened(&self) -> usize {
        self.state().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.state().sessions_closed
    }

    pub fn lock_attempts(&self) -> usize {
        self.state().lock_attempts
    }

    pub fn unlock_calls(&self) -> usize {
        self.state().unlock_calls
    }

    pub fn transactions_started(&self) -> usize {
        self.state().transactions_started
    }

    /// Committed ledger inserts.
    pub fn ledger_writes(&self) -> usize {
        self.state().ledger_writes
    }

    pub fn created_databases(&self) -> Vec<String> {
        self.state().created_databases.clone()
    }

    /// Every script body handed to `execute_script`, after substitution.
    pub fn executed_sql(&self) -> Vec<String> {
        self.state().executed_sql.clone()
    }

    /// Committed ledger ids, ordered.
    pub fn ledger_ids(&self, table: &str) -> Vec<String> {
        self.state()
            .schema
            .ledgers
            .get(table)
            .map(|rows| rows.iter().map(|r| r.script_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.state().schema.tables.contains_key(table)
    }

    pub fn has_ledger(&self, table: &str) -> bool {
        self.state().schema.ledgers.contains_key(table)
    }

    /// Committed rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<String> {
        self.state().schema.tables.get(table).cloned().unwrap_or_default()
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Database for InMemoryDatabase {
    type Session = InMemorySession;

    fn ensure_database_exists(&self, _maintenance_connection: &str, database: &str) -> Result<bool, DbError> {
        let mut state = self.state();
        state.calls += 1;
        if state.fail_connections {
            return Err(DbError::Query("could not connect to server: Connection refused".to_string()));
        }
        if state.databases.insert(database.to_string()) {
            state.created_databases.push(database.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn open(&self, _connection_string: &str) -> Result<InMemorySession, DbError> {
        let mut state = self.state();
        state.calls += 1;
        if state.fail_connections {
            return Err(DbError::Query("could not connect to server: Connection refused".to_string()));
        }
        state.next_session += 1;
        state.sessions_opened += 1;
        Ok(InMemorySession {
            id: state.next_session,
            state: self.state.clone(),
            clock: self.clock.clone(),
            open: true,
        })
    }
}

/// One connection to an [`InMemoryDatabase`]. Dropping it closes it.
pub struct InMemorySession {
    id: u64,
    state: Arc<Mutex<State>>,
    clock: Option<Arc<ManualClock>>,
    open: bool,
}

impl InMemorySession {
    fn state(&self) -> Result<MutexGuard<'_, State>, DbError> {
        if !self.open {
            return Err(DbError::Closed);
        }
        let mut state = lock_state(&self.state);
        state.calls += 1;
        Ok(state)
    }
}

impl AdvisoryLock for InMemorySession {
    fn try_advisory_lock(&self, key: i64) -> Result<bool, DbError> {
        let mut state = self.state()?;
        state.lock_attempts += 1;
        match state.locks.get(&key) {
            Some(holder) => Ok(*holder == self.id),
            None => {
                state.locks.insert(key, self.id);
                Ok(true)
            }
        }
    }

    fn advisory_unlock(&self, key: i64) -> Result<bool, DbError> {
        let mut state = self.state()?;
        state.unlock_calls += 1;
        if state.locks.get(&key) == Some(&self.id) {
            state.locks.remove(&key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl ScriptExecutor for InMemorySession {
    fn ensure_ledger(&self, table: &str) -> Result<(), DbError> {
        let mut state = self.state()?;
        state.schema.ledgers.entry(table.to_string()).or_default();
        Ok(())
    }

    fn ledger_exists(&self, table: &str) -> Result<bool, DbError> {
        Ok(self.state()?.schema.ledgers.contains_key(table))
    }

    fn applied_records(&self, table: &str) -> Result<Vec<SchemaVersionRecord>, DbError> {
        let state = self.state()?;
        if state.fail_ledger_reads {
            return Err(DbError::Query(format!("permission denied for table {}", table)));
        }
        let mut rows = state
            .schema
            .ledgers
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::Query(format!("relation \"{}\" does not exist", table)))?;
        rows.sort_by(|a, b| a.script_id.cmp(&b.script_id));
        Ok(rows)
    }

    fn begin(&self) -> Result<Box<dyn ScriptTransaction + '_>, DbError> {
        let mut state = self.state()?;
        state.transactions_started += 1;
        let working = state.schema.clone();
        Ok(Box::new(InMemoryTransaction {
            state: self.state.clone(),
            clock: self.clock.clone(),
            working,
            statement_timeout: None,
            ledger_writes: 0,
        }))
    }
}

impl Session for InMemorySession {
    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let id = self.id;
        let mut state = lock_state(&self.state);
        state.sessions_closed += 1;
        state.locks.retain(|_, holder| *holder != id);
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Works on a copy of the schema. Commit publishes it, anything else discards it.
struct InMemoryTransaction {
    state: Arc<Mutex<State>>,
    clock: Option<Arc<ManualClock>>,
    working: Schema,
    statement_timeout: Option<Duration>,
    ledger_writes: usize,
}

impl InMemoryTransaction {
    fn table_mut(&mut self, table: &str) -> Result<&mut Vec<String>, DbError> {
        self.working
            .tables
            .get_mut(table)
            .ok_or_else(|| DbError::Query(format!("relation \"{}\" does not exist", table)))
    }

    fn elapse(&self, millis: u64, spent: &mut Duration) -> Result<(), DbError> {
        let Some(clock) = &self.clock else {
            return Ok(());
        };
        let requested = Duration::from_millis(millis);
        match self.statement_timeout {
            Some(limit) if *spent + requested > limit => {
                clock.advance(limit.saturating_sub(*spent));
                *spent = limit;
                Err(DbError::StatementTimeout)
            }
            _ => {
                clock.advance(requested);
                *spent += requested;
                Ok(())
            }
        }
    }
}

impl ScriptTransaction for InMemoryTransaction {
    fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DbError> {
        self.statement_timeout = Some(timeout);
        Ok(())
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), DbError> {
        {
            let mut state = lock_state(&self.state);
            state.calls += 1;
            state.executed_sql.push(sql.to_string());
        }

        let mut spent = Duration::ZERO;
        for line in sql.lines().map(str::trim) {
            if line.is_empty() || line.starts_with("--") {
                continue;
            }
            let mut parts = line.splitn(3, char::is_whitespace);
            let command = parts.next().unwrap_or_default();
            let table = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default().trim();

            match command {
                "CREATE" => {
                    self.working.tables.entry(table.to_string()).or_default();
                }
                "INSERT" => self.table_mut(table)?.push(value.to_string()),
                "INSERT_IF_ABSENT" => {
                    let rows = self.table_mut(table)?;
                    if !rows.iter().any(|row| row == value) {
                        rows.push(value.to_string());
                    }
                }
                "SKIP_IF_NOT_EMPTY" => {
                    if !self.table_mut(table)?.is_empty() {
                        break;
                    }
                }
                "ELAPSE" => {
                    let millis = table
                        .parse::<u64>()
                        .map_err(|_| DbError::Query(format!("invalid ELAPSE value '{}'", table)))?;
                    self.elapse(millis, &mut spent)?;
                }
                "FAIL" => {
                    let message = line.trim_start_matches("FAIL").trim();
                    return Err(DbError::Query(message.to_string()));
                }
                other => {
                    return Err(DbError::Query(format!("syntax error at or near \"{}\"", other)));
                }
            }
        }
        Ok(())
    }

    fn record_applied(&mut self, table: &str, record: &SchemaVersionRecord) -> Result<(), DbError> {
        let rows = self
            .working
            .ledgers
            .get_mut(table)
            .ok_or_else(|| DbError::Query(format!("relation \"{}\" does not exist", table)))?;
        if rows.iter().any(|r| r.script_id == record.script_id) {
            return Err(DbError::Query(format!(
                "duplicate key value violates unique constraint \"{}_pkey\"",
                table
            )));
        }
        rows.push(record.clone());
        self.ledger_writes += 1;
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), DbError> {
        let mut state = lock_state(&self.state);
        state.calls += 1;
        state.schema = self.working.clone();
        state.ledger_writes += self.ledger_writes;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), DbError> {
        lock_state(&self.state).calls += 1;
        Ok(())
    }
}

/// A [`Clock`] that only moves when told to. `sleep` advances it instantly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }

    /// Durations passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        self.advance(duration);
    }
}

/// Records exit codes instead of exiting
#[derive(Debug, Clone, Default)]
pub struct RecordingTerminator {
    codes: Arc<Mutex<Vec<i32>>>,
}

impl RecordingTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn terminated(&self) -> bool {
        !self.codes().is_empty()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, exit_code: i32) {
        self.codes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_discards_changes() {
        let db = InMemoryDatabase::new();
        let session = db.open("memory").unwrap();

        let mut tx = session.begin().unwrap();
        tx.execute_script("CREATE products\nINSERT products lamp").unwrap();
        tx.rollback().unwrap();
        assert!(!db.table_exists("products"));

        let mut tx = session.begin().unwrap();
        tx.execute_script("CREATE products\nINSERT products lamp").unwrap();
        tx.commit().unwrap();
        assert_eq!(db.rows("products"), vec!["lamp"]);
    }

    #[test]
    fn test_insert_into_missing_table_fails() {
        let db = InMemoryDatabase::new();
        let session = db.open("memory").unwrap();
        let mut tx = session.begin().unwrap();

        let err = tx.execute_script("INSERT products lamp").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_closing_session_frees_its_locks() {
        let db = InMemoryDatabase::new();
        {
            let session = db.open("memory").unwrap();
            assert!(session.try_advisory_lock(11).unwrap());
            assert!(db.is_lock_held(11));
        }
        assert!(!db.is_lock_held(11));
        assert_eq!(db.sessions_closed(), 1);
    }

    #[test]
    fn test_elapse_honours_statement_timeout() {
        let clock = Arc::new(ManualClock::new());
        let db = InMemoryDatabase::with_clock(clock.clone());
        let session = db.open("memory").unwrap();
        let mut tx = session.begin().unwrap();

        tx.set_statement_timeout(Duration::from_secs(2)).unwrap();
        let err = tx.execute_script("ELAPSE 5000").unwrap_err();
        assert!(err.is_statement_timeout());
        assert_eq!(clock.now(), Duration::from_secs(2));
    }
}
