//! Schema version ledger: one row per applied migration script.
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS schema_versions (
//!     script_id         VARCHAR(255) PRIMARY KEY,
//!     checksum          VARCHAR(64),
//!     applied_at        TIMESTAMPTZ NOT NULL,
//!     execution_time_ms BIGINT
//! )
//! ```
//!
//! The primary key enforces "at most one record per script id". Rows are only ever inserted,
//! inside the migration batch transaction.

use chrono::{DateTime, Utc};

/// Represents a row in the version ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVersionRecord {
    /// Applied script id (`YYYYMMDD-HHMMSS-Description`)
    pub script_id: String,

    /// `SHA-256` of the script body when it was applied (`None` for rows written without one)
    pub checksum: Option<String>,

    /// When the batch containing the script ran
    pub applied_at: DateTime<Utc>,

    /// Execution time in milliseconds (`None` if not recorded)
    pub execution_time_ms: Option<i64>,
}

impl SchemaVersionRecord {
    #[must_use]
    pub fn new(
        script_id: impl Into<String>,
        checksum: Option<String>,
        applied_at: DateTime<Utc>,
        execution_time_ms: Option<i64>,
    ) -> Self {
        Self {
            script_id: script_id.into(),
            checksum,
            applied_at,
            execution_time_ms,
        }
    }

    /// Create a `SchemaVersionRecord` from a row produced by [`select_sql`].
    ///
    /// Expected column order: `script_id`, `checksum`, `applied_at`, `execution_time_ms`
    pub fn from_row(row: &may_postgres::Row) -> Self {
        Self {
            script_id: row.get(0),
            checksum: row.get(1),
            applied_at: row.get(2),
            execution_time_ms: row.get(3),
        }
    }
}

pub fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            script_id VARCHAR(255) PRIMARY KEY,
            checksum VARCHAR(64),
            applied_at TIMESTAMPTZ NOT NULL,
            execution_time_ms BIGINT
        )
        "#
    )
}

pub fn select_sql(table: &str) -> String {
    format!(
        "SELECT script_id, checksum, applied_at, execution_time_ms FROM {table} ORDER BY script_id ASC"
    )
}

pub fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (script_id, checksum, applied_at, execution_time_ms) VALUES ($1, $2, $3, $4)"
    )
}
