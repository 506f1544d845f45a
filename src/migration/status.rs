//! Migration status reporting

use super::SchemaVersionRecord;
use crate::script::checksum::checksum_matches;
use crate::script::Script;
use std::collections::{HashMap, HashSet};

/// Snapshot of the ledger compared against the available migration scripts
#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    /// Ledger rows, ordered by script id
    pub applied: Vec<SchemaVersionRecord>,

    /// Script ids not yet in the ledger, in apply order
    pub pending: Vec<String>,

    /// Applied script ids whose body changed since they ran
    pub drifted: Vec<String>,

    /// Ledger ids with no matching script (removed or renamed files)
    pub unknown: Vec<String>,
}

impl MigrationStatus {
    #[must_use]
    pub fn new(scripts: &[Script], applied: Vec<SchemaVersionRecord>) -> Self {
        let by_id: HashMap<&str, &SchemaVersionRecord> =
            applied.iter().map(|r| (r.script_id.as_str(), r)).collect();
        let known: HashSet<&str> = scripts.iter().map(Script::id).collect();

        let mut pending = Vec::new();
        let mut drifted = Vec::new();
        for script in scripts {
            match by_id.get(script.id()) {
                None => pending.push(script.id().to_string()),
                Some(record) if !checksum_matches(record.checksum.as_deref(), script.checksum()) => {
                    drifted.push(script.id().to_string())
                }
                Some(_) => {}
            }
        }

        let unknown = applied
            .iter()
            .filter(|r| !known.contains(r.script_id.as_str()))
            .map(|r| r.script_id.clone())
            .collect();

        Self {
            applied,
            pending,
            drifted,
            unknown,
        }
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn latest_applied(&self) -> Option<&SchemaVersionRecord> {
        self.applied.last()
    }

    #[must_use]
    pub fn next_pending(&self) -> Option<&str> {
        self.pending.first().map(String::as_str)
    }
}
