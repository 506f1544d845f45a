//! Script discovery.
//!
//! A [`ScriptSource`] turns a location key into a finite, deterministically ordered list of
//! [`Script`]s. Script ids follow the `YYYYMMDD-HHMMSS-Description` convention, so ascending
//! lexical order equals authoring order. Listing the same location twice yields the same list.

pub mod checksum;
pub mod file;
pub mod memory;

pub use checksum::calculate_checksum;
pub use file::DirectoryScriptSource;
pub use memory::StaticScriptSource;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;

static SCRIPT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{8}-\d{6}-\S.*$").expect("valid script id regex"));

/// A named SQL script. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    id: String,
    content: String,
    checksum: String,
    location: String,
}

impl Script {
    /// Create a script, computing its checksum. The id is not validated here.
    pub fn new(id: impl Into<String>, content: impl Into<String>, location: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: id.into(),
            checksum: calculate_checksum(&content),
            content,
            location: location.into(),
        }
    }

    /// Lexically sortable id, e.g. `20240120-120000-CreateProducts`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Hex SHA-256 of [`content`](Self::content).
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Where the script came from (file path or embedded location).
    pub fn location(&self) -> &str {
        &self.location
    }
}

/// Whether `id` follows the `YYYYMMDD-HHMMSS-Description` naming convention.
pub fn is_valid_script_id(id: &str) -> bool {
    SCRIPT_ID.is_match(id)
}

/// Build a script name for a new script authored at `now`.
///
/// Characters outside `[A-Za-z0-9_]` in the description become `_`.
pub fn new_script_name(description: &str, now: DateTime<Utc>) -> String {
    let sanitized: String = description
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{}-{}", now.format("%Y%m%d-%H%M%S"), sanitized)
}

/// Errors raised while listing scripts
#[derive(Debug, thiserror::Error)]
pub enum ScriptSourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("script name '{0}' does not match YYYYMMDD-HHMMSS-Description")]
    InvalidName(String),
    #[error("script location is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("script id '{0}' appears more than once")]
    DuplicateId(String),
    #[error("invalid script location '{0}'")]
    InvalidLocation(String),
}

/// Produces the ordered scripts stored under a location key
pub trait ScriptSource: Send + Sync {
    /// Scripts under `location`, ascending by id. An empty location yields an empty list.
    fn list(&self, location: &str) -> Result<Vec<Script>, ScriptSourceError>;
}

/// Sort by id and reject duplicates.
pub(crate) fn into_ordered(mut scripts: Vec<Script>) -> Result<Vec<Script>, ScriptSourceError> {
    scripts.sort_by(|a, b| a.id.cmp(&b.id));
    if let Some(pair) = scripts.windows(2).find(|pair| pair[0].id == pair[1].id) {
        return Err(ScriptSourceError::DuplicateId(pair[0].id.clone()));
    }
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_script_id_convention() {
        assert!(is_valid_script_id("20240120-120000-CreateProducts"));
        assert!(is_valid_script_id("20240120-120000-Add price index"));
        assert!(!is_valid_script_id("m20240120120000_create_products"));
        assert!(!is_valid_script_id("20240120-120000-"));
        assert!(!is_valid_script_id("2024012-120000-Short"));
    }

    #[test]
    fn test_new_script_name() {
        let now = Utc.with_ymd_and_hms(2024, 1, 20, 12, 0, 5).unwrap();
        assert_eq!(
            new_script_name("add product-price index", now),
            "20240120-120005-add_product_price_index"
        );
        assert!(is_valid_script_id(&new_script_name("x", now)));
    }

    #[test]
    fn test_into_ordered_sorts_and_rejects_duplicates() {
        let scripts = vec![
            Script::new("20240102-000000-B", "", "mem"),
            Script::new("20240101-000000-A", "", "mem"),
        ];
        let ordered = into_ordered(scripts).unwrap();
        assert_eq!(ordered[0].id(), "20240101-000000-A");

        let duplicates = vec![
            Script::new("20240101-000000-A", "one", "mem"),
            Script::new("20240101-000000-A", "two", "mem"),
        ];
        assert!(matches!(
            into_ordered(duplicates),
            Err(ScriptSourceError::DuplicateId(id)) if id == "20240101-000000-A"
        ));
    }

    #[test]
    fn test_checksum_tracks_content() {
        let a = Script::new("20240101-000000-A", "SELECT 1;", "mem");
        let b = Script::new("20240101-000000-A", "SELECT 2;", "mem");
        assert_eq!(a.checksum().len(), 64);
        assert_ne!(a.checksum(), b.checksum());
    }
}
