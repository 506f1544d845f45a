//! Script source for scripts compiled into the binary (`include_str!`) or built in tests.

use super::{into_ordered, is_valid_script_id, Script, ScriptSource, ScriptSourceError};
use std::collections::BTreeMap;

/// Holds `(id, content)` pairs per location key
///
/// ```
/// use launchguard::{ScriptSource, StaticScriptSource};
///
/// let source = StaticScriptSource::new()
///     .with_script("migrations", "20240120-120000-CreateProducts", "CREATE TABLE products (id BIGINT);");
/// assert_eq!(source.list("migrations").unwrap().len(), 1);
/// assert!(source.list("seeds/development").unwrap().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticScriptSource {
    locations: BTreeMap<String, Vec<(String, String)>>,
}

impl StaticScriptSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(
        mut self,
        location: impl Into<String>,
        id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.add_script(location, id, content);
        self
    }

    pub fn add_script(
        &mut self,
        location: impl Into<String>,
        id: impl Into<String>,
        content: impl Into<String>,
    ) {
        self.locations
            .entry(location.into())
            .or_default()
            .push((id.into(), content.into()));
    }
}

impl ScriptSource for StaticScriptSource {
    fn list(&self, location: &str) -> Result<Vec<Script>, ScriptSourceError> {
        let Some(entries) = self.locations.get(location) else {
            return Ok(Vec::new());
        };

        let mut scripts = Vec::with_capacity(entries.len());
        for (id, content) in entries {
            if !is_valid_script_id(id) {
                return Err(ScriptSourceError::InvalidName(id.clone()));
            }
            scripts.push(Script::new(id.clone(), content.clone(), format!("static:{}", location)));
        }
        into_ordered(scripts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_scripts_regardless_of_insertion_order() {
        let source = StaticScriptSource::new()
            .with_script("migrations", "20240201-000000-Second", "SELECT 2;")
            .with_script("migrations", "20240101-000000-First", "SELECT 1;");

        let scripts = source.list("migrations").unwrap();
        assert_eq!(scripts[0].id(), "20240101-000000-First");
        assert_eq!(scripts[1].id(), "20240201-000000-Second");
        assert_eq!(scripts[0].location(), "static:migrations");
    }

    #[test]
    fn test_rejects_invalid_id() {
        let source = StaticScriptSource::new().with_script("migrations", "init", "SELECT 1;");
        assert!(source.list("migrations").is_err());
    }
}
