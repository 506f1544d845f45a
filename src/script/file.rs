//! Directory-backed script source
//!
//! Layout under the scripts root:
//!
//! ```text
//! db/
//!   migrations/20240120-120000-CreateProducts.sql
//!   seeds/development/20240121-090000-DemoCategories.sql
//! ```

use super::{into_ordered, is_valid_script_id, Script, ScriptSource, ScriptSourceError};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Lists `*.sql` files in `root/<location>`
#[derive(Debug, Clone)]
pub struct DirectoryScriptSource {
    root: PathBuf,
}

impl DirectoryScriptSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a location key to a directory, refusing keys that escape the root.
    pub fn directory(&self, location: &str) -> Result<PathBuf, ScriptSourceError> {
        let relative = Path::new(location);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ScriptSourceError::InvalidLocation(location.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl ScriptSource for DirectoryScriptSource {
    fn list(&self, location: &str) -> Result<Vec<Script>, ScriptSourceError> {
        let dir = self.directory(location)?;

        if !dir.exists() {
            log::debug!("script location {} does not exist, nothing to run", dir.display());
            return Ok(Vec::new());
        }
        if !dir.is_dir() {
            return Err(ScriptSourceError::NotADirectory(dir));
        }

        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ScriptSourceError::Io { path, source }
        };

        let mut scripts = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_error(&dir))? {
            let path = entry.map_err(io_error(&dir))?.path();

            if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("sql") {
                continue;
            }

            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| ScriptSourceError::InvalidName(path.display().to_string()))?;
            if !is_valid_script_id(id) {
                return Err(ScriptSourceError::InvalidName(id.to_string()));
            }

            let content = fs::read_to_string(&path).map_err(io_error(&path))?;
            scripts.push(Script::new(id, content, path.display().to_string()));
        }

        into_ordered(scripts)
    }
}
