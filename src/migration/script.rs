//! Script loaders
//!
//! A `RawScript` operation names its script by id; a [`ScriptLoader`] turns the
//! id into SQL text. Missing ids surface as `ScriptNotFound` at execution time.

use super::error::MigrationError;
use regex::Regex;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Folder segment whose scripts are never served
const ARCHIVE_SEGMENT: &str = "Archive";

/// Resolves script ids to SQL text
pub trait ScriptLoader: Send + Sync {
    /// Return the script registered under `script_id`
    ///
    /// # Errors
    ///
    /// `ScriptNotFound` when no script exists under the id, `ScriptLoad` when it
    /// exists but cannot be read.
    fn resolve(&self, script_id: &str) -> Result<String, MigrationError>;
}

/// In-memory scripts, keyed by id
#[derive(Debug, Clone, Default)]
pub struct StaticScriptLoader {
    scripts: HashMap<String, String>,
}

impl StaticScriptLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a script, replacing any previous text under the same id
    pub fn with_script(mut self, script_id: impl Into<String>, sql: impl Into<String>) -> Self {
        self.insert(script_id, sql);
        self
    }

    pub fn insert(&mut self, script_id: impl Into<String>, sql: impl Into<String>) {
        self.scripts.insert(script_id.into(), sql.into());
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl ScriptLoader for StaticScriptLoader {
    fn resolve(&self, script_id: &str) -> Result<String, MigrationError> {
        self.scripts
            .get(script_id)
            .cloned()
            .ok_or_else(|| MigrationError::ScriptNotFound {
                script_id: script_id.to_string(),
            })
    }
}

/// Scripts read from `<root>/<id>.sql`
///
/// Ids may contain `/` to address subdirectories. Anything under an `Archive`
/// directory is treated as absent.
#[derive(Debug, Clone)]
pub struct DirectoryScriptLoader {
    root: PathBuf,
}

impl DirectoryScriptLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn script_path(&self, script_id: &str) -> Result<PathBuf, MigrationError> {
        let segment = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$")
            .map_err(|e| MigrationError::InvalidIdentifier(format!("{script_id}: {e}")))?;

        let relative = Path::new(script_id);
        let mut path = self.root.clone();
        for component in relative.components() {
            let Component::Normal(part) = component else {
                return Err(MigrationError::InvalidIdentifier(script_id.to_string()));
            };
            let part = part.to_str().unwrap_or_default();
            if !segment.is_match(part) || part.contains("..") {
                return Err(MigrationError::InvalidIdentifier(script_id.to_string()));
            }
            if part == ARCHIVE_SEGMENT {
                return Err(MigrationError::ScriptNotFound {
                    script_id: script_id.to_string(),
                });
            }
            path.push(part);
        }
        if path == self.root {
            return Err(MigrationError::InvalidIdentifier(script_id.to_string()));
        }

        let mut file = path.into_os_string();
        file.push(".sql");
        Ok(PathBuf::from(file))
    }
}

impl ScriptLoader for DirectoryScriptLoader {
    fn resolve(&self, script_id: &str) -> Result<String, MigrationError> {
        let path = self.script_path(script_id)?;
        std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                MigrationError::ScriptNotFound {
                    script_id: script_id.to_string(),
                }
            } else {
                MigrationError::ScriptLoad {
                    script_id: script_id.to_string(),
                    source,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_static_loader_resolves_registered_scripts() {
        let loader = StaticScriptLoader::new().with_script("User_ReadById", "SELECT 1");
        assert_eq!(loader.resolve("User_ReadById").unwrap(), "SELECT 1");
        assert!(matches!(
            loader.resolve("Nope"),
            Err(MigrationError::ScriptNotFound { script_id }) if script_id == "Nope"
        ));
    }

    #[test]
    fn test_directory_loader_reads_sql_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("dbo")).unwrap();
        fs::write(dir.path().join("dbo").join("User_ReadById.sql"), "SELECT 2;").unwrap();

        let loader = DirectoryScriptLoader::new(dir.path());
        assert_eq!(loader.resolve("dbo/User_ReadById").unwrap(), "SELECT 2;");
        assert!(matches!(
            loader.resolve("dbo/Missing"),
            Err(MigrationError::ScriptNotFound { .. })
        ));
    }

    #[test]
    fn test_directory_loader_skips_archive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Archive")).unwrap();
        fs::write(dir.path().join("Archive").join("Old.sql"), "SELECT 3;").unwrap();

        let loader = DirectoryScriptLoader::new(dir.path());
        assert!(matches!(
            loader.resolve("Archive/Old"),
            Err(MigrationError::ScriptNotFound { .. })
        ));
    }

    #[test]
    fn test_directory_loader_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DirectoryScriptLoader::new(dir.path());
        for bad in ["../etc/passwd", "/abs", "a/../b", "", "has space"] {
            assert!(
                matches!(loader.resolve(bad), Err(MigrationError::InvalidIdentifier(_))),
                "{bad} should be rejected"
            );
        }
    }
}
