//! Persisted key/value preferences
//!
//! A small TOML file of string values grouped by section:
//!
//! ```toml
//! [vmcircbuf]
//! default_factory = "mmap_shm_open"
//! ```
//!
//! The default location is `~/.config/sigflow/prefs.toml` (Linux),
//! `~/Library/Application Support/sigflow/prefs.toml` (macOS) or
//! `%APPDATA%\sigflow\prefs.toml` (Windows).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "sigflow";
const PREFS_FILE: &str = "prefs.toml";

/// Errors while loading or saving preferences
#[derive(Debug, thiserror::Error)]
pub enum PrefsError {
    #[error("Preferences I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed preferences file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize preferences: {0}")]
    Serialize(#[from] toml::ser::Error),
}

type Sections = BTreeMap<String, BTreeMap<String, String>>;

/// Returns the default preference file path, if a config directory exists.
pub fn default_prefs_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME).join(PREFS_FILE))
}

/// Section/key/value store backed by an optional file
#[derive(Debug, Default, Clone)]
pub struct Preferences {
    path: Option<PathBuf>,
    sections: Sections,
}

impl Preferences {
    /// A store that never touches the filesystem
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PrefsError> {
        let path = path.into();
        let sections = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Sections::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            sections,
        })
    }

    /// Load from [`default_prefs_path`], or fall back to an in-memory store
    pub fn load_default() -> Result<Self, PrefsError> {
        match default_prefs_path() {
            Some(path) => Self::load(path),
            None => Ok(Self::in_memory()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Remove a key; returns the previous value
    pub fn remove(&mut self, section: &str, key: &str) -> Option<String> {
        let section_map = self.sections.get_mut(section)?;
        let old = section_map.remove(key);
        if section_map.is_empty() {
            self.sections.remove(section);
        }
        old
    }

    /// Write the store back to its file.
    ///
    /// The file is replaced atomically: contents go to a temporary file in the
    /// same directory which is then renamed over the target. In-memory stores
    /// save nothing.
    pub fn save(&self) -> Result<(), PrefsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let text = toml::to_string(&self.sections)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(prefs.get("vmcircbuf", "default_factory"), None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prefs.toml");

        let mut prefs = Preferences::load(&path).unwrap();
        prefs.set("vmcircbuf", "default_factory", "mmap_tmpfile");
        prefs.set("scheduler", "kind", "sts");
        prefs.save().unwrap();

        let reloaded = Preferences::load(&path).unwrap();
        assert_eq!(reloaded.get("vmcircbuf", "default_factory"), Some("mmap_tmpfile"));
        assert_eq!(reloaded.get("scheduler", "kind"), Some("sts"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[vmcircbuf]"));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");
        std::fs::write(&path, "[vmcircbuf\ndefault_factory = ").unwrap();
        assert!(matches!(Preferences::load(&path), Err(PrefsError::Parse(_))));
    }

    #[test]
    fn test_remove_drops_empty_section() {
        let mut prefs = Preferences::in_memory();
        prefs.set("a", "k", "v");
        assert_eq!(prefs.remove("a", "k").as_deref(), Some("v"));
        assert_eq!(prefs.remove("a", "k"), None);
        assert!(prefs.save().is_ok());
    }
}
