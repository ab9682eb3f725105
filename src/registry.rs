//! Durable per-collection registry (SPEC_FULL.md §4.4): the JSON map of
//! relative path to last-synced identity. Grounded on the teacher's
//! `indexer.rs::save_content_hashes` / `read_existing_hashes` atomic-write
//! pattern (tempfile in the same directory, then rename).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryEntry {
    pub content_hash: String,
    pub mtime: f64,
    pub chunk_count: usize,
    pub last_synced: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryDocument {
    pub version: u32,
    pub vault_path: String,
    pub files: HashMap<String, RegistryEntry>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            vault_path: String::new(),
            files: HashMap::new(),
        }
    }
}

/// Owns one collection's on-disk registry file. The Syncer is this type's
/// sole writer (§5 "Shared-resource policy").
pub struct Registry {
    path: PathBuf,
    doc: RegistryDocument,
}

impl Registry {
    /// Load `path`, tolerating a missing file or corrupt JSON by returning
    /// an empty document rather than failing — the caller's next full sync
    /// recovers from there (§7 RegistryCorruption).
    pub fn load(path: PathBuf) -> Self {
        let doc = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<RegistryDocument>(&s).ok())
            .unwrap_or_default();
        Self { path, doc }
    }

    pub fn files(&self) -> &HashMap<String, RegistryEntry> {
        &self.doc.files
    }

    pub fn get_vault_path(&self) -> &str {
        &self.doc.vault_path
    }

    pub fn set_vault_path(&mut self, vault_path: impl Into<String>) {
        self.doc.vault_path = vault_path.into();
    }

    pub fn update_file_info(&mut self, relative_path: impl Into<String>, entry: RegistryEntry) {
        self.doc.files.insert(relative_path.into(), entry);
    }

    pub fn remove_file_info(&mut self, relative_path: &str) {
        self.doc.files.remove(relative_path);
    }

    /// Drop all file entries but keep `vault_path`, per §4.4.
    pub fn clear(&mut self) {
        self.doc.files.clear();
    }

    /// Atomic save: write to a tempfile in the same directory, then rename.
    pub fn save(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(AppError::Io)?;
        }
        let json = serde_json::to_string_pretty(&self.doc)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(AppError::Io)?;
        std::fs::rename(&tmp_path, &self.path).map_err(AppError::Io)?;
        Ok(())
    }

    /// A cheap corruption/vault-change probe per §4.5: sample up to 5
    /// registered paths and check they still exist on disk under `root`.
    pub fn sample_paths_exist(&self, root: &Path) -> bool {
        self.doc
            .files
            .keys()
            .take(5)
            .all(|relative| root.join(relative).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::load(dir.path().join("registry.json"));
        assert!(reg.files().is_empty());
        assert_eq!(reg.get_vault_path(), "");
    }

    #[test]
    fn corrupt_json_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "not json{{{").unwrap();
        let reg = Registry::load(path);
        assert!(reg.files().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let mut reg = Registry::load(path.clone());
        reg.set_vault_path("/vault");
        reg.update_file_info(
            "notes/a.md",
            RegistryEntry {
                content_hash: "abc".to_string(),
                mtime: 1.0,
                chunk_count: 2,
                last_synced: Utc::now(),
            },
        );
        reg.save().unwrap();

        let reloaded = Registry::load(path);
        assert_eq!(reloaded.get_vault_path(), "/vault");
        assert_eq!(reloaded.files().get("notes/a.md").unwrap().chunk_count, 2);
    }

    #[test]
    fn clear_preserves_vault_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::load(dir.path().join("registry.json"));
        reg.set_vault_path("/vault");
        reg.update_file_info(
            "a.md",
            RegistryEntry {
                content_hash: "h".to_string(),
                mtime: 1.0,
                chunk_count: 1,
                last_synced: Utc::now(),
            },
        );
        reg.clear();
        assert!(reg.files().is_empty());
        assert_eq!(reg.get_vault_path(), "/vault");
    }

    #[test]
    fn sample_paths_exist_detects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "x").unwrap();
        let mut reg = Registry::load(dir.path().join("registry.json"));
        reg.update_file_info(
            "a.md",
            RegistryEntry {
                content_hash: "h".to_string(),
                mtime: 1.0,
                chunk_count: 1,
                last_synced: Utc::now(),
            },
        );
        assert!(reg.sample_paths_exist(dir.path()));

        let other_dir = tempfile::tempdir().unwrap();
        assert!(!reg.sample_paths_exist(other_dir.path()));
    }
}
