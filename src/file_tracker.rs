//! Per-file identity and change classification (SPEC_FULL.md §4.3).
//! Grounded on the teacher's content-hash dedup pattern in
//! `indexer.rs::read_existing_hashes` / `embedder.rs`'s hash-diff
//! classification, generalized from SHA-256 to MD5 because FileState is
//! contractually MD5-keyed here.

use md5::{Digest, Md5};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{AppError, AppResult};
use crate::registry::RegistryEntry;

const HASH_BLOCK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct FileState {
    pub relative_path: String,
    pub mtime: f64,
    pub content_hash: String,
}

/// Stream `path` in 8 KiB blocks and return its MD5-keyed identity.
/// `root` is only used to validate the path is the one the caller intends
/// to report on; the relative path itself is supplied by the caller
/// (typically from the Scanner) rather than recomputed here.
pub fn get_file_state(path: &Path, relative_path: &str) -> AppResult<FileState> {
    let metadata = std::fs::metadata(path).map_err(AppError::Io)?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    let mut file = File::open(path).map_err(AppError::Io)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; HASH_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(AppError::Io)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let content_hash = format!("{:x}", hasher.finalize());

    Ok(FileState {
        relative_path: relative_path.to_string(),
        mtime,
        content_hash,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Classify `current` against `registry` per SPEC_FULL.md §4.3's two-tier
/// rule: mtime-equal short-circuits to unchanged without a hash compare;
/// otherwise hash-equal (touch-only edit) is also unchanged.
pub fn detect_changes(
    current: &[FileState],
    registry: &HashMap<String, RegistryEntry>,
) -> ChangeSet {
    let mut set = ChangeSet::default();
    let current_keys: std::collections::HashSet<&str> =
        current.iter().map(|f| f.relative_path.as_str()).collect();

    for (path, _) in registry.iter() {
        if !current_keys.contains(path.as_str()) {
            set.deleted.push(path.clone());
        }
    }

    for file in current {
        match registry.get(&file.relative_path) {
            None => set.added.push(file.relative_path.clone()),
            Some(entry) if entry.mtime == file.mtime => {
                set.unchanged.push(file.relative_path.clone())
            }
            Some(entry) if entry.content_hash == file.content_hash => {
                set.unchanged.push(file.relative_path.clone())
            }
            Some(_) => set.modified.push(file.relative_path.clone()),
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(hash: &str, mtime: f64) -> RegistryEntry {
        RegistryEntry {
            content_hash: hash.to_string(),
            mtime,
            chunk_count: 1,
            last_synced: Utc::now(),
        }
    }

    fn state(path: &str, hash: &str, mtime: f64) -> FileState {
        FileState {
            relative_path: path.to_string(),
            content_hash: hash.to_string(),
            mtime,
        }
    }

    #[test]
    fn new_file_is_added() {
        let registry = HashMap::new();
        let current = vec![state("a.md", "h1", 1.0)];
        let set = detect_changes(&current, &registry);
        assert_eq!(set.added, vec!["a.md".to_string()]);
    }

    #[test]
    fn mtime_match_short_circuits_to_unchanged_even_if_hash_would_differ() {
        let mut registry = HashMap::new();
        registry.insert("a.md".to_string(), entry("old_hash", 5.0));
        let current = vec![state("a.md", "new_hash", 5.0)];
        let set = detect_changes(&current, &registry);
        assert_eq!(set.unchanged, vec!["a.md".to_string()]);
        assert!(set.modified.is_empty());
    }

    #[test]
    fn touch_only_is_unchanged_via_hash_match() {
        let mut registry = HashMap::new();
        registry.insert("a.md".to_string(), entry("h1", 1.0));
        let current = vec![state("a.md", "h1", 2.0)];
        let set = detect_changes(&current, &registry);
        assert_eq!(set.unchanged, vec!["a.md".to_string()]);
    }

    #[test]
    fn changed_content_and_mtime_is_modified() {
        let mut registry = HashMap::new();
        registry.insert("a.md".to_string(), entry("h1", 1.0));
        let current = vec![state("a.md", "h2", 2.0)];
        let set = detect_changes(&current, &registry);
        assert_eq!(set.modified, vec!["a.md".to_string()]);
    }

    #[test]
    fn missing_from_current_is_deleted() {
        let mut registry = HashMap::new();
        registry.insert("gone.md".to_string(), entry("h1", 1.0));
        let set = detect_changes(&[], &registry);
        assert_eq!(set.deleted, vec!["gone.md".to_string()]);
    }

    #[test]
    fn classification_partitions_current_and_registry() {
        let mut registry = HashMap::new();
        registry.insert("unchanged.md".to_string(), entry("h1", 1.0));
        registry.insert("modified.md".to_string(), entry("h1", 1.0));
        registry.insert("deleted.md".to_string(), entry("h1", 1.0));
        let current = vec![
            state("unchanged.md", "h1", 1.0),
            state("modified.md", "h2", 2.0),
            state("added.md", "h3", 3.0),
        ];
        let set = detect_changes(&current, &registry);
        assert_eq!(
            set.added.len() + set.modified.len() + set.unchanged.len(),
            current.len()
        );
        assert_eq!(set.deleted.len(), 1);
    }
}
