//! Vault directory walk (SPEC_FULL.md §4.2). Grounded on the teacher's
//! `ignore::WalkBuilder` usage in `indexer.rs::index_workspace` /
//! `routes/search.rs::collect_indexable_files_pub`, but standard gitignore
//! filtering is turned off: the spec's own dot-component and ignore-set
//! rules replace it rather than layering on top of it.

use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

use crate::error::AppResult;

/// Directories that are never descended into regardless of extension
/// filters: version control, vault metadata, and common cache directories.
pub static DEFAULT_IGNORE_DIRS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        ".git",
        ".obsidian",
        ".trash",
        ".vscode",
        ".idea",
        "node_modules",
        "__pycache__",
        ".cache",
    ]
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub full_path: PathBuf,
    pub relative_path: String,
    pub filename: String,
    pub folder_path: String,
}

/// POSIX-join path components and NFC-normalize the result, per §6's file
/// identity rule (`relative_path` is NFC-normalized for filename lookup,
/// with NFD falling back to it on macOS since HFS+/APFS store filenames
/// decomposed).
fn to_posix(path: &Path) -> String {
    let joined = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/");
    joined.nfc().collect()
}

/// True if any path component other than the root starts with `.`.
fn has_dot_component(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
}

fn is_ignored_dir(relative: &Path, ignore_dirs: &[String]) -> bool {
    relative.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        ignore_dirs.iter().any(|ig| ig == name.as_ref())
    })
}

/// Recursively walk `root`, filtering by extension and the ignore rules
/// above, and return results sorted by `(folder_path, filename)`.
///
/// `include_paths`, when non-empty, restricts results to relative paths
/// beginning with one of the given POSIX-normalized prefixes.
pub fn scan(
    root: &Path,
    extensions: &[&str],
    ignore_dirs: &[String],
    include_paths: Option<&[String]>,
) -> AppResult<Vec<ScannedFile>> {
    let mut files = Vec::new();

    // Canonicalize without the `\\?\` UNC prefix dunce::canonicalize avoids
    // on Windows, so `strip_prefix` below matches cleanly regardless of host.
    let root = dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let root = root.as_path();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .build();

    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }

        let relative = match path.strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        if has_dot_component(relative) || is_ignored_dir(relative, ignore_dirs) {
            continue;
        }

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)) {
            continue;
        }

        let relative_path = to_posix(relative);
        if let Some(prefixes) = include_paths {
            if !prefixes.is_empty() && !prefixes.iter().any(|p| relative_path.starts_with(p.as_str())) {
                continue;
            }
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let folder_path = relative
            .parent()
            .map(to_posix)
            .unwrap_or_default();

        files.push(ScannedFile {
            full_path: path.to_path_buf(),
            relative_path,
            filename,
            folder_path,
        });
    }

    files.sort_by(|a, b| (&a.folder_path, &a.filename).cmp(&(&b.folder_path, &b.filename)));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_vault() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("notes")).unwrap();
        fs::create_dir_all(dir.path().join(".obsidian")).unwrap();
        fs::create_dir_all(dir.path().join("notes/.hidden")).unwrap();
        fs::write(dir.path().join("notes/a.md"), "a").unwrap();
        fs::write(dir.path().join("notes/b.md"), "b").unwrap();
        fs::write(dir.path().join("notes/c.txt"), "c").unwrap();
        fs::write(dir.path().join(".obsidian/workspace.json"), "{}").unwrap();
        fs::write(dir.path().join("notes/.hidden/d.md"), "d").unwrap();
        dir
    }

    #[test]
    fn filters_by_extension_and_ignores_dotfiles() {
        let dir = make_vault();
        let ignore_dirs: Vec<String> = DEFAULT_IGNORE_DIRS.iter().map(|s| s.to_string()).collect();
        let files = scan(dir.path(), &["md"], &ignore_dirs, None).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["notes/a.md", "notes/b.md"]);
    }

    #[test]
    fn include_paths_whitelist_restricts_results() {
        let dir = make_vault();
        let ignore_dirs: Vec<String> = DEFAULT_IGNORE_DIRS.iter().map(|s| s.to_string()).collect();
        let include = vec!["notes/a".to_string()];
        let files = scan(dir.path(), &["md"], &ignore_dirs, Some(&include)).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "notes/a.md");
    }

    #[test]
    fn results_are_sorted() {
        let dir = make_vault();
        fs::create_dir_all(dir.path().join("aaa")).unwrap();
        fs::write(dir.path().join("aaa/z.md"), "z").unwrap();
        let ignore_dirs: Vec<String> = DEFAULT_IGNORE_DIRS.iter().map(|s| s.to_string()).collect();
        let files = scan(dir.path(), &["md"], &ignore_dirs, None).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["aaa/z.md", "notes/a.md", "notes/b.md"]);
    }
}
