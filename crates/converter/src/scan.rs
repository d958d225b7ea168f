use std::path::{Path, PathBuf};
use std::time::SystemTime;
use anyhow::{Context, Result};
use walkdir::WalkDir;
use log::{debug, warn};

/// A media file found during traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCandidate {
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    pub modified: SystemTime,
    /// Containing directory, used to group log output
    pub directory: PathBuf,
}

impl FileCandidate {
    /// Stat a file and build a candidate for it
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat file: {}", path.display()))?;
        Ok(Self::from_metadata(path, &metadata))
    }

    fn from_metadata(path: &Path, metadata: &std::fs::Metadata) -> Self {
        FileCandidate {
            path: path.to_path_buf(),
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            directory: path.parent().map(Path::to_path_buf).unwrap_or_default(),
        }
    }

    /// File name including extension
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Lower-cased extension without the dot
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Lazily walk `root` and yield every file with one of `extensions`.
///
/// Anything under `exclude` (the application data folder) is skipped, so
/// scratch outputs are never picked up as input. Unreadable entries are
/// logged and skipped.
pub fn find_files(
    root: &Path,
    extensions: &'static [&'static str],
    exclude: Option<PathBuf>,
) -> impl Iterator<Item = FileCandidate> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| match &exclude {
            Some(excluded) => !entry.path().starts_with(excluded),
            None => true,
        })
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(move |entry| has_extension(entry.path(), extensions))
        .filter_map(|entry| match entry.metadata() {
            Ok(metadata) => {
                debug!("Found media file: {}", entry.path().display());
                Some(FileCandidate::from_metadata(entry.path(), &metadata))
            }
            Err(e) => {
                warn!("Failed to stat file {}: {}", entry.path().display(), e);
                None
            }
        })
}

/// Walk `root` and collect every regular file, regardless of extension
pub fn all_files(root: &Path) -> Vec<FileCandidate> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.metadata()
                .ok()
                .map(|m| FileCandidate::from_metadata(e.path(), &m))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    static EXTS: &[&str] = &["mp4", "avi"];

    #[test]
    fn test_find_files_filters_by_extension_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("season1");
        fs::create_dir_all(&sub).unwrap();
        fs::write(dir.path().join("a.mp4"), b"aaaa").unwrap();
        fs::write(sub.join("b.AVI"), b"bb").unwrap();
        fs::write(sub.join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join("noext"), b"x").unwrap();

        let found: Vec<_> = find_files(dir.path(), EXTS, None).collect();
        assert_eq!(found.len(), 2);

        let b = found.iter().find(|c| c.file_name() == "b.AVI").unwrap();
        assert_eq!(b.size, 2);
        assert_eq!(b.directory, sub);
        assert_eq!(b.extension().as_deref(), Some("avi"));
    }

    #[test]
    fn test_find_files_skips_excluded_tree() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("appdata");
        fs::create_dir_all(data.join("scratch")).unwrap();
        fs::write(data.join("scratch").join("tmp.mp4"), b"x").unwrap();
        fs::write(dir.path().join("keep.mp4"), b"x").unwrap();

        let found: Vec<_> = find_files(dir.path(), EXTS, Some(data)).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_name(), "keep.mp4");
    }

    #[test]
    fn test_find_files_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        fs::write(dir.path().join("b.mp4"), b"x").unwrap();

        let first: Vec<_> = find_files(dir.path(), EXTS, None).collect();
        let second: Vec<_> = find_files(dir.path(), EXTS, None).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_all_files_ignores_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        fs::write(dir.path().join("b.txt"), b"x").unwrap();
        assert_eq!(all_files(dir.path()).len(), 2);
    }
}
