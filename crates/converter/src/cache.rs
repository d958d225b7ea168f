use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use chrono::Local;
use log::{debug, info};
use crate::error::Result;
use crate::fingerprint::{all_fingerprints, CURRENT_SCHEME};
use crate::scan::{self, FileCandidate};

/// File name of the fingerprint list inside the data folder
pub const CACHE_FILE_NAME: &str = "media_converter_hashes.txt";

/// Persistent set of fingerprints of files that need no further conversion.
///
/// Backed by an append-only text file with one fingerprint per line. The file
/// is read once, on first use; every `record` appends straight to disk.
#[derive(Debug)]
pub struct CompletionCache {
    folder: PathBuf,
    entries: Option<HashSet<String>>,
}

impl CompletionCache {
    /// Cache stored in `folder`. Nothing is read until the first lookup.
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        CompletionCache {
            folder: folder.into(),
            entries: None,
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn file_path(&self) -> PathBuf {
        self.folder.join(CACHE_FILE_NAME)
    }

    /// Load the backing file, creating the folder if needed. Idempotent.
    pub fn load(&mut self) -> Result<&HashSet<String>> {
        if self.entries.is_none() {
            let entries = self.read_entries()?;
            debug!(
                "Loaded {} fingerprints from {}",
                entries.len(),
                self.file_path().display()
            );
            self.entries = Some(entries);
        }
        Ok(self.entries.get_or_insert_with(HashSet::new))
    }

    fn read_entries(&self) -> Result<HashSet<String>> {
        fs::create_dir_all(&self.folder)?;
        let path = self.file_path();
        if !path.exists() {
            return Ok(HashSet::new());
        }
        let content = fs::read_to_string(&path)?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// True if any supported scheme's fingerprint of `candidate` is cached
    pub fn contains(&mut self, candidate: &FileCandidate) -> Result<bool> {
        let entries = self.load()?;
        Ok(all_fingerprints(candidate)
            .iter()
            .any(|fp| entries.contains(fp.as_str())))
    }

    /// Remember `candidate` as converted, in memory and on disk
    pub fn record(&mut self, candidate: &FileCandidate) -> Result<()> {
        let fingerprint = CURRENT_SCHEME.fingerprint(candidate).into_string();
        self.load()?;
        let path = self.file_path();
        let entries = self.entries.get_or_insert_with(HashSet::new);
        if entries.contains(&fingerprint) {
            return Ok(());
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", fingerprint)?;
        entries.insert(fingerprint);
        debug!("Recorded {} as converted", candidate.path.display());
        Ok(())
    }

    /// Drop all history by deleting and recreating the data folder
    pub fn reset(&mut self) -> Result<()> {
        if self.folder.exists() {
            fs::remove_dir_all(&self.folder)?;
            info!("Cache folder was deleted: {}", self.folder.display());
        }
        fs::create_dir_all(&self.folder)?;
        self.entries = Some(HashSet::new());
        Ok(())
    }

    /// Remove the entries of every file currently under `directory` and
    /// rewrite the backing file. Returns how many entries were removed.
    pub fn forget(&mut self, directory: &Path) -> Result<usize> {
        self.load()?;
        let path = self.file_path();
        let staged = self.folder.join(format!("{}.rewrite", CACHE_FILE_NAME));
        let entries = self.entries.get_or_insert_with(HashSet::new);

        let mut removed = 0;
        for candidate in scan::all_files(directory) {
            for fp in all_fingerprints(&candidate) {
                if entries.remove(fp.as_str()) {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            let mut lines: Vec<&String> = entries.iter().collect();
            lines.sort();
            {
                let mut file = fs::File::create(&staged)?;
                for line in lines {
                    writeln!(file, "{}", line)?;
                }
                file.flush()?;
            }
            fs::rename(&staged, &path)?;
        }

        info!(
            "Forgot {} cache entries for files under {}",
            removed,
            directory.display()
        );
        Ok(removed)
    }

    /// Dump every entry to a timestamped file in `directory`
    pub fn export(&mut self, directory: &Path) -> Result<PathBuf> {
        let stem = CACHE_FILE_NAME.trim_end_matches(".txt");
        let target = directory.join(format!(
            "{}_{}.txt",
            stem,
            Local::now().format("%Y%m%d_%H%M%S")
        ));

        let mut lines: Vec<&String> = self.load()?.iter().collect();
        lines.sort();
        let mut file = fs::File::create(&target)?;
        for line in &lines {
            writeln!(file, "{}", line)?;
        }
        info!("Exported {} fingerprints to {}", lines.len(), target.display());
        Ok(target)
    }

    pub fn len(&mut self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.load()?.is_empty())
    }
}
