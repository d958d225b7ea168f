use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use crate::cache::{CompletionCache, CACHE_FILE_NAME};
use crate::classifier::{Classification, CompletionClassifier};
use crate::config::ConverterConfig;
use crate::error::{ConverterError, Result};
use crate::ffmpeg::MediaEngine;
use crate::formats::{self, MediaFormat};
use crate::scan::{self, FileCandidate};
use crate::stager::{ConversionOutcome, ConversionStager};
use crate::stats::{BatchStatistics, ScanSummary};

/// Number of skipped files between two progress lines while scanning
const SKIP_LOG_INTERVAL: usize = 100;

/// Walks the input tree and converts every file that is not finished yet,
/// one at a time.
pub struct BatchEngine {
    input_dir: PathBuf,
    data_dir: PathBuf,
    scratch_dir: PathBuf,
    format: &'static MediaFormat,
    cache: CompletionCache,
    classifier: CompletionClassifier,
    stager: ConversionStager,
    /// Pending files found by a counting pass, shown as `i/N` per file
    expected_total: Option<usize>,
}

impl BatchEngine {
    pub fn new(cfg: &ConverterConfig, media_engine: Arc<dyn MediaEngine>) -> Result<Self> {
        if !cfg.input_dir.is_dir() {
            return Err(ConverterError::InputDirectoryNotFound {
                path: cfg.input_dir.clone(),
            });
        }
        let format = formats::resolve(&cfg.output_format)?;

        if cfg.threads > 1 {
            warn!("threads = {} requested, files are converted one at a time", cfg.threads);
        }

        info!(
            "Converting {} files under {} to {} ({} via {})",
            format.kind,
            cfg.input_dir.display(),
            format.id,
            format.target_codec,
            media_engine.name()
        );

        Ok(BatchEngine {
            input_dir: cfg.input_dir.clone(),
            data_dir: cfg.data_dir.clone(),
            scratch_dir: cfg.scratch_dir(),
            format,
            cache: CompletionCache::new(&cfg.data_dir),
            classifier: CompletionClassifier::new(cfg, format, media_engine.clone())?,
            stager: ConversionStager::new(cfg, format, media_engine),
            expected_total: None,
        })
    }

    pub fn format(&self) -> &'static MediaFormat {
        self.format
    }

    pub fn cache_mut(&mut self) -> &mut CompletionCache {
        &mut self.cache
    }

    pub fn set_expected_total(&mut self, total: usize) {
        self.expected_total = Some(total);
    }

    /// Fresh lazy walk over every file with an extension of the target kind
    pub fn find_candidates(&self) -> impl Iterator<Item = FileCandidate> {
        scan::find_files(
            &self.input_dir,
            self.format.input_extensions(),
            Some(self.data_dir.clone()),
        )
    }

    /// Pull candidates until one needs converting. Skips are counted in `stats`.
    pub async fn next_pending<I>(
        &mut self,
        files: &mut I,
        stats: &mut BatchStatistics,
        cancel: &CancellationToken,
    ) -> Option<FileCandidate>
    where
        I: Iterator<Item = FileCandidate>,
    {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let candidate = files.next()?;

            match self.classifier.classify(&mut self.cache, &candidate).await {
                Classification::NeedsConversion => return Some(candidate),
                decision => {
                    debug!("Skipping {} ({:?})", candidate.path.display(), decision);
                    stats.record_skip(decision == Classification::BadFile);
                    if stats.skipped % SKIP_LOG_INTERVAL == 0 {
                        info!("Skipped {} files", stats.skipped);
                    }
                }
            }
        }
    }

    /// Classify every candidate without converting anything
    pub async fn scan_only(&mut self, cancel: &CancellationToken) -> ScanSummary {
        let mut stats = BatchStatistics::default();
        let mut files = self.find_candidates();
        let mut pending = 0;

        while let Some(candidate) = self.next_pending(&mut files, &mut stats, cancel).await {
            pending += 1;
            info!("To convert: {}", self.relative(&candidate.path));
        }

        let summary = ScanSummary {
            pending,
            skipped: stats.skipped,
        };
        info!("{}", summary);
        summary
    }

    /// Remove leftovers of interrupted runs from the scratch folder
    pub fn delete_temp_files(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.scratch_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            if entry.file_name() == CACHE_FILE_NAME {
                continue;
            }
            let path = entry.path();
            let result = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    debug!("Removed orphaned temp file: {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove orphaned temp file {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!("🧹 Cleaned {} orphaned temp file(s)", removed);
        }
        Ok(removed)
    }

    /// Convert pending files until the tree is exhausted, `limit` files were
    /// processed (0 means no limit) or `cancel` fires
    pub async fn run_all(
        &mut self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<BatchStatistics> {
        self.delete_temp_files()?;

        let mut stats = BatchStatistics::default();
        let mut files = self.find_candidates();
        let mut current_dir: Option<PathBuf> = None;

        while let Some(candidate) = self.next_pending(&mut files, &mut stats, cancel).await {
            if current_dir.as_ref() != Some(&candidate.directory) {
                info!("📁 {}", self.relative(&candidate.directory));
                current_dir = Some(candidate.directory.clone());
            }

            info!(
                "{}",
                file_label(&candidate.file_name(), stats.processed + 1, self.expected_total)
            );
            match self.stager.convert(&mut self.cache, &candidate, cancel).await {
                Ok(outcome) => {
                    if outcome.modified {
                        log_outcome(&outcome);
                    }
                    stats.record_outcome(&outcome);
                }
                Err(e) => {
                    error!("❌ Failed to convert {}: {}", candidate.path.display(), e);
                    if let ConverterError::ConversionFailed { stderr: Some(tail), .. } = &e {
                        debug!("FFmpeg stderr:\n{}", tail);
                    }
                    stats.record_error();
                }
            }

            if cancel.is_cancelled() {
                info!("Cancellation requested, stopping");
                break;
            }
            if limit > 0 && stats.processed >= limit {
                info!("Limit of {} file(s) reached", limit);
                break;
            }
        }

        info!("{}", stats);
        Ok(stats)
    }

    /// `path` relative to the input root, for log lines
    fn relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.input_dir) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

fn file_label(name: &str, index: usize, total: Option<usize>) -> String {
    match total {
        Some(total) => format!("File: {} ({}/{})", name, index, total),
        None => format!("File: {}", name),
    }
}

fn log_outcome(outcome: &ConversionOutcome) {
    let name = outcome
        .output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!(
        "✅ Compressed file: {}, {}Mb => {}Mb ({}%), {:?}",
        name,
        outcome.size_before / 1024 / 1024,
        outcome.size_after / 1024 / 1024,
        outcome.compression_rate(),
        outcome.elapsed
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngine;
    use std::time::Duration;

    struct Fixture {
        _media: tempfile::TempDir,
        _data: tempfile::TempDir,
        media_dir: PathBuf,
        cfg: ConverterConfig,
    }

    fn fixture(format: &str) -> Fixture {
        let media = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let cfg = ConverterConfig {
            input_dir: media.path().to_path_buf(),
            output_format: format.to_string(),
            data_dir: data.path().to_path_buf(),
            replace_retry_delay_ms: 10,
            ..Default::default()
        };
        Fixture {
            media_dir: media.path().to_path_buf(),
            cfg,
            _media: media,
            _data: data,
        }
    }

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, bytes).unwrap();
        path
    }

    fn engine(cfg: &ConverterConfig, mock: &Arc<MockEngine>) -> BatchEngine {
        BatchEngine::new(cfg, mock.clone()).unwrap()
    }

    #[test]
    fn test_missing_input_dir() {
        let mut f = fixture("mp4");
        f.cfg.input_dir = f.media_dir.join("nope");
        let result = BatchEngine::new(&f.cfg, Arc::new(MockEngine::default()));
        assert!(matches!(result.err(), Some(ConverterError::InputDirectoryNotFound { .. })));
    }

    #[test]
    fn test_unsupported_format() {
        let mut f = fixture("mp4");
        f.cfg.output_format = "docx".to_string();
        let result = BatchEngine::new(&f.cfg, Arc::new(MockEngine::default()));
        assert!(matches!(result.err(), Some(ConverterError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_candidates_exclude_data_folder_and_other_kinds() {
        let mut f = fixture("mp4");
        f.cfg.data_dir = f.media_dir.join(".mediaconv");
        write(&f.media_dir, "a.MP4", b"x");
        write(&f.media_dir, "sub/b.avi", b"x");
        write(&f.media_dir, "song.mp3", b"x");
        write(&f.media_dir, "notes.txt", b"x");
        write(&f.media_dir, ".mediaconv/scratch/c.mp4", b"x");

        let e = engine(&f.cfg, &Arc::new(MockEngine::default()));
        let mut names: Vec<String> = e.find_candidates().map(|c| c.file_name()).collect();
        names.sort();
        assert_eq!(names, vec!["a.MP4", "b.avi"]);

        // Each call starts a new walk
        assert_eq!(e.find_candidates().count(), 2);
    }

    #[tokio::test]
    async fn test_second_run_converts_nothing() {
        let f = fixture("mp4");
        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            write(&f.media_dir, name, b"original");
        }
        let mock = Arc::new(MockEngine::default());
        let cancel = CancellationToken::new();

        let first = engine(&f.cfg, &mock).run_all(0, &cancel).await.unwrap();
        assert_eq!(first.processed, 3);
        assert_eq!(first.errors, 0);

        let second = engine(&f.cfg, &mock).run_all(0, &cancel).await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(mock.convert_count(), 3);
    }

    #[tokio::test]
    async fn test_limit_stops_after_processed_items() {
        let f = fixture("mp4");
        for i in 0..5 {
            write(&f.media_dir, &format!("clip{}.mp4", i), b"original");
        }
        let mock = Arc::new(MockEngine::default());

        let stats = engine(&f.cfg, &mock)
            .run_all(2, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(mock.convert_count(), 2);
        let untouched = (0..5)
            .map(|i| fs::read(f.media_dir.join(format!("clip{}.mp4", i))).unwrap())
            .filter(|bytes| bytes == b"original")
            .count();
        assert_eq!(untouched, 3);
    }

    async fn cancelled_run(abort_on_cancel: bool) {
        let f = fixture("mp4");
        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            write(&f.media_dir, name, b"original");
        }
        let mock = Arc::new(MockEngine {
            cancel_after: Some(2),
            abort_on_cancel,
            ..Default::default()
        });

        let stats = engine(&f.cfg, &mock)
            .run_all(0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.processed, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(fs::read(f.media_dir.join("a.mp4")).unwrap(), b"converted");
        assert_eq!(fs::read(f.media_dir.join("b.mp4")).unwrap(), b"original");
        assert_eq!(fs::read(f.media_dir.join("c.mp4")).unwrap(), b"original");
        assert_eq!(fs::read_dir(f.cfg.scratch_dir()).unwrap().count(), 0);
        // only a.mp4 contributes time
        assert!(stats.elapsed > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancel_keeps_only_completed_items() {
        cancelled_run(false).await;
    }

    #[tokio::test]
    async fn test_cancel_reported_by_engine() {
        cancelled_run(true).await;
    }

    #[tokio::test]
    async fn test_cancel_before_start_does_nothing() {
        let f = fixture("mp4");
        write(&f.media_dir, "a.mp4", b"original");
        let mock = Arc::new(MockEngine::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = engine(&f.cfg, &mock).run_all(0, &cancel).await.unwrap();
        assert_eq!(stats, BatchStatistics::default());
        assert_eq!(mock.convert_count(), 0);
    }

    async fn probes_after_two_runs(mark_bad: bool) -> (usize, usize) {
        let mut f = fixture("mp4");
        f.cfg.mark_bad_as_completed = mark_bad;
        write(&f.media_dir, "a.mp4", b"original");
        write(&f.media_dir, "b.mp4", b"garbage");
        let mock = Arc::new(MockEngine::default());
        mock.mark_corrupt("b.mp4");
        let cancel = CancellationToken::new();

        let first = engine(&f.cfg, &mock).run_all(0, &cancel).await.unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(first.bad_files, 1);
        assert_eq!(first.skipped, 1);
        let after_first = mock.probe_count();

        engine(&f.cfg, &mock).run_all(0, &cancel).await.unwrap();
        (after_first, mock.probe_count())
    }

    #[tokio::test]
    async fn test_bad_file_marked_is_not_inspected_again() {
        let (first, second) = probes_after_two_runs(true).await;
        assert_eq!(first, 2);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_bad_file_unmarked_is_inspected_every_run() {
        let (first, second) = probes_after_two_runs(false).await;
        assert_eq!(first, 2);
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn test_stale_temp_removed_and_failure_keeps_original() {
        let f = fixture("mp4");
        write(&f.cfg.scratch_dir(), "0b7e3f1c.mp4", b"half written");
        write(&f.cfg.scratch_dir(), CACHE_FILE_NAME, b"");
        write(&f.media_dir, "a.mp4", b"original");
        write(&f.media_dir, "b.mp4", b"original");
        write(&f.media_dir, "c.mp4", b"original");
        let mock = Arc::new(MockEngine::default());
        mock.mark_failing("b.mp4");

        let stats = engine(&f.cfg, &mock)
            .run_all(0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(fs::read(f.media_dir.join("b.mp4")).unwrap(), b"original");
        let left: Vec<_> = fs::read_dir(f.cfg.scratch_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from(CACHE_FILE_NAME)]);
    }

    #[tokio::test]
    async fn test_failed_items_add_no_elapsed_time() {
        let f = fixture("mp4");
        write(&f.media_dir, "a.mp4", b"original");
        let mock = Arc::new(MockEngine::default());
        mock.mark_failing("a.mp4");

        let stats = engine(&f.cfg, &mock)
            .run_all(0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.elapsed, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_counted_run_converts_everything_pending() {
        let f = fixture("mp4");
        for name in ["a.mp4", "b.mp4"] {
            write(&f.media_dir, name, b"original");
        }
        let mock = Arc::new(MockEngine::default());
        let cancel = CancellationToken::new();

        let mut e = engine(&f.cfg, &mock);
        let summary = e.scan_only(&cancel).await;
        e.set_expected_total(summary.pending);
        let stats = e.run_all(0, &cancel).await.unwrap();

        assert_eq!(summary.pending, 2);
        assert_eq!(stats.processed, 2);
    }

    #[test]
    fn test_file_label() {
        assert_eq!(file_label("a.mp4", 3, Some(10)), "File: a.mp4 (3/10)");
        assert_eq!(file_label("a.mp4", 3, None), "File: a.mp4");
    }

    #[tokio::test]
    async fn test_extension_change_replaces_source() {
        let f = fixture("mkv");
        write(&f.media_dir, "movie.avi", b"original");
        let mock = Arc::new(MockEngine::default());

        let stats = engine(&f.cfg, &mock)
            .run_all(0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.processed, 1);
        assert!(!f.media_dir.join("movie.avi").exists());
        assert_eq!(fs::read(f.media_dir.join("movie.mkv")).unwrap(), b"converted");

        // The new file is found on the next walk and recognised from the cache
        let second = engine(&f.cfg, &mock)
            .run_all(0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(mock.convert_count(), 1);
    }

    #[tokio::test]
    async fn test_scan_only_counts_without_converting() {
        let f = fixture("mp4");
        let done = write(&f.media_dir, "done.mp4", b"original");
        write(&f.media_dir, "todo.mp4", b"original");
        write(&f.media_dir, "sub/todo2.mkv", b"original");
        let mock = Arc::new(MockEngine::default());

        let mut e = engine(&f.cfg, &mock);
        e.cache_mut()
            .record(&FileCandidate::from_path(&done).unwrap())
            .unwrap();

        let summary = e.scan_only(&CancellationToken::new()).await;
        assert_eq!(summary, ScanSummary { pending: 2, skipped: 1 });
        assert_eq!(mock.convert_count(), 0);
    }

    #[test]
    fn test_delete_temp_files_without_scratch_dir() {
        let f = fixture("mp3");
        let e = engine(&f.cfg, &Arc::new(MockEngine::default()));
        assert_eq!(e.delete_temp_files().unwrap(), 0);
    }

    #[test]
    fn test_relative_paths_in_logs() {
        let f = fixture("mp3");
        let e = engine(&f.cfg, &Arc::new(MockEngine::default()));
        assert_eq!(e.relative(&f.media_dir), ".");
        let nested = Path::new("a").join("b");
        assert_eq!(e.relative(&f.media_dir.join(&nested)), nested.display().to_string());
        assert_eq!(e.relative(Path::new("/elsewhere")), "/elsewhere");
    }
}
