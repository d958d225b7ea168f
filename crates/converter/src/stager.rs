use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::cache::CompletionCache;
use crate::config::ConverterConfig;
use crate::error::{ConverterError, Result};
use crate::ffmpeg::{ConversionOptions, ConversionProgress, ConversionRequest, MediaEngine};
use crate::formats::MediaFormat;
use crate::scan::FileCandidate;

/// Result of staging one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutcome {
    pub source: PathBuf,
    /// Final location of the converted file
    pub output: PathBuf,
    pub size_before: u64,
    pub size_after: u64,
    pub elapsed: Duration,
    /// False when the conversion was discarded on cancellation
    pub modified: bool,
}

impl ConversionOutcome {
    /// Bytes saved; negative if the file grew
    pub fn bytes_saved(&self) -> i64 {
        self.size_before as i64 - self.size_after as i64
    }

    /// Saved bytes as a percentage of the original size
    pub fn compression_rate(&self) -> i64 {
        if self.size_before == 0 {
            0
        } else {
            self.bytes_saved() * 100 / self.size_before as i64
        }
    }
}

/// Logs a progress line only when the percentage moves
#[derive(Debug, Default)]
pub struct ProgressLogger {
    last_percent: Option<u8>,
}

impl ProgressLogger {
    /// Returns true if a line was logged for this event
    pub fn observe(&mut self, progress: &ConversionProgress) -> bool {
        if self.last_percent == Some(progress.percent) {
            return false;
        }
        self.last_percent = Some(progress.percent);
        info!(
            "Progress: {}% ({:?} - {:?}) PID: {}",
            progress.percent,
            progress.position,
            progress.total.unwrap_or_default(),
            progress.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
        );
        true
    }
}

/// Converts one file into the scratch folder and swaps it into place.
///
/// The original is only touched after the engine finished successfully
/// and the run was not cancelled in the meantime.
pub struct ConversionStager {
    format: &'static MediaFormat,
    engine: Arc<dyn MediaEngine>,
    scratch_dir: PathBuf,
    options: ConversionOptions,
    retry_delay: Duration,
}

impl ConversionStager {
    pub fn new(
        cfg: &ConverterConfig,
        format: &'static MediaFormat,
        engine: Arc<dyn MediaEngine>,
    ) -> Self {
        ConversionStager {
            format,
            engine,
            scratch_dir: cfg.scratch_dir(),
            options: ConversionOptions::from_config(cfg),
            retry_delay: cfg.replace_retry_delay(),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Fresh, uniquely named output path in the scratch folder
    pub fn temp_path(&self) -> PathBuf {
        self.scratch_dir
            .join(format!("{}.{}", Uuid::new_v4(), self.format.id))
    }

    /// Where the converted file ends up: same base name, target extension
    pub fn destination_for(&self, source: &Path) -> PathBuf {
        source.with_extension(self.format.id)
    }

    pub async fn convert(
        &self,
        cache: &mut CompletionCache,
        candidate: &FileCandidate,
        cancel: &CancellationToken,
    ) -> Result<ConversionOutcome> {
        let started = Instant::now();
        fs::create_dir_all(&self.scratch_dir)?;
        let temp = self.temp_path();

        let request = ConversionRequest {
            input: candidate.path.clone(),
            output: temp.clone(),
            format: self.format,
            options: self.options.clone(),
        };

        let (progress_tx, mut progress_rx) = mpsc::channel::<ConversionProgress>(32);
        let conversion = self.engine.convert(request, progress_tx, cancel.clone());
        let report = async {
            let mut logger = ProgressLogger::default();
            while let Some(progress) = progress_rx.recv().await {
                logger.observe(&progress);
            }
        };
        let (result, ()) = tokio::join!(conversion, report);

        match result {
            Ok(()) if !cancel.is_cancelled() => {}
            Ok(()) | Err(ConverterError::Cancelled) => {
                info!("Cancelled, discarding output for {}", candidate.path.display());
                discard(&temp);
                return Ok(ConversionOutcome {
                    source: candidate.path.clone(),
                    output: candidate.path.clone(),
                    size_before: candidate.size,
                    size_after: candidate.size,
                    elapsed: started.elapsed(),
                    modified: false,
                });
            }
            Err(e) => {
                discard(&temp);
                return Err(e);
            }
        }

        let size_after = match fs::metadata(&temp) {
            Ok(m) if m.is_file() => m.len(),
            _ => {
                discard(&temp);
                return Err(ConverterError::conversion_failed(
                    &candidate.path,
                    "engine reported success but wrote no output",
                    None,
                ));
            }
        };

        let destination = self.destination_for(&candidate.path);
        let staged = match stage_beside(&temp, &destination) {
            Ok(staged) => staged,
            Err(e) => {
                discard(&temp);
                return Err(e.into());
            }
        };
        self.swap_into_place(&staged, &destination).await?;

        if destination != candidate.path {
            if let Err(e) = fs::remove_file(&candidate.path) {
                warn!(
                    "Converted file is in place but the original could not be removed: {} ({})",
                    candidate.path.display(),
                    e
                );
            }
        }

        match FileCandidate::from_path(&destination) {
            Ok(result) => {
                if let Err(e) = cache.record(&result) {
                    warn!("Failed to record {} in cache: {}", destination.display(), e);
                }
            }
            Err(e) => warn!("Failed to stat converted file {}: {}", destination.display(), e),
        }

        Ok(ConversionOutcome {
            source: candidate.path.clone(),
            output: destination,
            size_before: candidate.size,
            size_after,
            elapsed: started.elapsed(),
            modified: true,
        })
    }

    /// Rename `staged` over `destination`.
    ///
    /// A failed rename is retried once after the retry delay, removing the
    /// destination first on platforms that refuse to rename over a file.
    async fn swap_into_place(&self, staged: &Path, destination: &Path) -> Result<()> {
        let first = match fs::rename(staged, destination) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        debug!(
            "Destination busy ({}), retrying in {:?}: {}",
            first,
            self.retry_delay,
            destination.display()
        );
        tokio::time::sleep(self.retry_delay).await;

        let retry = if destination.is_file() {
            fs::remove_file(destination).and_then(|()| fs::rename(staged, destination))
        } else {
            fs::rename(staged, destination)
        };

        retry.map_err(|source| {
            if destination.exists() {
                discard(staged);
            } else {
                // the original is gone, so the staged copy is the only one left
                error!(
                    "Could not move converted file into place, it was kept at {}",
                    staged.display()
                );
            }
            ConverterError::ReplaceContention {
                path: destination.to_path_buf(),
                source,
            }
        })
    }
}

/// Move `temp` to a hidden `.part` file next to `destination`, so the final
/// swap is a rename within one filesystem
fn stage_beside(temp: &Path, destination: &Path) -> io::Result<PathBuf> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let staged = parent.join(format!(".{}.part", Uuid::new_v4()));
    match fs::rename(temp, &staged) {
        Ok(()) => Ok(staged),
        Err(rename_err) => {
            debug!("Rename failed ({}), copying {} instead", rename_err, temp.display());
            copy_to_part(temp, &staged)?;
            Ok(staged)
        }
    }
}

/// Copy `temp` to `staged` and remove `temp`; a partial copy is removed on error
fn copy_to_part(temp: &Path, staged: &Path) -> io::Result<()> {
    if let Err(e) = fs::copy(temp, staged) {
        let _ = fs::remove_file(staged);
        return Err(e);
    }
    if let Err(e) = fs::remove_file(temp) {
        warn!("Failed to remove temp file {}: {}", temp.display(), e);
    }
    Ok(())
}

fn discard(temp: &Path) {
    if temp.exists() {
        if let Err(e) = fs::remove_file(temp) {
            warn!("Failed to remove temp file {}: {}", temp.display(), e);
        }
    }
}
