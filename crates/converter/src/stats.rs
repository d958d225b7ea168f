use std::fmt;
use std::time::Duration;
use crate::stager::ConversionOutcome;

/// Counters for one batch run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStatistics {
    /// Files the engine finished and swapped into place
    pub processed: usize,
    pub errors: usize,
    /// Files classified as already converted, bad files included
    pub skipped: usize,
    /// Files that could not be probed
    pub bad_files: usize,
    /// Total size reduction in bytes; negative if outputs grew
    pub bytes_saved: i64,
    /// Time spent on processed files only
    pub elapsed: Duration,
}

impl BatchStatistics {
    pub fn record_outcome(&mut self, outcome: &ConversionOutcome) {
        if outcome.modified {
            self.processed += 1;
            self.bytes_saved += outcome.bytes_saved();
            self.elapsed += outcome.elapsed;
        }
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_skip(&mut self, bad_file: bool) {
        self.skipped += 1;
        if bad_file {
            self.bad_files += 1;
        }
    }

    pub fn megabytes_saved(&self) -> i64 {
        self.bytes_saved / 1024 / 1024
    }
}

impl fmt::Display for BatchStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Done. Processed {} files. Compressed {} MB. Errors: {}. Elapsed: {:?}",
            self.processed,
            self.megabytes_saved(),
            self.errors,
            self.elapsed
        )
    }
}

/// Result of a scan-only pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub pending: usize,
    pub skipped: usize,
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scan complete. Files to convert: {}. Skipped: {}", self.pending, self.skipped)
    }
}
