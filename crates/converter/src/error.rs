use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the conversion core
#[derive(Debug, Error)]
pub enum ConverterError {
    /// Requested output format is in neither the audio nor the video catalog
    #[error("Output media type is not supported: {token}")]
    UnsupportedFormat { token: String },

    /// Input directory does not exist
    #[error("Input directory not found: {path}")]
    InputDirectoryNotFound { path: PathBuf },

    /// ffmpeg could not be executed at startup
    #[error("FFmpeg is not usable at {path}: {reason}")]
    EngineUnavailable { path: PathBuf, reason: String },

    /// A configuration value cannot be used
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The file could not be inspected by ffprobe
    #[error("Failed to probe {path}: {reason}")]
    ProbeFailed { path: PathBuf, reason: String },

    /// ffmpeg failed while transcoding a single file
    #[error("Conversion failed for {path}: {reason}")]
    ConversionFailed {
        path: PathBuf,
        reason: String,
        stderr: Option<String>,
    },

    /// Destination stayed locked after the retry
    #[error("Destination is locked and could not be replaced: {path}")]
    ReplaceContention {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// ffmpeg ran longer than the configured timeout and was killed
    #[error("Conversion timed out after {secs} seconds")]
    Timeout { secs: u64 },

    /// Cancellation was requested while the engine was running
    #[error("Conversion cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConverterError {
    pub fn conversion_failed(
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
        stderr: Option<String>,
    ) -> Self {
        Self::ConversionFailed {
            path: path.into(),
            reason: reason.into(),
            stderr,
        }
    }

    pub fn probe_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ProbeFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors that abort the run before any file is touched
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat { .. }
                | Self::InputDirectoryNotFound { .. }
                | Self::EngineUnavailable { .. }
                | Self::InvalidConfig { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ConverterError>;
