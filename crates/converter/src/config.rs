use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::cache::CACHE_FILE_NAME;

/// Folder under the local data directory holding the cache and scratch files
pub const DATA_FOLDER_NAME: &str = "MediaConverter";

/// Configuration for a conversion run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Root directory to scan recursively
    pub input_dir: PathBuf,
    /// Requested output format token, e.g. "mp4" or ".flac"
    pub output_format: String,
    /// Folder holding the fingerprint cache and the scratch subfolder
    pub data_dir: PathBuf,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Look for the producer marker or an encoder signature near the end of the file
    pub verify_footer: bool,
    /// Probe files and compare their codec with the target codec
    pub verify_codec: bool,
    /// Files whose extension differs from the target always need conversion
    pub strict_extension: bool,
    /// Record unreadable files in the cache so they are never retried
    pub mark_bad_as_completed: bool,
    /// Ask ffmpeg to continue past malformed input
    pub ignore_source_errors: bool,
    /// Remux without re-encoding
    pub stream_copy: bool,
    /// Tag written into every output and searched for by the footer check
    pub marker: String,
    /// Byte pattern of an encoder signature that also counts as a finished footer
    pub encoder_signature: Option<String>,
    /// Delay before the single retry when the destination is locked
    pub replace_retry_delay_ms: u64,
    /// Kill ffmpeg if a single conversion runs longer than this
    pub conversion_timeout_secs: Option<u64>,
    /// Accepted for compatibility; conversion is always sequential
    pub threads: usize,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            input_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            output_format: String::new(),
            data_dir: default_data_dir(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            verify_footer: true,
            verify_codec: true,
            strict_extension: true,
            mark_bad_as_completed: false,
            ignore_source_errors: false,
            stream_copy: false,
            marker: "mediaconv".to_string(),
            encoder_signature: Some(r"Lavf\d+\.\d+\.\d+".to_string()),
            replace_retry_delay_ms: 1000,
            conversion_timeout_secs: None,
            threads: 1,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path).with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content).with_context(|| {
                        format!("Failed to parse TOML config: {}", config_path.display())
                    })?;
                } else {
                    config = serde_json::from_str(&content).with_context(|| {
                        format!("Failed to parse JSON config: {}", config_path.display())
                    })?;
                }
            }
        }

        Ok(config)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE_NAME)
    }

    /// Where in-flight conversion outputs are written
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }

    pub fn replace_retry_delay(&self) -> Duration {
        Duration::from_millis(self.replace_retry_delay_ms)
    }
}

/// `<local data dir>/MediaConverter`, falling back to the temp dir
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DATA_FOLDER_NAME)
}
