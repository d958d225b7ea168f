use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use log::{debug, error, warn};
use regex::bytes::Regex;
use crate::cache::CompletionCache;
use crate::config::ConverterConfig;
use crate::error::{ConverterError, Result};
use crate::ffmpeg::MediaEngine;
use crate::formats::MediaFormat;
use crate::scan::FileCandidate;

/// Bytes searched past the longest signature when reading a footer
const FOOTER_WINDOW: usize = 255;

/// Widest encoder tag the default signature matches, e.g. "Lavf58.45.100"
const SIGNATURE_WIDTH: usize = 16;

/// Why a file was or was not considered finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A fingerprint of the file is in the cache
    Cached,
    /// The file ends with our marker or an encoder signature
    Footer,
    /// The probe found a stream already in the target codec
    Codec,
    /// The probe failed; the file is skipped rather than retried now
    BadFile,
    /// The file has to be converted
    NeedsConversion,
}

impl Classification {
    pub fn is_converted(&self) -> bool {
        !matches!(self, Classification::NeedsConversion)
    }
}

/// Decides whether a file is already in the target format.
///
/// Checks run cheapest first: cache lookup, footer scan, codec probe. Any
/// positive answer other than a cache hit is written back to the cache so
/// the next run stops at the first check.
pub struct CompletionClassifier {
    format: &'static MediaFormat,
    engine: Arc<dyn MediaEngine>,
    verify_footer: bool,
    verify_codec: bool,
    strict_extension: bool,
    mark_bad_as_completed: bool,
    marker: Vec<u8>,
    encoder_signature: Option<Regex>,
}

impl CompletionClassifier {
    pub fn new(
        cfg: &ConverterConfig,
        format: &'static MediaFormat,
        engine: Arc<dyn MediaEngine>,
    ) -> Result<Self> {
        let encoder_signature = match cfg.encoder_signature.as_deref() {
            Some(pattern) if !pattern.is_empty() => {
                Some(Regex::new(pattern).map_err(|e| ConverterError::InvalidConfig {
                    reason: format!("encoder_signature {:?}: {}", pattern, e),
                })?)
            }
            _ => None,
        };

        Ok(CompletionClassifier {
            format,
            engine,
            verify_footer: cfg.verify_footer,
            verify_codec: cfg.verify_codec,
            strict_extension: cfg.strict_extension,
            mark_bad_as_completed: cfg.mark_bad_as_completed,
            marker: cfg.marker.as_bytes().to_vec(),
            encoder_signature,
        })
    }

    /// True if `candidate` needs no conversion. Never fails.
    pub async fn is_converted(
        &self,
        cache: &mut CompletionCache,
        candidate: &FileCandidate,
    ) -> bool {
        self.classify(cache, candidate).await.is_converted()
    }

    pub async fn classify(
        &self,
        cache: &mut CompletionCache,
        candidate: &FileCandidate,
    ) -> Classification {
        match cache.contains(candidate) {
            Ok(true) => return Classification::Cached,
            Ok(false) => {}
            Err(e) => warn!("Cache lookup failed for {}: {}", candidate.path.display(), e),
        }

        if self.strict_extension && !self.has_target_extension(candidate) {
            return Classification::NeedsConversion;
        }

        if self.verify_footer {
            match self.has_valid_footer(&candidate.path) {
                Ok(true) => {
                    debug!("Footer marks {} as converted", candidate.path.display());
                    remember(cache, candidate);
                    return Classification::Footer;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to read footer of {}: {}", candidate.path.display(), e),
            }
        }

        if self.verify_codec {
            match self.engine.probe(&candidate.path).await {
                Ok(info) if info.has_stream(self.format.kind, self.format.target_codec) => {
                    debug!(
                        "{} already has a {} {} stream",
                        candidate.path.display(),
                        self.format.target_codec,
                        self.format.kind
                    );
                    remember(cache, candidate);
                    return Classification::Codec;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Bad file - {} ({})", candidate.file_name(), e);
                    if self.mark_bad_as_completed {
                        remember(cache, candidate);
                    }
                    return Classification::BadFile;
                }
            }
        }

        Classification::NeedsConversion
    }

    fn has_target_extension(&self, candidate: &FileCandidate) -> bool {
        candidate
            .extension()
            .map(|ext| self.format.matches_extension(&ext))
            .unwrap_or(false)
    }

    /// Number of trailing bytes inspected by the footer check
    pub fn footer_len(&self) -> usize {
        self.marker.len().max(SIGNATURE_WIDTH) + FOOTER_WINDOW
    }

    /// Search the file's tail for the marker or the encoder signature
    pub fn has_valid_footer(&self, path: &Path) -> std::io::Result<bool> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let start = len.saturating_sub(self.footer_len() as u64);
        file.seek(SeekFrom::Start(start))?;

        let mut tail = Vec::with_capacity(self.footer_len());
        file.read_to_end(&mut tail)?;

        let marker = self.marker.as_slice();
        if !marker.is_empty() && tail.windows(marker.len()).any(|w| w == marker) {
            return Ok(true);
        }
        Ok(self
            .encoder_signature
            .as_ref()
            .map(|re| re.is_match(&tail))
            .unwrap_or(false))
    }
}

fn remember(cache: &mut CompletionCache, candidate: &FileCandidate) {
    if let Err(e) = cache.record(candidate) {
        warn!("Failed to record {} in cache: {}", candidate.path.display(), e);
    }
}
