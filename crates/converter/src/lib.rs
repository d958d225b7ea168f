pub mod cache;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod ffprobe;
pub mod fingerprint;
pub mod formats;
pub mod scan;
pub mod stager;
pub mod stats;

#[cfg(test)]
mod testing;

pub use cache::CompletionCache;
pub use classifier::{Classification, CompletionClassifier};
pub use config::ConverterConfig;
pub use engine::BatchEngine;
pub use error::ConverterError;
pub use ffmpeg::{FfmpegEngine, MediaEngine};
pub use formats::{MediaFormat, MediaKind};
pub use scan::FileCandidate;
pub use stager::{ConversionOutcome, ConversionStager};
pub use stats::{BatchStatistics, ScanSummary};
