use anyhow::{Context, Result};
use clap::Parser;
use converter::{config::ConverterConfig, BatchEngine, CompletionCache, FfmpegEngine, MediaEngine};
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long a cancelled run may take to wind down before the process exits anyway
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const EXIT_INTERRUPTED: i32 = 130;

/// Batch media converter
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory to convert (defaults to the current directory)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Target format, e.g. mp4, mkv, mp3, flac
    #[arg(short, long)]
    format: String,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only report which files would be converted
    #[arg(short, long)]
    scan_only: bool,

    /// Count pending files first and show per-file progress as i/N
    #[arg(long)]
    count: bool,

    /// Stop after converting this many files (0 = no limit)
    #[arg(short, long, default_value_t = 0)]
    limit: usize,

    /// Clear the cache of converted files before starting
    #[arg(short, long)]
    reset: bool,

    /// Remember unreadable files so they are not probed again
    #[arg(short, long)]
    mark_bad_as_completed: bool,

    /// Keep converting past corrupt input data
    #[arg(long)]
    ignore_errors: bool,

    /// Do not probe files for their codec
    #[arg(long)]
    no_codec_check: bool,

    /// Do not look for the converter marker at the end of files
    #[arg(long)]
    no_footer_check: bool,

    /// Remux without re-encoding
    #[arg(long)]
    stream_copy: bool,

    /// Write the cache contents to DIR (default: current directory) and exit
    #[arg(long, value_name = "DIR", num_args = 0..=1, default_missing_value = ".")]
    export_hashes: Option<PathBuf>,

    /// Drop cache entries for every file under DIR and exit
    #[arg(long, value_name = "DIR")]
    forget: Option<PathBuf>,

    /// Number of worker threads (only 1 is supported)
    #[arg(long)]
    threads: Option<usize>,

    /// Folder for the cache and temporary files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, cfg: &mut ConverterConfig) {
        cfg.output_format = self.format.clone();
        if let Some(input) = &self.input {
            cfg.input_dir = input.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            cfg.data_dir = data_dir.clone();
        }
        if let Some(threads) = self.threads {
            cfg.threads = threads;
        }
        cfg.mark_bad_as_completed |= self.mark_bad_as_completed;
        cfg.ignore_source_errors |= self.ignore_errors;
        cfg.stream_copy |= self.stream_copy;
        if self.no_codec_check {
            cfg.verify_codec = false;
        }
        if self.no_footer_check {
            cfg.verify_footer = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG still wins for module-level filters; --verbose only raises the default
    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(LevelFilter::Info);
    }
    logger.format_timestamp_secs().init();

    let mut cfg = ConverterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut cfg);

    info!("Media converter starting");
    info!("  Input: {}", cfg.input_dir.display());
    info!("  Format: {}", cfg.output_format);
    info!("  Data dir: {}", cfg.data_dir.display());

    let mut cache = CompletionCache::new(&cfg.data_dir);

    if let Some(dir) = &args.export_hashes {
        let path = cache
            .export(dir)
            .with_context(|| format!("Failed to export cache to {}", dir.display()))?;
        info!("Exported {} entries to {}", cache.len()?, path.display());
        return Ok(());
    }

    if let Some(dir) = &args.forget {
        let removed = cache
            .forget(dir)
            .with_context(|| format!("Failed to forget files under {}", dir.display()))?;
        info!("Removed {} cache entries for {}", removed, dir.display());
        return Ok(());
    }

    let ffmpeg = FfmpegEngine::new(&cfg).await.context("FFmpeg is required")?;
    let mut engine = start_engine(&cfg, Arc::new(ffmpeg), args.reset)?;

    let cancel = CancellationToken::new();
    tokio::spawn(watch_interrupts(cancel.clone()));

    if args.scan_only {
        engine.scan_only(&cancel).await;
    } else {
        if args.count {
            let summary = engine.scan_only(&cancel).await;
            engine.set_expected_total(summary.pending);
        }
        engine
            .run_all(args.limit, &cancel)
            .await
            .context("Conversion run failed")?;
    }

    if cancel.is_cancelled() {
        warn!("Interrupted");
        std::process::exit(EXIT_INTERRUPTED);
    }
    Ok(())
}

/// Validate the run before clearing the cache, so a bad format or input
/// directory leaves the history alone
fn start_engine(
    cfg: &ConverterConfig,
    media_engine: Arc<dyn MediaEngine>,
    reset: bool,
) -> Result<BatchEngine> {
    let mut engine = BatchEngine::new(cfg, media_engine).context("Failed to start conversion")?;
    if reset {
        engine.cache_mut().reset().context("Failed to reset cache")?;
        info!("Cache was reset");
    }
    Ok(engine)
}

/// First Ctrl-C cancels the run; a second one, or the grace period running
/// out, exits immediately
async fn watch_interrupts(cancel: CancellationToken) {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        return;
    }
    warn!("Ctrl+C received, stopping after cleanup (press again to abort)");
    cancel.cancel();

    tokio::select! {
        _ = signal::ctrl_c() => warn!("Second Ctrl+C, aborting"),
        _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
            warn!("Shutdown took longer than {:?}, aborting", SHUTDOWN_GRACE)
        }
    }
    std::process::exit(EXIT_INTERRUPTED);
}

#[cfg(test)]
mod tests {
    use super::*;
    use converter::cache::CACHE_FILE_NAME;
    use std::fs;

    fn offline_ffmpeg() -> Arc<dyn MediaEngine> {
        Arc::new(FfmpegEngine {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            version: None,
            timeout: None,
        })
    }

    fn setup(format: &str) -> (tempfile::TempDir, tempfile::TempDir, ConverterConfig) {
        let media = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        fs::write(data.path().join(CACHE_FILE_NAME), "ABCDEF\n").unwrap();
        let cfg = ConverterConfig {
            input_dir: media.path().to_path_buf(),
            output_format: format.to_string(),
            data_dir: data.path().to_path_buf(),
            ..Default::default()
        };
        (media, data, cfg)
    }

    #[test]
    fn test_reset_skipped_for_unsupported_format() {
        let (_media, data, cfg) = setup("docx");
        assert!(start_engine(&cfg, offline_ffmpeg(), true).is_err());
        assert!(data.path().join(CACHE_FILE_NAME).exists());
    }

    #[test]
    fn test_reset_skipped_for_missing_input() {
        let (media, data, mut cfg) = setup("mp4");
        cfg.input_dir = media.path().join("typo");
        assert!(start_engine(&cfg, offline_ffmpeg(), true).is_err());
        assert!(data.path().join(CACHE_FILE_NAME).exists());
    }

    #[test]
    fn test_reset_clears_cache_for_valid_run() {
        let (_media, data, cfg) = setup("mp4");
        let mut engine = start_engine(&cfg, offline_ffmpeg(), true).unwrap();
        assert!(!data.path().join(CACHE_FILE_NAME).exists());
        assert!(engine.cache_mut().is_empty().unwrap());
    }
}
