use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::config::ConverterConfig;
use crate::error::{ConverterError, Result};
use crate::ffprobe::{self, MediaInfo};
use crate::formats::MediaFormat;

/// Flags passed with every conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOptions {
    /// Continue past malformed input instead of aborting
    pub error_tolerance: bool,
    /// Copy streams as-is instead of re-encoding
    pub stream_copy: bool,
    /// Producer tag written into the output metadata
    pub metadata_tag: String,
}

impl ConversionOptions {
    pub fn from_config(cfg: &ConverterConfig) -> Self {
        ConversionOptions {
            error_tolerance: cfg.ignore_source_errors,
            stream_copy: cfg.stream_copy,
            metadata_tag: cfg.marker.clone(),
        }
    }
}

/// A single conversion handed to the engine
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: &'static MediaFormat,
    pub options: ConversionOptions,
}

/// Progress event emitted while a conversion runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionProgress {
    /// 0..=100; stays at 0 when the input duration is unknown
    pub percent: u8,
    pub position: Duration,
    pub total: Option<Duration>,
    pub pid: Option<u32>,
}

/// The external media engine: probing and transcoding.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Returns the name of this engine implementation.
    fn name(&self) -> &str;

    /// Inspects a file. Fails if the file is unreadable or corrupt.
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;

    /// Transcodes `request.input` into `request.output`.
    ///
    /// Progress is sent on `progress_tx`; a dropped receiver is ignored.
    /// When `cancel` fires the engine stops early and returns
    /// `ConverterError::Cancelled`.
    async fn convert(
        &self,
        request: ConversionRequest,
        progress_tx: mpsc::Sender<ConversionProgress>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    /// Parse version from the first line of `ffmpeg -version`
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> FFmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> anyhow::Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .skip_while(|s| *s != "version")
            .nth(1)
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        // Release tags may carry an "n" prefix and a distro suffix
        let numeric: String = version_part
            .trim_start_matches('n')
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        let mut parts = numeric.split('.').filter(|p| !p.is_empty());
        let major = parts
            .next()
            .ok_or_else(|| anyhow!("Invalid version format: {}", version_str))?
            .parse::<u32>()
            .with_context(|| format!("Failed to parse major version from: {}", version_part))?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

        Ok(FFmpegVersion { major, minor, patch })
    }
}

/// Turns `-progress` key=value lines into progress events
#[derive(Debug)]
pub struct ProgressParser {
    total: Option<Duration>,
    pid: Option<u32>,
}

impl ProgressParser {
    pub fn new(total: Option<Duration>, pid: Option<u32>) -> Self {
        ProgressParser { total, pid }
    }

    pub fn feed(&mut self, line: &str) -> Option<ConversionProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let position = match key {
            // both are microseconds despite the name
            "out_time_us" | "out_time_ms" => Duration::from_micros(value.trim().parse().ok()?),
            "out_time" => parse_timestamp(value.trim())?,
            "progress" if value.trim() == "end" => {
                return Some(ConversionProgress {
                    percent: 100,
                    position: self.total.unwrap_or_default(),
                    total: self.total,
                    pid: self.pid,
                });
            }
            _ => return None,
        };
        Some(ConversionProgress {
            percent: self.percent(position),
            position,
            total: self.total,
            pid: self.pid,
        })
    }

    fn percent(&self, position: Duration) -> u8 {
        match self.total {
            Some(total) if !total.is_zero() => {
                let pct = position.as_secs_f64() / total.as_secs_f64() * 100.0;
                pct.clamp(0.0, 100.0) as u8
            }
            _ => 0,
        }
    }
}

/// Parse `HH:MM:SS.ffffff`
fn parse_timestamp(value: &str) -> Option<Duration> {
    let mut parts = value.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if !(0.0..1e12).contains(&seconds) {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

/// Runs the local ffmpeg and ffprobe binaries
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub version: Option<FFmpegVersion>,
    pub timeout: Option<Duration>,
}

impl FfmpegEngine {
    /// Locate ffmpeg and log its version
    pub async fn new(config: &ConverterConfig) -> Result<Self> {
        let ffmpeg_bin = config.ffmpeg_bin.clone();
        let version = Self::detect_version(&ffmpeg_bin).await?;

        match &version {
            Some(v) => info!(
                "🎬 Using FFmpeg {}.{}.{} ({})",
                v.major,
                v.minor,
                v.patch,
                ffmpeg_bin.display()
            ),
            None => info!(
                "🎬 Using FFmpeg (unrecognized version string) ({})",
                ffmpeg_bin.display()
            ),
        }

        Ok(FfmpegEngine {
            ffmpeg_bin,
            ffprobe_bin: config.ffprobe_bin.clone(),
            version,
            timeout: config.conversion_timeout_secs.map(Duration::from_secs),
        })
    }

    async fn detect_version(ffmpeg_bin: &Path) -> Result<Option<FFmpegVersion>> {
        let unavailable = |reason: String| ConverterError::EngineUnavailable {
            path: ffmpeg_bin.to_path_buf(),
            reason,
        };

        let output = Command::new(ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(unavailable(format!(
                "-version exited with {}",
                output.status.code().unwrap_or(-1)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().unwrap_or_default();
        match FFmpegVersion::parse(first_line) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                // Git builds report "N-12345-gdeadbeef"
                debug!("Could not parse FFmpeg version: {}", e);
                Ok(None)
            }
        }
    }

    /// Build the ffmpeg argument list for a conversion
    pub fn build_args(request: &ConversionRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
        ];

        if request.options.error_tolerance {
            args.extend([
                "-err_detect".to_string(),
                "ignore_err".to_string(),
                "-fflags".to_string(),
                "+discardcorrupt".to_string(),
            ]);
        }

        args.push("-i".to_string());
        args.push(request.input.to_string_lossy().to_string());

        if request.options.stream_copy {
            args.extend(["-map", "0", "-c", "copy"].map(String::from));
        } else {
            args.push(request.format.kind.codec_flag().to_string());
            args.push(request.format.encoder.to_string());
        }

        if !request.options.metadata_tag.is_empty() {
            args.push("-metadata".to_string());
            args.push(format!("comment={}", request.options.metadata_tag));
        }

        args.extend([
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
        ]);

        args.push(request.output.to_string_lossy().to_string());
        args
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        ffprobe::probe_file(&self.ffprobe_bin, path).await
    }

    async fn convert(
        &self,
        request: ConversionRequest,
        progress_tx: mpsc::Sender<ConversionProgress>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let total = match self.probe(&request.input).await {
            Ok(info) => info.duration,
            Err(e) => {
                debug!("No duration for progress reporting: {}", e);
                None
            }
        };

        let args = Self::build_args(&request);
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConverterError::conversion_failed(
                    &request.input,
                    format!("failed to spawn {}: {}", self.ffmpeg_bin.display(), e),
                    None,
                )
            })?;

        let pid = child.id();
        let capture_failed = |stream: &str| {
            ConverterError::conversion_failed(
                &request.input,
                format!("failed to capture FFmpeg {}", stream),
                None,
            )
        };
        let stdout = child.stdout.take().ok_or_else(|| capture_failed("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| capture_failed("stderr"))?;

        // Keep the tail of stderr for error reports
        let stderr_handle = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == 20 {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail.join("\n")
        });

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let timeout = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let mut parser = ProgressParser::new(total, pid);
        let mut progress_lines = BufReader::new(stdout).lines();
        let mut stdout_open = true;

        let status = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Cancelling FFmpeg (PID {:?}) for {}", pid, request.input.display());
                    let _ = child.kill().await;
                    return Err(ConverterError::Cancelled);
                }
                _ = &mut timeout => {
                    let _ = child.kill().await;
                    return Err(ConverterError::Timeout {
                        secs: self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                    });
                }
                line = progress_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if let Some(progress) = parser.feed(&line) {
                            let _ = progress_tx.send(progress).await;
                        }
                    }
                    _ => stdout_open = false,
                },
                status = child.wait(), if !stdout_open => {
                    break status?;
                }
            }
        };

        let stderr = stderr_handle.await.unwrap_or_default();

        if !status.success() {
            return Err(ConverterError::conversion_failed(
                &request.input,
                format!("FFmpeg exited with code {}", status.code().unwrap_or(-1)),
                Some(stderr),
            ));
        }

        debug!("FFmpeg finished: {}", request.output.display());
        Ok(())
    }
}
