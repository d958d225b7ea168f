use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use log::debug;
use serde::Deserialize;
use tokio::process::Command;
use crate::error::{ConverterError, Result};
use crate::formats::MediaKind;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
}

/// Stream summary used by the completion classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub kind: Option<MediaKind>,
    pub codec: Option<String>,
}

/// What the classifier and the progress reporter need from a probe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub streams: Vec<StreamInfo>,
    pub duration: Option<Duration>,
}

impl MediaInfo {
    /// Whether a stream of `kind` is encoded with `codec`
    pub fn has_stream(&self, kind: MediaKind, codec: &str) -> bool {
        self.streams.iter().any(|s| {
            s.kind == Some(kind)
                && s.codec
                    .as_deref()
                    .map(|c| c.eq_ignore_ascii_case(codec))
                    .unwrap_or(false)
        })
    }
}

impl From<FFProbeData> for MediaInfo {
    fn from(data: FFProbeData) -> Self {
        let streams = data
            .streams
            .into_iter()
            .map(|s| StreamInfo {
                kind: match s.codec_type.as_deref() {
                    Some("video") => Some(MediaKind::Video),
                    Some("audio") => Some(MediaKind::Audio),
                    _ => None,
                },
                codec: s.codec_name,
            })
            .collect();

        let duration = data
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|secs| *secs > 0.0 && *secs < 1e12)
            .map(Duration::from_secs_f64);

        MediaInfo { streams, duration }
    }
}

/// Parse `ffprobe -print_format json` output
pub fn parse_probe_output(path: &Path, json: &str) -> Result<MediaInfo> {
    let data: FFProbeData = serde_json::from_str(json).map_err(|e| {
        ConverterError::probe_failed(path, format!("invalid ffprobe JSON: {}", e))
    })?;
    Ok(data.into())
}

/// Run ffprobe on `file_path` and parse the JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<MediaInfo> {
    // Verify file exists before trying to probe
    if !file_path.exists() {
        return Err(ConverterError::probe_failed(file_path, "file does not exist"));
    }

    debug!("Executing FFprobe for: {}", file_path.display());

    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            ConverterError::probe_failed(
                file_path,
                format!("failed to execute {}: {}", ffprobe_bin.display(), e),
            )
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        return Err(ConverterError::probe_failed(
            file_path,
            format!("ffprobe exit code {}: {}", exit_code, stderr.trim()),
        ));
    }

    let json_str = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(file_path, &json_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920},
            {"index": 1, "codec_type": "audio", "codec_name": "aac"},
            {"index": 2, "codec_type": "subtitle", "codec_name": "mov_text"}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "125.500000", "bit_rate": "812345"}
    }"#;

    #[test]
    fn test_parse_streams_and_duration() {
        let info = parse_probe_output(Path::new("a.mp4"), SAMPLE).unwrap();
        assert_eq!(info.streams.len(), 3);
        assert_eq!(info.streams[0].kind, Some(MediaKind::Video));
        assert_eq!(info.streams[2].kind, None);
        assert_eq!(info.duration, Some(Duration::from_millis(125_500)));
    }

    #[test]
    fn test_has_stream_checks_kind_and_codec() {
        let info = parse_probe_output(Path::new("a.mp4"), SAMPLE).unwrap();
        assert!(info.has_stream(MediaKind::Video, "h264"));
        assert!(info.has_stream(MediaKind::Audio, "AAC"));
        assert!(!info.has_stream(MediaKind::Audio, "h264"));
        assert!(!info.has_stream(MediaKind::Video, "hevc"));
    }

    #[test]
    fn test_missing_format_and_bad_duration() {
        let info = parse_probe_output(
            Path::new("a.mp3"),
            r#"{"streams": [{"index": 0, "codec_type": "audio", "codec_name": "mp3"}]}"#,
        )
        .unwrap();
        assert_eq!(info.duration, None);

        let info = parse_probe_output(
            Path::new("a.mp3"),
            r#"{"streams": [], "format": {"duration": "N/A"}}"#,
        )
        .unwrap();
        assert_eq!(info.duration, None);
        assert!(info.streams.is_empty());
    }

    #[test]
    fn test_garbage_output_is_rejected() {
        let err = parse_probe_output(Path::new("bad.mkv"), "not json").unwrap_err();
        assert!(matches!(err, ConverterError::ProbeFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let err = probe_file(Path::new("ffprobe"), Path::new("/no/such/file.mkv"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConverterError::ProbeFailed { .. }));
    }
}
