use std::fmt;
use serde::{Deserialize, Serialize};
use crate::error::{ConverterError, Result};

/// Media kind of an output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// ffprobe `codec_type` value for streams of this kind
    pub fn codec_type(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// ffmpeg codec selector flag for this kind
    pub fn codec_flag(&self) -> &'static str {
        match self {
            MediaKind::Audio => "-c:a",
            MediaKind::Video => "-c:v",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.codec_type())
    }
}

/// An output format from the static catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFormat {
    /// Container extension without the dot, e.g. "mp4"
    pub id: &'static str,
    pub kind: MediaKind,
    /// Codec name ffprobe reports for a finished file
    pub target_codec: &'static str,
    /// ffmpeg encoder producing `target_codec`
    pub encoder: &'static str,
}

impl MediaFormat {
    const fn video(id: &'static str, target_codec: &'static str, encoder: &'static str) -> Self {
        Self { id, kind: MediaKind::Video, target_codec, encoder }
    }

    const fn audio(id: &'static str, target_codec: &'static str, encoder: &'static str) -> Self {
        Self { id, kind: MediaKind::Audio, target_codec, encoder }
    }

    /// Every extension of this format's kind is eligible input
    pub fn input_extensions(&self) -> &'static [&'static str] {
        input_extensions(self)
    }

    /// Check whether a bare extension names this format
    pub fn matches_extension(&self, ext: &str) -> bool {
        ext.eq_ignore_ascii_case(self.id)
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.id, self.kind, self.target_codec)
    }
}

static VIDEO_FORMATS: &[MediaFormat] = &[
    MediaFormat::video("webm", "vp9", "libvpx-vp9"),
    MediaFormat::video("mp4", "h264", "libx264"),
    MediaFormat::video("mkv", "h264", "libx264"),
    MediaFormat::video("mov", "h264", "libx264"),
    MediaFormat::video("flv", "flv1", "flv"),
    MediaFormat::video("wmv", "wmv2", "wmv2"),
    MediaFormat::video("mpg", "mpeg2video", "mpeg2video"),
    MediaFormat::video("ts", "h264", "libx264"),
    MediaFormat::video("avi", "mpeg4", "mpeg4"),
    MediaFormat::video("m2ts", "h264", "libx264"),
    MediaFormat::video("mts", "h264", "libx264"),
    MediaFormat::video("m2t", "h264", "libx264"),
];

static AUDIO_FORMATS: &[MediaFormat] = &[
    MediaFormat::audio("mp3", "mp3", "libmp3lame"),
    MediaFormat::audio("m4a", "aac", "aac"),
    MediaFormat::audio("flac", "flac", "flac"),
    MediaFormat::audio("wav", "pcm_s16le", "pcm_s16le"),
    MediaFormat::audio("ogg", "vorbis", "libvorbis"),
];

static VIDEO_EXTENSIONS: &[&str] = &[
    "webm", "mp4", "mkv", "mov", "flv", "wmv", "mpg", "ts", "avi", "m2ts", "mts", "m2t",
];

static AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "flac", "wav", "ogg"];

/// Resolve a user supplied output format token such as ".MP4 " to a catalog entry
pub fn resolve(token: &str) -> Result<&'static MediaFormat> {
    let normalized = token.trim().trim_start_matches('.').trim().to_lowercase();

    VIDEO_FORMATS
        .iter()
        .chain(AUDIO_FORMATS.iter())
        .find(|f| f.id == normalized)
        .ok_or_else(|| ConverterError::UnsupportedFormat {
            token: token.to_string(),
        })
}

/// Extensions eligible for conversion to `format`
pub fn input_extensions(format: &MediaFormat) -> &'static [&'static str] {
    match format.kind {
        MediaKind::Video => VIDEO_EXTENSIONS,
        MediaKind::Audio => AUDIO_EXTENSIONS,
    }
}

/// All catalog entries, video first
pub fn all_formats() -> impl Iterator<Item = &'static MediaFormat> {
    VIDEO_FORMATS.iter().chain(AUDIO_FORMATS.iter())
}
