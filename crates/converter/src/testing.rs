//! In-process stand-in for ffmpeg used by unit tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::error::{ConverterError, Result};
use crate::ffmpeg::{ConversionProgress, ConversionRequest, MediaEngine};
use crate::ffprobe::{MediaInfo, StreamInfo};
use crate::formats::MediaKind;

/// Writes `output_bytes` (if any) for every conversion and answers probes from a
/// fixed stream description. File names listed in `corrupt` fail to probe,
/// names in `failing` fail to convert.
pub struct MockEngine {
    pub probe_stream: Option<(MediaKind, String)>,
    /// `None` reports success without producing a file
    pub output_bytes: Option<Vec<u8>>,
    pub corrupt: Mutex<HashSet<String>>,
    pub failing: Mutex<HashSet<String>>,
    /// Cancel the run's token after this many successful conversions
    pub cancel_after: Option<usize>,
    /// Report cancellation from inside the engine instead of finishing
    pub abort_on_cancel: bool,
    pub probes: AtomicUsize,
    pub converts: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        MockEngine {
            probe_stream: None,
            output_bytes: Some(b"converted".to_vec()),
            corrupt: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            cancel_after: None,
            abort_on_cancel: false,
            probes: AtomicUsize::new(0),
            converts: AtomicUsize::new(0),
        }
    }
}

impl MockEngine {
    pub fn probing_as(kind: MediaKind, codec: &str) -> Self {
        MockEngine {
            probe_stream: Some((kind, codec.to_string())),
            ..Default::default()
        }
    }

    pub fn mark_corrupt(&self, name: &str) {
        self.corrupt.lock().unwrap().insert(name.to_string());
    }

    pub fn mark_failing(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn convert_count(&self) -> usize {
        self.converts.load(Ordering::SeqCst)
    }
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl MediaEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.corrupt.lock().unwrap().contains(&name_of(path)) {
            return Err(ConverterError::probe_failed(
                path,
                "invalid data found when processing input",
            ));
        }
        let streams = self
            .probe_stream
            .iter()
            .map(|(kind, codec)| StreamInfo {
                kind: Some(*kind),
                codec: Some(codec.clone()),
            })
            .collect();
        Ok(MediaInfo {
            streams,
            duration: Some(Duration::from_secs(10)),
        })
    }

    async fn convert(
        &self,
        request: ConversionRequest,
        progress_tx: mpsc::Sender<ConversionProgress>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self.failing.lock().unwrap().contains(&name_of(&request.input)) {
            return Err(ConverterError::conversion_failed(
                &request.input,
                "FFmpeg exited with code 1",
                Some("moov atom not found".to_string()),
            ));
        }

        for (percent, secs) in [(0u8, 0u64), (50, 5), (50, 5), (100, 10)] {
            let _ = progress_tx
                .send(ConversionProgress {
                    percent,
                    position: Duration::from_secs(secs),
                    total: Some(Duration::from_secs(10)),
                    pid: Some(4242),
                })
                .await;
        }

        if let Some(bytes) = &self.output_bytes {
            std::fs::write(&request.output, bytes)?;
        }
        let done = self.converts.fetch_add(1, Ordering::SeqCst) + 1;

        if self.cancel_after == Some(done) {
            cancel.cancel();
            if self.abort_on_cancel {
                return Err(ConverterError::Cancelled);
            }
        }
        Ok(())
    }
}
