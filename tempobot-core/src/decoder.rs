//! External decoder subprocess driver.
//!
//! Decoding is delegated entirely to ffmpeg: one child process per track,
//! seeked to the requested start offset, writing s16le / 48kHz / 2ch PCM to
//! its stdout. Seeking after a pause is a process restart with a new `-ss`,
//! not an in-process seek. The child is killed explicitly whenever the copy
//! loop lets go of the stream, so interrupted playback never leaves an
//! orphaned decoder behind.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::debug;

use tempobot_common::Error;

/// Output byte rate of the fixed PCM format: 48000 Hz * 2 channels * 2
/// bytes per sample.
pub const PCM_BYTES_PER_SECOND: u64 = 192_000;

/// Map a copied byte count back to playback time.
pub fn pcm_duration(bytes: u64) -> Duration {
    Duration::from_millis(bytes * 1_000 / PCM_BYTES_PER_SECOND)
}

#[async_trait]
pub trait PcmDecoder: Send + Sync {
    /// Spawn a decoder for `stream_url`, seeked to `start_at`.
    async fn spawn(&self, stream_url: &str, start_at: Duration) -> Result<PcmStream, Error>;
}

/// A live PCM byte stream plus the subprocess (if any) producing it.
pub struct PcmStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<Child>,
}

impl PcmStream {
    pub fn from_child(mut child: Child) -> Result<Self, Error> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Decoder("decoder child has no stdout handle".into()))?;
        Ok(Self {
            reader: Box::new(stdout),
            child: Some(child),
        })
    }

    /// For test decoders that synthesize PCM without a subprocess.
    pub fn from_reader(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            reader,
            child: None,
        }
    }

    pub fn reader_mut(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut *self.reader
    }

    /// Kill the decoder subprocess if it is still alive and reap it.
    pub async fn shutdown(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

pub struct FfmpegDecoder {
    binary: String,
}

impl FfmpegDecoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl PcmDecoder for FfmpegDecoder {
    async fn spawn(&self, stream_url: &str, start_at: Duration) -> Result<PcmStream, Error> {
        let offset = format!("{}.{:03}", start_at.as_secs(), start_at.subsec_millis());
        debug!("spawning {} for stream (offset {offset}s)", self.binary);

        let child = Command::new(&self.binary)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-ss")
            .arg(&offset)
            .arg("-i")
            .arg(stream_url)
            .arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg("48000")
            .arg("-ac")
            .arg("2")
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Decoder(format!("failed to spawn {}: {e}", self.binary)))?;

        PcmStream::from_child(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_byte_math_round_trips_whole_seconds() {
        assert_eq!(pcm_duration(PCM_BYTES_PER_SECOND * 3), Duration::from_secs(3));
        assert_eq!(pcm_duration(0), Duration::ZERO);
        // Half a second of PCM.
        assert_eq!(pcm_duration(96_000), Duration::from_millis(500));
    }
}
