use std::{io::Cursor, path::PathBuf};

use async_trait::async_trait;
use hound::SampleFormat;

use crate::{analysis::downmix_to_mono, Result, WaveviewError};

/// PCM produced by [`AudioSource::decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved samples in [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Collapses the buffer to a single channel.
    pub fn into_mono(self) -> Self {
        Self {
            samples: downmix_to_mono(&self.samples, self.channels),
            sample_rate: self.sample_rate,
            channels: 1,
        }
    }

    pub fn duration_seconds(&self) -> f32 {
        let frames = self.samples.len() / self.channels.max(1) as usize;
        frames as f32 / self.sample_rate.max(1) as f32
    }
}

/// Acquires and decodes the audio behind a source reference.
///
/// Neither step is retried by the scheduler; implementations that want
/// retries own that policy.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Loads the raw bytes for `source`. Failures should be reported as
    /// [`WaveviewError::Transport`].
    async fn fetch(&self, source: &str) -> Result<Vec<u8>>;

    /// Turns raw bytes into PCM. Failures should be reported as
    /// [`WaveviewError::Decode`].
    async fn decode(&self, bytes: Vec<u8>) -> Result<DecodedAudio>;
}

/// Reads WAV files from the local filesystem. Source references are paths,
/// resolved against an optional root directory.
#[derive(Debug, Clone, Default)]
pub struct FileAudioSource {
    root: Option<PathBuf>,
}

impl FileAudioSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, source: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(source),
            None => PathBuf::from(source),
        }
    }
}

#[async_trait]
impl AudioSource for FileAudioSource {
    async fn fetch(&self, source: &str) -> Result<Vec<u8>> {
        let path = self.resolve(source);
        tokio::fs::read(&path)
            .await
            .map_err(|error| WaveviewError::Transport(format!("{}: {error}", path.display())))
    }

    async fn decode(&self, bytes: Vec<u8>) -> Result<DecodedAudio> {
        tokio::task::spawn_blocking(move || decode_wav(&bytes))
            .await
            .map_err(|error| WaveviewError::Decode(format!("decoder task failed: {error}")))?
    }
}

/// Decodes WAV bytes into interleaved float samples.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|error| WaveviewError::Decode(format!("invalid wav: {error}")))?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>(),
        SampleFormat::Int => {
            let scale = (1_i64 << spec.bits_per_sample.saturating_sub(1)).max(1) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
        }
    }
    .map_err(|error| WaveviewError::Decode(format!("sample error: {error}")))?;

    Ok(DecodedAudio::new(samples, spec.sample_rate, spec.channels))
}
