use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{CacheStats, LruCache};
use crate::{
    analysis::{Spectrogram, Waveform},
    audio::DecodedAudio,
    config::CacheConfig,
};

/// Cache key for a generated artifact: the source identity plus the output
/// dimensions. Waveforms have no height.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub resource_key: String,
    pub width: usize,
    pub height: Option<usize>,
}

impl ArtifactKey {
    pub fn waveform(resource_key: impl Into<String>, width: usize) -> Self {
        Self {
            resource_key: resource_key.into(),
            width,
            height: None,
        }
    }

    pub fn spectrogram(resource_key: impl Into<String>, width: usize, height: usize) -> Self {
        Self {
            resource_key: resource_key.into(),
            width,
            height: Some(height),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.height {
            Some(height) => write!(f, "{}@{}x{}", self.resource_key, self.width, height),
            None => write!(f, "{}@{}", self.resource_key, self.width),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheManagerStats {
    pub audio: CacheStats,
    pub waveform: CacheStats,
    pub spectrogram: CacheStats,
}

/// Owns the decoded-audio, waveform and spectrogram caches.
///
/// Decoded audio is keyed by resource alone since it does not depend on
/// output dimensions; artifacts are keyed by [`ArtifactKey`].
#[derive(Debug)]
pub struct CacheManager {
    audio: LruCache<String, Arc<DecodedAudio>>,
    waveforms: LruCache<ArtifactKey, Arc<Waveform>>,
    spectrograms: LruCache<ArtifactKey, Arc<Spectrogram>>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl CacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            audio: LruCache::new(config.audio_capacity),
            waveforms: LruCache::new(config.waveform_capacity),
            spectrograms: LruCache::new(config.spectrogram_capacity),
        }
    }

    pub fn get_audio(&self, resource_key: &str) -> Option<Arc<DecodedAudio>> {
        self.audio.get(resource_key)
    }

    pub fn set_audio(&self, resource_key: &str, audio: Arc<DecodedAudio>) {
        if let Some((evicted, _)) = self.audio.set(resource_key.to_string(), audio) {
            tracing::trace!(resource_key = %evicted, "evicted decoded audio");
        }
    }

    pub fn get_waveform(&self, resource_key: &str, width: usize) -> Option<Arc<Waveform>> {
        self.waveforms.get(&ArtifactKey::waveform(resource_key, width))
    }

    pub fn set_waveform(&self, resource_key: &str, width: usize, waveform: Arc<Waveform>) {
        let key = ArtifactKey::waveform(resource_key, width);
        if let Some((evicted, _)) = self.waveforms.set(key, waveform) {
            tracing::trace!(key = %evicted, "evicted waveform");
        }
    }

    pub fn get_spectrogram(
        &self,
        resource_key: &str,
        width: usize,
        height: usize,
    ) -> Option<Arc<Spectrogram>> {
        self.spectrograms
            .get(&ArtifactKey::spectrogram(resource_key, width, height))
    }

    pub fn set_spectrogram(
        &self,
        resource_key: &str,
        width: usize,
        height: usize,
        spectrogram: Arc<Spectrogram>,
    ) {
        let key = ArtifactKey::spectrogram(resource_key, width, height);
        if let Some((evicted, _)) = self.spectrograms.set(key, spectrogram) {
            tracing::trace!(key = %evicted, "evicted spectrogram");
        }
    }

    /// Drops the decoded audio and every artifact derived from
    /// `resource_key`, e.g. after the source file changed. Returns the
    /// number of entries removed.
    pub fn remove_resource(&self, resource_key: &str) -> usize {
        let mut removed = usize::from(self.audio.delete(resource_key).is_some());

        for key in self.waveforms.keys() {
            if key.resource_key == resource_key && self.waveforms.delete(&key).is_some() {
                removed += 1;
            }
        }
        for key in self.spectrograms.keys() {
            if key.resource_key == resource_key && self.spectrograms.delete(&key).is_some() {
                removed += 1;
            }
        }

        tracing::debug!(resource_key, removed, "invalidated cached resource");
        removed
    }

    pub fn clear(&self) {
        self.audio.clear();
        self.waveforms.clear();
        self.spectrograms.clear();
    }

    pub fn stats(&self) -> CacheManagerStats {
        CacheManagerStats {
            audio: self.audio.stats(),
            waveform: self.waveforms.stats(),
            spectrogram: self.spectrograms.stats(),
        }
    }
}
