use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{analysis::MagnitudeScale, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub analysis: AnalysisConfig,
}

impl AppConfig {
    /// Loads a JSON configuration file. Missing sections and fields keep
    /// their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_json_slice(&bytes)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Options that control admission and execution of generation tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on simultaneously running tasks. Zero is treated as one.
    pub max_concurrent: usize,
    /// When disabled pending tasks run in pure admission order.
    pub priority_enabled: bool,
    pub completed_retention_ms: u64,
    pub failed_retention_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            priority_enabled: true,
            completed_retention_ms: 5_000,
            failed_retention_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent.max(1)
    }

    /// How long a completed task stays visible to status queries.
    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }

    /// How long a failed task stays visible to status queries.
    pub fn failed_retention(&self) -> Duration {
        Duration::from_millis(self.failed_retention_ms)
    }
}

/// Entry limits for the three caches held by the cache manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub audio_capacity: usize,
    pub waveform_capacity: usize,
    pub spectrogram_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            audio_capacity: 20,
            waveform_capacity: 100,
            spectrogram_capacity: 50,
        }
    }
}

/// Configuration specific to the signal processing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Analysis frame length. `None` picks a size from the buffer length.
    pub fft_size: Option<usize>,
    pub min_hz: f32,
    pub max_hz: f32,
    pub default_width: usize,
    pub default_height: usize,
    pub scale: MagnitudeScale,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: None,
            min_hz: 20.0,
            max_hz: 20_000.0,
            default_width: 800,
            default_height: 200,
            scale: MagnitudeScale::Linear,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            AppConfig::from_json_slice(br#"{"scheduler":{"max_concurrent":1}}"#).unwrap();

        assert_eq!(config.scheduler.max_concurrent, 1);
        assert!(config.scheduler.priority_enabled);
        assert_eq!(config.cache.waveform_capacity, 100);
        assert_eq!(config.analysis.min_hz, 20.0);
        assert_eq!(config.analysis.scale, MagnitudeScale::Linear);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let config = SchedulerConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert_eq!(config.concurrency_limit(), 1);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = AppConfig::from_json_slice(b"{ nope").unwrap_err();
        assert!(matches!(err, crate::WaveviewError::Json(_)));
    }

    #[test]
    fn parses_decibel_scale() {
        let config = AppConfig::from_json_slice(
            br#"{"analysis":{"scale":{"decibels":{"range_db":80.0}}}}"#,
        )
        .unwrap();
        assert_eq!(
            config.analysis.scale,
            MagnitudeScale::Decibels { range_db: 80.0 }
        );
    }
}
