//! Core library for waveview.
//!
//! Audio resources are turned into waveform overviews and spectrograms by a
//! background [`TaskScheduler`]. Decoded audio and finished artifacts are
//! kept in bounded LRU caches so repeated requests for the same resource and
//! size are served without touching the audio source again.

pub mod analysis;
pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod palette;
pub mod scheduler;

pub use analysis::{MagnitudeScale, Peak, Spectrogram, SpectrogramParams, Waveform};
pub use audio::{AudioSource, DecodedAudio, FileAudioSource};
pub use cache::{ArtifactKey, CacheManager, CacheManagerStats, CacheStats, LruCache};
pub use config::{AnalysisConfig, AppConfig, CacheConfig, SchedulerConfig};
pub use error::{Result, WaveviewError};
pub use palette::{Palette, Rgb};
pub use scheduler::{
    Artifacts, CompletionEvent, Dimensions, ErrorEvent, Priority, ProgressEvent, QueueStats,
    Subscription, Task, TaskId, TaskKind, TaskRequest, TaskScheduler, TaskStatus,
};
