//! Stateless signal processing: RMS waveform envelopes, windowed FFT
//! spectrograms and the helpers shared between them.

mod spectrogram;

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{Result, WaveviewError};

pub use spectrogram::{
    choose_fft_size, spectrogram, MagnitudeScale, Spectrogram, SpectrogramParams, MAX_FFT_SIZE,
};

/// Minimum and maximum sample of one waveform column, scaled by the absolute
/// peak of the analysed audio so both lie in [-1, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub min: f32,
    pub max: f32,
}

impl Peak {
    fn of(samples: &[f32]) -> Self {
        samples.iter().fold(
            Peak {
                min: f32::MAX,
                max: f32::MIN,
            },
            |acc, &sample| Peak {
                min: acc.min.min(sample),
                max: acc.max.max(sample),
            },
        )
    }

    fn magnitude(&self) -> f32 {
        self.min.abs().max(self.max.abs())
    }
}

/// Amplitude overview of a buffer at a fixed horizontal resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    /// Per-column RMS normalised by the loudest column, in [0, 1].
    pub rms: Vec<f32>,
    pub peaks: Vec<Peak>,
}

impl Waveform {
    pub fn width(&self) -> usize {
        self.rms.len()
    }
}

/// Reduces `samples` to `width` RMS values.
///
/// The buffer is split into `width` contiguous blocks of `len / width`
/// samples and any trailing remainder is ignored. When the buffer is shorter
/// than `width` each column takes a single sample instead. Values are divided
/// by the global maximum, so silence produces zeros rather than NaN.
pub fn downsample(samples: &[f32], width: usize) -> Result<Waveform> {
    if samples.is_empty() {
        return Err(WaveviewError::validation(
            "waveform requires at least one sample",
        ));
    }
    if width == 0 {
        return Err(WaveviewError::validation("waveform width must be positive"));
    }

    let len = samples.len();
    let block = len / width;
    let mut rms = Vec::with_capacity(width);
    let mut peaks = Vec::with_capacity(width);

    for column in 0..width {
        let block_samples = if block == 0 {
            let index = column * len / width;
            &samples[index..index + 1]
        } else {
            &samples[column * block..(column + 1) * block]
        };
        rms.push(compute_rms(block_samples));
        peaks.push(Peak::of(block_samples));
    }

    normalize_by_max(&mut rms);

    let peak = peaks.iter().map(Peak::magnitude).fold(0.0_f32, f32::max);
    for pair in &mut peaks {
        if peak > 0.0 && peak.is_finite() {
            pair.min /= peak;
            pair.max /= peak;
        } else {
            *pair = Peak::default();
        }
    }

    Ok(Waveform { rms, peaks })
}

/// Averages interleaved frames into a single channel. Non-finite samples
/// are treated as silence.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let sanitize = |sample: f32| if sample.is_finite() { sample } else { 0.0 };
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return interleaved.iter().copied().map(sanitize).collect();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().copied().map(sanitize).sum::<f32>() / channels as f32)
        .collect()
}

/// Divides every value by the largest one. Non-finite values become zero
/// and a non-positive maximum zeroes the slice.
pub(crate) fn normalize_by_max(values: &mut [f32]) {
    for value in values.iter_mut().filter(|value| !value.is_finite()) {
        *value = 0.0;
    }
    let max = values.iter().copied().fold(0.0_f32, f32::max);
    if max > 0.0 && max.is_finite() {
        for value in values.iter_mut() {
            *value = (*value / max).clamp(0.0, 1.0);
        }
    } else {
        values.fill(0.0);
    }
}

pub(crate) fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&sample| f64::from(sample) * f64::from(sample)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

pub(crate) fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
