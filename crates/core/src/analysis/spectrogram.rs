use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};

use super::{hann_value, normalize_by_max};
use crate::{Result, WaveviewError};

const MIN_AUTO_FFT: usize = 1024;
const MAX_AUTO_FFT: usize = 4096;
/// Largest configurable frame length.
pub const MAX_FFT_SIZE: usize = 1 << 16;

/// How bin magnitudes are mapped into [0, 1] within one time slice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MagnitudeScale {
    /// Divide by the slice maximum.
    #[default]
    Linear,
    /// Map decibels relative to the slice maximum over `range_db`.
    Decibels { range_db: f32 },
}

impl MagnitudeScale {
    fn normalize(self, column: &mut [f32]) {
        match self {
            MagnitudeScale::Linear => normalize_by_max(column),
            MagnitudeScale::Decibels { range_db } => {
                let max = column.iter().copied().fold(0.0_f32, f32::max);
                if !(max > 0.0 && max.is_finite()) {
                    column.fill(0.0);
                    return;
                }
                let range = range_db.max(f32::EPSILON);
                for value in column.iter_mut() {
                    *value = if *value > 0.0 {
                        let relative_db = 20.0 * (*value / max).log10();
                        ((relative_db + range) / range).clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                }
            }
        }
    }
}

/// Inputs for [`spectrogram`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectrogramParams {
    pub width: usize,
    pub height: usize,
    pub sample_rate: u32,
    pub min_hz: f32,
    pub max_hz: f32,
    /// Frame length; rounded up to a power of two. `None` derives it from
    /// the buffer length.
    pub fft_size: Option<usize>,
    pub scale: MagnitudeScale,
}

impl SpectrogramParams {
    pub fn new(width: usize, height: usize, sample_rate: u32) -> Self {
        Self {
            width,
            height,
            sample_rate,
            min_hz: 20.0,
            max_hz: 20_000.0,
            fft_size: None,
            scale: MagnitudeScale::Linear,
        }
    }

    pub fn with_frequency_range(mut self, min_hz: f32, max_hz: f32) -> Self {
        self.min_hz = min_hz;
        self.max_hz = max_hz;
        self
    }

    pub fn with_fft_size(mut self, fft_size: Option<usize>) -> Self {
        self.fft_size = fft_size;
        self
    }

    pub fn with_scale(mut self, scale: MagnitudeScale) -> Self {
        self.scale = scale;
        self
    }

    fn frame_len(&self, sample_count: usize) -> Result<usize> {
        match self.fft_size {
            Some(size) if size > MAX_FFT_SIZE => Err(WaveviewError::validation(format!(
                "fft size {size} exceeds the maximum of {MAX_FFT_SIZE}"
            ))),
            Some(size) => Ok(size.max(2).next_power_of_two()),
            None => Ok(choose_fft_size(sample_count)),
        }
    }
}

/// Time/frequency magnitudes, `width` slices of `height` rows each. Row 0
/// is the lowest frequency of the requested range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrogram {
    pub width: usize,
    pub height: usize,
    pub columns: Vec<Vec<f32>>,
}

/// Picks an analysis frame length for a buffer: 1024 samples, doubled while
/// the buffer holds two frames, capped at 4096.
pub fn choose_fft_size(sample_count: usize) -> usize {
    let mut size = MIN_AUTO_FFT;
    while size * 2 <= sample_count && size < MAX_AUTO_FFT {
        size *= 2;
    }
    size
}

/// Computes a spectrogram from mono samples.
///
/// `width` Hann-windowed frames are spread evenly over the buffer (frames
/// running past the end are zero padded). Each magnitude spectrum is
/// restricted to `[min_hz, max_hz]`, with `max_hz` clamped to Nyquist, then
/// linearly resampled to `height` rows and normalised per slice.
pub fn spectrogram(samples: &[f32], params: &SpectrogramParams) -> Result<Spectrogram> {
    if samples.is_empty() {
        return Err(WaveviewError::validation(
            "spectrogram requires at least one sample",
        ));
    }
    if params.width == 0 || params.height == 0 {
        return Err(WaveviewError::validation(format!(
            "spectrogram dimensions must be positive, got {}x{}",
            params.width, params.height
        )));
    }
    if params.sample_rate == 0 {
        return Err(WaveviewError::validation("sample rate must be positive"));
    }

    let sample_rate = params.sample_rate as f32;
    let max_hz = params.max_hz.min(sample_rate * 0.5);
    if !(params.min_hz >= 0.0 && params.min_hz < max_hz) {
        return Err(WaveviewError::validation(format!(
            "invalid frequency range {}..{} Hz at {} Hz sample rate",
            params.min_hz, params.max_hz, params.sample_rate
        )));
    }

    let frame_len = params.frame_len(samples.len())?;
    let mut planner = RealFftPlanner::<f32>::new();
    let plan = planner.plan_fft_forward(frame_len);
    let mut input = plan.make_input_vec();
    let mut spectrum = plan.make_output_vec();
    let mut scratch = plan.make_scratch_vec();
    let window: Vec<f32> = (0..frame_len).map(|i| hann_value(i, frame_len)).collect();
    let mut magnitudes = vec![0.0_f32; spectrum.len()];

    let bin_hz = sample_rate / frame_len as f32;
    let low_bin = params.min_hz / bin_hz;
    let high_bin = max_hz / bin_hz;

    let mut columns = Vec::with_capacity(params.width);
    for start in frame_starts(samples.len(), frame_len, params.width) {
        for (index, slot) in input.iter_mut().enumerate() {
            let sample = samples.get(start + index).copied().unwrap_or(0.0);
            *slot = sample * window[index];
        }

        plan.process_with_scratch(&mut input, &mut spectrum, &mut scratch)?;

        for (magnitude, bin) in magnitudes.iter_mut().zip(&spectrum) {
            *magnitude = bin.norm();
        }

        let mut column = resample_bins(&magnitudes, low_bin, high_bin, params.height);
        params.scale.normalize(&mut column);
        columns.push(column);
    }

    Ok(Spectrogram {
        width: params.width,
        height: params.height,
        columns,
    })
}

fn frame_starts(sample_count: usize, frame_len: usize, width: usize) -> impl Iterator<Item = usize> {
    let span = sample_count.saturating_sub(frame_len) as f64;
    let steps = width.saturating_sub(1).max(1) as f64;
    (0..width).map(move |i| (i as f64 * span / steps).round() as usize)
}

/// Linear interpolation of `bins` at `rows` evenly spaced fractional
/// positions between `low` and `high`.
fn resample_bins(bins: &[f32], low: f32, high: f32, rows: usize) -> Vec<f32> {
    let last = bins.len().saturating_sub(1);
    let step = if rows > 1 {
        (high - low) / (rows - 1) as f32
    } else {
        0.0
    };

    (0..rows)
        .map(|row| {
            let position = (low + step * row as f32).clamp(0.0, last as f32);
            let lower = position.floor() as usize;
            let upper = (lower + 1).min(last);
            let fraction = position - lower as f32;
            bins[lower] * (1.0 - fraction) + bins[upper] * fraction
        })
        .collect()
}
