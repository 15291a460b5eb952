use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::WaveviewError;

const MAGMA_STOPS: [(f32, [f32; 3]); 5] = [
    (0.0, [0.0, 0.0, 3.0]),
    (0.25, [30.0, 16.0, 68.0]),
    (0.5, [83.0, 18.0, 123.0]),
    (0.75, [187.0, 55.0, 84.0]),
    (1.0, [251.0, 252.0, 73.0]),
];
const MAGMA_GAMMA: f32 = 0.4;
const MAGMA_BOOST_PIVOT: f32 = 0.85;
const MAGMA_BOOST_STRENGTH: f32 = 0.6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Colour ramps used to display normalised magnitudes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Palette {
    /// Black, red, yellow, white.
    #[default]
    Hot,
    Grayscale,
    /// Perceptual dark-purple to yellow ramp with boosted highlights.
    Magma,
}

impl Palette {
    /// Maps `value` to a colour. Values outside [0, 1] are clamped and NaN is
    /// treated as zero.
    pub fn color(self, value: f32) -> Rgb {
        let t = if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, 1.0)
        };

        match self {
            Palette::Hot => hot(t),
            Palette::Grayscale => {
                let level = to_channel(t * 255.0);
                Rgb::new(level, level, level)
            }
            Palette::Magma => magma(t),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Palette::Hot => "hot",
            Palette::Grayscale => "grayscale",
            Palette::Magma => "magma",
        }
    }
}

impl FromStr for Palette {
    type Err = WaveviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(Palette::Hot),
            "grayscale" | "greyscale" | "gray" | "grey" => Ok(Palette::Grayscale),
            "magma" => Ok(Palette::Magma),
            other => Err(WaveviewError::validation(format!("unknown palette `{other}`"))),
        }
    }
}

fn hot(t: f32) -> Rgb {
    let third = 1.0 / 3.0;
    let r = (t / third).min(1.0);
    let g = ((t - third) / third).clamp(0.0, 1.0);
    let b = ((t - 2.0 * third) / third).clamp(0.0, 1.0);
    Rgb::new(to_channel(r * 255.0), to_channel(g * 255.0), to_channel(b * 255.0))
}

fn magma(t: f32) -> Rgb {
    let mut t = t.powf(MAGMA_GAMMA);
    if t > MAGMA_BOOST_PIVOT {
        t = MAGMA_BOOST_PIVOT + (t - MAGMA_BOOST_PIVOT) * (1.0 + MAGMA_BOOST_STRENGTH);
    }
    let t = t.clamp(0.0, 1.0);

    let upper = MAGMA_STOPS
        .iter()
        .position(|(stop, _)| *stop >= t)
        .unwrap_or(MAGMA_STOPS.len() - 1)
        .max(1);
    let (t0, c0) = MAGMA_STOPS[upper - 1];
    let (t1, c1) = MAGMA_STOPS[upper];
    let fraction = (t - t0) / (t1 - t0);
    let channel = |i: usize| to_channel(c0[i] + (c1[i] - c0[i]) * fraction);

    Rgb::new(channel(0), channel(1), channel(2))
}

fn to_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
