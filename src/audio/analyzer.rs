//! Read-only amplitude/frequency tap over a live signal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Samples kept for each snapshot.
const WINDOW: usize = 512;
/// Frequency bands per snapshot.
const BANDS: usize = 16;

/// One visualizer frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LevelFrame {
    pub rms: f32,
    pub peak: f32,
    /// Band magnitudes, low to high, roughly normalized to 0..1
    pub bands: Vec<f32>,
}

/// Shared sliding window fed by a capture thread and read by the visualizer.
#[derive(Debug, Clone, Default)]
pub struct SignalAnalyzer {
    window: Arc<Mutex<VecDeque<f32>>>,
}

impl SignalAnalyzer {
    pub fn new() -> Self {
        Self {
            window: Arc::new(Mutex::new(VecDeque::with_capacity(WINDOW))),
        }
    }

    /// Feed captured samples.
    pub fn push(&self, samples: &[i16]) {
        if let Ok(mut window) = self.window.lock() {
            for &s in samples {
                if window.len() == WINDOW {
                    window.pop_front();
                }
                window.push_back(f32::from(s) / 32768.0);
            }
        }
    }

    pub fn snapshot(&self) -> LevelFrame {
        let samples: Vec<f32> = match self.window.lock() {
            Ok(window) => window.iter().copied().collect(),
            Err(_) => return LevelFrame::default(),
        };
        if samples.is_empty() {
            return LevelFrame {
                bands: vec![0.0; BANDS],
                ..LevelFrame::default()
            };
        }

        let energy: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (energy / samples.len() as f32).sqrt();
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));

        LevelFrame {
            rms,
            peak,
            bands: band_magnitudes(&samples),
        }
    }
}

/// Naive DFT magnitudes over the lower half-spectrum, averaged into bands.
fn band_magnitudes(samples: &[f32]) -> Vec<f32> {
    let n = samples.len();
    let bins = n / 2;
    if bins == 0 {
        return vec![0.0; BANDS];
    }
    let per_band = (bins / BANDS).max(1);

    (0..BANDS)
        .map(|band| {
            let first = band * per_band;
            let last = (first + per_band).min(bins);
            if first >= last {
                return 0.0;
            }
            let sum: f32 = (first..last)
                .map(|k| {
                    let (mut re, mut im) = (0.0f32, 0.0f32);
                    for (i, &s) in samples.iter().enumerate() {
                        let phase = -2.0 * std::f32::consts::PI * (k * i) as f32 / n as f32;
                        re += s * phase.cos();
                        im += s * phase.sin();
                    }
                    (re * re + im * im).sqrt() * 2.0 / n as f32
                })
                .sum();
            sum / (last - first) as f32
        })
        .collect()
}
