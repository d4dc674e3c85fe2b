//! Stateful sample-rate conversion for one playback run.
//!
//! Chunks are pushed through a single FFT resampler, so chunk boundaries do
//! not restart the filter and the output length over a whole run matches
//! `input_len * to / from` exactly once [`StreamResampler::flush`] is called.

use rubato::{FftFixedIn, Resampler};

use crate::error::{Error, Result};

/// Input frames per FFT block. Bounds how much of a chunk is held back
/// until the next one arrives (10 ms at 24 kHz).
pub const BLOCK_FRAMES: usize = 240;

pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
    /// Filter delay in output frames
    delay: usize,
    /// Leading output frames still to drop
    skip: usize,
    consumed: u64,
    emitted: u64,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let mut resampler = Self {
            from_rate,
            to_rate,
            inner: None,
            pending: Vec::new(),
            delay: 0,
            skip: 0,
            consumed: 0,
            emitted: 0,
        };
        resampler.reset()?;
        Ok(resampler)
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Output frames a chunk may lag behind its nominal position: one
    /// held-back block plus the filter delay.
    pub fn max_lag_frames(&self) -> u64 {
        match self.inner.as_ref() {
            None => 0,
            Some(inner) => {
                let block = inner.input_frames_max() as u64;
                (block * u64::from(self.to_rate)).div_ceil(u64::from(self.from_rate)) + self.delay as u64
            }
        }
    }

    /// Start a fresh run, dropping any held-back input.
    pub fn reset(&mut self) -> Result<()> {
        self.pending.clear();
        self.consumed = 0;
        self.emitted = 0;
        if self.from_rate == self.to_rate {
            self.inner = None;
            self.delay = 0;
            self.skip = 0;
            return Ok(());
        }

        let inner = FftFixedIn::<f32>::new(
            self.from_rate as usize,
            self.to_rate as usize,
            BLOCK_FRAMES,
            1,
            1,
        )
        .map_err(|e| Error::Device(format!("resampler init failed: {}", e)))?;
        self.delay = inner.output_delay();
        self.skip = self.delay;
        self.inner = Some(inner);
        Ok(())
    }

    /// Convert the next piece of the stream. Up to one block of input may be
    /// held back until more arrives or the run is flushed.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.consumed += samples.len() as u64;
        if self.inner.is_none() {
            self.emitted += samples.len() as u64;
            return Ok(samples.to_vec());
        }

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = match self.inner.as_ref() {
                Some(inner) => inner.input_frames_next(),
                None => break,
            };
            if self.pending.len() < needed {
                break;
            }
            let block: Vec<f32> = self.pending.drain(..needed).collect();
            self.run_block(block, &mut out)?;
        }
        Ok(out)
    }

    /// Emit the held-back tail of the run and start a new one.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        if self.inner.is_some() && self.consumed > 0 {
            let expected = self.expected_frames();
            // zero padding pushes the last real samples through the filter
            let mut guard = 0;
            while self.emitted < expected && guard < 64 {
                let needed = match self.inner.as_ref() {
                    Some(inner) => inner.input_frames_next(),
                    None => break,
                };
                let mut block = std::mem::take(&mut self.pending);
                block.resize(needed, 0.0);
                self.run_block(block, &mut out)?;
                guard += 1;
            }
            let excess = (self.emitted.saturating_sub(expected)) as usize;
            out.truncate(out.len().saturating_sub(excess));
        }
        self.reset()?;
        Ok(out)
    }

    fn expected_frames(&self) -> u64 {
        (self.consumed * u64::from(self.to_rate) + u64::from(self.from_rate) / 2)
            / u64::from(self.from_rate)
    }

    fn run_block(&mut self, block: Vec<f32>, out: &mut Vec<f32>) -> Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(());
        };
        let result = inner
            .process(&[block], None)
            .map_err(|e| Error::Device(format!("resample failed: {}", e)))?;
        let Some(channel) = result.into_iter().next() else {
            return Ok(());
        };

        let dropped = self.skip.min(channel.len());
        self.skip -= dropped;
        self.emitted += (channel.len() - dropped) as u64;
        out.extend_from_slice(&channel[dropped..]);
        Ok(())
    }
}
