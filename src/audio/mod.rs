//! audio - device contracts consumed by the voice pipeline
//!
//! The engines never talk to hardware directly. They see an output clock
//! that accepts scheduled buffers, a microphone that hands over captured
//! PCM, and a read-only analyzer tap for the visualizer. The ALSA backend
//! (feature `alsa`) runs real-time I/O on dedicated OS threads.

mod analyzer;
#[cfg(test)]
pub(crate) mod fake;
#[cfg_attr(not(feature = "alsa"), allow(dead_code))]
mod resample;
#[cfg_attr(not(feature = "alsa"), allow(dead_code))]
mod timeline;

#[cfg(feature = "alsa")]
mod alsa_device;
#[cfg(feature = "alsa")]
mod input;
#[cfg(feature = "alsa")]
mod output;

pub use analyzer::{LevelFrame, SignalAnalyzer};
#[cfg(feature = "alsa")]
pub use input::AlsaMicrophone;
#[cfg(feature = "alsa")]
pub use output::AlsaOutput;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Sample rate of inbound speech chunks and of the output clock target.
pub const CHUNK_SAMPLE_RATE: u32 = 24_000;

/// Identifies one scheduled chunk. Delivered back by the output device once
/// the chunk has finished rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackTicket {
    /// Bumped by every stop/reset; tickets from older generations are stale
    pub generation: u64,
    /// Arrival sequence of the chunk
    pub sequence: u64,
}

/// Output context: a monotonic clock plus sample-accurate scheduling.
pub trait AudioOutput: Send {
    /// Seconds elapsed on the device clock.
    fn current_time(&self) -> f64;

    /// Make sure the device is running, re-acquiring it if it was suspended.
    fn resume(&mut self) -> Result<()>;

    /// Render `samples` (mono, [`CHUNK_SAMPLE_RATE`]) starting at `start_at`
    /// seconds on the device clock. `ticket` is sent on the completion
    /// channel once the last sample has been rendered.
    fn schedule(&mut self, samples: Vec<f32>, start_at: f64, ticket: PlaybackTicket) -> Result<()>;

    /// Drop everything scheduled; no completion fires for dropped buffers.
    fn halt(&mut self);

    /// The queue ran dry: render whatever the output still holds back for
    /// the current run and start a fresh one.
    fn flush(&mut self);
}

/// An acquired microphone. Dropping it releases the device.
pub trait Microphone: Send {
    /// Native capture rate
    fn sample_rate(&self) -> u32;

    /// Mono samples captured since the previous call.
    fn take_samples(&mut self) -> Vec<i16>;

    /// Live tap over the captured signal.
    fn analyzer(&self) -> SignalAnalyzer;
}

/// Process-wide device factory.
#[async_trait]
pub trait AudioDevices: Send + Sync {
    async fn microphone(&self) -> Result<Box<dyn Microphone>>;

    async fn output(
        &self,
        completions: mpsc::UnboundedSender<PlaybackTicket>,
    ) -> Result<Box<dyn AudioOutput>>;
}

/// ALSA device configuration.
#[derive(Debug, Clone)]
pub struct AudioSettings {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Desired playback rate; the hardware may negotiate another one
    pub playback_sample_rate: u32,
    pub playback_channels: u32,
    /// Playback period size in frames (0 = let ALSA decide)
    pub playback_period_size: usize,
}

/// [`AudioDevices`] backed by ALSA.
#[cfg(feature = "alsa")]
pub struct AlsaDevices {
    settings: AudioSettings,
}

#[cfg(feature = "alsa")]
impl AlsaDevices {
    pub fn new(settings: AudioSettings) -> Self {
        Self { settings }
    }
}

#[cfg(feature = "alsa")]
#[async_trait]
impl AudioDevices for AlsaDevices {
    async fn microphone(&self) -> Result<Box<dyn Microphone>> {
        let device = self.settings.capture_device.clone();
        let mic = tokio::task::spawn_blocking(move || AlsaMicrophone::open(&device))
            .await
            .map_err(|e| crate::error::Error::Device(format!("capture open task failed: {}", e)))??;
        Ok(Box::new(mic))
    }

    async fn output(
        &self,
        completions: mpsc::UnboundedSender<PlaybackTicket>,
    ) -> Result<Box<dyn AudioOutput>> {
        let settings = self.settings.clone();
        let output = tokio::task::spawn_blocking(move || AlsaOutput::open(settings, completions))
            .await
            .map_err(|e| crate::error::Error::Device(format!("playback open task failed: {}", e)))??;
        Ok(Box::new(output))
    }
}

/// Decode little-endian 16-bit PCM into normalized floats (`sample / 32768`).
///
/// Callers must pass an even number of bytes; a trailing odd byte is ignored.
pub fn pcm16_to_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect()
}
