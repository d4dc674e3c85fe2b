//! Capture engine: microphone acquisition, periodic fragment encoding and
//! utterance finalization.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::audio::{AudioDevices, Microphone, SignalAnalyzer};
use crate::error::{Error, Result};

/// Container format of a finalized utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Pcm,
}

impl AudioFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Pcm => "audio/pcm",
        }
    }
}

/// Turns captured PCM into transmittable bytes.
///
/// `encode` is called once per capture tick and may return an empty
/// fragment; `finish` wraps the concatenated fragments of one utterance.
pub trait FragmentEncoder: Send {
    fn format(&self) -> AudioFormat;

    /// Reset per-utterance state.
    fn begin(&mut self, sample_rate: u32);

    fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>>;

    fn finish(&mut self, body: Vec<u8>) -> Result<Vec<u8>>;
}

/// Headerless s16le mono.
#[derive(Default)]
pub struct PcmEncoder;

impl FragmentEncoder for PcmEncoder {
    fn format(&self) -> AudioFormat {
        AudioFormat::Pcm
    }

    fn begin(&mut self, _sample_rate: u32) {}

    fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>> {
        Ok(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
    }

    fn finish(&mut self, body: Vec<u8>) -> Result<Vec<u8>> {
        Ok(body)
    }
}

/// RIFF/WAVE container around 16-bit mono PCM.
pub struct WavEncoder {
    sample_rate: u32,
}

impl Default for WavEncoder {
    fn default() -> Self {
        Self { sample_rate: 16_000 }
    }
}

impl FragmentEncoder for WavEncoder {
    fn format(&self) -> AudioFormat {
        AudioFormat::Wav
    }

    fn begin(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>> {
        PcmEncoder.encode(samples)
    }

    fn finish(&mut self, body: Vec<u8>) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = std::io::Cursor::new(Vec::with_capacity(body.len() + 44));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| Error::Encode(e.to_string()))?;
            for b in body.chunks_exact(2) {
                writer
                    .write_sample(i16::from_le_bytes([b[0], b[1]]))
                    .map_err(|e| Error::Encode(e.to_string()))?;
            }
            writer.finalize().map_err(|e| Error::Encode(e.to_string()))?;
        }

        Ok(cursor.into_inner())
    }
}

/// Build an encoder by its configured name.
pub fn create_encoder(name: &str) -> Result<Box<dyn FragmentEncoder>> {
    match name.to_ascii_lowercase().as_str() {
        "wav" => Ok(Box::new(WavEncoder::default())),
        "pcm" | "raw" => Ok(Box::new(PcmEncoder)),
        other => Err(Error::Encode(format!("unsupported encoder: {}", other))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Finalizing,
}

/// One finalized recording gesture, ready for `send_audio`.
#[derive(Debug, Clone)]
pub struct EncodedUtterance {
    pub format: AudioFormat,
    pub bytes: Bytes,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    /// Nothing was captured; nothing is sent
    Empty,
    Utterance(EncodedUtterance),
}

pub struct CaptureEngine {
    state: CaptureState,
    encoder: Box<dyn FragmentEncoder>,
    mic: Option<Box<dyn Microphone>>,
    buffer: Vec<Bytes>,
    samples: usize,
    sample_rate: u32,
}

impl CaptureEngine {
    pub fn new(encoder: Box<dyn FragmentEncoder>) -> Self {
        Self {
            state: CaptureState::Idle,
            encoder,
            mic: None,
            buffer: Vec::new(),
            samples: 0,
            sample_rate: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == CaptureState::Recording
    }

    /// Acquire the microphone and begin a new utterance. Returns the live
    /// analyzer for the visualizer.
    pub async fn start(&mut self, devices: &dyn AudioDevices) -> Result<SignalAnalyzer> {
        if self.state != CaptureState::Idle {
            return Err(Error::Device("capture already running".to_string()));
        }

        let mic = devices.microphone().await?;
        let analyzer = mic.analyzer();

        self.sample_rate = mic.sample_rate();
        self.encoder.begin(self.sample_rate);
        self.buffer.clear();
        self.samples = 0;
        self.mic = Some(mic);
        self.state = CaptureState::Recording;

        log::info!(
            "Capture started: rate={}, format={}",
            self.sample_rate,
            self.encoder.format().mime()
        );
        Ok(analyzer)
    }

    /// Drain captured PCM into one encoded fragment.
    pub fn tick(&mut self) -> Result<()> {
        if self.state != CaptureState::Recording {
            return Ok(());
        }
        let Some(mic) = self.mic.as_mut() else {
            return Ok(());
        };

        let pcm = mic.take_samples();
        if pcm.is_empty() {
            return Ok(());
        }
        let fragment = self.encoder.encode(&pcm)?;
        if fragment.is_empty() {
            return Ok(());
        }

        self.samples += pcm.len();
        self.buffer.push(Bytes::from(fragment));
        Ok(())
    }

    /// Final tick, release the microphone and finalize the utterance.
    pub fn stop(&mut self) -> Result<CaptureOutcome> {
        if self.state != CaptureState::Recording {
            return Ok(CaptureOutcome::Empty);
        }

        let last_tick = self.tick();
        self.state = CaptureState::Finalizing;
        self.mic = None;

        let result = last_tick.and_then(|_| self.finalize());
        self.buffer.clear();
        self.samples = 0;
        self.state = CaptureState::Idle;
        result
    }

    fn finalize(&mut self) -> Result<CaptureOutcome> {
        if self.buffer.is_empty() {
            log::info!("Capture stopped: no audio recorded");
            return Ok(CaptureOutcome::Empty);
        }

        let mut body = BytesMut::with_capacity(self.buffer.iter().map(Bytes::len).sum());
        for fragment in &self.buffer {
            body.extend_from_slice(fragment);
        }
        let bytes = self.encoder.finish(body.to_vec())?;

        let duration = Duration::from_secs_f64(self.samples as f64 / f64::from(self.sample_rate.max(1)));
        log::info!(
            "Capture stopped: {:.2}s at {} Hz, {} bytes {}",
            duration.as_secs_f64(),
            self.sample_rate,
            bytes.len(),
            self.encoder.format().mime()
        );

        Ok(CaptureOutcome::Utterance(EncodedUtterance {
            format: self.encoder.format(),
            bytes: Bytes::from(bytes),
            duration,
        }))
    }

    /// Drop the microphone and everything captured so far.
    pub fn abort(&mut self) {
        if self.mic.take().is_some() {
            log::info!("Capture aborted");
        }
        self.buffer.clear();
        self.samples = 0;
        self.state = CaptureState::Idle;
    }
}
