//! ALSA output context with a frame-counting clock.
//!
//! A dedicated thread keeps the PCM fed at all times: scheduled buffers are
//! placed on a [`Timeline`] and silence fills every gap, so the clock
//! advances like a browser audio context's. The clock reads the next frame
//! the feeder can still place, not the frames already written.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use tokio::sync::mpsc;

use super::alsa_device::{self, AlsaParams};
use super::resample::StreamResampler;
use super::timeline::Timeline;
use super::{AudioOutput, AudioSettings, PlaybackTicket, CHUNK_SAMPLE_RATE};
use crate::error::Error;

/// Rounding slack on top of the resampler lag when joining buffers
const SNAP_SLACK_FRAMES: u64 = 8;

enum OutputCommand {
    Schedule {
        /// `None` appends right after the previous buffer
        start_frame: Option<u64>,
        /// Interleaved device-rate samples
        samples: Vec<i16>,
        ticket: Option<PlaybackTicket>,
    },
    Halt,
}

pub struct AlsaOutput {
    settings: AudioSettings,
    params: AlsaParams,
    completions: mpsc::UnboundedSender<PlaybackTicket>,
    cmd_tx: mpsc::UnboundedSender<OutputCommand>,
    resampler: StreamResampler,
    frames_placed: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaOutput {
    /// Open the playback device and start the feeder thread.
    pub fn open(
        settings: AudioSettings,
        completions: mpsc::UnboundedSender<PlaybackTicket>,
    ) -> crate::error::Result<Self> {
        let frames_placed = Arc::new(AtomicU64::new(0));
        let (cmd_tx, handle, running, alive, params) =
            spawn_feeder(&settings, completions.clone(), frames_placed.clone())?;

        let resampler = StreamResampler::new(CHUNK_SAMPLE_RATE, params.sample_rate)?;
        if !resampler.is_passthrough() {
            log::warn!(
                "Output runs at {} Hz instead of {} Hz, resampling chunks",
                params.sample_rate,
                CHUNK_SAMPLE_RATE
            );
        }

        Ok(Self {
            settings,
            params,
            completions,
            cmd_tx,
            resampler,
            frames_placed,
            running,
            alive,
            handle: Some(handle),
        })
    }

    fn shutdown_feeder(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    fn interleave(&self, samples: &[f32]) -> Vec<i16> {
        let channels = self.params.channels as usize;
        let mut interleaved = Vec::with_capacity(samples.len() * channels);
        for s in samples {
            let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            interleaved.extend(std::iter::repeat_n(v, channels));
        }
        interleaved
    }

    fn send(&self, cmd: OutputCommand) -> crate::error::Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::Device("playback thread stopped".to_string()))
    }
}

impl AudioOutput for AlsaOutput {
    fn current_time(&self) -> f64 {
        self.frames_placed.load(Ordering::Acquire) as f64 / f64::from(self.params.sample_rate)
    }

    fn resume(&mut self) -> crate::error::Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            return Ok(());
        }
        log::warn!("Playback thread is down, re-opening {}", self.settings.playback_device);
        self.shutdown_feeder();

        // the clock keeps counting from where the old stream stopped
        let (cmd_tx, handle, running, alive, params) = spawn_feeder(
            &self.settings,
            self.completions.clone(),
            self.frames_placed.clone(),
        )?;
        self.cmd_tx = cmd_tx;
        self.handle = Some(handle);
        self.running = running;
        self.alive = alive;
        self.params = params;
        self.resampler = StreamResampler::new(CHUNK_SAMPLE_RATE, params.sample_rate)?;
        Ok(())
    }

    fn schedule(
        &mut self,
        samples: Vec<f32>,
        start_at: f64,
        ticket: PlaybackTicket,
    ) -> crate::error::Result<()> {
        let resampled = self.resampler.process(&samples)?;
        let start_frame = (start_at * f64::from(self.params.sample_rate)).round() as u64;
        self.send(OutputCommand::Schedule {
            start_frame: Some(start_frame),
            samples: self.interleave(&resampled),
            ticket: Some(ticket),
        })
    }

    fn halt(&mut self) {
        let _ = self.cmd_tx.send(OutputCommand::Halt);
        if let Err(e) = self.resampler.reset() {
            log::warn!("Failed to reset resampler: {}", e);
        }
    }

    fn flush(&mut self) {
        let tail = match self.resampler.flush() {
            Ok(tail) => tail,
            Err(e) => {
                log::warn!("Failed to flush resampler: {}", e);
                return;
            }
        };
        if tail.is_empty() {
            return;
        }
        log::debug!("Appending {} resampled tail frames", tail.len());
        let cmd = OutputCommand::Schedule {
            start_frame: None,
            samples: self.interleave(&tail),
            ticket: None,
        };
        if let Err(e) = self.send(cmd) {
            log::warn!("Failed to append resampled tail: {}", e);
        }
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.shutdown_feeder();
    }
}

type Feeder = (
    mpsc::UnboundedSender<OutputCommand>,
    JoinHandle<()>,
    Arc<AtomicBool>,
    Arc<AtomicBool>,
    AlsaParams,
);

fn spawn_feeder(
    settings: &AudioSettings,
    completions: mpsc::UnboundedSender<PlaybackTicket>,
    frames_placed: Arc<AtomicU64>,
) -> crate::error::Result<Feeder> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<AlsaParams, String>>();
    let running = Arc::new(AtomicBool::new(true));
    let alive = Arc::new(AtomicBool::new(true));

    let handle = {
        let settings = settings.clone();
        let running = running.clone();
        let alive = alive.clone();
        thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || {
                if let Err(e) = play_thread(&settings, cmd_rx, completions, &frames_placed, &running, ready_tx) {
                    log::error!("Playback thread error: {}", e);
                }
                alive.store(false, Ordering::SeqCst);
            })?
    };

    match ready_rx.recv() {
        Ok(Ok(params)) => Ok((cmd_tx, handle, running, alive, params)),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(Error::Device(e))
        }
        Err(_) => {
            let _ = handle.join();
            Err(Error::Device("playback thread exited during setup".to_string()))
        }
    }
}

fn play_thread(
    settings: &AudioSettings,
    mut cmd_rx: mpsc::UnboundedReceiver<OutputCommand>,
    completions: mpsc::UnboundedSender<PlaybackTicket>,
    frames_placed: &AtomicU64,
    running: &AtomicBool,
    ready: std_mpsc::Sender<Result<AlsaParams, String>>,
) -> Result<()> {
    let period_opt = (settings.playback_period_size > 0).then_some(settings.playback_period_size);
    let (pcm, params) = match alsa_device::open_playback(
        &settings.playback_device,
        settings.playback_sample_rate,
        settings.playback_channels,
        period_opt,
    ) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(format!("{:#}", e)));
            return Err(e);
        }
    };
    let _ = ready.send(Ok(params));

    let channels = params.channels as usize;
    let period_size = params.period_size.max(1);
    let io = pcm.io_i16()?;

    // a resampled buffer may end up to one filter lag short of its nominal end
    let snap_frames =
        StreamResampler::new(CHUNK_SAMPLE_RATE, params.sample_rate)?.max_lag_frames() + SNAP_SLACK_FRAMES;
    let mut timeline = Timeline::new(channels, frames_placed.load(Ordering::Acquire), snap_frames);
    let mut period = vec![0i16; period_size * channels];

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        period_size,
    );

    while running.load(Ordering::Relaxed) {
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                OutputCommand::Schedule { start_frame, samples, ticket } => {
                    timeline.push(start_frame, samples, ticket)
                }
                OutputCommand::Halt => timeline.halt(),
            }
        }

        let finished = timeline.fill(&mut period);
        frames_placed.store(timeline.cursor(), Ordering::Release);

        // tickets go out before the blocking write so the next chunk lands in time
        for ticket in finished {
            if completions.send(ticket).is_err() {
                log::info!("Completion receiver dropped, stopping playback");
                return Ok(());
            }
        }

        // Write with retry loop to handle short writes and XRUN recovery
        let mut written = 0;
        let mut retry_count = 0u32;
        while written < period_size {
            match io.writei(&period[written * channels..]) {
                Ok(n) => {
                    written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    alsa_device::recover(&pcm, "Playback")?;
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached, dropping {} frames",
                            retry_count,
                            period_size - written
                        );
                        break;
                    }
                }
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}
