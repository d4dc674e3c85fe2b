//! ALSA microphone capture on a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::Result;

use super::alsa_device::{self, AlsaParams};
use super::{Microphone, SignalAnalyzer};
use crate::error::Error;

pub struct AlsaMicrophone {
    params: AlsaParams,
    captured: Arc<Mutex<Vec<i16>>>,
    analyzer: SignalAnalyzer,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaMicrophone {
    /// Acquire the capture device. Fails with [`Error::Device`] when the
    /// device is missing or access is denied; nothing is left open then.
    pub fn open(device: &str) -> crate::error::Result<Self> {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let analyzer = SignalAnalyzer::new();
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<AlsaParams, String>>();

        let handle = {
            let device = device.to_string();
            let captured = captured.clone();
            let analyzer = analyzer.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    if let Err(e) = record_thread(&device, &captured, &analyzer, &running, ready_tx) {
                        log::error!("Recording thread error: {}", e);
                    }
                })?
        };

        let params = match ready_rx.recv() {
            Ok(Ok(params)) => params,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(Error::Device(e));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::Device("capture thread exited during setup".to_string()));
            }
        };

        Ok(Self {
            params,
            captured,
            analyzer,
            running,
            handle: Some(handle),
        })
    }
}

impl Microphone for AlsaMicrophone {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn take_samples(&mut self) -> Vec<i16> {
        self.captured
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    fn analyzer(&self) -> SignalAnalyzer {
        self.analyzer.clone()
    }
}

impl Drop for AlsaMicrophone {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
        log::debug!("Microphone released");
    }
}

fn record_thread(
    device: &str,
    captured: &Mutex<Vec<i16>>,
    analyzer: &SignalAnalyzer,
    running: &AtomicBool,
    ready: std_mpsc::Sender<Result<AlsaParams, String>>,
) -> Result<()> {
    let (pcm, params) = match alsa_device::open_capture(device) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(format!("{:#}", e)));
            return Err(e);
        }
    };
    let _ = ready.send(Ok(params));

    let channels = params.channels.max(1) as usize;
    let mut read_buf = vec![0i16; params.period_size.max(1) * channels];
    let io = pcm.io_i16()?;

    log::info!(
        "Recording started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        params.period_size,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                // Interleaved -> mono
                let mono: Vec<i16> = read_buf[..frames * channels]
                    .chunks_exact(channels)
                    .map(|frame| {
                        let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                        (sum / channels as i32) as i16
                    })
                    .collect();

                analyzer.push(&mono);
                if let Ok(mut buf) = captured.lock() {
                    buf.extend_from_slice(&mono);
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = alsa_device::recover(&pcm, "Capture") {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}
