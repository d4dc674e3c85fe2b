//! ALSA PCM helpers shared by the capture and playback threads.

use alsa::pcm::{Access, Format, HwParams, State, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone, Copy)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a PCM device for capture. Mono is requested; the hardware may
/// insist on more channels, which the caller downmixes.
pub fn open_capture(device: &str) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, None, 1, None, "Capture")
}

/// Open a PCM device for playback near the requested rate.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(
        device,
        Direction::Playback,
        Some(sample_rate),
        channels,
        period_size,
        "Playback",
    )
}

/// Bring a stream back after XRUN or power-management suspension.
pub fn recover(pcm: &PCM, dir_name: &str) -> Result<()> {
    match pcm.state() {
        State::Suspended => {
            log::warn!("ALSA {} suspended, resuming", dir_name);
            if pcm.resume().is_err() {
                pcm.prepare()
                    .with_context(|| format!("Failed to re-prepare suspended {} stream", dir_name))?;
            }
        }
        State::Disconnected => {
            anyhow::bail!("{} device disconnected", dir_name);
        }
        _ => {
            pcm.prepare()
                .with_context(|| format!("Failed to recover {} stream", dir_name))?;
        }
    }
    Ok(())
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: Option<u32>,
    channels: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        if hwp.set_channels(channels).is_err() {
            // 硬件不支持请求的声道数时，取最接近的
            hwp.set_channels_near(channels)?;
        }
        if let Some(rate) = sample_rate {
            hwp.set_rate_near(rate, ValueOr::Nearest)?;
        }
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}
