use serde::Serialize;
use std::time::Duration;

use crate::audio::AudioSettings;
use crate::session::SessionSettings;

#[derive(Debug, Serialize, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 网络配置
    pub ws_url: &'static str,

    // GUI进程配置
    pub gui_local_port: u16,
    pub gui_remote_port: u16,
    pub gui_local_ip: &'static str,
    pub gui_remote_ip: &'static str,
    pub gui_buffer_size: usize,

    // 音频设备配置
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub playback_sample_rate: u32,
    pub playback_channels: u32,
    pub playback_period_size: usize,
    pub capture_tick_ms: u64,
    pub encoder: &'static str,

    // 会话配置
    pub status_revert_ms: u64,
    pub visualizer_frame_ms: u64,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            ws_url: env!("WS_URL"),

            gui_local_port: env!("GUI_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse GUI_LOCAL_PORT")?,
            gui_remote_port: env!("GUI_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse GUI_REMOTE_PORT")?,
            gui_local_ip: env!("GUI_LOCAL_IP"),
            gui_remote_ip: env!("GUI_REMOTE_IP"),
            gui_buffer_size: env!("GUI_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse GUI_BUFFER_SIZE")?,

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            playback_sample_rate: env!("PLAYBACK_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_SAMPLE_RATE")?,
            playback_channels: env!("PLAYBACK_CHANNELS").parse()
                .map_err(|_| "Failed to parse PLAYBACK_CHANNELS")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
            capture_tick_ms: positive_ms(env!("CAPTURE_TICK_MS"), "CAPTURE_TICK_MS must be a positive integer")?,
            encoder: env!("CAPTURE_ENCODER"),

            status_revert_ms: env!("STATUS_REVERT_MS").parse()
                .map_err(|_| "Failed to parse STATUS_REVERT_MS")?,
            visualizer_frame_ms: positive_ms(env!("VISUALIZER_FRAME_MS"), "VISUALIZER_FRAME_MS must be a positive integer")?,
        })
    }

    pub fn audio_settings(&self) -> AudioSettings {
        AudioSettings {
            capture_device: self.capture_device.to_string(),
            playback_device: self.playback_device.to_string(),
            playback_sample_rate: self.playback_sample_rate,
            playback_channels: self.playback_channels,
            playback_period_size: self.playback_period_size,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            capture_tick: self.capture_tick(),
            status_revert: self.status_revert_delay(),
        }
    }

    pub fn capture_tick(&self) -> Duration {
        Duration::from_millis(self.capture_tick_ms)
    }

    pub fn status_revert_delay(&self) -> Duration {
        Duration::from_millis(self.status_revert_ms)
    }

    pub fn visualizer_frame(&self) -> Duration {
        Duration::from_millis(self.visualizer_frame_ms)
    }
}

/// Periods fed to `tokio::time::interval`, which rejects zero.
fn positive_ms(raw: &str, err: &'static str) -> Result<u64, &'static str> {
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(err),
    }
}
