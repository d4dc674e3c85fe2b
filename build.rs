use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    gui: Gui,
    audio: Audio,
    session: Session,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
}

#[derive(Deserialize)]
struct Gui {
    local_port: u16,
    remote_port: u16,
    local_ip: String,
    remote_ip: String,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    playback_sample_rate: u32,
    playback_channels: u32,
    playback_period_size: usize,
    capture_tick_ms: u64,
    encoder: String,
}

#[derive(Deserialize)]
struct Session {
    status_revert_ms: u64,
    visualizer_frame_ms: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);

    // GUI 配置
    println!("cargo:rustc-env=GUI_LOCAL_PORT={}", config.gui.local_port);
    println!("cargo:rustc-env=GUI_REMOTE_PORT={}", config.gui.remote_port);
    println!("cargo:rustc-env=GUI_LOCAL_IP={}", config.gui.local_ip);
    println!("cargo:rustc-env=GUI_REMOTE_IP={}", config.gui.remote_ip);
    println!("cargo:rustc-env=GUI_BUFFER_SIZE={}", config.gui.buffer_size);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=PLAYBACK_SAMPLE_RATE={}", config.audio.playback_sample_rate);
    println!("cargo:rustc-env=PLAYBACK_CHANNELS={}", config.audio.playback_channels);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);
    println!("cargo:rustc-env=CAPTURE_TICK_MS={}", config.audio.capture_tick_ms);
    println!("cargo:rustc-env=CAPTURE_ENCODER={}", config.audio.encoder);

    // 会话配置
    println!("cargo:rustc-env=STATUS_REVERT_MS={}", config.session.status_revert_ms);
    println!("cargo:rustc-env=VISUALIZER_FRAME_MS={}", config.session.visualizer_frame_ms);
}
