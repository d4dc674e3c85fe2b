use anyhow::Context;
use habeebi_client::audio::AlsaDevices;
use habeebi_client::capture::create_encoder;
use habeebi_client::config::Config;
use habeebi_client::console::{self, ConsoleUi};
use habeebi_client::gui_bridge::GuiBridge;
use habeebi_client::net_link::NetLink;
use habeebi_client::session::{Session, UiSink, UserAction};
use habeebi_client::visualizer::{GuiRenderer, LogRenderer, Renderer, Visualizer};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    let config = Config::new().map_err(anyhow::Error::msg)?;
    log::info!("{} v{} starting", config.app_name, config.app_version);

    // 用户操作通道，GUI和终端共用
    let (tx_action, rx_action) = mpsc::channel::<UserAction>(32);

    let gui_bridge = Arc::new(GuiBridge::new(&config, tx_action.clone()).await?);
    let gui_bridge_clone = gui_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = gui_bridge_clone.run().await {
            log::error!("GuiBridge error: {}", e);
        }
    });

    println!("{}", console::HELP);
    tokio::spawn(async move {
        if let Err(e) = console::read_actions(tx_action).await {
            log::error!("Console error: {}", e);
        }
    });

    let mut ui: Box<dyn UiSink> = Box::new(vec![
        Box::new(ConsoleUi) as Box<dyn UiSink>,
        Box::new(gui_bridge.clone()),
    ]);

    let renderers: Vec<Box<dyn Renderer>> = vec![
        Box::new(GuiRenderer::new(gui_bridge.clone())),
        Box::new(LogRenderer),
    ];
    let (visualizer, _visualizer_task) = Visualizer::spawn(renderers, config.visualizer_frame());

    // 连接失败直接退出，不自动重连
    let (transport, rx_net_event) = match NetLink::connect(config.ws_url).await {
        Ok(link) => link,
        Err(e) => {
            ui.status(&format!("Could not connect to {}: {}", config.ws_url, e));
            return Err(anyhow::Error::new(e).context("Connection failed"));
        }
    };

    let encoder = create_encoder(config.encoder).context("Invalid capture encoder")?;
    let devices = Arc::new(AlsaDevices::new(config.audio_settings()));

    let session = Session::new(
        transport.clone(),
        devices,
        encoder,
        visualizer,
        ui,
        config.session_settings(),
    );

    tokio::select! {
        result = session.run(rx_net_event, rx_action) => {
            result.context("Session failed")?;
        }
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
            transport.close().await;
        }
    }

    Ok(())
}
