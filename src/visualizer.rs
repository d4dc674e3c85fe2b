//! Level visualizer fed by the capture analyzer.
//!
//! Runs on its own task; the session only swaps the analyzer source in and
//! out through a watch channel, so rendering can never stall capture or
//! playback.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::audio::{LevelFrame, SignalAnalyzer};
use crate::gui_bridge::{GuiBridge, GuiMessage};

pub trait Renderer: Send {
    fn draw(&mut self, frame: &LevelFrame) -> anyhow::Result<()>;

    /// Blank the display after the source detaches.
    fn clear(&mut self) -> anyhow::Result<()>;
}

/// Fan-out; one failing renderer does not starve the others.
impl Renderer for Vec<Box<dyn Renderer>> {
    fn draw(&mut self, frame: &LevelFrame) -> anyhow::Result<()> {
        for renderer in self.iter_mut() {
            if let Err(e) = renderer.draw(frame) {
                log::warn!("Renderer draw failed: {:#}", e);
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        for renderer in self.iter_mut() {
            if let Err(e) = renderer.clear() {
                log::warn!("Renderer clear failed: {:#}", e);
            }
        }
        Ok(())
    }
}

/// Source switch for a running visualizer.
#[derive(Clone)]
pub struct VisualizerHandle {
    source: Arc<watch::Sender<Option<SignalAnalyzer>>>,
}

impl VisualizerHandle {
    /// A handle with no render loop behind it.
    pub fn detached() -> Self {
        let (tx, _) = watch::channel(None);
        Self { source: Arc::new(tx) }
    }

    pub fn attach(&self, analyzer: SignalAnalyzer) {
        self.source.send_replace(Some(analyzer));
    }

    pub fn detach(&self) {
        if self.source.borrow().is_some() {
            self.source.send_replace(None);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.source.borrow().is_some()
    }
}

pub struct Visualizer;

impl Visualizer {
    pub fn spawn<R>(renderer: R, frame_interval: Duration) -> (VisualizerHandle, JoinHandle<()>)
    where
        R: Renderer + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(render_loop(renderer, rx, frame_interval));
        (VisualizerHandle { source: Arc::new(tx) }, task)
    }
}

async fn render_loop<R: Renderer>(
    mut renderer: R,
    mut source: watch::Receiver<Option<SignalAnalyzer>>,
    frame_interval: Duration,
) {
    loop {
        let current = source.borrow_and_update().clone();
        let Some(analyzer) = current else {
            if source.changed().await.is_err() {
                return;
            }
            continue;
        };

        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let sender_alive = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = renderer.draw(&analyzer.snapshot()) {
                        log::warn!("Visualizer draw failed: {}", e);
                    }
                }
                changed = source.changed() => break changed.is_ok(),
            }
        };

        if let Err(e) = renderer.clear() {
            log::warn!("Visualizer clear failed: {}", e);
        }
        if !sender_alive {
            return;
        }
    }
}

/// Streams level frames to the GUI process.
pub struct GuiRenderer {
    bridge: Arc<GuiBridge>,
}

impl GuiRenderer {
    pub fn new(bridge: Arc<GuiBridge>) -> Self {
        Self { bridge }
    }
}

impl Renderer for GuiRenderer {
    fn draw(&mut self, frame: &LevelFrame) -> anyhow::Result<()> {
        self.bridge.send(&GuiMessage::Level(frame.clone()))
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        self.bridge.send(&GuiMessage::Level(LevelFrame::default()))
    }
}

/// Text meter in the debug log, for headless runs.
#[derive(Default)]
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn draw(&mut self, frame: &LevelFrame) -> anyhow::Result<()> {
        let width = (frame.rms * 40.0).round().clamp(0.0, 40.0) as usize;
        log::debug!("level |{:<40}| peak {:.2}", "#".repeat(width), frame.peak);
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
