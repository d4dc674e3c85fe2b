use crate::audio::LevelFrame;
use crate::config::Config;
use crate::session::{Affordances, UiSink, UserAction};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Datagrams sent to the GUI process.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuiMessage {
    Status { text: String },
    Controls(Affordances),
    Level(LevelFrame),
}

#[derive(Deserialize, Debug)]
#[serde(tag = "action", rename_all = "snake_case")]
enum GuiAction {
    Record,
    StopRecording,
    Toggle,
    Interrupt,
    Refresh,
}

impl From<GuiAction> for UserAction {
    fn from(action: GuiAction) -> Self {
        match action {
            GuiAction::Record => UserAction::StartRecording,
            GuiAction::StopRecording => UserAction::StopRecording,
            GuiAction::Toggle => UserAction::ToggleRecording,
            GuiAction::Interrupt => UserAction::Interrupt,
            GuiAction::Refresh => UserAction::Refresh,
        }
    }
}

/// Parse one datagram from the GUI into a user action.
pub fn parse_action(text: &str) -> Option<UserAction> {
    serde_json::from_str::<GuiAction>(text).ok().map(UserAction::from)
}

pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    target_addr: SocketAddr,
    buffer_size: usize,
    tx: mpsc::Sender<UserAction>,
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
impl GuiBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<UserAction>) -> anyhow::Result<Self> {
        let local: SocketAddr = format!("{}:{}", config.gui_local_ip, config.gui_local_port)
            .parse()
            .context("Invalid GUI local address")?;
        let remote: SocketAddr = format!("{}:{}", config.gui_remote_ip, config.gui_remote_port)
            .parse()
            .context("Invalid GUI remote address")?;
        Self::bind(local, remote, config.gui_buffer_size, tx).await
    }

    pub async fn bind(
        local: SocketAddr,
        remote: SocketAddr,
        buffer_size: usize,
        tx: mpsc::Sender<UserAction>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .with_context(|| format!("Failed to bind GUI socket on {}", local))?;
        log::info!("GUI bridge listening on {}, sending to {}", socket.local_addr()?, remote);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr: remote,
            buffer_size: buffer_size.max(64),
            tx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                log::warn!("Non-UTF-8 datagram from GUI {}", from);
                continue;
            };
            match parse_action(text) {
                Some(action) => {
                    log::debug!("GUI action {:?}", action);
                    if self.tx.send(action).await.is_err() {
                        log::info!("Session gone, GUI bridge stopping");
                        break;
                    }
                }
                None => log::warn!("Ignoring GUI message: {}", text),
            }
        }
        Ok(())
    }

    /// Fire-and-forget send; a missing GUI process must never block the session.
    pub fn send(&self, message: &GuiMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message)?;
        match self.socket.try_send_to(&payload, self.target_addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                log::debug!("GUI socket busy, dropping {} bytes", payload.len());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl UiSink for Arc<GuiBridge> {
    fn status(&mut self, text: &str) {
        let message = GuiMessage::Status {
            text: text.to_string(),
        };
        if let Err(e) = self.send(&message) {
            log::debug!("Failed to send status to GUI: {}", e);
        }
    }

    fn controls(&mut self, affordances: Affordances) {
        if let Err(e) = self.send(&GuiMessage::Controls(affordances)) {
            log::debug!("Failed to send controls to GUI: {}", e);
        }
    }
}
