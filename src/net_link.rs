use crate::error::{Error, Result};
use crate::protocol::{self, ClientCommand, Inbound, ServerMessage};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, protocol::Message},
};
use url::Url;
use uuid::Uuid;

/// Events surfaced by the transport to the session.
#[derive(Debug)]
pub enum NetEvent {
    Opened,
    /// One synthesized-speech chunk, forwarded verbatim
    Audio(Bytes),
    Control(ServerMessage),
    /// Peer closed the channel
    Closed(String),
    /// Channel failed
    Failed(String),
}

#[derive(Debug)]
pub enum NetCommand {
    SendText(String),
    SendBinary(Bytes),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Send side of an open link. Cheap to clone.
///
/// Sends fail fast with [`Error::NotConnected`] unless the link is open;
/// once closed, a link never reopens.
#[derive(Clone)]
pub struct TransportHandle {
    id: Uuid,
    state: Arc<Mutex<ConnectionState>>,
    tx: mpsc::Sender<NetCommand>,
}

impl TransportHandle {
    pub(crate) fn new(state: Arc<Mutex<ConnectionState>>, tx: mpsc::Sender<NetCommand>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Send one finished utterance as a single binary frame.
    pub async fn send_audio(&self, payload: Bytes) -> Result<()> {
        log::debug!("[{}] sending {} bytes of audio", self.id, payload.len());
        self.send(NetCommand::SendBinary(payload)).await
    }

    pub async fn send_command(&self, command: ClientCommand) -> Result<()> {
        let text = command.to_json()?;
        log::info!("[{}] sending command {}", self.id, text);
        self.send(NetCommand::SendText(text)).await
    }

    /// Close the link; later sends fail with `NotConnected`.
    pub async fn close(&self) {
        if self.is_open() {
            let _ = self.tx.send(NetCommand::Close).await;
        }
        set_state(&self.state, ConnectionState::Closed);
    }

    async fn send(&self, command: NetCommand) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        if self.tx.send(command).await.is_err() {
            // I/O task is gone
            set_state(&self.state, ConnectionState::Closed);
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}

fn set_state(state: &Mutex<ConnectionState>, value: ConnectionState) {
    if let Ok(mut s) = state.lock() {
        *s = value;
    }
}

pub struct NetLink;

impl NetLink {
    /// Open the duplex channel to the agent.
    ///
    /// Returns the send handle and the inbound event stream; the first event
    /// is always [`NetEvent::Opened`]. No retries: a failure here is terminal.
    pub async fn connect(endpoint: &str) -> Result<(TransportHandle, mpsc::Receiver<NetEvent>)> {
        let url = Url::parse(endpoint)
            .map_err(|e| Error::Connection(format!("invalid endpoint {}: {}", endpoint, e)))?;

        let state = Arc::new(Mutex::new(ConnectionState::Connecting));

        log::info!("Connecting to {}...", url);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", url, e)))?;

        let (tx_event, rx_event) = mpsc::channel::<NetEvent>(100);
        let (tx_cmd, rx_cmd) = mpsc::channel::<NetCommand>(100);

        set_state(&state, ConnectionState::Open);
        let handle = TransportHandle::new(state.clone(), tx_cmd);
        log::info!("[{}] Connected!", handle.id());

        // fresh channel, cannot be full
        let _ = tx_event.try_send(NetEvent::Opened);

        tokio::spawn(run_link(ws_stream, tx_event, rx_cmd, state));

        Ok((handle, rx_event))
    }
}

/// Drive one connection until it ends, then report how it ended.
pub(crate) async fn run_link<S>(
    ws: S,
    tx: mpsc::Sender<NetEvent>,
    rx_cmd: mpsc::Receiver<NetCommand>,
    state: Arc<Mutex<ConnectionState>>,
) where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let result = pump(ws, &tx, rx_cmd).await;
    set_state(&state, ConnectionState::Closed);

    let event = match result {
        Ok(reason) => {
            log::info!("Connection closed: {}", reason);
            NetEvent::Closed(reason)
        }
        Err(e) => {
            log::error!("Connection error: {}", e);
            NetEvent::Failed(e.to_string())
        }
    };
    let _ = tx.send(event).await;
}

// 主循环，处理读取和写入
async fn pump<S>(
    ws: S,
    tx: &mpsc::Sender<NetEvent>,
    mut rx_cmd: mpsc::Receiver<NetCommand>,
) -> anyhow::Result<String>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match protocol::parse_server_message(&text) {
                        Ok(Inbound::Message(message)) => {
                            log::debug!("Received {} message", message.kind());
                            tx.send(NetEvent::Control(message)).await?;
                        }
                        Ok(Inbound::Unknown(kind)) => {
                            log::warn!("Ignoring unknown message type: {}", kind);
                        }
                        Err(e) => {
                            log::warn!("Ignoring bad message ({}): {}", e, text.as_str());
                        }
                    },
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Received audio chunk: {} bytes", data.len());
                        tx.send(NetEvent::Audio(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", f.code, f.reason.as_str()))
                            .unwrap_or_else(|| "closed by peer".to_string());
                        return Ok(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok("stream ended".to_string()),
                }
            }
            cmd = rx_cmd.recv() => {
                match cmd {
                    Some(NetCommand::SendText(text)) => {
                        write.send(Message::Text(text.into())).await?;
                    }
                    Some(NetCommand::SendBinary(data)) => {
                        write.send(Message::Binary(data)).await?;
                    }
                    Some(NetCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok("closed by client".to_string());
                    }
                }
            }
        }
    }
}
