//! Session coordinator.
//!
//! One task owns the transport handle, both engines, readiness and the UI
//! sink. Inbound frames, playback completions, user actions, capture ticks
//! and the status-revert timer are all serialized through [`Session::run`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::audio::{AudioDevices, PlaybackTicket};
use crate::capture::{CaptureEngine, CaptureOutcome, FragmentEncoder};
use crate::error::{Error, Result};
use crate::net_link::{NetEvent, TransportHandle};
use crate::playback::{AudioChunk, PlaybackEngine, PlaybackSignal};
use crate::protocol::{self, ClientCommand, ServerMessage, AGENT_READY};
use crate::visualizer::VisualizerHandle;

const STATUS_RECORDING: &str = "Recording...";
const STATUS_PROCESSING: &str = "Processing...";
const STATUS_PLAYING: &str = "Playing response...";
const STATUS_REFRESHING: &str = "Refreshing Zapier connection...";
const STATUS_REFRESHED: &str = "Zapier refreshed";
const STATUS_REFRESH_FAILED: &str = "Zapier refresh failed";
const STATUS_NO_AUDIO: &str = "No audio recorded.";
const STATUS_NOT_READY: &str = "Agent not ready";
const STATUS_CONNECTED: &str = "Connected, waiting for agent...";

/// Agent errors that mean it cannot take a turn at all.
const AGENT_UNAVAILABLE: &[&str] = &["Agent initialization failed", "Agent not ready"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    NotReady,
    Ready,
}

/// Which user actions are currently permitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Affordances {
    pub can_record: bool,
    pub can_stop_recording: bool,
    pub can_interrupt: bool,
    pub can_refresh: bool,
}

/// Where status text and affordance changes go.
pub trait UiSink: Send {
    fn status(&mut self, text: &str);
    fn controls(&mut self, affordances: Affordances);
}

impl UiSink for Vec<Box<dyn UiSink>> {
    fn status(&mut self, text: &str) {
        for sink in self.iter_mut() {
            sink.status(text);
        }
    }

    fn controls(&mut self, affordances: Affordances) {
        for sink in self.iter_mut() {
            sink.controls(affordances);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    StartRecording,
    StopRecording,
    ToggleRecording,
    Interrupt,
    Refresh,
    Quit,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub capture_tick: Duration,
    pub status_revert: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            capture_tick: Duration::from_millis(250),
            status_revert: Duration::from_millis(3000),
        }
    }
}

pub struct Session {
    transport: TransportHandle,
    devices: Arc<dyn AudioDevices>,
    playback: Option<PlaybackEngine>,
    capture: CaptureEngine,
    visualizer: VisualizerHandle,
    ui: Box<dyn UiSink>,
    settings: SessionSettings,

    readiness: Readiness,
    refreshing: bool,
    awaiting_response: bool,
    /// Set by an interrupt; late chunks of the cancelled response are dropped
    discard_audio: bool,
    closed: bool,
    revert_at: Option<Instant>,
    last_affordances: Option<Affordances>,
    last_status: String,

    completions_tx: mpsc::UnboundedSender<PlaybackTicket>,
    completions_rx: Option<mpsc::UnboundedReceiver<PlaybackTicket>>,
    next_sequence: u64,
}

impl Session {
    pub fn new(
        transport: TransportHandle,
        devices: Arc<dyn AudioDevices>,
        encoder: Box<dyn FragmentEncoder>,
        visualizer: VisualizerHandle,
        ui: Box<dyn UiSink>,
        settings: SessionSettings,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            devices,
            playback: None,
            capture: CaptureEngine::new(encoder),
            visualizer,
            ui,
            settings,
            readiness: Readiness::NotReady,
            refreshing: false,
            awaiting_response: false,
            discard_audio: false,
            closed: false,
            revert_at: None,
            last_affordances: None,
            last_status: String::new(),
            completions_tx,
            completions_rx: Some(completions_rx),
            next_sequence: 0,
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.as_ref().is_some_and(PlaybackEngine::is_active)
    }

    pub fn last_status(&self) -> &str {
        &self.last_status
    }

    pub fn affordances(&self) -> Affordances {
        if self.closed || !self.transport.is_open() {
            return Affordances::default();
        }
        let capturing = self.capture.is_recording();
        let playing = self.is_playing();
        Affordances {
            can_record: self.readiness == Readiness::Ready
                && !self.refreshing
                && !capturing
                && !playing,
            can_stop_recording: capturing,
            can_interrupt: playing || self.awaiting_response,
            can_refresh: !self.refreshing && !capturing,
        }
    }

    fn idle_status(&self) -> &'static str {
        match self.readiness {
            Readiness::Ready => AGENT_READY,
            Readiness::NotReady => STATUS_NOT_READY,
        }
    }

    fn show(&mut self, text: &str) {
        log::info!("Status: {}", text);
        self.last_status = text.to_string();
        self.ui.status(text);
    }

    /// Push affordances to the UI when they changed.
    fn publish(&mut self) {
        let current = self.affordances();
        if self.last_affordances != Some(current) {
            self.last_affordances = Some(current);
            self.ui.controls(current);
        }
    }

    /// Handle one transport event. Returns `false` once the link is gone.
    pub async fn handle_net_event(&mut self, event: NetEvent) -> bool {
        match event {
            NetEvent::Opened => {
                log::info!("Link {} open", self.transport.id());
                self.show(STATUS_CONNECTED);
            }
            NetEvent::Audio(data) => self.handle_audio(data).await,
            NetEvent::Control(message) => self.handle_message(message),
            NetEvent::Closed(reason) | NetEvent::Failed(reason) => {
                self.shutdown(&reason);
                return false;
            }
        }
        self.publish();
        true
    }

    fn handle_message(&mut self, message: ServerMessage) {
        log::debug!("Control message: {}", message.kind());
        match message {
            ServerMessage::Status { message } => {
                if message == AGENT_READY {
                    self.readiness = Readiness::Ready;
                }
                self.show(&message);
            }
            ServerMessage::Error { message } => {
                log::warn!("Agent error: {}", message);
                if let Some(playback) = self.playback.as_mut() {
                    playback.stop();
                }
                self.awaiting_response = false;
                if self.refreshing {
                    self.refreshing = false;
                    self.readiness = Readiness::NotReady;
                    self.revert_at = Some(Instant::now() + self.settings.status_revert);
                } else if AGENT_UNAVAILABLE.iter().any(|m| message.starts_with(m)) {
                    self.readiness = Readiness::NotReady;
                }
                self.show(&format!("Error: {}", message));
            }
            ServerMessage::AudioStreamEnd {} => {
                self.awaiting_response = false;
                self.discard_audio = false;
                if !self.is_playing() && !self.capture.is_recording() {
                    let idle = self.idle_status();
                    self.show(idle);
                }
            }
            ServerMessage::ZapierRefreshed { status } => {
                self.refreshing = false;
                if protocol::refresh_succeeded(&status) {
                    self.readiness = Readiness::Ready;
                    self.show(STATUS_REFRESHED);
                } else {
                    log::warn!("Zapier refresh ended with status {}", status);
                    self.readiness = Readiness::NotReady;
                    self.show(STATUS_REFRESH_FAILED);
                }
                self.revert_at = Some(Instant::now() + self.settings.status_revert);
            }
            ServerMessage::Lifecycle { event } => {
                log::info!("Agent lifecycle: {}", event);
            }
        }
    }

    async fn ensure_output(&mut self) -> Result<()> {
        if self.playback.is_none() {
            let output = self.devices.output(self.completions_tx.clone()).await?;
            self.playback = Some(PlaybackEngine::new(output));
            log::info!("Audio output initialized");
        }
        Ok(())
    }

    async fn handle_audio(&mut self, data: Bytes) {
        if self.discard_audio {
            log::debug!("Dropping {} bytes of interrupted response", data.len());
            return;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        if let Err(e) = self.ensure_output().await {
            log::error!("Dropping chunk #{}: {}", sequence, e);
            self.show(&format!("Audio output unavailable: {}", e));
            return;
        }
        let Some(playback) = self.playback.as_mut() else {
            return;
        };

        let was_active = playback.is_active();
        playback.enqueue(AudioChunk::new(sequence, data));
        let started = !was_active && playback.is_active();

        self.drain_playback_signals();
        if started {
            self.show(STATUS_PLAYING);
        }
    }

    /// Completion ticket from the output device.
    pub fn handle_completion(&mut self, ticket: PlaybackTicket) {
        if let Some(playback) = self.playback.as_mut() {
            playback.on_chunk_finished(ticket);
        }
        self.drain_playback_signals();
        self.publish();
    }

    fn drain_playback_signals(&mut self) {
        let signals = match self.playback.as_mut() {
            Some(playback) => playback.drain_signals(),
            None => return,
        };
        for signal in signals {
            match signal {
                PlaybackSignal::CorruptChunk { sequence } => {
                    log::warn!("Skipped corrupt audio chunk #{}", sequence);
                }
                PlaybackSignal::Drained => {
                    if !self.capture.is_recording() {
                        let text = if self.awaiting_response {
                            STATUS_PROCESSING
                        } else {
                            self.idle_status()
                        };
                        self.show(text);
                    }
                }
                PlaybackSignal::Failed(reason) => {
                    self.show(&format!("Playback error: {}", reason));
                }
            }
        }
    }

    /// Apply a user action. Returns `false` when the user asked to quit.
    pub async fn handle_action(&mut self, action: UserAction) -> bool {
        match action {
            UserAction::StartRecording => self.start_recording().await,
            UserAction::StopRecording => self.stop_recording().await,
            UserAction::ToggleRecording => {
                if self.capture.is_recording() {
                    self.stop_recording().await;
                } else {
                    self.start_recording().await;
                }
            }
            UserAction::Interrupt => self.interrupt().await,
            UserAction::Refresh => self.request_refresh().await,
            UserAction::Quit => {
                log::info!("Quit requested");
                self.capture.abort();
                self.visualizer.detach();
                if let Some(playback) = self.playback.as_mut() {
                    playback.stop();
                }
                return false;
            }
        }
        self.publish();
        true
    }

    pub async fn start_recording(&mut self) {
        if self.capture.is_recording() {
            return;
        }
        if self.closed || !self.transport.is_open() {
            self.show("Not connected");
            return;
        }
        if self.refreshing {
            self.show("Refresh in progress, please wait");
            return;
        }
        if self.readiness != Readiness::Ready {
            self.show(STATUS_NOT_READY);
            return;
        }
        if self.is_playing() {
            self.show("Response still playing, interrupt it first");
            return;
        }
        if let Err(e) = self.ensure_output().await {
            self.show(&format!("Audio output unavailable: {}", e));
            return;
        }

        // a new turn never mixes with leftovers of the previous one
        if let Some(playback) = self.playback.as_mut() {
            playback.stop();
        }

        match self.capture.start(self.devices.as_ref()).await {
            Ok(analyzer) => {
                self.visualizer.attach(analyzer);
                self.awaiting_response = false;
                self.revert_at = None;
                self.show(STATUS_RECORDING);
            }
            Err(e) => {
                log::error!("Failed to start capture: {}", e);
                self.show(&format!("Microphone unavailable: {}", e));
            }
        }
    }

    pub async fn stop_recording(&mut self) {
        if !self.capture.is_recording() {
            return;
        }
        let outcome = self.capture.stop();
        self.visualizer.detach();

        match outcome {
            Ok(CaptureOutcome::Empty) => {
                self.show(STATUS_NO_AUDIO);
            }
            Ok(CaptureOutcome::Utterance(utterance)) => {
                log::info!(
                    "Sending {:.2}s utterance ({} bytes, {})",
                    utterance.duration.as_secs_f64(),
                    utterance.bytes.len(),
                    utterance.format.mime()
                );
                match self.transport.send_audio(utterance.bytes).await {
                    Ok(()) => {
                        self.awaiting_response = true;
                        self.discard_audio = false;
                        self.show(STATUS_PROCESSING);
                    }
                    Err(Error::NotConnected) => self.show("Not connected"),
                    Err(e) => self.show(&format!("Failed to send audio: {}", e)),
                }
            }
            Err(e) => {
                log::error!("Failed to finalize capture: {}", e);
                self.show(&format!("Recording failed: {}", e));
            }
        }
    }

    pub async fn interrupt(&mut self) {
        if let Some(playback) = self.playback.as_mut() {
            playback.stop();
        }
        self.awaiting_response = false;
        self.discard_audio = true;

        if let Err(e) = self.transport.send_command(ClientCommand::StopAgent).await {
            log::warn!("stop_agent not delivered: {}", e);
        }
        if !self.capture.is_recording() {
            let idle = self.idle_status();
            self.show(idle);
        }
    }

    pub async fn request_refresh(&mut self) {
        if self.refreshing || self.capture.is_recording() {
            return;
        }
        match self.transport.send_command(ClientCommand::RefreshZapier).await {
            Ok(()) => {
                self.refreshing = true;
                self.readiness = Readiness::NotReady;
                self.revert_at = None;
                self.show(STATUS_REFRESHING);
            }
            Err(Error::NotConnected) => self.show("Not connected"),
            Err(e) => self.show(&format!("Refresh failed: {}", e)),
        }
    }

    pub fn capture_tick(&mut self) {
        if let Err(e) = self.capture.tick() {
            log::error!("Capture tick failed: {}", e);
            self.capture.abort();
            self.visualizer.detach();
            self.show(&format!("Recording failed: {}", e));
            self.publish();
        }
    }

    /// The transient refresh status goes back to the idle text.
    pub fn revert_status(&mut self) {
        self.revert_at = None;
        if self.closed || self.refreshing || self.capture.is_recording() || self.is_playing() {
            return;
        }
        let idle = self.idle_status();
        self.show(idle);
    }

    fn shutdown(&mut self, reason: &str) {
        log::warn!("Link {} closed: {}", self.transport.id(), reason);
        self.closed = true;
        self.capture.abort();
        self.visualizer.detach();
        if let Some(playback) = self.playback.as_mut() {
            playback.stop();
        }
        self.readiness = Readiness::NotReady;
        self.refreshing = false;
        self.awaiting_response = false;
        self.revert_at = None;
        self.show(&format!("Disconnected: {}", reason));
        self.publish();
    }

    /// Drive the session until the link closes or the user quits.
    pub async fn run(
        mut self,
        mut net_rx: mpsc::Receiver<NetEvent>,
        mut actions: mpsc::Receiver<UserAction>,
    ) -> Result<()> {
        let mut completions = self
            .completions_rx
            .take()
            .ok_or_else(|| Error::Device("session already running".to_string()))?;

        let mut ticker = tokio::time::interval(self.settings.capture_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.publish();
        loop {
            let recording = self.capture.is_recording();
            let revert_at = self.revert_at;

            tokio::select! {
                event = net_rx.recv() => match event {
                    Some(event) => {
                        if !self.handle_net_event(event).await {
                            break;
                        }
                    }
                    None => {
                        self.shutdown("link task ended");
                        break;
                    }
                },
                Some(ticket) = completions.recv() => self.handle_completion(ticket),
                action = actions.recv() => match action {
                    Some(action) => {
                        if !self.handle_action(action).await {
                            break;
                        }
                    }
                    None => {
                        log::info!("All user interfaces closed");
                        break;
                    }
                },
                _ = ticker.tick(), if recording => self.capture_tick(),
                _ = tokio::time::sleep_until(revert_at.unwrap_or_else(Instant::now)), if revert_at.is_some() => {
                    self.revert_status();
                }
            }
        }

        self.transport.close().await;
        log::info!("Session ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::FakeDevices;
    use crate::capture::PcmEncoder;
    use crate::net_link::{ConnectionState, NetCommand};
    use std::sync::Mutex;

    #[derive(Default)]
    struct UiLog {
        statuses: Vec<String>,
        controls: Vec<Affordances>,
    }

    #[derive(Clone, Default)]
    struct RecordingUi(Arc<Mutex<UiLog>>);

    impl RecordingUi {
        fn statuses(&self) -> Vec<String> {
            self.0.lock().unwrap().statuses.clone()
        }

        fn last_status(&self) -> String {
            self.statuses().last().cloned().unwrap_or_default()
        }

        fn last_controls(&self) -> Option<Affordances> {
            self.0.lock().unwrap().controls.last().copied()
        }
    }

    impl UiSink for RecordingUi {
        fn status(&mut self, text: &str) {
            self.0.lock().unwrap().statuses.push(text.to_string());
        }

        fn controls(&mut self, affordances: Affordances) {
            self.0.lock().unwrap().controls.push(affordances);
        }
    }

    struct Harness {
        session: Session,
        devices: FakeDevices,
        ui: RecordingUi,
        sent: mpsc::Receiver<NetCommand>,
        link: Arc<Mutex<ConnectionState>>,
    }

    fn harness_with(devices: FakeDevices) -> Harness {
        let link = Arc::new(Mutex::new(ConnectionState::Open));
        let (tx, sent) = mpsc::channel(16);
        let transport = TransportHandle::new(link.clone(), tx);
        let ui = RecordingUi::default();
        let session = Session::new(
            transport,
            Arc::new(devices.clone()),
            Box::new(PcmEncoder),
            VisualizerHandle::detached(),
            Box::new(ui.clone()),
            SessionSettings::default(),
        );
        Harness {
            session,
            devices,
            ui,
            sent,
            link,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeDevices::default())
    }

    fn status(message: &str) -> NetEvent {
        NetEvent::Control(ServerMessage::Status {
            message: message.to_string(),
        })
    }

    fn agent_error(message: &str) -> NetEvent {
        NetEvent::Control(ServerMessage::Error {
            message: message.to_string(),
        })
    }

    fn refreshed(result: &str) -> NetEvent {
        NetEvent::Control(ServerMessage::ZapierRefreshed {
            status: result.to_string(),
        })
    }

    fn pcm(samples: usize) -> NetEvent {
        NetEvent::Audio(Bytes::from(vec![0u8; samples * 2]))
    }

    async fn ready(h: &mut Harness) {
        assert!(h.session.handle_net_event(status(AGENT_READY)).await);
    }

    fn sent_text(h: &mut Harness) -> Option<String> {
        match h.sent.try_recv() {
            Ok(NetCommand::SendText(text)) => Some(text),
            _ => None,
        }
    }

    #[tokio::test]
    async fn recording_is_gated_on_agent_ready() {
        let mut h = harness();
        h.session.handle_net_event(NetEvent::Opened).await;
        assert!(!h.session.affordances().can_record);

        h.session.handle_action(UserAction::StartRecording).await;
        assert!(!h.session.is_recording());
        assert_eq!(h.devices.mic_acquisitions(), 0);
        assert_eq!(h.ui.last_status(), STATUS_NOT_READY);

        ready(&mut h).await;
        assert_eq!(h.session.readiness(), Readiness::Ready);
        assert!(h.session.affordances().can_record);
        assert_eq!(h.ui.last_controls().map(|a| a.can_record), Some(true));

        h.session.handle_action(UserAction::StartRecording).await;
        assert!(h.session.is_recording());
        assert_eq!(h.devices.mic_acquisitions(), 1);
        let affordances = h.session.affordances();
        assert!(!affordances.can_record);
        assert!(affordances.can_stop_recording);
        assert!(!affordances.can_refresh);
    }

    #[tokio::test]
    async fn other_status_messages_do_not_grant_readiness() {
        let mut h = harness();
        h.session.handle_net_event(status("Agent warming up")).await;
        assert_eq!(h.session.readiness(), Readiness::NotReady);
        assert_eq!(h.ui.last_status(), "Agent warming up");
        assert!(!h.session.affordances().can_record);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_capture_disabled() {
        let mut h = harness();
        ready(&mut h).await;

        h.session.handle_action(UserAction::Refresh).await;
        assert_eq!(sent_text(&mut h).as_deref(), Some(r#"{"command":"refresh_zapier"}"#));
        assert_eq!(h.ui.last_status(), STATUS_REFRESHING);
        let during = h.session.affordances();
        assert!(!during.can_record);
        assert!(!during.can_refresh);

        h.session.handle_net_event(status("Zapier refresh started...")).await;
        assert!(!h.session.affordances().can_record);

        h.session.handle_net_event(refreshed("failure")).await;
        assert_eq!(h.session.readiness(), Readiness::NotReady);
        assert_eq!(h.ui.last_status(), STATUS_REFRESH_FAILED);
        assert!(!h.session.affordances().can_record);
        assert!(h.session.affordances().can_refresh);

        h.session.handle_action(UserAction::StartRecording).await;
        assert_eq!(h.devices.mic_acquisitions(), 0);
    }

    #[tokio::test]
    async fn successful_refresh_restores_readiness() {
        let mut h = harness();
        h.session.handle_action(UserAction::Refresh).await;
        h.session.handle_net_event(refreshed("success")).await;

        assert_eq!(h.session.readiness(), Readiness::Ready);
        assert_eq!(h.ui.last_status(), STATUS_REFRESHED);
        assert!(h.session.affordances().can_record);
    }

    #[tokio::test]
    async fn empty_capture_sends_nothing() {
        let mut h = harness();
        ready(&mut h).await;

        h.session.handle_action(UserAction::ToggleRecording).await;
        h.session.capture_tick();
        h.session.handle_action(UserAction::ToggleRecording).await;

        assert!(!h.session.is_recording());
        assert_eq!(h.ui.last_status(), STATUS_NO_AUDIO);
        assert!(h.sent.try_recv().is_err());
        assert!(h.devices.mic_released());
        assert!(h.session.affordances().can_record);
    }

    #[tokio::test]
    async fn recorded_utterance_is_sent_as_one_frame() {
        let devices = FakeDevices::default();
        devices.script_microphone(vec![vec![1, 2], vec![3]]);
        let mut h = harness_with(devices);
        ready(&mut h).await;

        h.session.handle_action(UserAction::StartRecording).await;
        h.session.capture_tick();
        h.session.handle_action(UserAction::StopRecording).await;

        match h.sent.try_recv() {
            Ok(NetCommand::SendBinary(payload)) => {
                assert_eq!(&payload[..], &[1, 0, 2, 0, 3, 0]);
            }
            other => panic!("expected one binary frame, got {:?}", other),
        }
        assert!(h.sent.try_recv().is_err());
        assert_eq!(h.ui.last_status(), STATUS_PROCESSING);
        assert!(h.session.affordances().can_interrupt);
    }

    #[tokio::test]
    async fn denied_microphone_returns_to_idle() {
        let devices = FakeDevices {
            deny_microphone: true,
            ..Default::default()
        };
        let mut h = harness_with(devices);
        ready(&mut h).await;

        h.session.handle_action(UserAction::StartRecording).await;
        assert!(!h.session.is_recording());
        assert!(h.ui.last_status().starts_with("Microphone unavailable"));
        assert!(h.session.affordances().can_record);
    }

    #[tokio::test]
    async fn audio_plays_and_drains_back_to_idle() {
        let mut h = harness();
        ready(&mut h).await;

        h.session.handle_net_event(pcm(240)).await;
        h.session.handle_net_event(pcm(240)).await;
        assert!(h.session.is_playing());
        assert_eq!(h.ui.last_status(), STATUS_PLAYING);
        assert!(!h.session.affordances().can_record);
        assert!(h.session.affordances().can_interrupt);

        h.session
            .handle_net_event(NetEvent::Control(ServerMessage::AudioStreamEnd {}))
            .await;
        assert!(h.session.is_playing());

        let first = h.devices.output.last_ticket().unwrap();
        h.session.handle_completion(first);
        let second = h.devices.output.last_ticket().unwrap();
        assert_ne!(first, second);
        h.session.handle_completion(second);

        assert!(!h.session.is_playing());
        assert_eq!(h.ui.last_status(), AGENT_READY);
        assert!(h.session.affordances().can_record);
    }

    #[tokio::test]
    async fn interrupt_stops_playback_and_notifies_agent() {
        let mut h = harness();
        ready(&mut h).await;
        h.session.handle_net_event(pcm(2400)).await;
        h.session.handle_net_event(pcm(2400)).await;

        h.session.handle_action(UserAction::Interrupt).await;

        assert!(!h.session.is_playing());
        assert!(h.devices.output.halts() >= 1);
        assert_eq!(sent_text(&mut h).as_deref(), Some(r#"{"command":"stop_agent"}"#));
        assert!(h.session.affordances().can_record);
        assert_eq!(h.ui.last_status(), AGENT_READY);
    }

    #[tokio::test]
    async fn audio_after_interrupt_is_dropped_until_stream_end() {
        let mut h = harness();
        ready(&mut h).await;
        h.session.handle_net_event(pcm(2400)).await;
        h.session.handle_action(UserAction::Interrupt).await;

        // the agent had already sent more of the cancelled reply
        h.session.handle_net_event(pcm(2400)).await;
        assert!(!h.session.is_playing());
        assert_eq!(h.devices.output.scheduled().len(), 1);
        assert_eq!(h.ui.last_status(), AGENT_READY);

        h.session
            .handle_net_event(NetEvent::Control(ServerMessage::AudioStreamEnd {}))
            .await;
        h.session.handle_net_event(pcm(2400)).await;
        assert!(h.session.is_playing());
        assert_eq!(h.devices.output.scheduled().len(), 2);
    }

    #[tokio::test]
    async fn sending_a_new_utterance_accepts_audio_again() {
        let devices = FakeDevices::default();
        devices.script_microphone(vec![vec![1, 2, 3]]);
        let mut h = harness_with(devices);
        ready(&mut h).await;
        h.session.handle_action(UserAction::Interrupt).await;
        h.session.handle_net_event(pcm(240)).await;
        assert!(!h.session.is_playing());

        h.session.handle_action(UserAction::StartRecording).await;
        h.session.capture_tick();
        h.session.handle_action(UserAction::StopRecording).await;
        h.session.handle_net_event(pcm(240)).await;
        assert!(h.session.is_playing());
    }

    #[tokio::test]
    async fn interrupt_while_disconnected_is_harmless() {
        let mut h = harness();
        ready(&mut h).await;
        h.session.handle_net_event(pcm(240)).await;
        *h.link.lock().unwrap() = ConnectionState::Closed;

        h.session.handle_action(UserAction::Interrupt).await;
        assert!(!h.session.is_playing());
        assert!(h.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn agent_error_clears_playback_and_keeps_session_usable() {
        let mut h = harness();
        ready(&mut h).await;
        h.session.handle_net_event(pcm(2400)).await;
        h.session.handle_net_event(pcm(2400)).await;
        let stale = h.devices.output.last_ticket().unwrap();

        h.session
            .handle_net_event(agent_error("Agent processing failed: timeout"))
            .await;

        assert!(!h.session.is_playing());
        assert_eq!(h.ui.last_status(), "Error: Agent processing failed: timeout");
        assert!(h.session.affordances().can_record);

        // the cancelled chunk's completion arrives late and changes nothing
        h.session.handle_completion(stale);
        assert_eq!(h.devices.output.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_agent_error_drops_readiness() {
        let mut h = harness();
        ready(&mut h).await;
        h.session.handle_net_event(agent_error("Agent not ready")).await;
        assert_eq!(h.session.readiness(), Readiness::NotReady);
        assert!(!h.session.affordances().can_record);
    }

    #[tokio::test]
    async fn corrupt_chunk_is_skipped() {
        let mut h = harness();
        ready(&mut h).await;
        h.session
            .handle_net_event(NetEvent::Audio(Bytes::from_static(&[1, 2, 3])))
            .await;
        assert!(!h.session.is_playing());

        h.session.handle_net_event(pcm(240)).await;
        assert!(h.session.is_playing());
        assert_eq!(h.devices.output.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn closed_link_disables_everything() {
        let mut h = harness();
        ready(&mut h).await;
        h.session.handle_action(UserAction::StartRecording).await;
        assert!(h.session.is_recording());

        *h.link.lock().unwrap() = ConnectionState::Closed;
        let keep_going = h
            .session
            .handle_net_event(NetEvent::Closed("server went away".into()))
            .await;

        assert!(!keep_going);
        assert!(!h.session.is_recording());
        assert!(h.devices.mic_released());
        assert_eq!(h.session.readiness(), Readiness::NotReady);
        assert_eq!(h.session.affordances(), Affordances::default());
        assert_eq!(h.ui.last_controls(), Some(Affordances::default()));
        assert!(h.ui.last_status().starts_with("Disconnected"));

        // a late status cannot revive a closed session
        h.session.handle_net_event(status(AGENT_READY)).await;
        assert_eq!(h.session.affordances(), Affordances::default());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_status_reverts_after_delay() {
        let h = harness();
        let ui = h.ui.clone();
        let _sent = h.sent;
        let (net_tx, net_rx) = mpsc::channel(8);
        let (action_tx, action_rx) = mpsc::channel(8);
        let task = tokio::spawn(h.session.run(net_rx, action_rx));

        net_tx.send(status(AGENT_READY)).await.unwrap();
        action_tx.send(UserAction::Refresh).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ui.last_status(), STATUS_REFRESHING);

        net_tx.send(refreshed("success")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(ui.last_status(), STATUS_REFRESHED);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(ui.last_status(), AGENT_READY);

        net_tx.send(NetEvent::Closed("bye".into())).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(ui.last_status().starts_with("Disconnected"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_capture_and_quits_on_request() {
        let devices = FakeDevices::default();
        devices.script_microphone(vec![vec![5; 10], vec![6; 10], vec![7; 10]]);
        let mut h = harness_with(devices);
        let (net_tx, net_rx) = mpsc::channel(8);
        let (action_tx, action_rx) = mpsc::channel(8);
        let task = tokio::spawn(h.session.run(net_rx, action_rx));

        net_tx.send(status(AGENT_READY)).await.unwrap();
        action_tx.send(UserAction::StartRecording).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        action_tx.send(UserAction::StopRecording).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        match h.sent.try_recv() {
            Ok(NetCommand::SendBinary(payload)) => assert_eq!(payload.len(), 60),
            other => panic!("expected the utterance, got {:?}", other),
        }

        action_tx.send(UserAction::Quit).await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(*h.link.lock().unwrap(), ConnectionState::Closed);
    }
}
