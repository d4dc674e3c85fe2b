//! In-memory devices for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{AudioDevices, AudioOutput, Microphone, PlaybackTicket, SignalAnalyzer};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCall {
    pub start_at: f64,
    pub samples: Vec<f32>,
    pub ticket: PlaybackTicket,
}

#[derive(Default)]
pub struct FakeOutputState {
    pub clock: f64,
    pub scheduled: Vec<ScheduledCall>,
    pub halts: usize,
    pub flushes: usize,
    pub resumes: usize,
    pub fail_schedule: bool,
}

/// Output whose clock only moves when a test says so.
#[derive(Clone, Default)]
pub struct FakeOutput {
    pub state: Arc<Mutex<FakeOutputState>>,
}

impl FakeOutput {
    pub fn set_clock(&self, seconds: f64) {
        self.state.lock().unwrap().clock = seconds;
    }

    pub fn scheduled(&self) -> Vec<ScheduledCall> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub fn last_ticket(&self) -> Option<PlaybackTicket> {
        self.state.lock().unwrap().scheduled.last().map(|c| c.ticket)
    }

    pub fn halts(&self) -> usize {
        self.state.lock().unwrap().halts
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().unwrap().flushes
    }

    pub fn resumes(&self) -> usize {
        self.state.lock().unwrap().resumes
    }

    pub fn fail_next_schedule(&self) {
        self.state.lock().unwrap().fail_schedule = true;
    }
}

impl AudioOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().clock
    }

    fn resume(&mut self) -> Result<()> {
        self.state.lock().unwrap().resumes += 1;
        Ok(())
    }

    fn schedule(&mut self, samples: Vec<f32>, start_at: f64, ticket: PlaybackTicket) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_schedule {
            state.fail_schedule = false;
            return Err(Error::Device("output rejected buffer".to_string()));
        }
        state.scheduled.push(ScheduledCall { start_at, samples, ticket });
        Ok(())
    }

    fn halt(&mut self) {
        self.state.lock().unwrap().halts += 1;
    }

    fn flush(&mut self) {
        self.state.lock().unwrap().flushes += 1;
    }
}

/// Microphone that hands out scripted blocks, one per `take_samples`.
pub struct FakeMicrophone {
    blocks: Arc<Mutex<VecDeque<Vec<i16>>>>,
    analyzer: SignalAnalyzer,
    released: Arc<Mutex<bool>>,
}

impl Microphone for FakeMicrophone {
    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn take_samples(&mut self) -> Vec<i16> {
        let block = self.blocks.lock().unwrap().pop_front().unwrap_or_default();
        self.analyzer.push(&block);
        block
    }

    fn analyzer(&self) -> SignalAnalyzer {
        self.analyzer.clone()
    }
}

impl Drop for FakeMicrophone {
    fn drop(&mut self) {
        *self.released.lock().unwrap() = true;
    }
}

#[derive(Clone, Default)]
pub struct FakeDevices {
    pub output: FakeOutput,
    pub mic_blocks: Arc<Mutex<VecDeque<Vec<i16>>>>,
    pub mic_released: Arc<Mutex<bool>>,
    pub mic_acquisitions: Arc<Mutex<usize>>,
    pub deny_microphone: bool,
}

impl FakeDevices {
    pub fn script_microphone(&self, blocks: Vec<Vec<i16>>) {
        self.mic_blocks.lock().unwrap().extend(blocks);
    }

    pub fn mic_released(&self) -> bool {
        *self.mic_released.lock().unwrap()
    }

    pub fn mic_acquisitions(&self) -> usize {
        *self.mic_acquisitions.lock().unwrap()
    }
}

#[async_trait]
impl AudioDevices for FakeDevices {
    async fn microphone(&self) -> Result<Box<dyn Microphone>> {
        if self.deny_microphone {
            return Err(Error::Device("permission denied".to_string()));
        }
        *self.mic_acquisitions.lock().unwrap() += 1;
        *self.mic_released.lock().unwrap() = false;
        Ok(Box::new(FakeMicrophone {
            blocks: self.mic_blocks.clone(),
            analyzer: SignalAnalyzer::new(),
            released: self.mic_released.clone(),
        }))
    }

    async fn output(
        &self,
        _completions: mpsc::UnboundedSender<PlaybackTicket>,
    ) -> Result<Box<dyn AudioOutput>> {
        Ok(Box::new(self.output.clone()))
    }
}
