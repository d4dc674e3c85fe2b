//! Playback engine: FIFO chunk queue plus gapless scheduler.
//!
//! Chunks arrive at irregular intervals and must render as continuous
//! speech. Each chunk starts at `max(device_now, next_start_time)`: on-time
//! chunks chain end-to-end with no gap or overlap, late chunks start
//! immediately. Exactly one chunk is in flight at a time; its completion
//! ticket drives the next one.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::audio::{pcm16_to_f32, AudioOutput, PlaybackTicket, CHUNK_SAMPLE_RATE};
use crate::error::{Error, Result};

/// One synthesized-speech chunk: mono s16le PCM at 24 kHz, no header.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    sequence: u64,
    data: Bytes,
}

impl AudioChunk {
    pub fn new(sequence: u64, data: Bytes) -> Self {
        Self { sequence, data }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        (self.data.len() / 2) as f64 / f64::from(CHUNK_SAMPLE_RATE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
}

/// Notifications for the session, drained after each call.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackSignal {
    /// A chunk was dropped because it is not whole 16-bit samples
    CorruptChunk { sequence: u64 },
    /// The queue ran dry after the last chunk finished
    Drained,
    /// Scheduling failed; the queue was cleared
    Failed(String),
}

pub struct PlaybackEngine {
    output: Box<dyn AudioOutput>,
    queue: VecDeque<AudioChunk>,
    state: PlaybackState,
    next_start_time: f64,
    generation: u64,
    in_flight: Option<PlaybackTicket>,
    needs_resume: bool,
    signals: Vec<PlaybackSignal>,
}

impl PlaybackEngine {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            queue: VecDeque::new(),
            state: PlaybackState::Idle,
            next_start_time: 0.0,
            generation: 0,
            in_flight: None,
            needs_resume: true,
            signals: Vec::new(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Playing or holding chunks that will play.
    pub fn is_active(&self) -> bool {
        self.state == PlaybackState::Playing || !self.queue.is_empty()
    }

    pub fn enqueue(&mut self, chunk: AudioChunk) {
        log::debug!(
            "Queued chunk #{} ({} bytes), {} waiting",
            chunk.sequence(),
            chunk.len(),
            self.queue.len()
        );
        self.queue.push_back(chunk);
        if self.state == PlaybackState::Idle {
            self.try_play_next();
        }
    }

    /// Schedule the head of the queue unless a chunk is already in flight.
    pub fn try_play_next(&mut self) {
        while self.state == PlaybackState::Idle {
            let Some(chunk) = self.queue.pop_front() else {
                return;
            };
            self.state = PlaybackState::Playing;

            match self.schedule(&chunk) {
                Ok(ticket) => {
                    self.in_flight = Some(ticket);
                }
                Err(Error::CorruptChunk(reason)) => {
                    log::warn!("Dropping chunk #{}: {}", chunk.sequence(), reason);
                    self.state = PlaybackState::Idle;
                    self.signals.push(PlaybackSignal::CorruptChunk {
                        sequence: chunk.sequence(),
                    });
                }
                Err(e) => {
                    self.fail(e.to_string());
                    return;
                }
            }
        }
    }

    fn schedule(&mut self, chunk: &AudioChunk) -> Result<PlaybackTicket> {
        if chunk.len() % 2 != 0 {
            return Err(Error::CorruptChunk(format!("odd length {}", chunk.len())));
        }

        if self.needs_resume {
            self.output.resume()?;
            self.needs_resume = false;
        }

        let samples = pcm16_to_f32(&chunk.data);
        let duration = chunk.duration_secs();

        let now = self.output.current_time();
        let start = now.max(self.next_start_time);
        if self.next_start_time > 0.0 && now > self.next_start_time {
            log::debug!(
                "Output starved by {:.3}s before chunk #{}",
                now - self.next_start_time,
                chunk.sequence()
            );
        }

        let ticket = PlaybackTicket {
            generation: self.generation,
            sequence: chunk.sequence(),
        };
        self.output.schedule(samples, start, ticket)?;
        self.next_start_time = start + duration;

        log::debug!(
            "Scheduled chunk #{} at {:.3}s for {:.3}s",
            chunk.sequence(),
            start,
            duration
        );
        Ok(ticket)
    }

    /// Completion from the output device. Stale tickets are ignored.
    pub fn on_chunk_finished(&mut self, ticket: PlaybackTicket) {
        if self.in_flight != Some(ticket) {
            log::debug!("Ignoring stale completion {:?}", ticket);
            return;
        }
        self.in_flight = None;
        self.state = PlaybackState::Idle;

        let generation = self.generation;
        self.try_play_next();
        if self.generation != generation {
            // scheduling failed and already reset everything
            return;
        }

        if self.state == PlaybackState::Idle && self.queue.is_empty() {
            self.next_start_time = 0.0;
            self.needs_resume = true;
            self.output.flush();
            self.signals.push(PlaybackSignal::Drained);
            log::debug!("Playback queue drained");
        }
    }

    /// Halt output, drop queued chunks and detach the in-flight completion.
    pub fn stop(&mut self) {
        self.reset();
        log::debug!("Playback stopped (generation {})", self.generation);
    }

    fn fail(&mut self, reason: String) {
        log::error!("Playback error: {}", reason);
        self.reset();
        self.signals.push(PlaybackSignal::Failed(reason));
    }

    fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.in_flight = None;
        self.output.halt();
        self.queue.clear();
        self.next_start_time = 0.0;
        self.state = PlaybackState::Idle;
        self.needs_resume = true;
    }

    pub fn drain_signals(&mut self) -> Vec<PlaybackSignal> {
        std::mem::take(&mut self.signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::FakeOutput;

    /// `samples` samples of PCM whose first sample carries the sequence.
    fn chunk(sequence: u64, samples: usize) -> AudioChunk {
        let mut data = vec![0u8; samples * 2];
        data[..2].copy_from_slice(&(sequence as i16).to_le_bytes());
        AudioChunk::new(sequence, Bytes::from(data))
    }

    fn engine() -> (PlaybackEngine, FakeOutput) {
        let output = FakeOutput::default();
        (PlaybackEngine::new(Box::new(output.clone())), output)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn finish_current(engine: &mut PlaybackEngine, output: &FakeOutput) {
        let ticket = output.last_ticket().expect("a chunk should be scheduled");
        engine.on_chunk_finished(ticket);
    }

    #[test]
    fn plays_in_arrival_order() {
        let (mut engine, output) = engine();
        for seq in 0..5 {
            engine.enqueue(chunk(seq, 240));
        }
        // one in flight at a time
        assert_eq!(output.scheduled().len(), 1);

        for _ in 0..5 {
            finish_current(&mut engine, &output);
        }

        let order: Vec<u64> = output.scheduled().iter().map(|c| c.ticket.sequence).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn on_time_chunks_chain_without_gaps() {
        let (mut engine, output) = engine();
        output.set_clock(1.0);

        let sizes = [2400usize, 4800, 1200];
        for (seq, size) in sizes.iter().enumerate() {
            engine.enqueue(chunk(seq as u64, *size));
        }
        // device clock does not catch up with the schedule
        finish_current(&mut engine, &output);
        finish_current(&mut engine, &output);

        let starts: Vec<f64> = output.scheduled().iter().map(|c| c.start_at).collect();
        assert_eq!(starts.len(), 3);
        for (actual, expected) in starts.iter().zip([1.0, 1.1, 1.3]) {
            assert!(close(*actual, expected), "{actual} != {expected}");
        }

        let total: f64 = sizes.iter().map(|s| *s as f64 / 24_000.0).sum();
        assert!((engine.next_start_time() - (1.0 + total)).abs() < 1e-9);
    }

    #[test]
    fn late_chunk_starts_at_device_clock() {
        let (mut engine, output) = engine();
        output.set_clock(2.0);
        engine.enqueue(chunk(0, 2400));
        assert!((engine.next_start_time() - 2.1).abs() < 1e-9);

        // chunk 0 done, queue empty; the device then runs past the old end time
        finish_current(&mut engine, &output);
        output.set_clock(5.0);
        engine.enqueue(chunk(1, 2400));

        assert_eq!(output.scheduled()[1].start_at, 5.0);
        assert!((engine.next_start_time() - 5.1).abs() < 1e-9);
    }

    #[test]
    fn starved_mid_stream_restarts_at_now() {
        let (mut engine, output) = engine();
        output.set_clock(0.5);
        engine.enqueue(chunk(0, 2400));
        engine.enqueue(chunk(1, 2400));

        finish_current(&mut engine, &output);
        assert!(close(output.scheduled()[1].start_at, 0.6));

        // the next chunk arrives well after chunk 1 should have ended
        output.set_clock(3.0);
        engine.enqueue(chunk(2, 2400));
        finish_current(&mut engine, &output);
        assert_eq!(output.scheduled()[2].start_at, 3.0);
    }

    #[test]
    fn clock_resets_once_when_queue_drains() {
        let (mut engine, output) = engine();
        output.set_clock(1.0);
        engine.enqueue(chunk(0, 2400));
        engine.enqueue(chunk(1, 2400));

        finish_current(&mut engine, &output);
        assert!(engine.next_start_time() > 0.0);
        assert!(engine.drain_signals().is_empty());

        finish_current(&mut engine, &output);
        assert_eq!(engine.next_start_time(), 0.0);
        assert_eq!(engine.drain_signals(), vec![PlaybackSignal::Drained]);

        // a repeated completion is stale and resets nothing
        finish_current(&mut engine, &output);
        assert!(engine.drain_signals().is_empty());

        // the next run starts from a fresh clock
        output.set_clock(4.0);
        engine.enqueue(chunk(2, 2400));
        assert_eq!(output.scheduled()[2].start_at, 4.0);
        assert!(engine.drain_signals().is_empty());
    }

    #[test]
    fn output_is_flushed_once_per_drained_run() {
        let (mut engine, output) = engine();
        engine.enqueue(chunk(0, 2400));
        engine.enqueue(chunk(1, 2400));

        finish_current(&mut engine, &output);
        assert_eq!(output.flushes(), 0);

        finish_current(&mut engine, &output);
        assert_eq!(output.flushes(), 1);

        // stale completion and stop do not flush again
        finish_current(&mut engine, &output);
        engine.stop();
        assert_eq!(output.flushes(), 1);
    }

    #[test]
    fn odd_length_chunk_is_dropped_and_pipeline_continues() {
        let (mut engine, output) = engine();
        engine.enqueue(AudioChunk::new(0, Bytes::from_static(&[1, 2, 3])));
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert_eq!(
            engine.drain_signals(),
            vec![PlaybackSignal::CorruptChunk { sequence: 0 }]
        );

        engine.enqueue(chunk(1, 240));
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(output.scheduled().len(), 1);
        assert_eq!(output.scheduled()[0].ticket.sequence, 1);
    }

    #[test]
    fn odd_length_chunk_between_valid_ones_is_skipped() {
        let (mut engine, output) = engine();
        engine.enqueue(chunk(0, 240));
        engine.enqueue(AudioChunk::new(1, Bytes::from_static(&[9])));
        engine.enqueue(chunk(2, 240));

        finish_current(&mut engine, &output);
        let order: Vec<u64> = output.scheduled().iter().map(|c| c.ticket.sequence).collect();
        assert_eq!(order, vec![0, 2]);
        assert_eq!(engine.state(), PlaybackState::Playing);
    }

    #[test]
    fn stop_cancels_in_flight_completion() {
        let (mut engine, output) = engine();
        output.set_clock(1.0);
        engine.enqueue(chunk(0, 2400));
        engine.enqueue(chunk(1, 2400));
        let in_flight = output.last_ticket().unwrap();

        engine.stop();
        assert_eq!(output.halts(), 1);
        assert_eq!(engine.next_start_time(), 0.0);
        assert_eq!(engine.queued(), 0);
        assert!(!engine.is_active());

        // the detached completion fires late and must not resurrect anything
        engine.on_chunk_finished(in_flight);
        assert_eq!(output.scheduled().len(), 1);
        assert_eq!(engine.next_start_time(), 0.0);
        assert!(engine.drain_signals().is_empty());
    }

    #[test]
    fn tickets_from_before_stop_do_not_match_new_chunks() {
        let (mut engine, output) = engine();
        engine.enqueue(chunk(7, 240));
        let old = output.last_ticket().unwrap();
        engine.stop();

        engine.enqueue(chunk(7, 240));
        let new = output.last_ticket().unwrap();
        assert_ne!(old, new);

        engine.on_chunk_finished(old);
        assert_eq!(engine.state(), PlaybackState::Playing);
        engine.on_chunk_finished(new);
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[test]
    fn scheduling_failure_resets_to_idle() {
        let (mut engine, output) = engine();
        output.fail_next_schedule();
        engine.enqueue(chunk(0, 240));
        engine.enqueue(chunk(1, 240));

        // the first failure cleared chunk 0; chunk 1 arrived afterwards
        let signals = engine.drain_signals();
        assert!(matches!(signals.as_slice(), [PlaybackSignal::Failed(_)]));
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(output.scheduled().len(), 1);
        assert_eq!(output.scheduled()[0].ticket.sequence, 1);
    }

    #[test]
    fn failure_clears_queued_chunks() {
        let (mut engine, output) = engine();
        engine.enqueue(chunk(0, 240));
        engine.enqueue(chunk(1, 240));
        engine.enqueue(chunk(2, 240));

        output.fail_next_schedule();
        finish_current(&mut engine, &output);

        assert_eq!(engine.state(), PlaybackState::Idle);
        assert_eq!(engine.queued(), 0);
        assert_eq!(engine.next_start_time(), 0.0);
        assert!(matches!(engine.drain_signals().as_slice(), [PlaybackSignal::Failed(_)]));
    }

    #[test]
    fn resumes_output_once_per_playback_run() {
        let (mut engine, output) = engine();
        engine.enqueue(chunk(0, 240));
        engine.enqueue(chunk(1, 240));
        finish_current(&mut engine, &output);
        finish_current(&mut engine, &output);
        assert_eq!(output.resumes(), 1);

        engine.enqueue(chunk(2, 240));
        assert_eq!(output.resumes(), 2);
    }

    #[test]
    fn samples_are_normalized() {
        let (mut engine, output) = engine();
        let data = Bytes::from(vec![0x00, 0x40, 0x00, 0xc0]);
        engine.enqueue(AudioChunk::new(0, data));
        assert_eq!(output.scheduled()[0].samples, vec![0.5, -0.5]);
    }
}
