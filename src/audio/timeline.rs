//! Frame-accurate placement of scheduled buffers into device periods.
//!
//! The feeder thread owns one [`Timeline`] and calls [`Timeline::fill`] for
//! every period it writes. `cursor` is the next frame that has not been
//! handed to the device yet, which is also the earliest frame a newly
//! scheduled buffer can still occupy.

use std::collections::VecDeque;

use super::PlaybackTicket;

struct Placed {
    start_frame: u64,
    /// Interleaved samples
    samples: Vec<i16>,
    frames: u64,
    ticket: Option<PlaybackTicket>,
    notified: bool,
}

impl Placed {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.frames
    }
}

pub struct Timeline {
    channels: usize,
    cursor: u64,
    /// End of the last buffer placed in the current run
    tail_end: u64,
    /// Starts at most this far past `tail_end` continue the run seamlessly
    snap_frames: u64,
    pending: VecDeque<Placed>,
}

impl Timeline {
    pub fn new(channels: usize, cursor: u64, snap_frames: u64) -> Self {
        Self {
            channels: channels.max(1),
            cursor,
            tail_end: cursor,
            snap_frames,
            pending: VecDeque::new(),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Place interleaved `samples` at `start_frame`, or right after the
    /// previous buffer when `start_frame` is `None`.
    ///
    /// Buffers never overlap: a start inside the previous buffer waits for
    /// its end, and a start that already passed is moved to the cursor
    /// instead of skipping the head of the buffer.
    pub fn push(&mut self, start_frame: Option<u64>, samples: Vec<i16>, ticket: Option<PlaybackTicket>) {
        let start = match start_frame {
            Some(frame) if frame > self.tail_end + self.snap_frames => frame,
            _ => self.tail_end,
        }
        .max(self.cursor);

        let frames = (samples.len() / self.channels) as u64;
        self.tail_end = start + frames;
        self.pending.push_back(Placed {
            start_frame: start,
            samples,
            frames,
            ticket,
            notified: false,
        });
    }

    /// Drop everything not yet rendered. No ticket fires for dropped buffers.
    pub fn halt(&mut self) {
        self.pending.clear();
        self.tail_end = self.cursor;
    }

    /// Render the next period into `period` (interleaved, silence where
    /// nothing is scheduled) and advance the cursor.
    ///
    /// Returns the tickets of buffers that end before the following period
    /// is filled, so the next buffer can be scheduled back to back.
    pub fn fill(&mut self, period: &mut [i16]) -> Vec<PlaybackTicket> {
        let channels = self.channels;
        let frames = period.len() / channels;
        let mut tickets = Vec::new();
        period.fill(0);

        for i in 0..frames {
            let frame = self.cursor + i as u64;
            while self.pending.front().is_some_and(|item| item.end_frame() <= frame) {
                self.finish_front(&mut tickets);
            }
            if let Some(item) = self.pending.front() {
                if frame >= item.start_frame {
                    let offset = (frame - item.start_frame) as usize * channels;
                    period[i * channels..(i + 1) * channels]
                        .copy_from_slice(&item.samples[offset..offset + channels]);
                }
            }
        }

        self.cursor += frames as u64;
        while self.pending.front().is_some_and(|item| item.end_frame() <= self.cursor) {
            self.finish_front(&mut tickets);
        }

        let horizon = self.cursor + frames as u64;
        for item in self.pending.iter_mut() {
            if item.end_frame() > horizon {
                break;
            }
            if !item.notified {
                item.notified = true;
                tickets.extend(item.ticket);
            }
        }
        tickets
    }

    fn finish_front(&mut self, tickets: &mut Vec<PlaybackTicket>) {
        if let Some(item) = self.pending.pop_front() {
            if !item.notified {
                tickets.extend(item.ticket);
            }
        }
    }
}
