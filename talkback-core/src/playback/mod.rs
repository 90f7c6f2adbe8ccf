//! Strictly-ordered playback of response audio.
//!
//! ## Ordering contract
//!
//! Response chunks arrive in generation order and must be played back to
//! back with no overlap: chunk N's audio always finishes before chunk N+1's
//! starts. A FIFO queue plus a single "playing" flag enforce this. The
//! sequencer lives on one thread (the relay worker), and the flag is checked
//! and set synchronously with no suspension in between, so the flag is the
//! only mutual exclusion required.
//!
//! ## Error policy
//!
//! A chunk the sink rejects is treated like a completed slot: logged,
//! counted, and skipped. One bad chunk never stalls the stream. `close`
//! drops the queue and the device resource, is idempotent, and makes any
//! late completion notification a no-op.

pub mod device;

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::Result;
use crate::pcm;

/// Playback output seam.
///
/// Implementations are what actually make noise: a cpal output stream in
/// production, a recording fake in tests. The trait deliberately does not
/// require `Send` — the cpal-backed sink owns a `!Send` stream and lives its
/// whole life on the thread that created it.
pub trait PlaybackSink {
    /// Hand one decoded buffer to the device and return immediately.
    ///
    /// Exactly one completion notification must eventually follow every
    /// successful `begin`; how it travels back is the implementor's choice
    /// (the cpal sink posts to a channel the relay polls).
    fn begin(&mut self, samples: Vec<f32>) -> Result<()>;

    /// Discard any device-side audio and stop delivering completions.
    fn stop(&mut self);
}

/// Plays queued response chunks one at a time, in arrival order.
pub struct PlaybackSequencer {
    /// Pending chunks, head next to play. Unbounded by design; the inbound
    /// message channel upstream is the bounded safety valve, and
    /// `queue_high_water` makes growth observable.
    queue: VecDeque<Vec<i16>>,
    /// True from a successful sink `begin` until its completion arrives.
    playing: bool,
    /// Terminal flag set by `close`.
    closed: bool,
    sink: Box<dyn PlaybackSink>,
    chunks_played: u64,
    chunks_skipped: u64,
    queue_high_water: usize,
}

impl PlaybackSequencer {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            queue: VecDeque::new(),
            playing: false,
            closed: false,
            sink,
            chunks_played: 0,
            chunks_skipped: 0,
            queue_high_water: 0,
        }
    }

    /// Append a chunk to the queue; starts playback if the device is idle.
    pub fn enqueue(&mut self, pcm: Vec<i16>) {
        if self.closed {
            debug!("sequencer closed: dropped inbound chunk");
            return;
        }
        self.queue.push_back(pcm);
        self.queue_high_water = self.queue_high_water.max(self.queue.len());
        if !self.playing {
            self.play_next();
        }
    }

    /// Start the next queued chunk if idle. No-op while a chunk is playing
    /// or when the queue is empty, so it is safe to call at any time.
    pub fn play_next(&mut self) {
        if self.playing || self.closed {
            return;
        }
        while let Some(pcm) = self.queue.pop_front() {
            if pcm.is_empty() {
                self.chunks_skipped += 1;
                debug!("skipped empty playback chunk");
                continue;
            }
            let samples = pcm::decode(&pcm);
            match self.sink.begin(samples) {
                Ok(()) => {
                    self.playing = true;
                    return;
                }
                Err(e) => {
                    // Treat like a completed slot and advance.
                    self.chunks_skipped += 1;
                    warn!(error = %e, "playback sink rejected chunk: skipping");
                }
            }
        }
    }

    /// Record completion of the current chunk and advance the queue.
    ///
    /// Ignored after `close` (the completion belongs to audio that was
    /// discarded) and when nothing was playing.
    pub fn finish_current(&mut self) {
        if self.closed || !self.playing {
            return;
        }
        self.playing = false;
        self.chunks_played += 1;
        self.play_next();
    }

    /// Drop all queued audio and release the output device. Idempotent and
    /// safe to call mid-playback.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.queue.clear();
        self.playing = false;
        self.closed = true;
        self.sink.stop();
        debug!("playback sequencer closed");
    }

    /// True while a chunk is being played by the sink.
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// True once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Chunks currently waiting behind the playing one.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Largest queue length observed since construction.
    pub fn queue_high_water(&self) -> usize {
        self.queue_high_water
    }

    /// Chunks played to completion.
    pub fn chunks_played(&self) -> u64 {
        self.chunks_played
    }

    /// Chunks dropped because they were empty or the sink rejected them.
    pub fn chunks_skipped(&self) -> u64 {
        self.chunks_skipped
    }
}
