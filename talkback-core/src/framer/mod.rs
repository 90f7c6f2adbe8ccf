//! Fixed-size framing of captured audio into transport chunks.
//!
//! ## Buffer cycle
//!
//! 1. `push_frame` copies incoming samples into the fill buffer at the write
//!    cursor.
//! 2. When the cursor reaches capacity: compute RMS and peak over the full
//!    buffer, quantize it to 16-bit PCM, send a [`FramedChunk`] downstream,
//!    reset the cursor.
//!
//! The push path is driveable from a real-time capture context: the fill
//! buffer is preallocated, the only per-cycle allocation is the encoded
//! `Vec<i16>` (one per full buffer), and the channel send never blocks — a
//! full queue drops the chunk and counts the drop.
//!
//! Exactly one capture stream feeds one framer, so there is no internal
//! locking; the counters are plain integers read through accessors.

pub mod chunk;

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, warn};

use crate::events::AudioMetrics;
use crate::pcm;
use chunk::FramedChunk;

/// Accumulates mono samples and emits one [`FramedChunk`] per full buffer.
pub struct CaptureFramer {
    /// Fill buffer. Contents at and past `cursor` are stale data from the
    /// previous cycle and are never read before being overwritten.
    buf: Vec<f32>,
    /// Write position, always in `[0, capacity)` between calls.
    cursor: usize,
    /// Total samples consumed since construction.
    total_samples: u64,
    /// RMS level below which a full buffer counts as suspiciously quiet.
    low_volume_rms: f32,
    /// Low-volume check period, in full buffers. Zero disables the check.
    low_volume_interval: u64,
    chunk_tx: Sender<FramedChunk>,
    chunks_emitted: u64,
    chunks_dropped: u64,
    low_volume_alerts: u64,
}

impl CaptureFramer {
    /// Create a framer emitting chunks of `chunk_samples` samples.
    ///
    /// # Panics
    /// Panics if `chunk_samples` is zero.
    pub fn new(
        chunk_samples: usize,
        low_volume_rms: f32,
        low_volume_interval: u64,
        chunk_tx: Sender<FramedChunk>,
    ) -> Self {
        assert!(chunk_samples > 0, "chunk_samples must be non-zero");
        Self {
            buf: vec![0.0; chunk_samples],
            cursor: 0,
            total_samples: 0,
            low_volume_rms,
            low_volume_interval,
            chunk_tx,
            chunks_emitted: 0,
            chunks_dropped: 0,
            low_volume_alerts: 0,
        }
    }

    /// Consume one capture callback's worth of samples.
    ///
    /// An empty frame is a no-op (the device may deliver nothing while it
    /// spins up). A frame larger than the remaining buffer space completes
    /// the current chunk and carries the rest into the next cycle.
    pub fn push_frame(&mut self, frame: &[f32]) {
        let mut rest = frame;
        while !rest.is_empty() {
            let space = self.buf.len() - self.cursor;
            let take = space.min(rest.len());
            self.buf[self.cursor..self.cursor + take].copy_from_slice(&rest[..take]);
            self.cursor += take;
            self.total_samples += take as u64;
            rest = &rest[take..];
            if self.cursor == self.buf.len() {
                self.flush();
            }
        }
    }

    /// Number of samples waiting in the partially-filled buffer.
    pub fn pending_samples(&self) -> usize {
        self.cursor
    }

    /// Total samples consumed since construction.
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Chunks successfully handed to the channel.
    pub fn chunks_emitted(&self) -> u64 {
        self.chunks_emitted
    }

    /// Chunks dropped because the channel was full or closed.
    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped
    }

    /// Times the low-volume diagnostic has fired.
    pub fn low_volume_alerts(&self) -> u64 {
        self.low_volume_alerts
    }

    /// Encode and emit the full buffer, then reset the cursor.
    fn flush(&mut self) {
        let rms = pcm::rms(&self.buf);
        let peak = pcm::peak(&self.buf);
        let metrics = AudioMetrics {
            rms,
            peak,
            sample_count: self.total_samples,
        };
        let encoded = pcm::encode(&self.buf);

        // Diagnostic only: never gates or alters the emitted chunk.
        let period = self.buf.len() as u64 * self.low_volume_interval;
        if period != 0 && rms < self.low_volume_rms && self.total_samples % period == 0 {
            self.low_volume_alerts += 1;
            warn!(
                rms = format_args!("{:.5}", rms),
                total_samples = self.total_samples,
                "sustained low input level — check microphone"
            );
        }

        match self.chunk_tx.try_send(FramedChunk::new(encoded, metrics)) {
            Ok(()) => self.chunks_emitted += 1,
            Err(TrySendError::Full(_)) => {
                self.chunks_dropped += 1;
                warn!(
                    dropped = self.chunks_dropped,
                    "chunk queue full: dropped capture chunk"
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                self.chunks_dropped += 1;
                debug!("chunk queue disconnected: dropped capture chunk");
            }
        }

        self.cursor = 0;
    }
}
