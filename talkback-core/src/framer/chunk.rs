//! Framed capture chunk handed from the framer to the outbound relay.

use crate::events::AudioMetrics;

/// One full capture buffer, quantized and ready for the transport.
///
/// Allocated once per 0.2 s buffer (on the capture worker, not in the device
/// callback). Ownership moves through the channel; nothing retains a
/// reference after send.
#[derive(Debug, Clone)]
pub struct FramedChunk {
    /// 16-bit PCM payload, exactly one capture buffer long.
    pub pcm: Vec<i16>,
    /// Loudness metrics computed over the source buffer at encode time.
    pub metrics: AudioMetrics,
}

impl FramedChunk {
    pub fn new(pcm: Vec<i16>, metrics: AudioMetrics) -> Self {
        Self { pcm, metrics }
    }

    /// Returns the duration of this chunk in seconds at `sample_rate`.
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        self.pcm.len() as f64 / sample_rate as f64
    }
}
