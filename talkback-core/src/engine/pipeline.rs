//! Blocking worker loops.
//!
//! ## Capture worker (per iteration)
//!
//! ```text
//! 1. Drain ring buffer → &[f32] (one block per iteration)
//! 2. Resample from the device rate to the pipeline rate
//! 3. Frame into fixed-size chunks: rms/peak metrics + i16 encode
//! 4. Non-blocking send into the chunk queue
//! ```
//!
//! ## Relay worker (per iteration)
//!
//! ```text
//! 1. chunk queue      → transport send (fire and forget) + metrics broadcast
//! 2. response queue   → base64 decode → playback sequencer
//! 3. completion queue → advance the sequencer
//! ```
//!
//! Both loops run in `spawn_blocking`, keeping the Tokio async executor free
//! for callers. The relay worker owns the sequencer and the output device,
//! so every playback state change happens on one thread.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    capture::{resample::Resampler, Consumer, SampleConsumer},
    engine::EngineConfig,
    events::AudioMetrics,
    framer::{chunk::FramedChunk, CaptureFramer},
    pcm,
    playback::PlaybackSequencer,
    transport::TransportHandle,
};

pub struct PipelineDiagnostics {
    pub samples_captured: AtomicU64,
    pub chunks_framed: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub low_volume_alerts: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub responses_rejected: AtomicU64,
    pub inbound_chunks: AtomicU64,
    pub inbound_decode_errors: AtomicU64,
    pub chunks_played: AtomicU64,
    pub playback_skips: AtomicU64,
    pub playback_queue_high_water: AtomicUsize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            samples_captured: AtomicU64::new(0),
            chunks_framed: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            low_volume_alerts: AtomicU64::new(0),
            chunks_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            responses_rejected: AtomicU64::new(0),
            inbound_chunks: AtomicU64::new(0),
            inbound_decode_errors: AtomicU64::new(0),
            chunks_played: AtomicU64::new(0),
            playback_skips: AtomicU64::new(0),
            playback_queue_high_water: AtomicUsize::new(0),
        }
    }
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.samples_captured.store(0, Ordering::Relaxed);
        self.chunks_framed.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
        self.low_volume_alerts.store(0, Ordering::Relaxed);
        self.chunks_sent.store(0, Ordering::Relaxed);
        self.send_failures.store(0, Ordering::Relaxed);
        self.responses_rejected.store(0, Ordering::Relaxed);
        self.inbound_chunks.store(0, Ordering::Relaxed);
        self.inbound_decode_errors.store(0, Ordering::Relaxed);
        self.chunks_played.store(0, Ordering::Relaxed);
        self.playback_skips.store(0, Ordering::Relaxed);
        self.playback_queue_high_water.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_captured: self.samples_captured.load(Ordering::Relaxed),
            chunks_framed: self.chunks_framed.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            low_volume_alerts: self.low_volume_alerts.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            responses_rejected: self.responses_rejected.load(Ordering::Relaxed),
            inbound_chunks: self.inbound_chunks.load(Ordering::Relaxed),
            inbound_decode_errors: self.inbound_decode_errors.load(Ordering::Relaxed),
            chunks_played: self.chunks_played.load(Ordering::Relaxed),
            playback_skips: self.playback_skips.load(Ordering::Relaxed),
            playback_queue_high_water: self.playback_queue_high_water.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub samples_captured: u64,
    pub chunks_framed: u64,
    pub chunks_dropped: u64,
    pub low_volume_alerts: u64,
    pub chunks_sent: u64,
    pub send_failures: u64,
    pub responses_rejected: u64,
    pub inbound_chunks: u64,
    pub inbound_decode_errors: u64,
    pub chunks_played: u64,
    pub playback_skips: u64,
    pub playback_queue_high_water: usize,
}

/// All context the capture worker needs, passed as one struct so the closure
/// stays tidy.
pub struct CaptureContext {
    pub config: EngineConfig,
    pub consumer: SampleConsumer,
    pub capture_sample_rate: u32,
    pub running: Arc<AtomicBool>,
    pub chunk_tx: Sender<FramedChunk>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// All context the relay worker needs. The playback sequencer is **not**
/// part of this struct: it owns a `!Send` device sink and is constructed on
/// the relay thread itself, then handed to [`run_relay`] directly.
pub struct RelayContext {
    pub transport: TransportHandle,
    pub chunk_rx: Receiver<FramedChunk>,
    pub response_rx: Receiver<String>,
    pub completion_rx: Receiver<()>,
    pub metrics_tx: broadcast::Sender<AudioMetrics>,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Block size drained from the capture ring per iteration.
/// 20 ms at 48 kHz = 960 samples; 40 ms at the 24 kHz pipeline rate.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the capture ring is empty (avoids busy-wait burning a core).
const EMPTY_SLEEP_MS: u64 = 5;

/// Sleep when all three relay queues are empty. Short enough that the gap
/// between one chunk's completion and the next chunk's start stays inaudible.
const RELAY_IDLE_SLEEP_MS: u64 = 2;

/// Run the blocking capture loop until `ctx.running` becomes false.
pub fn run_capture(mut ctx: CaptureContext) {
    info!("capture worker started");

    let mut resampler = match Resampler::new(
        ctx.capture_sample_rate,
        ctx.config.sample_rate,
        DRAIN_CHUNK,
    ) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create resampler: {e}");
            return;
        }
    };

    let mut framer = CaptureFramer::new(
        ctx.config.chunk_samples,
        ctx.config.low_volume_rms,
        ctx.config.low_volume_interval_chunks,
        ctx.chunk_tx.clone(),
    );

    // Scratch buffer, reused each iteration.
    let mut raw = vec![0f32; DRAIN_CHUNK];

    loop {
        // ── 0. Check running flag ─────────────────────────────────────────
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        // ── 1. Drain ring buffer ──────────────────────────────────────────
        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(EMPTY_SLEEP_MS));
            continue;
        }
        ctx.diagnostics
            .samples_captured
            .fetch_add(n as u64, Ordering::Relaxed);

        // ── 2. Resample to the pipeline rate ──────────────────────────────
        let resampled = resampler.convert(&raw[..n]);
        if resampled.is_empty() {
            // Partial block — rubato is waiting for more input
            continue;
        }

        debug!(
            raw = n,
            resampled = resampled.len(),
            "processed capture block"
        );

        // ── 3. Frame, measure, emit ───────────────────────────────────────
        framer.push_frame(&resampled);
        ctx.diagnostics
            .chunks_framed
            .store(framer.chunks_emitted(), Ordering::Relaxed);
        ctx.diagnostics
            .chunks_dropped
            .store(framer.chunks_dropped(), Ordering::Relaxed);
        ctx.diagnostics
            .low_volume_alerts
            .store(framer.low_volume_alerts(), Ordering::Relaxed);
    }

    // Samples short of a full chunk are discarded on stop; only whole chunks
    // ever reach the transport.
    info!(
        samples_captured = ctx.diagnostics.samples_captured.load(Ordering::Relaxed),
        chunks_framed = framer.chunks_emitted(),
        chunks_dropped = framer.chunks_dropped(),
        low_volume_alerts = framer.low_volume_alerts(),
        discarded_partial_samples = framer.pending_samples(),
        "capture worker stopped"
    );
}

/// Run the blocking relay loop until `ctx.running` becomes false, then close
/// the sequencer (dropping any queued response audio).
pub fn run_relay(ctx: RelayContext, mut sequencer: PlaybackSequencer) {
    info!("relay worker started");

    loop {
        let mut did_work = false;

        // ── 1. Outbound: framed chunks → transport ────────────────────────
        while let Ok(chunk) = ctx.chunk_rx.try_recv() {
            did_work = true;
            match ctx.transport.0.lock().send_audio(&chunk.pcm) {
                Ok(()) => {
                    ctx.diagnostics.chunks_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // Fire and forget: never retried, never fatal.
                    ctx.diagnostics
                        .send_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "transport send failed: chunk dropped");
                }
            }
            // The level meter reflects what the microphone captured, so
            // metrics go out even when the transport rejected the chunk.
            let _ = ctx.metrics_tx.send(chunk.metrics);
        }

        // ── 2. Inbound: response payloads → playback queue ────────────────
        while let Ok(payload) = ctx.response_rx.try_recv() {
            did_work = true;
            match pcm::decode_base64(&payload) {
                Ok(samples) => {
                    ctx.diagnostics
                        .inbound_chunks
                        .fetch_add(1, Ordering::Relaxed);
                    sequencer.enqueue(samples);
                }
                Err(e) => {
                    ctx.diagnostics
                        .inbound_decode_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "dropping undecodable response chunk");
                }
            }
        }

        // ── 3. Playback completions ───────────────────────────────────────
        while ctx.completion_rx.try_recv().is_ok() {
            did_work = true;
            sequencer.finish_current();
        }

        ctx.diagnostics
            .chunks_played
            .store(sequencer.chunks_played(), Ordering::Relaxed);
        ctx.diagnostics
            .playback_skips
            .store(sequencer.chunks_skipped(), Ordering::Relaxed);
        ctx.diagnostics
            .playback_queue_high_water
            .store(sequencer.queue_high_water(), Ordering::Relaxed);

        // ── 4. Shutdown check / idle sleep ────────────────────────────────
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }
        if !did_work {
            std::thread::sleep(Duration::from_millis(RELAY_IDLE_SLEEP_MS));
        }
    }

    sequencer.close();

    let snap = ctx.diagnostics.snapshot();
    info!(
        chunks_sent = snap.chunks_sent,
        send_failures = snap.send_failures,
        inbound_chunks = snap.inbound_chunks,
        inbound_decode_errors = snap.inbound_decode_errors,
        chunks_played = snap.chunks_played,
        playback_skips = snap.playback_skips,
        playback_queue_high_water = snap.playback_queue_high_water,
        "relay worker stopped — diagnostics"
    );
}
