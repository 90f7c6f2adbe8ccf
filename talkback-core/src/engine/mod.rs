//! `TalkbackEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! TalkbackEngine::new()
//!     └─► start()        → mic + speaker open, workers spawned, status = Listening
//!         └─► stop()     → running=false, streams dropped, status = Stopped
//! ```
//!
//! `start()`/`stop()` guard their state: calling them in the wrong order
//! returns an error rather than panicking.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). The microphone and the speaker sink are therefore created
//! *inside* their workers' `spawn_blocking` closures so they never cross a
//! thread boundary. Two sync oneshot channels propagate open-device errors
//! back to the `start()` caller.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    capture::{create_sample_ring, MicCapture},
    error::{Result, TalkbackError},
    events::{AudioMetrics, EngineStatus, EngineStatusEvent},
    playback::{device::CpalSink, PlaybackSequencer},
    transport::TransportHandle,
};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Completion channel capacity. Playback is strictly sequential, so at most
/// one notification is ever in flight; the slack absorbs stop-time races.
const COMPLETION_CAP: usize = 4;

/// Configuration for `TalkbackEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pipeline sample rate (Hz). Capture at other device rates is resampled
    /// to this before framing; playback also runs at this rate.
    /// Default: 24000.
    pub sample_rate: u32,
    /// Samples per outbound chunk at `sample_rate`.
    /// Default: 4800 (200 ms at 24 kHz).
    pub chunk_samples: usize,
    /// RMS below this counts as near-silence for the low-volume alert.
    /// Default: 0.001.
    pub low_volume_rms: f32,
    /// Low-volume alert cadence, measured in emitted chunks. Zero disables
    /// the alert. Default: 50 (one alert per 10 s of near-silent capture).
    pub low_volume_interval_chunks: u64,
    /// Capacity of the capture→relay chunk queue. Sends are non-blocking;
    /// chunks are dropped (and counted) when the relay falls this far behind.
    /// Default: 32.
    pub chunk_queue_capacity: usize,
    /// Capacity of the inbound response queue. `play_response` reports
    /// `ResponseQueueFull` instead of blocking when it fills.
    /// Default: 256.
    pub response_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            chunk_samples: 4_800,
            low_volume_rms: 0.001,
            low_volume_interval_chunks: 50,
            chunk_queue_capacity: 32,
            response_queue_capacity: 256,
        }
    }
}

/// The top-level engine handle.
///
/// `TalkbackEngine` is `Send + Sync` — all fields use interior mutability.
/// Wrap in `Arc<TalkbackEngine>` to share between command handlers and
/// event-forwarding async tasks.
pub struct TalkbackEngine {
    config: EngineConfig,
    transport: TransportHandle,
    /// `true` while the capture and relay workers are active.
    running: Arc<AtomicBool>,
    /// Canonical status (written atomically via Mutex, read from commands).
    status: Arc<Mutex<EngineStatus>>,
    /// Broadcast sender for per-chunk audio metrics.
    metrics_tx: broadcast::Sender<AudioMetrics>,
    /// Broadcast sender for status events.
    status_tx: broadcast::Sender<EngineStatusEvent>,
    /// Inbound response queue handle; present only while running.
    response_tx: Mutex<Option<Sender<String>>>,
    /// Shared worker diagnostics counters.
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
}

impl TalkbackEngine {
    /// Create a new engine. Does not touch audio devices — call `start()`.
    pub fn new(config: EngineConfig, transport: TransportHandle) -> Self {
        let (metrics_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let diagnostics = Arc::new(pipeline::PipelineDiagnostics::default());

        Self {
            config,
            transport,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            metrics_tx,
            status_tx,
            response_tx: Mutex::new(None),
            diagnostics,
        }
    }

    /// Open both audio devices and spawn the capture and relay workers.
    ///
    /// Blocks until both devices are confirmed open (or one fails), then
    /// returns. The workers keep running on background blocking threads.
    ///
    /// # Errors
    /// - `TalkbackError::AlreadyRunning` if already started.
    /// - `TalkbackError::NoDefaultInputDevice` /
    ///   `TalkbackError::NoDefaultOutputDevice` /
    ///   `TalkbackError::AudioStream` on device errors.
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(TalkbackError::AlreadyRunning);
        }

        self.diagnostics.reset();
        self.running.store(true, Ordering::SeqCst);
        self.set_status(EngineStatus::Listening, None);

        let (producer, consumer) = create_sample_ring();
        let (chunk_tx, chunk_rx) = bounded(self.config.chunk_queue_capacity);
        let (response_tx, response_rx) = bounded(self.config.response_queue_capacity);
        let (completion_tx, completion_rx) = bounded(COMPLETION_CAP);
        *self.response_tx.lock() = Some(response_tx);

        // Clone all shared state before moving into the closures.
        let config = self.config.clone();
        let transport = self.transport.clone();
        let capture_running = Arc::clone(&self.running);
        let relay_running = Arc::clone(&self.running);
        let metrics_tx = self.metrics_tx.clone();
        let capture_diagnostics = Arc::clone(&self.diagnostics);
        let relay_diagnostics = Arc::clone(&self.diagnostics);
        let playback_rate = self.config.sample_rate;

        // Sync oneshots: each worker signals open success/failure back to
        // start(). The capture one carries the actual device sample rate.
        let (capture_open_tx, capture_open_rx) = std::sync::mpsc::channel::<Result<u32>>();
        let (relay_open_tx, relay_open_rx) = std::sync::mpsc::channel::<Result<()>>();

        tokio::task::spawn_blocking(move || {
            // ── Open microphone (on THIS thread — cpal::Stream is !Send) ──
            let capture = match MicCapture::open_default(producer, Arc::clone(&capture_running)) {
                Ok(c) => {
                    let _ = capture_open_tx.send(Ok(c.sample_rate));
                    c
                }
                Err(e) => {
                    let _ = capture_open_tx.send(Err(e));
                    capture_running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let capture_sample_rate = capture.sample_rate;

            pipeline::run_capture(pipeline::CaptureContext {
                config,
                consumer,
                capture_sample_rate,
                running: capture_running,
                chunk_tx,
                diagnostics: capture_diagnostics,
            });

            // Stream drops here, releasing the microphone on this thread.
            drop(capture);
        });

        tokio::task::spawn_blocking(move || {
            // ── Open speaker (same !Send constraint as the microphone) ──
            let sink = match CpalSink::open_default(playback_rate, completion_tx) {
                Ok(s) => s,
                Err(e) => {
                    let _ = relay_open_tx.send(Err(e));
                    relay_running.store(false, Ordering::SeqCst);
                    return;
                }
            };
            let _ = relay_open_tx.send(Ok(()));

            // The sequencer owns the !Send sink, so it lives and dies on
            // this thread; run_relay closes it on the way out.
            let sequencer = PlaybackSequencer::new(Box::new(sink));
            pipeline::run_relay(
                pipeline::RelayContext {
                    transport,
                    chunk_rx,
                    response_rx,
                    completion_rx,
                    metrics_tx,
                    running: relay_running,
                    diagnostics: relay_diagnostics,
                },
                sequencer,
            );
        });

        // Block start() until both devices are confirmed open.
        match capture_open_rx.recv() {
            Ok(Ok(rate)) => info!(capture_sample_rate = rate, "microphone open"),
            Ok(Err(e)) => {
                self.abort_start(e.to_string());
                return Err(e);
            }
            Err(_) => {
                // Channel closed before a message was sent — worker panicked?
                self.abort_start("capture worker failed to start".into());
                return Err(TalkbackError::Other(anyhow::anyhow!(
                    "capture task died unexpectedly"
                )));
            }
        }
        match relay_open_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.abort_start(e.to_string());
                return Err(e);
            }
            Err(_) => {
                self.abort_start("relay worker failed to start".into());
                return Err(TalkbackError::Other(anyhow::anyhow!(
                    "relay task died unexpectedly"
                )));
            }
        }

        info!("engine started — listening");
        Ok(())
    }

    /// Stop both workers and release the audio devices.
    ///
    /// Any response audio still queued or playing is dropped: the relay
    /// worker closes the playback sequencer on its way out.
    ///
    /// # Errors
    /// - `TalkbackError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TalkbackError::NotRunning);
        }

        *self.response_tx.lock() = None;
        self.running.store(false, Ordering::SeqCst);
        self.set_status(EngineStatus::Stopped, None);
        info!("engine stop requested");
        Ok(())
    }

    /// Queue one base64-encoded response chunk for playback.
    ///
    /// Never blocks. The payload is decoded on the relay worker; an
    /// undecodable payload is logged and counted there, not reported here.
    ///
    /// # Errors
    /// - `TalkbackError::NotRunning` when the engine is stopped.
    /// - `TalkbackError::ResponseQueueFull` when playback cannot keep up.
    pub fn play_response(&self, payload: String) -> Result<()> {
        let guard = self.response_tx.lock();
        let tx = guard.as_ref().ok_or(TalkbackError::NotRunning)?;
        match tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.diagnostics
                    .responses_rejected
                    .fetch_add(1, Ordering::Relaxed);
                Err(TalkbackError::ResponseQueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(TalkbackError::NotRunning),
        }
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    /// Subscribe to per-chunk capture metrics (rms, peak, running total).
    pub fn subscribe_metrics(&self) -> broadcast::Receiver<AudioMetrics> {
        self.metrics_tx.subscribe()
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of worker counters for observability.
    pub fn pipeline_diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }

    fn abort_start(&self, detail: String) {
        self.running.store(false, Ordering::SeqCst);
        *self.response_tx.lock() = None;
        self.set_status(EngineStatus::Error, Some(detail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::loopback::LoopbackTransport;

    fn engine_with_loopback() -> (TalkbackEngine, crossbeam_channel::Receiver<String>) {
        let (echo_tx, echo_rx) = bounded(8);
        let engine = TalkbackEngine::new(
            EngineConfig::default(),
            TransportHandle::new(LoopbackTransport::new(echo_tx)),
        );
        (engine, echo_rx)
    }

    #[test]
    fn play_response_before_start_is_rejected() {
        let (engine, _echo_rx) = engine_with_loopback();
        assert!(matches!(
            engine.play_response("AAAA".into()),
            Err(TalkbackError::NotRunning)
        ));
    }

    #[test]
    fn stop_before_start_is_rejected() {
        let (engine, _echo_rx) = engine_with_loopback();
        assert!(matches!(engine.stop(), Err(TalkbackError::NotRunning)));
    }

    #[test]
    fn new_engine_is_idle_with_zeroed_diagnostics() {
        let (engine, _echo_rx) = engine_with_loopback();
        assert_eq!(engine.status(), EngineStatus::Idle);

        let snap = engine.pipeline_diagnostics_snapshot();
        assert_eq!(snap.samples_captured, 0);
        assert_eq!(snap.chunks_sent, 0);
        assert_eq!(snap.chunks_played, 0);
        assert_eq!(snap.responses_rejected, 0);
    }

    #[test]
    fn play_response_reports_a_full_queue() {
        let (engine, _echo_rx) = engine_with_loopback();

        // Install a tiny response queue as if the engine were running.
        let (tx, _rx) = bounded(1);
        *engine.response_tx.lock() = Some(tx);

        engine.play_response("AAAA".into()).unwrap();
        assert!(matches!(
            engine.play_response("BBBB".into()),
            Err(TalkbackError::ResponseQueueFull)
        ));
        assert_eq!(engine.pipeline_diagnostics_snapshot().responses_rejected, 1);
    }

    #[tokio::test]
    async fn start_and_stop_drive_the_status_lifecycle() {
        let (engine, _echo_rx) = engine_with_loopback();
        let mut status_rx = engine.subscribe_status();

        // Device availability depends on the host; both outcomes have a
        // well-defined status trail.
        match engine.start() {
            Ok(()) => {
                assert_eq!(engine.status(), EngineStatus::Listening);
                assert!(matches!(
                    engine.start(),
                    Err(TalkbackError::AlreadyRunning)
                ));
                engine.stop().unwrap();
                assert_eq!(engine.status(), EngineStatus::Stopped);
                assert!(matches!(engine.stop(), Err(TalkbackError::NotRunning)));
            }
            Err(_) => {
                assert_eq!(engine.status(), EngineStatus::Error);
                assert!(matches!(engine.stop(), Err(TalkbackError::NotRunning)));
            }
        }

        // The first broadcast event is always the Listening transition.
        let first = status_rx.try_recv().expect("status event");
        assert_eq!(first.status, EngineStatus::Listening);
    }
}
