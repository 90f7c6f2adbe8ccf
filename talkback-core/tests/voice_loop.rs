use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use talkback_core::capture::{create_sample_ring, Producer};
use talkback_core::engine::{pipeline, EngineConfig};
use talkback_core::error::Result;
use talkback_core::{
    pcm, AudioMetrics, CaptureFramer, FramedChunk, LoopbackTransport, OutboundTransport,
    PlaybackSequencer, PlaybackSink, TransportHandle,
};

struct RecordingTransport {
    sent: Arc<Mutex<Vec<Vec<i16>>>>,
}

impl OutboundTransport for RecordingTransport {
    fn send_audio(&mut self, pcm: &[i16]) -> Result<()> {
        self.sent.lock().push(pcm.to_vec());
        Ok(())
    }
}

struct RecordingSink {
    begun: Arc<Mutex<Vec<Vec<f32>>>>,
    stopped: Arc<AtomicBool>,
}

impl PlaybackSink for RecordingSink {
    fn begin(&mut self, samples: Vec<f32>) -> Result<()> {
        self.begun.lock().push(samples);
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

struct CompletingSink {
    begun: Arc<Mutex<Vec<Vec<f32>>>>,
    completion_tx: Sender<()>,
}

impl PlaybackSink for CompletingSink {
    fn begin(&mut self, samples: Vec<f32>) -> Result<()> {
        self.begun.lock().push(samples);
        let _ = self.completion_tx.try_send(());
        Ok(())
    }

    fn stop(&mut self) {}
}

fn recv_metrics_with_timeout(
    rx: &mut broadcast::Receiver<AudioMetrics>,
    timeout: Duration,
) -> AudioMetrics {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(m) => return m,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for metrics event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("metrics channel closed unexpectedly"),
        }
    }
}

fn wait_for(cond: impl Fn() -> bool, timeout: Duration, what: &str) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() >= timeout {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn captured_audio_reaches_the_transport_in_fixed_chunks() {
    let config = EngineConfig::default();
    let (mut producer, consumer) = create_sample_ring();
    producer.push_slice(&vec![0.5f32; 2 * config.chunk_samples]);

    let (chunk_tx, chunk_rx) = bounded(config.chunk_queue_capacity);
    let (_response_tx, response_rx) = bounded(config.response_queue_capacity);
    let (_completion_tx, completion_rx) = bounded::<()>(4);
    let (metrics_tx, mut metrics_rx) = broadcast::channel(32);
    let running = Arc::new(AtomicBool::new(true));
    let diagnostics = Arc::new(pipeline::PipelineDiagnostics::default());

    let sent = Arc::new(Mutex::new(Vec::new()));
    let begun = Arc::new(Mutex::new(Vec::new()));
    let stopped = Arc::new(AtomicBool::new(false));

    let capture_ctx = pipeline::CaptureContext {
        config: config.clone(),
        consumer,
        capture_sample_rate: config.sample_rate,
        running: Arc::clone(&running),
        chunk_tx,
        diagnostics: Arc::clone(&diagnostics),
    };
    let relay_ctx = pipeline::RelayContext {
        transport: TransportHandle::new(RecordingTransport {
            sent: Arc::clone(&sent),
        }),
        chunk_rx,
        response_rx,
        completion_rx,
        metrics_tx,
        running: Arc::clone(&running),
        diagnostics: Arc::clone(&diagnostics),
    };

    let capture = thread::spawn(move || pipeline::run_capture(capture_ctx));
    let sink = RecordingSink {
        begun: Arc::clone(&begun),
        stopped: Arc::clone(&stopped),
    };
    let relay = thread::spawn(move || {
        let sequencer = PlaybackSequencer::new(Box::new(sink));
        pipeline::run_relay(relay_ctx, sequencer);
    });

    let first = recv_metrics_with_timeout(&mut metrics_rx, Duration::from_secs(1));
    let second = recv_metrics_with_timeout(&mut metrics_rx, Duration::from_secs(1));
    wait_for(
        || sent.lock().len() == 2,
        Duration::from_secs(1),
        "two transport sends",
    );

    running.store(false, Ordering::SeqCst);
    capture.join().expect("capture thread panicked");
    relay.join().expect("relay thread panicked");

    approx::assert_relative_eq!(first.rms, 0.5, epsilon = 1e-6);
    assert_eq!(first.sample_count, config.chunk_samples as u64);
    assert_eq!(second.sample_count, 2 * config.chunk_samples as u64);

    let sent = sent.lock();
    assert_eq!(sent.len(), 2);
    for chunk in sent.iter() {
        assert_eq!(chunk.len(), config.chunk_samples);
        assert!(chunk.iter().all(|v| *v == 16_384));
    }

    let snap = diagnostics.snapshot();
    assert_eq!(snap.chunks_framed, 2);
    assert_eq!(snap.chunks_sent, 2);
    assert_eq!(snap.chunks_dropped, 0);
}

#[test]
fn responses_play_strictly_in_order() {
    let (_chunk_tx, chunk_rx) = bounded(8);
    let (response_tx, response_rx) = bounded(8);
    let (completion_tx, completion_rx) = bounded::<()>(4);
    let (metrics_tx, _metrics_rx) = broadcast::channel(8);
    let running = Arc::new(AtomicBool::new(true));
    let diagnostics = Arc::new(pipeline::PipelineDiagnostics::default());

    let begun = Arc::new(Mutex::new(Vec::new()));
    let stopped = Arc::new(AtomicBool::new(false));

    let ctx = pipeline::RelayContext {
        transport: TransportHandle::new(RecordingTransport {
            sent: Arc::new(Mutex::new(Vec::new())),
        }),
        chunk_rx,
        response_rx,
        completion_rx,
        metrics_tx,
        running: Arc::clone(&running),
        diagnostics: Arc::clone(&diagnostics),
    };
    let sink = RecordingSink {
        begun: Arc::clone(&begun),
        stopped: Arc::clone(&stopped),
    };
    let relay = thread::spawn(move || {
        let sequencer = PlaybackSequencer::new(Box::new(sink));
        pipeline::run_relay(ctx, sequencer);
    });

    let chunks = [
        vec![100i16, 200, 300],
        vec![-100i16, -200, -300],
        vec![1i16, 2, 3],
    ];
    for chunk in &chunks {
        response_tx.send(pcm::encode_base64(chunk)).unwrap();
    }

    // Each chunk starts only after the previous one completes.
    wait_for(
        || begun.lock().len() == 1,
        Duration::from_secs(1),
        "first chunk to start",
    );
    thread::sleep(Duration::from_millis(20));
    assert_eq!(begun.lock().len(), 1, "later chunks must wait");

    completion_tx.send(()).unwrap();
    wait_for(
        || begun.lock().len() == 2,
        Duration::from_secs(1),
        "second chunk to start",
    );
    completion_tx.send(()).unwrap();
    wait_for(
        || begun.lock().len() == 3,
        Duration::from_secs(1),
        "third chunk to start",
    );
    completion_tx.send(()).unwrap();

    wait_for(
        || diagnostics.snapshot().chunks_played == 3,
        Duration::from_secs(1),
        "all completions recorded",
    );

    running.store(false, Ordering::SeqCst);
    relay.join().expect("relay thread panicked");

    let begun = begun.lock();
    for (played, source) in begun.iter().zip(chunks.iter()) {
        assert_eq!(played, &pcm::decode(source));
    }
}

#[test]
fn shutdown_drops_queued_playback() {
    let (_chunk_tx, chunk_rx) = bounded(8);
    let (response_tx, response_rx) = bounded(8);
    let (_completion_tx, completion_rx) = bounded::<()>(4);
    let (metrics_tx, _metrics_rx) = broadcast::channel(8);
    let running = Arc::new(AtomicBool::new(true));
    let diagnostics = Arc::new(pipeline::PipelineDiagnostics::default());

    let begun = Arc::new(Mutex::new(Vec::new()));
    let stopped = Arc::new(AtomicBool::new(false));

    let ctx = pipeline::RelayContext {
        transport: TransportHandle::new(RecordingTransport {
            sent: Arc::new(Mutex::new(Vec::new())),
        }),
        chunk_rx,
        response_rx,
        completion_rx,
        metrics_tx,
        running: Arc::clone(&running),
        diagnostics: Arc::clone(&diagnostics),
    };
    let sink = RecordingSink {
        begun: Arc::clone(&begun),
        stopped: Arc::clone(&stopped),
    };
    let relay = thread::spawn(move || {
        let sequencer = PlaybackSequencer::new(Box::new(sink));
        pipeline::run_relay(ctx, sequencer);
    });

    for _ in 0..3 {
        response_tx.send(pcm::encode_base64(&[7i16, 8, 9])).unwrap();
    }
    wait_for(
        || begun.lock().len() == 1,
        Duration::from_secs(1),
        "first chunk to start",
    );

    // No completions arrive; the two queued chunks must die with the close.
    running.store(false, Ordering::SeqCst);
    relay.join().expect("relay thread panicked");

    assert_eq!(begun.lock().len(), 1, "queued chunks never started");
    assert!(stopped.load(Ordering::Relaxed), "sink released on shutdown");
    assert_eq!(diagnostics.snapshot().chunks_played, 0);
}

#[test]
fn loopback_transport_round_trips_the_wire_format() {
    let (echo_tx, echo_rx) = bounded(8);
    let (chunk_tx, chunk_rx) = bounded(8);
    let (response_tx, response_rx) = bounded(8);
    let (completion_tx, completion_rx) = bounded::<()>(4);
    let (metrics_tx, _metrics_rx) = broadcast::channel(8);
    let running = Arc::new(AtomicBool::new(true));
    let diagnostics = Arc::new(pipeline::PipelineDiagnostics::default());

    let begun = Arc::new(Mutex::new(Vec::new()));
    let stopped = Arc::new(AtomicBool::new(false));

    let ctx = pipeline::RelayContext {
        transport: TransportHandle::new(LoopbackTransport::new(echo_tx)),
        chunk_rx,
        response_rx,
        completion_rx,
        metrics_tx,
        running: Arc::clone(&running),
        diagnostics: Arc::clone(&diagnostics),
    };
    let sink = RecordingSink {
        begun: Arc::clone(&begun),
        stopped: Arc::clone(&stopped),
    };
    let relay = thread::spawn(move || {
        let sequencer = PlaybackSequencer::new(Box::new(sink));
        pipeline::run_relay(ctx, sequencer);
    });

    let pcm_data = vec![123i16, -456, 789, -32_768, 32_767];
    chunk_tx
        .send(FramedChunk::new(
            pcm_data.clone(),
            AudioMetrics {
                rms: 0.1,
                peak: 1.0,
                sample_count: pcm_data.len() as u64,
            },
        ))
        .unwrap();

    // The transport echoes the encoded chunk; feed it back as a response.
    let payload = echo_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("echoed payload");
    response_tx.send(payload).unwrap();

    wait_for(
        || begun.lock().len() == 1,
        Duration::from_secs(1),
        "echoed chunk to start playing",
    );
    completion_tx.send(()).unwrap();
    wait_for(
        || diagnostics.snapshot().chunks_played == 1,
        Duration::from_secs(1),
        "completion recorded",
    );

    running.store(false, Ordering::SeqCst);
    relay.join().expect("relay thread panicked");

    assert_eq!(begun.lock()[0], pcm::decode(&pcm_data));
    let snap = diagnostics.snapshot();
    assert_eq!(snap.chunks_sent, 1);
    assert_eq!(snap.inbound_chunks, 1);
    assert_eq!(snap.inbound_decode_errors, 0);
}

#[test]
fn self_echoing_relay_plays_back_every_framed_chunk() {
    // Device-free wiring, as the offline demo uses it: the echo transport
    // feeds the relay's own response queue and the sink acknowledges each
    // chunk the moment it starts, so framed audio drains end to end with
    // no external completions.
    let config = EngineConfig::default();
    let (chunk_tx, chunk_rx) = bounded(8);
    let (response_tx, response_rx) = bounded(8);
    let (completion_tx, completion_rx) = bounded::<()>(4);
    let (metrics_tx, _metrics_rx) = broadcast::channel(8);
    let running = Arc::new(AtomicBool::new(true));
    let diagnostics = Arc::new(pipeline::PipelineDiagnostics::default());

    let begun = Arc::new(Mutex::new(Vec::new()));

    let ctx = pipeline::RelayContext {
        transport: TransportHandle::new(LoopbackTransport::new(response_tx)),
        chunk_rx,
        response_rx,
        completion_rx,
        metrics_tx,
        running: Arc::clone(&running),
        diagnostics: Arc::clone(&diagnostics),
    };
    let sink = CompletingSink {
        begun: Arc::clone(&begun),
        completion_tx,
    };
    let relay = thread::spawn(move || {
        let sequencer = PlaybackSequencer::new(Box::new(sink));
        pipeline::run_relay(ctx, sequencer);
    });

    let mut framer = CaptureFramer::new(
        config.chunk_samples,
        config.low_volume_rms,
        config.low_volume_interval_chunks,
        chunk_tx,
    );
    framer.push_frame(&vec![0.5f32; 2 * config.chunk_samples]);

    wait_for(
        || diagnostics.snapshot().chunks_played == 2,
        Duration::from_secs(1),
        "both echoed chunks to play",
    );

    running.store(false, Ordering::SeqCst);
    relay.join().expect("relay thread panicked");

    let snap = diagnostics.snapshot();
    assert_eq!(snap.chunks_sent, 2);
    assert_eq!(snap.inbound_chunks, 2);
    assert_eq!(snap.inbound_decode_errors, 0);

    let begun = begun.lock();
    assert_eq!(begun.len(), 2);
    for samples in begun.iter() {
        assert_eq!(samples.len(), config.chunk_samples);
        approx::assert_relative_eq!(samples[0], 16_384.0 / 32_767.0, epsilon = 1e-6);
    }
}
