fn main() {
    if let Err(e) = run() {
        eprintln!("loopback demo failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use std::path::{Path, PathBuf};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::time::{Duration, Instant};

    use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
    use tokio::sync::broadcast;
    use tokio::sync::broadcast::error::TryRecvError;

    use talkback_core::capture::resample::Resampler;
    use talkback_core::engine::pipeline;
    use talkback_core::{
        AudioMetrics, CaptureFramer, EngineConfig, EngineStatus, LoopbackTransport,
        PlaybackSequencer, PlaybackSink, TalkbackEngine, TalkbackError, TransportHandle,
    };

    #[derive(Debug)]
    struct Args {
        seconds: u64,
        wav: Option<PathBuf>,
    }

    fn parse_args() -> Result<Args, String> {
        let mut seconds: u64 = 10;
        let mut wav: Option<PathBuf> = None;

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--seconds" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --seconds".into());
                    };
                    seconds = v
                        .parse::<u64>()
                        .map_err(|_| "invalid value for --seconds".to_string())?
                        .clamp(1, 600);
                }
                "--wav" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --wav".into());
                    };
                    wav = Some(PathBuf::from(v));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p talkback-core --bin loopback -- \\
  [--seconds <n>] [--wav <file>]

Without --wav: echo the microphone to the speakers through the full engine.
With --wav: pump a WAV file through the echo loop offline and report
per-chunk metrics (no devices)."
                    );
                    std::process::exit(0);
                }
                other => {
                    return Err(format!("unknown argument: {other}"));
                }
            }
        }

        Ok(Args { seconds, wav })
    }

    fn read_wav_mono_f32(path: &Path) -> Result<(Vec<f32>, u32), String> {
        let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map_err(|e| e.to_string()))
                .collect::<Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max).map_err(|e| e.to_string()))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        if channels == 1 {
            return Ok((interleaved, spec.sample_rate));
        }
        let mut mono = Vec::with_capacity(interleaved.len() / channels);
        for frame in interleaved.chunks(channels) {
            mono.push(frame.iter().copied().sum::<f32>() / channels as f32);
        }
        Ok((mono, spec.sample_rate))
    }

    /// Speaker stand-in for offline runs: acknowledges every buffer the
    /// moment it starts.
    struct NullSink {
        completion_tx: Sender<()>,
    }

    impl PlaybackSink for NullSink {
        fn begin(&mut self, _samples: Vec<f32>) -> talkback_core::error::Result<()> {
            let _ = self.completion_tx.try_send(());
            Ok(())
        }

        fn stop(&mut self) {}
    }

    /// Pump a WAV file through the framer, the relay worker, and the playback
    /// sequencer, device-free: the echo transport feeds the relay's own
    /// response queue and a [`NullSink`] stands in for the speaker.
    fn run_wav(path: &Path) -> Result<(), String> {
        fn report_chunk(count: &mut usize, m: &AudioMetrics) {
            *count += 1;
            println!(
                "chunk {}: rms={:.4} peak={:.4} total_samples={}",
                *count, m.rms, m.peak, m.sample_count
            );
        }

        let config = EngineConfig::default();
        let (samples, sample_rate) = read_wav_mono_f32(path)?;
        println!(
            "Read {} samples at {} Hz from {}",
            samples.len(),
            sample_rate,
            path.display()
        );

        // Mirror live capture: convert to the pipeline rate first.
        let samples = if sample_rate != config.sample_rate {
            let mut resampler = Resampler::new(sample_rate, config.sample_rate, 960)
                .map_err(|e| e.to_string())?;
            resampler.convert(&samples)
        } else {
            samples
        };

        let expected_chunks = samples.len() / config.chunk_samples;
        // Queues sized to the whole file so an offline run never sheds load.
        let queue_cap = expected_chunks.max(1);

        let (chunk_tx, chunk_rx) = bounded(queue_cap);
        let (response_tx, response_rx) = bounded(queue_cap);
        let (completion_tx, completion_rx) = bounded(4);
        let (metrics_tx, mut metrics_rx) = broadcast::channel(queue_cap);
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(pipeline::PipelineDiagnostics::default());

        let ctx = pipeline::RelayContext {
            transport: TransportHandle::new(LoopbackTransport::new(response_tx)),
            chunk_rx,
            response_rx,
            completion_rx,
            metrics_tx,
            running: Arc::clone(&running),
            diagnostics: Arc::clone(&diagnostics),
        };
        let sink = NullSink { completion_tx };
        let relay = std::thread::spawn(move || {
            let sequencer = PlaybackSequencer::new(Box::new(sink));
            pipeline::run_relay(ctx, sequencer);
        });

        let mut framer = CaptureFramer::new(
            config.chunk_samples,
            config.low_volume_rms,
            config.low_volume_interval_chunks,
            chunk_tx,
        );

        let mut reported = 0usize;
        for block in samples.chunks(960) {
            framer.push_frame(block);
            while let Ok(m) = metrics_rx.try_recv() {
                report_chunk(&mut reported, &m);
            }
        }

        // Everything is queued; wait for the relay to play it all back.
        let deadline = Instant::now() + Duration::from_secs(5);
        while diagnostics.snapshot().chunks_played < expected_chunks as u64
            && Instant::now() < deadline
        {
            while let Ok(m) = metrics_rx.try_recv() {
                report_chunk(&mut reported, &m);
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        running.store(false, Ordering::SeqCst);
        relay.join().map_err(|_| "relay thread panicked".to_string())?;
        while let Ok(m) = metrics_rx.try_recv() {
            report_chunk(&mut reported, &m);
        }

        let snap = diagnostics.snapshot();
        println!(
            "Done. chunks_sent={} echoed_back={} chunks_played={} \
             discarded_partial_samples={} low_volume_alerts={}",
            snap.chunks_sent,
            snap.inbound_chunks,
            snap.chunks_played,
            framer.pending_samples(),
            framer.low_volume_alerts()
        );
        Ok(())
    }

    /// Echo the microphone to the speakers through the full engine.
    fn run_live(seconds: u64) -> Result<(), String> {
        let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
        let _guard = runtime.enter();

        let (echo_tx, echo_rx) = bounded(64);
        let engine = Arc::new(TalkbackEngine::new(
            EngineConfig::default(),
            TransportHandle::new(LoopbackTransport::new(echo_tx)),
        ));

        let mut metrics_rx = engine.subscribe_metrics();
        engine.start().map_err(|e| e.to_string())?;
        println!("Echoing the microphone to the speakers for {seconds} s — speak now.");

        // Pump every chunk the transport echoes straight back as a response,
        // closing the capture → playback loop.
        let pump_engine = Arc::clone(&engine);
        let pump = std::thread::spawn(move || loop {
            match echo_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(payload) => match pump_engine.play_response(payload) {
                    Ok(()) | Err(TalkbackError::ResponseQueueFull) => {}
                    Err(_) => break,
                },
                Err(RecvTimeoutError::Timeout) => {
                    if pump_engine.status() != EngineStatus::Listening {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(seconds) {
            match metrics_rx.try_recv() {
                Ok(m) => println!(
                    "level: rms={:.4} peak={:.4} total_samples={}",
                    m.rms, m.peak, m.sample_count
                ),
                Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(50)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => break,
            }
        }

        engine.stop().map_err(|e| e.to_string())?;
        let _ = pump.join();

        let snap = engine.pipeline_diagnostics_snapshot();
        println!(
            "Done. captured_samples={} chunks_sent={} chunks_played={} \
             send_failures={} decode_errors={} low_volume_alerts={}",
            snap.samples_captured,
            snap.chunks_sent,
            snap.chunks_played,
            snap.send_failures,
            snap.inbound_decode_errors,
            snap.low_volume_alerts
        );
        Ok(())
    }

    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talkback_core=info".parse().unwrap()),
        )
        .init();

    let args = parse_args()?;
    match args.wav {
        Some(path) => run_wav(&path),
        None => run_live(args.seconds),
    }
}
