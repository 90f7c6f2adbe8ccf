//! Microphone capture via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority
//! (TIME_CRITICAL on Windows). It **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! This module satisfies that contract by writing directly into an SPSC ring
//! buffer producer whose `push_slice` is lock-free and allocation-free. The
//! capture worker on the other side of the ring does the framing, metrics,
//! and channel sends.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `MicCapture` therefore must be created and dropped on the same
//! thread. The engine accomplishes this by calling `open_default` inside
//! `spawn_blocking`.

pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use ringbuf::{traits::Split, HeapRb};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

use crate::error::{Result, TalkbackError};

pub use ringbuf::traits::{Consumer, Producer};

/// Type alias for the producer half — held by the device callback.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half — held by the capture worker.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Ring capacity: 2^16 = 65 536 f32 samples ≈ 1.4 s at 48 kHz. The capture
/// worker drains continuously, so this only needs to ride out scheduling
/// hiccups, not long stalls.
pub const RING_CAPACITY: usize = 1 << 16;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_sample_ring() -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// Handle to an active microphone stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct MicCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — set to `false` to signal the callback to no-op.
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl MicCapture {
    /// Open the system default microphone and push mono f32 samples into
    /// `producer`.
    ///
    /// Must be called from the thread that will also drop this value. In
    /// practice this means calling it inside `tokio::task::spawn_blocking`.
    ///
    /// Stream format (rate, channel count) is validated and logged once here;
    /// multi-channel input is downmixed to mono inside the callback with a
    /// reused scratch buffer.
    ///
    /// # Errors
    /// Returns `TalkbackError::NoDefaultInputDevice` when no microphone is
    /// available, `TalkbackError::UnsupportedSampleFormat` for exotic device
    /// formats, or `TalkbackError::AudioStream` if cpal fails to build the
    /// stream.
    pub fn open_default(mut producer: SampleProducer, running: Arc<AtomicBool>) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(TalkbackError::NoDefaultInputDevice)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| TalkbackError::AudioDevice(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(sample_rate, channels, "input stream configured");
        if channels != 1 {
            info!(channels, "multi-channel input will be downmixed to mono");
        }

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // One Arc per sample format branch so each closure owns its flag.
        let running_f32 = Arc::clone(&running);
        let running_i16 = Arc::clone(&running);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running_f32.load(Ordering::Relaxed) {
                            return;
                        }
                        if ch == 1 {
                            let written = producer.push_slice(data);
                            if written < data.len() {
                                warn!(
                                    "capture ring full: dropped {} f32 samples",
                                    data.len() - written
                                );
                            }
                            return;
                        }

                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0.0);
                        for f in 0..frames {
                            let mut sum = 0f32;
                            let base = f * ch;
                            for c in 0..ch {
                                sum += data[base + c];
                            }
                            mix_buf[f] = sum / ch as f32;
                        }
                        let written = producer.push_slice(&mix_buf);
                        if written < mix_buf.len() {
                            warn!(
                                "capture ring full: dropped {} f32 samples",
                                mix_buf.len() - written
                            );
                        }
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running_i16.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0.0);
                        if ch == 1 {
                            for (idx, sample) in data.iter().take(frames).enumerate() {
                                mix_buf[idx] = *sample as f32 / 32768.0;
                            }
                        } else {
                            for f in 0..frames {
                                let mut sum = 0f32;
                                let base = f * ch;
                                for c in 0..ch {
                                    sum += data[base + c] as f32 / 32768.0;
                                }
                                mix_buf[f] = sum / ch as f32;
                            }
                        }
                        let written = producer.push_slice(&mix_buf);
                        if written < mix_buf.len() {
                            warn!(
                                "capture ring full: dropped {} i16 samples",
                                mix_buf.len() - written
                            );
                        }
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(TalkbackError::UnsupportedSampleFormat(format!("{fmt:?}")));
            }
        }
        .map_err(|e| TalkbackError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| TalkbackError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl MicCapture {
    pub fn open_default(_producer: SampleProducer, _running: Arc<AtomicBool>) -> Result<Self> {
        Err(TalkbackError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
