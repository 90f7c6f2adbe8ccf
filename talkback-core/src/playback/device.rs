//! Speaker output via the cpal backend.
//!
//! Output-side counterpart of the capture module, with the same realtime
//! rules: the cpal output callback must not allocate, block, or perform I/O,
//! so it only pops from an SPSC ring and fills the remainder with silence.
//!
//! Chunks pushed by `begin` land in the ring back to back, so consecutive
//! chunks splice gap-free even though the completion notification fires
//! slightly before the device drains its last hardware buffer. A shared
//! `pending` counter tracks how many samples of the current chunk are still
//! in the ring; the callback decrements it as samples leave and posts one
//! completion when it reaches zero.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use crossbeam_channel::Sender;
#[cfg(feature = "audio-cpal")]
use ringbuf::{traits::Split, HeapRb};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info};
use tracing::warn;

use crate::capture::{Consumer, Producer, SampleConsumer, SampleProducer};
use crate::error::{Result, TalkbackError};
#[cfg(feature = "audio-cpal")]
use crate::pcm;
use crate::playback::PlaybackSink;

/// Ring capacity: 2^16 = 65 536 f32 samples ≈ 2.7 s at 24 kHz. Playback is
/// strictly sequential, so the ring only ever holds one chunk plus the tail
/// of the previous one.
pub const PLAYBACK_RING_CAPACITY: usize = 1 << 16;

/// One output-callback tick: move ring samples into `out`, silence the rest,
/// and decrement `pending`, posting exactly one completion when the current
/// chunk's last sample leaves the ring.
///
/// When `live` is false the ring is still drained (so stale audio cannot
/// play later) but the output is forced to silence and no completion fires.
fn fill_output(
    out: &mut [f32],
    consumer: &mut SampleConsumer,
    live: &AtomicBool,
    pending: &AtomicUsize,
    completion_tx: &Sender<()>,
) {
    let popped = consumer.pop_slice(out);
    out[popped..].fill(0.0);

    if !live.load(Ordering::Relaxed) {
        out.fill(0.0);
        return;
    }
    if popped == 0 {
        return;
    }

    // Saturating CAS decrement: `stop` can zero the counter between this
    // callback's read and write, and the count must never wrap.
    let drained = pending.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
        if count == 0 {
            None
        } else {
            Some(count.saturating_sub(popped))
        }
    });
    if let Ok(previous) = drained {
        if previous <= popped {
            let _ = completion_tx.try_send(());
        }
    }
}

/// Plays decoded response audio on the system default output device.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS, which is why [`PlaybackSink`] carries no `Send` bound.
/// The engine creates and drops this type inside the relay worker.
pub struct CpalSink {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    producer: SampleProducer,
    /// Cleared by `stop`; the callback then silences its output.
    live: Arc<AtomicBool>,
    /// Samples of the current chunk still waiting in the ring.
    pending: Arc<AtomicUsize>,
    completion_tx: Sender<()>,
}

#[cfg(feature = "audio-cpal")]
impl CpalSink {
    /// Open the system default output device as a mono stream at
    /// `sample_rate` and start it.
    ///
    /// `completion_tx` should be a small bounded channel — at most one
    /// notification is ever outstanding. Must be called from the thread
    /// that will also drop this value.
    ///
    /// # Errors
    /// Returns `TalkbackError::NoDefaultOutputDevice` when no speaker is
    /// available, `TalkbackError::UnsupportedSampleFormat` for exotic device
    /// formats, or `TalkbackError::AudioStream` if cpal rejects the mono
    /// config or fails to build the stream.
    pub fn open_default(sample_rate: u32, completion_tx: Sender<()>) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(TalkbackError::NoDefaultOutputDevice)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| TalkbackError::AudioDevice(e.to_string()))?;

        info!(sample_rate, "output stream configured");

        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, mut consumer) = HeapRb::<f32>::new(PLAYBACK_RING_CAPACITY).split();
        let live = Arc::new(AtomicBool::new(true));
        let pending = Arc::new(AtomicUsize::new(0));

        // One set of clones per sample format branch so each closure owns
        // its handles.
        let live_f32 = Arc::clone(&live);
        let pending_f32 = Arc::clone(&pending);
        let tx_f32 = completion_tx.clone();
        let live_i16 = Arc::clone(&live);
        let pending_i16 = Arc::clone(&pending);
        let tx_i16 = completion_tx.clone();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    fill_output(data, &mut consumer, &live_f32, &pending_f32, &tx_f32);
                },
                |err| error!("output stream error: {err}"),
                None,
            ),

            SampleFormat::I16 => {
                let mut scratch: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _info| {
                        scratch.resize(data.len(), 0.0);
                        fill_output(&mut scratch, &mut consumer, &live_i16, &pending_i16, &tx_i16);
                        for (dst, src) in data.iter_mut().zip(scratch.iter()) {
                            *dst = pcm::encode_sample(*src);
                        }
                    },
                    |err| error!("output stream error: {err}"),
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
            producer,
            live,
            pending,
            completion_tx,
        })
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl CpalSink {
    pub fn open_default(_sample_rate: u32, _completion_tx: Sender<()>) -> Result<Self> {
        Err(TalkbackError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl PlaybackSink for CpalSink {
    fn begin(&mut self, samples: Vec<f32>) -> Result<()> {
        if samples.is_empty() {
            return Err(TalkbackError::Playback("empty sample buffer".into()));
        }

        // Publish the pending count before the samples so the callback can
        // never see audio it has no accounting for.
        self.pending.store(samples.len(), Ordering::Release);
        let written = self.producer.push_slice(&samples);
        if written < samples.len() {
            // Chunk larger than the ring. The tail will never reach the
            // callback, so account for it here to keep the completion honest.
            let dropped = samples.len() - written;
            warn!(dropped, "playback ring full: chunk tail dropped");
            if self.pending.fetch_sub(dropped, Ordering::AcqRel) == dropped {
                let _ = self.completion_tx.try_send(());
            }
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.live.store(false, Ordering::Release);
        // Safe against a mid-tick callback: its decrement is a saturating
        // CAS that leaves an already-zeroed counter alone.
        self.pending.store(0, Ordering::Release);
    }
}
