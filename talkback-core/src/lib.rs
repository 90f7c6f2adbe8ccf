//! # talkback-core
//!
//! Reusable realtime voice-loop engine SDK: captures microphone audio,
//! frames it into fixed-size PCM chunks for a conversational transport, and
//! plays the transport's audio responses back strictly in order.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → MicCapture → SPSC RingBuffer → capture worker (spawn_blocking)
//!                                                  │ resample + frame + metrics
//!                                            chunk queue
//!                                                  │
//!                                   relay worker (spawn_blocking)
//!                                   │                          │
//!                        OutboundTransport::send_audio   broadcast::Sender<AudioMetrics>
//!
//! play_response(base64) → response queue → relay worker → PlaybackSequencer → CpalSink → Speaker
//! ```
//!
//! The audio callbacks are zero-alloc. All heap work happens on the worker
//! threads.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod capture;
pub mod engine;
pub mod error;
pub mod events;
pub mod framer;
pub mod pcm;
pub mod playback;
pub mod transport;

// Convenience re-exports for downstream crates
pub use engine::{EngineConfig, TalkbackEngine};
pub use error::TalkbackError;
pub use events::{AudioMetrics, EngineStatus, EngineStatusEvent};
pub use framer::{chunk::FramedChunk, CaptureFramer};
pub use playback::{PlaybackSequencer, PlaybackSink};
pub use transport::{loopback::LoopbackTransport, OutboundTransport, TransportHandle};
