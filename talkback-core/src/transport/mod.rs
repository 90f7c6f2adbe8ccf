//! Outbound transport abstraction.
//!
//! The `OutboundTransport` trait decouples the relay from any specific
//! realtime client (a websocket session in the real product, a loopback echo
//! in development, a recording fake in tests).
//!
//! `&mut self` on `send_audio` intentionally expresses that transports are
//! stateful — socket handles, reconnect state, send windows. All mutation is
//! therefore serialised through `TransportHandle`'s `parking_lot::Mutex`.

pub mod loopback;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Contract for the outbound side of the voice loop.
pub trait OutboundTransport: Send + 'static {
    /// Forward one encoded capture chunk to the realtime service.
    ///
    /// Fire-and-forget from the pipeline's perspective: delivery,
    /// backpressure, and reconnects are the transport's concern. The relay
    /// logs and counts a returned error, then moves on to the next chunk.
    fn send_audio(&mut self, pcm: &[i16]) -> Result<()>;
}

/// Thread-safe reference-counted handle to any `OutboundTransport` implementor.
///
/// Uses `parking_lot::Mutex` for non-poisoning on panic (unlike
/// `std::sync::Mutex`).
#[derive(Clone)]
pub struct TransportHandle(pub Arc<Mutex<dyn OutboundTransport>>);

impl TransportHandle {
    /// Wrap any `OutboundTransport` in a `TransportHandle`.
    pub fn new<T: OutboundTransport>(transport: T) -> Self {
        Self(Arc::new(Mutex::new(transport)))
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle").finish_non_exhaustive()
    }
}
