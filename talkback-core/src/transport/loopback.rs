//! `LoopbackTransport` — development transport that echoes audio back.
//!
//! Re-encodes every sent chunk as a base64 response payload and forwards it
//! to a channel, standing in for the realtime service's audio deltas. Lets
//! the full capture → transport → playback loop run with no network and no
//! service credentials.

use crossbeam_channel::{Sender, TrySendError};
use tracing::debug;

use crate::error::{Result, TalkbackError};
use crate::pcm;
use crate::transport::OutboundTransport;

/// Echo-style transport for demos and tests.
pub struct LoopbackTransport {
    response_tx: Sender<String>,
    chunks_echoed: u64,
}

impl LoopbackTransport {
    /// Echo sent audio as base64 payloads into `response_tx`.
    pub fn new(response_tx: Sender<String>) -> Self {
        Self {
            response_tx,
            chunks_echoed: 0,
        }
    }

    /// Chunks successfully echoed so far.
    pub fn chunks_echoed(&self) -> u64 {
        self.chunks_echoed
    }
}

impl OutboundTransport for LoopbackTransport {
    fn send_audio(&mut self, pcm: &[i16]) -> Result<()> {
        let payload = pcm::encode_base64(pcm);
        match self.response_tx.try_send(payload) {
            Ok(()) => {
                self.chunks_echoed += 1;
                debug!(samples = pcm.len(), "echoed capture chunk");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                Err(TalkbackError::Transport("echo queue is full".into()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(TalkbackError::Transport("echo receiver dropped".into()))
            }
        }
    }
}
