//! PCM sample conversion and loudness metrics.
//!
//! The wire format on both directions of the voice loop is signed 16-bit
//! little-endian PCM, mono, at the 24 kHz pipeline rate. Inbound response
//! chunks additionally arrive base64-encoded.
//!
//! ## Quantization
//!
//! Encoding multiplies by 32768 and floors; decoding divides by 32767. The
//! divisor asymmetry is deliberate: it maps the extreme code -32768 slightly
//! outside [-1, 1] but guarantees that ±32767 decode to exactly ±1.0, which
//! keeps full-scale audio full-scale across a round trip. Do not make the
//! divisors symmetric without re-checking the round-trip tests.

use base64::prelude::*;

use crate::error::{Result, TalkbackError};

/// Quantize one normalized sample to a signed 16-bit value.
///
/// Saturates on out-of-range input rather than wrapping: any `s > 1.0`
/// produces `i16::MAX`, any `s < -1.0` produces `i16::MIN`.
pub fn encode_sample(s: f32) -> i16 {
    (s * 32768.0).floor().clamp(-32768.0, 32767.0) as i16
}

/// Expand one signed 16-bit value to a normalized sample.
///
/// Divides by 32767 (not 32768) so that `i16::MAX` decodes to exactly 1.0.
/// See the module docs for why the divisor differs from the encoder's.
pub fn decode_sample(v: i16) -> f32 {
    f32::from(v) / 32767.0
}

/// Quantize a buffer of normalized samples to 16-bit PCM.
pub fn encode(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

/// Expand a buffer of 16-bit PCM to normalized samples.
pub fn decode(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&v| decode_sample(v)).collect()
}

/// Root-mean-square level of a sample buffer. Returns 0.0 for empty input
/// (the naive formula divides by zero there).
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Largest absolute sample value in a buffer. Returns 0.0 for empty input.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |max, s| max.max(s.abs()))
}

/// Decode a base64 payload of little-endian 16-bit PCM into samples.
///
/// An empty payload decodes to an empty buffer; an odd byte count is a
/// malformed payload and an error.
pub fn decode_base64(payload: &str) -> Result<Vec<i16>> {
    let bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|e| TalkbackError::Decode(format!("invalid base64: {e}")))?;
    if bytes.len() % 2 != 0 {
        return Err(TalkbackError::Decode(format!(
            "odd byte count {} for 16-bit PCM payload",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode 16-bit PCM samples as a base64 payload of little-endian bytes.
pub fn encode_base64(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    BASE64_STANDARD.encode(bytes)
}
