//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! `cpal` captures at the device's native rate (commonly 48 kHz or 44.1 kHz),
//! while the voice loop runs end to end at 24 kHz. `Resampler` bridges that
//! gap on the capture worker, where allocation is allowed.
//!
//! When the device already runs at the pipeline rate the converter is a
//! passthrough — no rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler as _};
use tracing::{error, info};

use crate::error::{Result, TalkbackError};

/// Converts f32 mono audio from the device rate to the pipeline rate.
pub struct Resampler {
    /// `None` when device rate == pipeline rate (passthrough mode).
    inner: Option<FastFixedIn<f32>>,
    /// Accumulates partial input blocks between calls.
    input_buf: Vec<f32>,
    /// Input samples rubato expects per process call.
    block_size: usize,
    /// Pre-allocated rubato output: `[1][output_frames_max]`.
    out_buf: Vec<Vec<f32>>,
}

impl Resampler {
    /// Create a converter from `device_rate` to `pipeline_rate` Hz, fed in
    /// blocks of `block_size` input samples.
    ///
    /// # Errors
    /// Returns `TalkbackError::AudioStream` if rubato fails to initialise.
    pub fn new(device_rate: u32, pipeline_rate: u32, block_size: usize) -> Result<Self> {
        if device_rate == pipeline_rate {
            return Ok(Self {
                inner: None,
                input_buf: Vec::new(),
                block_size,
                out_buf: Vec::new(),
            });
        }

        let ratio = pipeline_rate as f64 / device_rate as f64;

        let inner = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio — no dynamic adjustment
            PolynomialDegree::Cubic,
            block_size,
            1, // mono
        )
        .map_err(|e| TalkbackError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = inner.output_frames_max();
        let out_buf = vec![vec![0f32; max_out]; 1];

        info!(
            device_rate,
            pipeline_rate, block_size, "sample-rate conversion enabled"
        );

        Ok(Self {
            inner: Some(inner),
            input_buf: Vec::new(),
            block_size,
            out_buf,
        })
    }

    /// Convert incoming samples, returning pipeline-rate output (may be
    /// empty while a partial block accumulates).
    ///
    /// In passthrough mode the input is returned as-is.
    pub fn convert(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut inner) = self.inner else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut converted = Vec::new();
        while self.input_buf.len() >= self.block_size {
            let block = &self.input_buf[..self.block_size];
            match inner.process_into_buffer(&[block], &mut self.out_buf, None) {
                Ok((_consumed, produced)) => {
                    converted.extend_from_slice(&self.out_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.input_buf.drain(..self.block_size);
        }

        converted
    }

    /// Returns `true` when device rate == pipeline rate (no conversion).
    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }
}
