//! au-core: Shared types for the Auricle playback engine
//!
//! Foundational types used across all Auricle crates: the render sample
//! type, the negotiated playback format, decibel conversion, parameter
//! descriptors and the engine error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Render-buffer sample type. All audio crosses the engine boundary as
/// interleaved 32-bit float; filter arithmetic that needs the headroom
/// runs in f64 internally.
pub type Sample = f32;

/// Maximum channel count the engine will process.
pub const MAX_CHANNELS: usize = 24;

/// Convert decibels to linear gain.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert linear gain to decibels.
#[inline]
pub fn linear_to_db(gain: f32) -> f32 {
    20.0 * gain.max(1e-10).log10()
}

/// Negotiated playback format.
///
/// Set once per session while audio is stopped; read by both control and
/// render threads afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Channel count (1..=24)
    pub channels: usize,
    /// Largest buffer the driver will deliver, in frames
    pub max_block_size: usize,
}

impl AudioFormat {
    pub fn new(
        sample_rate: f64,
        channels: usize,
        max_block_size: usize,
    ) -> Result<Self, EngineError> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(EngineError::InvalidFormat(format!(
                "sample rate {sample_rate} Hz"
            )));
        }
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(EngineError::InvalidFormat(format!(
                "{channels} channels (supported: 1..={MAX_CHANNELS})"
            )));
        }
        if max_block_size == 0 {
            return Err(EngineError::InvalidFormat("zero block size".into()));
        }
        Ok(Self {
            sample_rate,
            channels,
            max_block_size,
        })
    }

    /// Stereo shorthand used throughout the tests.
    pub fn stereo(sample_rate: f64, max_block_size: usize) -> Self {
        Self {
            sample_rate,
            channels: 2,
            max_block_size,
        }
    }
}

/// Parameter descriptor exposed by DSP processors to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DspParameter {
    pub name: String,
    pub value: f32,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    /// e.g. "dB", "Hz", "%"
    pub unit: String,
}

/// Errors surfaced by control-thread operations.
///
/// The render path never returns errors; every fallible operation lives on
/// a control thread.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid audio format: {0}")]
    InvalidFormat(String),

    #[error("band index {0} out of range")]
    BandOutOfRange(usize),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("impulse response contains no samples")]
    EmptyImpulseResponse,

    #[error("timed out waiting for the render thread to consume a staged swap")]
    SwapTimeout,

    #[error("no HRTF dataset loaded")]
    NoDataset,

    #[error("could not restore processor state")]
    RestoreFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_conversion() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(6.0) - 1.9953).abs() < 1e-3);
        assert!((db_to_linear(-6.0) - 0.5012).abs() < 1e-3);
        assert!((linear_to_db(db_to_linear(3.5)) - 3.5).abs() < 1e-4);
    }

    #[test]
    fn test_format_validation() {
        assert!(AudioFormat::new(48000.0, 2, 1024).is_ok());
        assert!(AudioFormat::new(0.0, 2, 1024).is_err());
        assert!(AudioFormat::new(48000.0, 0, 1024).is_err());
        assert!(AudioFormat::new(48000.0, 25, 1024).is_err());
        assert!(AudioFormat::new(48000.0, 2, 0).is_err());
    }
}
