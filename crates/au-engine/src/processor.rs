//! Abstract per-buffer processor
//!
//! External processors (plugin hosts, visualizer taps, third-party
//! effects) join the pipeline's plugin chain through this trait. All
//! audio crosses the boundary as interleaved float32. The only threading
//! assumption the pipeline makes is that `process` is callable from the
//! render thread once `prepare` has run.

use au_core::{DspParameter, Sample};

pub trait DspProcessor: Send {
    /// Processor identity, for UI listings and session state.
    fn name(&self) -> &str;

    /// Process the buffer in place. Runs on the audio render thread:
    /// no allocation, no blocking, no I/O.
    fn process(&mut self, buf: &mut [Sample], frames: usize, channels: usize);

    /// Bypass flag. Disabled processors are skipped by the pipeline.
    fn is_enabled(&self) -> bool {
        true
    }

    fn set_enabled(&mut self, _enabled: bool) {}

    /// Called while audio is stopped, before the first `process`.
    fn prepare(&mut self, _sample_rate: f64, _channels: usize) {}

    /// Clear internal state (filter histories, delay lines).
    fn reset(&mut self) {}

    fn parameters(&self) -> Vec<DspParameter> {
        Vec::new()
    }

    fn set_parameter(&mut self, _index: usize, _value: f32) {}

    fn parameter(&self, _index: usize) -> f32 {
        0.0
    }

    /// Opaque state blob for session restore. The format is the
    /// processor's own business.
    fn save_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn restore_state(&mut self, _blob: &[u8]) -> bool {
        false
    }
}
