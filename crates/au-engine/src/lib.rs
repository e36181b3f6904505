//! au-engine: Render pipeline orchestration for the Auricle playback engine
//!
//! Owns the ordered DSP chain (headroom gain, crossfeed, convolution,
//! HRTF, equalizer, external plugin processors) and exposes one
//! `process` entry point to the audio driver plus control handles for
//! UI and background threads.

mod pipeline;
mod processor;

pub use pipeline::{EngineEvent, Pipeline, PipelineControl};
pub use processor::DspProcessor;

pub use au_core::{AudioFormat, DspParameter, EngineError, MAX_CHANNELS, Sample};
