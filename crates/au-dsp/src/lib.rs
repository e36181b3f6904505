//! au-dsp: Real-time DSP processors for the Auricle playback engine
//!
//! Per-buffer processors applied by the render pipeline, together with the
//! concurrency primitives they share.
//!
//! ## Infrastructure
//! - `staged` - Published-value hand-off from control threads to the render thread
//! - `fade` - Wet-mix fades, linear ramps, equal-power crossfades
//! - `partition` - Partitioned frequency-domain convolution core (OLA + FDL)
//!
//! ## Processors
//! - `gain` - Headroom/preamp gain with per-buffer ramp
//! - `biquad` - Audio-EQ-Cookbook biquad coefficients and state
//! - `equalizer` - 20-band parametric EQ (minimum-phase and linear-phase)
//! - `crossfeed` - bs2b-style headphone crossfeed
//! - `convolution` - Impulse-response reverb / room correction
//! - `hrtf` - Binaural speaker simulation from an HRTF dataset
//!
//! Every processor follows the same threading contract: its `process`
//! method runs on the audio render thread and never allocates, blocks or
//! performs I/O; configuration arrives through atomics and staged slots
//! written by control threads.

pub mod biquad;
pub mod convolution;
pub mod crossfeed;
pub mod equalizer;
pub mod fade;
pub mod gain;
pub mod hrtf;
pub mod partition;
pub mod staged;

pub use biquad::{Band, BiquadCoeffs, BiquadState, FilterKind, MAX_BANDS};
pub use convolution::{ConvolutionControl, ConvolutionProcessor, IrInfo};
pub use crossfeed::{CrossfeedControl, CrossfeedLevel, CrossfeedProcessor};
pub use equalizer::{EqControl, EqualizerProcessor, PhaseMode};
pub use fade::{LP_FADE_LEN, RAMP_FADE_LEN, WET_FADE_STEP, WetMixFade};
pub use gain::{GainControl, GainProcessor};
pub use hrtf::{HrtfControl, HrtfDataset, HrtfMeasurement, HrtfProcessor};
pub use partition::{CONV_FFT_SIZE, PARTITION_SIZE};
pub use staged::Published;
