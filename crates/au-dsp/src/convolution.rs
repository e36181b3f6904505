//! Convolution reverb / room correction
//!
//! Applies an arbitrary-length impulse response with the partitioned
//! overlap-add engine from `partition`. The IR arrives as decoded,
//! deinterleaved float PCM (decoding is an external collaborator); a
//! control thread partitions and transforms it into a staged slot
//! together with a freshly sized FDL, and the render thread adopts the
//! whole set by swapping ownership - no allocation in the audio callback.
//!
//! IR channel mapping:
//! - mono IR: applied to every audio channel
//! - stereo IR: alternating L/R per audio channel
//! - N >= 3 channels: 1:1 mapping; audio channels beyond the IR pass
//!   through unchanged

use au_core::{EngineError, MAX_CHANNELS, Sample};
use log::{debug, warn};
use parking_lot::Mutex;
use rustfft::num_complex::Complex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::fade::WetMixFade;
use crate::partition::{CONV_BINS, ConvFft, KernelPartitions, OlaChannel, PARTITION_SIZE};
use crate::staged::Published;

/// How long a control thread waits for the render thread to consume a
/// prior IR swap before abandoning the load.
const IR_SWAP_WAIT: Duration = Duration::from_secs(2);

/// Description of the loaded impulse response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrInfo {
    pub channels: usize,
    pub samples: usize,
    pub sample_rate: u32,
}

/// Frequency-domain IR: one kernel per IR channel.
#[derive(Default)]
struct IrData {
    kernels: Vec<KernelPartitions>,
    num_partitions: usize,
    channel_count: usize,
}

/// Staged IR plus the per-audio-channel OLA state built for it, so the
/// render-thread swap is a pure ownership exchange.
#[derive(Default)]
struct StagedIr {
    ir: IrData,
    ola: Vec<OlaChannel>,
}

struct ConvShared {
    enabled: AtomicBool,
    has_ir: AtomicBool,
    needs_state_reset: AtomicBool,
    staged: Published<StagedIr>,
    /// Audio channel count from the last prepare
    prepared_channels: AtomicUsize,
    info: Mutex<Option<IrInfo>>,
}

/// Control-thread handle.
#[derive(Clone)]
pub struct ConvolutionControl {
    shared: Arc<ConvShared>,
}

impl ConvolutionControl {
    /// Load an impulse response from decoded PCM (`channels x samples`,
    /// deinterleaved). Called from a background thread; blocks up to two
    /// seconds if the render thread has not yet consumed a prior swap.
    pub fn load_ir_from_pcm(
        &self,
        channels: Vec<Vec<f32>>,
        ir_sample_rate: u32,
    ) -> Result<(), EngineError> {
        if channels.is_empty() {
            return Err(EngineError::EmptyImpulseResponse);
        }
        if channels.len() > MAX_CHANNELS {
            return Err(EngineError::InvalidParameter(format!(
                "IR has {} channels (supported: 1..={MAX_CHANNELS})",
                channels.len()
            )));
        }
        let ir_len = channels[0].len();
        if ir_len == 0 {
            return Err(EngineError::EmptyImpulseResponse);
        }
        if channels.iter().any(|c| c.len() != ir_len) {
            return Err(EngineError::InvalidParameter(
                "IR channels differ in length".into(),
            ));
        }

        if !self.shared.staged.wait_consumed(IR_SWAP_WAIT) {
            warn!("convolution: render thread never consumed prior IR swap, abandoning load");
            return Err(EngineError::SwapTimeout);
        }

        // Build outside any lock: partition + forward-FFT each channel
        let mut fft = ConvFft::new();
        let kernels: Vec<KernelPartitions> = channels
            .iter()
            .map(|c| KernelPartitions::from_time_domain(c, &mut fft))
            .collect();
        let num_partitions = kernels[0].num_partitions();

        let audio_channels = self.shared.prepared_channels.load(Ordering::Relaxed).max(1);
        let mut built = StagedIr {
            ir: IrData {
                num_partitions,
                channel_count: channels.len(),
                kernels,
            },
            ola: (0..audio_channels)
                .map(|_| OlaChannel::new(num_partitions))
                .collect(),
        };

        // The previously active IR (left in the slot by the last render
        // swap) is dropped here, on the control thread
        self.shared
            .staged
            .publish_with(|slot| std::mem::swap(slot, &mut built));

        *self.shared.info.lock() = Some(IrInfo {
            channels: channels.len(),
            samples: ir_len,
            sample_rate: ir_sample_rate,
        });
        self.shared.has_ir.store(true, Ordering::Relaxed);
        self.shared.needs_state_reset.store(true, Ordering::Relaxed);

        debug!(
            "convolution: IR loaded ({} channels, {} samples, {} partitions, {} Hz)",
            channels.len(),
            ir_len,
            num_partitions,
            ir_sample_rate
        );
        Ok(())
    }

    /// Drop the IR. The processor fades out and clears its state; kernel
    /// memory is reclaimed on the next load.
    pub fn clear_ir(&self) {
        self.shared.has_ir.store(false, Ordering::Relaxed);
        self.shared.enabled.store(false, Ordering::Relaxed);
        *self.shared.info.lock() = None;
    }

    pub fn has_ir(&self) -> bool {
        self.shared.has_ir.load(Ordering::Relaxed)
    }

    pub fn ir_info(&self) -> Option<IrInfo> {
        *self.shared.info.lock()
    }

    pub fn set_enabled(&self, enabled: bool) {
        if enabled && !self.shared.enabled.load(Ordering::Relaxed) {
            self.shared.needs_state_reset.store(true, Ordering::Relaxed);
        }
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }
}

/// Render-side convolution engine.
pub struct ConvolutionProcessor {
    shared: Arc<ConvShared>,

    // Render-thread state
    active: IrData,
    ola: Vec<OlaChannel>,
    fft: ConvFft,
    accum: Vec<Complex<f32>>,
    /// Position within the current partition
    phase: usize,
    fdl_idx: usize,
    /// True once the first partition has been convolved
    has_output: bool,
    wet: WetMixFade,
}

impl ConvolutionProcessor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ConvShared {
                enabled: AtomicBool::new(false),
                has_ir: AtomicBool::new(false),
                needs_state_reset: AtomicBool::new(true),
                staged: Published::new(StagedIr::default()),
                prepared_channels: AtomicUsize::new(2),
                info: Mutex::new(None),
            }),
            active: IrData::default(),
            ola: Vec::new(),
            fft: ConvFft::new(),
            accum: vec![Complex::new(0.0, 0.0); CONV_BINS],
            phase: 0,
            fdl_idx: 0,
            has_output: false,
            wet: WetMixFade::new(),
        }
    }

    pub fn control(&self) -> ConvolutionControl {
        ConvolutionControl {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Called while audio is stopped. Rebuilds the per-channel OLA state
    /// for the new channel count.
    pub fn prepare(&mut self, _sample_rate: f64, channels: usize) {
        let channels = channels.clamp(1, MAX_CHANNELS);
        self.shared.prepared_channels.store(channels, Ordering::Relaxed);
        if self.active.num_partitions > 0 {
            self.ola = (0..channels)
                .map(|_| OlaChannel::new(self.active.num_partitions))
                .collect();
        } else {
            self.ola.clear();
        }
        self.reset();
    }

    /// Zero all convolution state.
    pub fn reset(&mut self) {
        self.phase = 0;
        self.fdl_idx = 0;
        self.has_output = false;
        self.wet.reset();
        for ch in &mut self.ola {
            ch.reset();
        }
    }

    pub fn process(&mut self, buf: &mut [Sample], frames: usize, channels: usize) {
        let want_enabled = self.shared.enabled.load(Ordering::Relaxed);
        let has_ir = self.shared.has_ir.load(Ordering::Relaxed);
        let want = want_enabled && has_ir;

        if !want && self.wet.is_bypassed() {
            return;
        }
        if channels == 0 || channels > MAX_CHANNELS {
            return;
        }

        // Adopt a staged IR: swap the kernel set and its pre-built FDL in
        // one critical section, then restart from clean state
        let adopted = self.shared.staged.try_consume_with(|staged| {
            std::mem::swap(&mut self.active, &mut staged.ir);
            std::mem::swap(&mut self.ola, &mut staged.ola);
        });
        if adopted {
            self.phase = 0;
            self.fdl_idx = 0;
            self.has_output = false;
            self.wet.reset();
        }

        if self.shared.needs_state_reset.swap(false, Ordering::Relaxed) {
            self.reset();
        }

        if self.active.num_partitions == 0 || self.ola.len() < channels {
            return;
        }

        let ir_channels = self.active.channel_count;
        let num_partitions = self.active.num_partitions;
        let mut pos = 0;

        while pos < frames {
            let avail = (frames - pos).min(PARTITION_SIZE - self.phase);

            for i in 0..avail {
                let base = (pos + i) * channels;

                // Deinterleave into the per-channel input blocks
                for c in 0..channels {
                    self.ola[c].input[self.phase + i] = buf[base + c];
                }

                // Emit the previously convolved partition (one partition
                // of latency); dry until the first partition completes
                if self.has_output {
                    let mix = self.wet.advance(want);
                    for c in 0..channels {
                        let dry = buf[base + c];
                        let wet = self.ola[c].output[self.phase + i];
                        buf[base + c] = dry * (1.0 - mix) + wet * mix;
                    }
                }
            }

            self.phase += avail;
            pos += avail;

            if self.phase >= PARTITION_SIZE {
                for c in 0..channels {
                    let mapped = if ir_channels == 1 {
                        0
                    } else if ir_channels == 2 {
                        c % 2
                    } else if c < ir_channels {
                        c
                    } else {
                        // No IR for this channel: pass input straight through
                        let ch = &mut self.ola[c];
                        ch.output.copy_from_slice(&ch.input);
                        continue;
                    };

                    self.ola[c].convolve_block(
                        &self.active.kernels[mapped],
                        &mut self.fft,
                        self.fdl_idx,
                        &mut self.accum,
                    );
                }

                self.fdl_idx = (self.fdl_idx + 1) % num_partitions;
                self.phase = 0;
                self.has_output = true;
            }
        }

        // Fully faded out: clear state for a clean restart
        if !want && self.wet.is_bypassed() {
            self.reset();
        }
    }
}

impl Default for ConvolutionProcessor {
    fn default() -> Self {
        Self::new()
    }
}
