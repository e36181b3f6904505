//! HRTF binauralizer
//!
//! Simulates loudspeaker playback on headphones: for a configurable
//! speaker angle, four impulse responses (left-speaker and right-speaker
//! to each ear) are pulled from an HRTF dataset and applied as FIR
//! filters:
//!
//! ```text
//! out_L = x_L * ir_ll + x_R * ir_rl
//! out_R = x_L * ir_lr + x_R * ir_rr
//! ```
//!
//! Convolution runs in block form over an extended `[history | block]`
//! buffer against reversed IR copies. Filter sets are built on a control
//! thread into a staged slot and adopted by the render thread in a single
//! swap. Stereo only; other channel counts pass through.
//!
//! Dataset file parsing (SOFA et al.) lives outside the engine; the
//! processor consumes decoded measurement sets.

use au_core::{EngineError, Sample};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::fade::WetMixFade;
use crate::staged::Published;

/// Speaker angle limits, degrees from center.
pub const MIN_SPEAKER_ANGLE: f32 = 10.0;
pub const MAX_SPEAKER_ANGLE: f32 = 90.0;
const DEFAULT_SPEAKER_ANGLE: f32 = 30.0;

/// How long a control thread waits for the render thread to adopt a
/// previously staged filter set before giving up.
const STAGED_WAIT: Duration = Duration::from_millis(100);

/// One measured source position with its two ear responses.
#[derive(Debug, Clone)]
pub struct HrtfMeasurement {
    /// Azimuth in degrees; positive = source left of center
    pub azimuth_deg: f32,
    /// Elevation in degrees; 0 = ear level
    pub elevation_deg: f32,
    /// Impulse response to the left ear
    pub left: Vec<f32>,
    /// Impulse response to the right ear
    pub right: Vec<f32>,
}

/// Decoded HRTF dataset: measurements at a common IR length and rate.
#[derive(Debug, Clone)]
pub struct HrtfDataset {
    measurements: Vec<HrtfMeasurement>,
    ir_length: usize,
    sample_rate: u32,
}

impl HrtfDataset {
    pub fn new(
        measurements: Vec<HrtfMeasurement>,
        sample_rate: u32,
    ) -> Result<Self, EngineError> {
        let Some(first) = measurements.first() else {
            return Err(EngineError::NoDataset);
        };
        let ir_length = first.left.len();
        if ir_length == 0 {
            return Err(EngineError::EmptyImpulseResponse);
        }
        for m in &measurements {
            if m.left.len() != ir_length || m.right.len() != ir_length {
                return Err(EngineError::InvalidParameter(
                    "HRTF measurements differ in IR length".into(),
                ));
            }
        }
        Ok(Self {
            measurements,
            ir_length,
            sample_rate,
        })
    }

    pub fn ir_length(&self) -> usize {
        self.ir_length
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Nearest measurement by angular distance.
    fn nearest(&self, azimuth_deg: f32, elevation_deg: f32) -> &HrtfMeasurement {
        self.measurements
            .iter()
            .min_by(|a, b| {
                let da = (a.azimuth_deg - azimuth_deg).abs() + (a.elevation_deg - elevation_deg).abs();
                let db = (b.azimuth_deg - azimuth_deg).abs() + (b.elevation_deg - elevation_deg).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("dataset validated non-empty")
    }
}

/// Staged filter set: four IRs, their reversed copies, and the extended
/// signal buffers, all swapped into the render thread at once.
#[derive(Default)]
struct StagedFilters {
    ir_ll: Vec<f32>,
    ir_lr: Vec<f32>,
    ir_rl: Vec<f32>,
    ir_rr: Vec<f32>,
    rev_ll: Vec<f32>,
    rev_lr: Vec<f32>,
    rev_rl: Vec<f32>,
    rev_rr: Vec<f32>,
    /// [history (N-1) | current block] per channel
    ext_l: Vec<f32>,
    ext_r: Vec<f32>,
    ir_len: usize,
}

struct HrtfShared {
    enabled: AtomicBool,
    loaded: AtomicBool,
    needs_state_reset: AtomicBool,
    staged: Published<StagedFilters>,
    dataset: Mutex<Option<HrtfDataset>>,
    /// Speaker angle readback, f32 bits
    angle: AtomicU32,
    /// Largest block the driver will deliver, from prepare
    max_block: AtomicUsize,
}

/// Control-thread handle.
#[derive(Clone)]
pub struct HrtfControl {
    shared: Arc<HrtfShared>,
}

impl HrtfControl {
    /// Install a decoded dataset and stage filters for the current angle.
    pub fn load_dataset(&self, dataset: HrtfDataset) -> Result<(), EngineError> {
        debug!(
            "hrtf: dataset loaded ({} measurements, IR length {}, {} Hz)",
            dataset.len(),
            dataset.ir_length(),
            dataset.sample_rate()
        );
        *self.shared.dataset.lock() = Some(dataset);
        self.shared.loaded.store(true, Ordering::Release);
        self.build_staged()
    }

    pub fn clear_dataset(&self) {
        self.shared.loaded.store(false, Ordering::Release);
        self.shared.enabled.store(false, Ordering::Relaxed);
        *self.shared.dataset.lock() = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.loaded.load(Ordering::Acquire)
    }

    /// Speaker angle from center, clamped to 10..=90 degrees.
    pub fn set_speaker_angle(&self, degrees: f32) -> Result<(), EngineError> {
        let degrees = degrees.clamp(MIN_SPEAKER_ANGLE, MAX_SPEAKER_ANGLE);
        self.shared.angle.store(degrees.to_bits(), Ordering::Relaxed);
        if self.is_loaded() {
            self.build_staged()
        } else {
            Ok(())
        }
    }

    pub fn speaker_angle(&self) -> f32 {
        f32::from_bits(self.shared.angle.load(Ordering::Relaxed))
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

    /// Build the four filters for the current angle into the staged slot.
    fn build_staged(&self) -> Result<(), EngineError> {
        // Wait for the render thread to adopt any previous set first
        if !self.shared.staged.wait_consumed(STAGED_WAIT) {
            warn!("hrtf: staged filter set not consumed, skipping update");
            return Err(EngineError::SwapTimeout);
        }

        let guard = self.shared.dataset.lock();
        let dataset = guard.as_ref().ok_or(EngineError::NoDataset)?;
        let angle = self.speaker_angle();

        // Left speaker at +angle (left of center), right speaker mirrored
        let left_spk = dataset.nearest(angle, 0.0);
        let right_spk = dataset.nearest(-angle, 0.0);

        let ir_len = dataset.ir_length();
        let max_block = self.shared.max_block.load(Ordering::Relaxed).max(1);
        let hist_len = ir_len - 1;

        let reverse = |ir: &[f32]| ir.iter().rev().copied().collect::<Vec<f32>>();

        let mut built = StagedFilters {
            rev_ll: reverse(&left_spk.left),
            rev_lr: reverse(&left_spk.right),
            rev_rl: reverse(&right_spk.left),
            rev_rr: reverse(&right_spk.right),
            ir_ll: left_spk.left.clone(),
            ir_lr: left_spk.right.clone(),
            ir_rl: right_spk.left.clone(),
            ir_rr: right_spk.right.clone(),
            ext_l: vec![0.0; hist_len + max_block],
            ext_r: vec![0.0; hist_len + max_block],
            ir_len,
        };
        drop(guard);

        self.shared
            .staged
            .publish_with(|slot| std::mem::swap(slot, &mut built));
        debug!("hrtf: staged filters for angle {angle} (IR length {ir_len})");
        Ok(())
    }
}

/// Render-side binauralizer.
pub struct HrtfProcessor {
    shared: Arc<HrtfShared>,

    // Active filter set (render thread only)
    ir_ll: Vec<f32>,
    ir_lr: Vec<f32>,
    ir_rl: Vec<f32>,
    ir_rr: Vec<f32>,
    rev_ll: Vec<f32>,
    rev_lr: Vec<f32>,
    rev_rl: Vec<f32>,
    rev_rr: Vec<f32>,
    ext_l: Vec<f32>,
    ext_r: Vec<f32>,
    ir_len: usize,

    wet: WetMixFade,
}

impl HrtfProcessor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(HrtfShared {
                enabled: AtomicBool::new(false),
                loaded: AtomicBool::new(false),
                needs_state_reset: AtomicBool::new(true),
                staged: Published::new(StagedFilters::default()),
                dataset: Mutex::new(None),
                angle: AtomicU32::new(DEFAULT_SPEAKER_ANGLE.to_bits()),
                max_block: AtomicUsize::new(4096),
            }),
            ir_ll: Vec::new(),
            ir_lr: Vec::new(),
            ir_rl: Vec::new(),
            ir_rr: Vec::new(),
            rev_ll: Vec::new(),
            rev_lr: Vec::new(),
            rev_rl: Vec::new(),
            rev_rr: Vec::new(),
            ext_l: Vec::new(),
            ext_r: Vec::new(),
            ir_len: 0,
            wet: WetMixFade::new(),
        }
    }

    pub fn control(&self) -> HrtfControl {
        HrtfControl {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Called while audio is stopped. Restages filters so the extended
    /// buffers match the new maximum block size.
    pub fn prepare(&mut self, sample_rate: f64, max_block_size: usize) {
        self.shared.max_block.store(max_block_size, Ordering::Relaxed);
        let ctl = self.control();
        if ctl.is_loaded() {
            if let Some(ds) = self.shared.dataset.lock().as_ref() {
                if (ds.sample_rate() as f64 - sample_rate).abs() > 1.0 {
                    warn!(
                        "hrtf: dataset rate {} Hz differs from playback rate {} Hz",
                        ds.sample_rate(),
                        sample_rate
                    );
                }
            }
            let _ = ctl.build_staged();
        }
        self.reset();
    }

    /// Zero the convolution history.
    pub fn reset(&mut self) {
        let hist_len = self.ir_len.saturating_sub(1);
        if hist_len > 0 && self.ext_l.len() >= hist_len {
            self.ext_l[..hist_len].fill(0.0);
            self.ext_r[..hist_len].fill(0.0);
        }
        self.wet.reset();
    }

    pub fn process(&mut self, buf: &mut [Sample], frames: usize, channels: usize) {
        if channels != 2 {
            return;
        }

        let want_enabled = self.shared.enabled.load(Ordering::Relaxed);
        if !want_enabled && self.wet.is_bypassed() {
            return;
        }
        if !self.shared.loaded.load(Ordering::Acquire) {
            return;
        }

        if self.shared.needs_state_reset.swap(false, Ordering::Relaxed) {
            self.reset();
        }

        // Adopt a staged filter set: O(1) swaps of all owning buffers in
        // one critical section
        self.shared.staged.try_consume_with(|staged| {
            std::mem::swap(&mut self.ir_ll, &mut staged.ir_ll);
            std::mem::swap(&mut self.ir_lr, &mut staged.ir_lr);
            std::mem::swap(&mut self.ir_rl, &mut staged.ir_rl);
            std::mem::swap(&mut self.ir_rr, &mut staged.ir_rr);
            std::mem::swap(&mut self.rev_ll, &mut staged.rev_ll);
            std::mem::swap(&mut self.rev_lr, &mut staged.rev_lr);
            std::mem::swap(&mut self.rev_rl, &mut staged.rev_rl);
            std::mem::swap(&mut self.rev_rr, &mut staged.rev_rr);
            std::mem::swap(&mut self.ext_l, &mut staged.ext_l);
            std::mem::swap(&mut self.ext_r, &mut staged.ext_r);
            self.ir_len = staged.ir_len;
        });

        if self.ir_len == 0 || self.ir_ll.is_empty() {
            return;
        }
        let hist_len = self.ir_len - 1;
        if frames + hist_len > self.ext_l.len() {
            return;
        }

        // Append current block to the extended signal buffers
        for n in 0..frames {
            self.ext_l[hist_len + n] = buf[n * 2];
            self.ext_r[hist_len + n] = buf[n * 2 + 1];
        }

        // out[n] is the dot product of ext[n .. n+N] with the reversed IRs
        for n in 0..frames {
            let in_l = buf[n * 2];
            let in_r = buf[n * 2 + 1];

            let mut sum_l = 0.0f32;
            let mut sum_r = 0.0f32;
            for k in 0..self.ir_len {
                let xl = self.ext_l[n + k];
                let xr = self.ext_r[n + k];
                sum_l += xl * self.rev_ll[k] + xr * self.rev_rl[k];
                sum_r += xl * self.rev_lr[k] + xr * self.rev_rr[k];
            }

            let mix = self.wet.advance(want_enabled);
            buf[n * 2] = in_l * (1.0 - mix) + sum_l * mix;
            buf[n * 2 + 1] = in_r * (1.0 - mix) + sum_r * mix;
        }

        // Shift history: the last N-1 input samples move to the start
        if hist_len > 0 {
            self.ext_l.copy_within(frames..frames + hist_len, 0);
            self.ext_r.copy_within(frames..frames + hist_len, 0);
        }

        if self.wet.is_bypassed() {
            self.reset();
        }
    }
}

impl Default for HrtfProcessor {
    fn default() -> Self {
        Self::new()
    }
}
