//! Headroom / preamp gain
//!
//! Scalar multiply with a per-buffer linear ramp to prevent clicks on
//! gain changes. The dB value is converted to linear on the control side;
//! the render thread only reads an atomic target and ramps toward it, so
//! the ramp lands exactly on the target at the first sample of the next
//! buffer.

use au_core::{DspParameter, Sample, db_to_linear};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Gain range in dB.
pub const GAIN_DB_MIN: f32 = -24.0;
pub const GAIN_DB_MAX: f32 = 24.0;

struct GainShared {
    enabled: AtomicBool,
    gain_db: AtomicU32,
    linear_gain: AtomicU32,
}

/// Control-thread handle. Cloneable; all methods are thread-safe.
#[derive(Clone)]
pub struct GainControl {
    shared: Arc<GainShared>,
}

impl GainControl {
    /// Set gain in dB (clamped to -24..+24).
    pub fn set_gain_db(&self, db: f32) {
        let db = db.clamp(GAIN_DB_MIN, GAIN_DB_MAX);
        self.shared.gain_db.store(db.to_bits(), Ordering::Relaxed);
        self.shared
            .linear_gain
            .store(db_to_linear(db).to_bits(), Ordering::Relaxed);
    }

    pub fn gain_db(&self) -> f32 {
        f32::from_bits(self.shared.gain_db.load(Ordering::Relaxed))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    pub fn parameters(&self) -> Vec<DspParameter> {
        vec![DspParameter {
            name: "Gain".into(),
            value: self.gain_db(),
            min: GAIN_DB_MIN,
            max: GAIN_DB_MAX,
            default: 0.0,
            unit: "dB".into(),
        }]
    }
}

/// Render-side gain processor. `process` runs on the audio thread.
pub struct GainProcessor {
    shared: Arc<GainShared>,
    /// Gain the previous buffer landed on; render-thread only.
    prev_gain: f32,
}

impl GainProcessor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(GainShared {
                enabled: AtomicBool::new(true),
                gain_db: AtomicU32::new(0.0f32.to_bits()),
                linear_gain: AtomicU32::new(1.0f32.to_bits()),
            }),
            prev_gain: 1.0,
        }
    }

    pub fn control(&self) -> GainControl {
        GainControl {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn reset(&mut self) {
        self.prev_gain = 1.0;
    }

    pub fn process(&mut self, buf: &mut [Sample], frames: usize, channels: usize) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }
        let target = f32::from_bits(self.shared.linear_gain.load(Ordering::Relaxed));
        let prev = self.prev_gain;
        if target == 1.0 && prev == 1.0 {
            return;
        }

        if prev != target && frames > 0 {
            // Linear ramp stopping one step short; the next buffer's flat
            // multiply is the first to apply the target exactly
            let step = (target - prev) / frames as f32;
            for f in 0..frames {
                let g = prev + step * f as f32;
                for c in 0..channels {
                    buf[f * channels + c] *= g;
                }
            }
        } else {
            for s in buf[..frames * channels].iter_mut() {
                *s *= target;
            }
        }
        self.prev_gain = target;
    }
}

impl Default for GainProcessor {
    fn default() -> Self {
        Self::new()
    }
}
