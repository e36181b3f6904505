//! Headphone crossfeed (bs2b-style)
//!
//! Fixed two-band mixer that feeds a low-passed, slightly delayed copy of
//! each channel into the other, simulating loudspeaker inter-aural bleed
//! on headphones. Direct and crossfeed gains are normalized so that
//! `direct + crossfeed = 1`, which keeps correlated mono content below
//! full scale.
//!
//! Stereo only. The delay buffer is pre-filled on enable before the
//! wet-mix fade starts, so the crossfeed path never ramps in from stale
//! samples.

use au_core::Sample;
use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::fade::WetMixFade;

/// Crossfeed strength presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossfeedLevel {
    /// -6 dB crossfeed, 700 Hz cutoff
    Light = 0,
    /// -4.5 dB crossfeed, 700 Hz cutoff (bs2b default)
    #[default]
    Medium = 1,
    /// -3 dB crossfeed, 650 Hz cutoff
    Strong = 2,
}

impl CrossfeedLevel {
    pub fn from_index(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Light),
            1 => Some(Self::Medium),
            2 => Some(Self::Strong),
            _ => None,
        }
    }

    fn crossfeed_db(self) -> f32 {
        match self {
            Self::Light => -6.0,
            Self::Medium => -4.5,
            Self::Strong => -3.0,
        }
    }

    fn cutoff_hz(self) -> f32 {
        match self {
            Self::Light | Self::Medium => 700.0,
            Self::Strong => 650.0,
        }
    }
}

const MAX_DELAY: usize = 64;

/// Interaural delay of the crossfeed path.
const DELAY_SECONDS: f32 = 0.0003;

struct CrossfeedShared {
    enabled: AtomicBool,
    /// -1 = no change pending
    pending_level: AtomicI32,
    /// Control-side readback of the requested level
    level: AtomicI32,
    needs_state_reset: AtomicBool,
}

/// Control-thread handle.
#[derive(Clone)]
pub struct CrossfeedControl {
    shared: Arc<CrossfeedShared>,
}

impl CrossfeedControl {
    pub fn set_enabled(&self, enabled: bool) {
        if enabled && !self.shared.enabled.load(Ordering::Relaxed) {
            self.shared.needs_state_reset.store(true, Ordering::Relaxed);
        }
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, level: CrossfeedLevel) {
        self.shared.level.store(level as i32, Ordering::Relaxed);
        self.shared.pending_level.store(level as i32, Ordering::Relaxed);
    }

    pub fn level(&self) -> CrossfeedLevel {
        CrossfeedLevel::from_index(self.shared.level.load(Ordering::Relaxed))
            .unwrap_or_default()
    }
}

/// Render-side crossfeed processor.
pub struct CrossfeedProcessor {
    shared: Arc<CrossfeedShared>,

    // Active parameters, render thread only
    level: CrossfeedLevel,
    sample_rate: f64,

    // Derived coefficients
    crossfeed_gain: f32,
    direct_gain: f32,
    lp_coeff: f32,
    delay_len: usize,

    // Render state
    wet: WetMixFade,
    lp_state_l: f32,
    lp_state_r: f32,
    delay_l: [f32; MAX_DELAY],
    delay_r: [f32; MAX_DELAY],
    delay_idx: usize,
    /// Frames left to pre-fill the delay before fade-in starts
    prefill: usize,
}

impl CrossfeedProcessor {
    pub fn new() -> Self {
        let mut proc = Self {
            shared: Arc::new(CrossfeedShared {
                enabled: AtomicBool::new(false),
                pending_level: AtomicI32::new(-1),
                level: AtomicI32::new(CrossfeedLevel::Medium as i32),
                needs_state_reset: AtomicBool::new(true),
            }),
            level: CrossfeedLevel::Medium,
            sample_rate: 44100.0,
            crossfeed_gain: 0.0,
            direct_gain: 1.0,
            lp_coeff: 0.0,
            delay_len: 1,
            wet: WetMixFade::new(),
            lp_state_l: 0.0,
            lp_state_r: 0.0,
            delay_l: [0.0; MAX_DELAY],
            delay_r: [0.0; MAX_DELAY],
            delay_idx: 0,
            prefill: 0,
        };
        proc.recalculate();
        proc
    }

    pub fn control(&self) -> CrossfeedControl {
        CrossfeedControl {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Called while audio is stopped.
    pub fn prepare(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.recalculate();
        self.reset();
    }

    pub fn reset(&mut self) {
        self.clear_state();
        self.wet.reset();
    }

    fn clear_state(&mut self) {
        self.lp_state_l = 0.0;
        self.lp_state_r = 0.0;
        self.delay_l = [0.0; MAX_DELAY];
        self.delay_r = [0.0; MAX_DELAY];
        self.delay_idx = 0;
    }

    fn recalculate(&mut self) {
        let raw_crossfeed = 10.0f32.powf(self.level.crossfeed_db() / 20.0);

        // direct + crossfeed = 1, preserving the ratio
        self.direct_gain = 1.0 / (1.0 + raw_crossfeed);
        self.crossfeed_gain = raw_crossfeed / (1.0 + raw_crossfeed);

        // 1-pole low-pass: a = exp(-2*pi*fc/fs)
        let w = 2.0 * PI * self.level.cutoff_hz() / self.sample_rate as f32;
        self.lp_coeff = (-w).exp();

        let delay = (DELAY_SECONDS * self.sample_rate as f32 + 0.5) as usize;
        self.delay_len = delay.clamp(1, MAX_DELAY - 1);
    }

    pub fn process(&mut self, buf: &mut [Sample], frames: usize, channels: usize) {
        if channels != 2 {
            return;
        }

        let want_enabled = self.shared.enabled.load(Ordering::Relaxed);
        if !want_enabled && self.wet.is_bypassed() {
            return;
        }

        if self.shared.needs_state_reset.swap(false, Ordering::Relaxed) {
            self.clear_state();
            self.wet.reset();
            self.prefill = self.delay_len;
        }

        // Apply pending level change; coefficients move smoothly, no
        // state reset needed
        let pending = self.shared.pending_level.swap(-1, Ordering::Relaxed);
        if let Some(level) = CrossfeedLevel::from_index(pending) {
            self.level = level;
            self.recalculate();
        }

        for f in 0..frames {
            let l = buf[f * 2];
            let r = buf[f * 2 + 1];

            // Pre-fill: run the filter and delay, output stays dry
            if self.prefill > 0 {
                self.lp_state_l = l * (1.0 - self.lp_coeff) + self.lp_state_l * self.lp_coeff;
                self.lp_state_r = r * (1.0 - self.lp_coeff) + self.lp_state_r * self.lp_coeff;
                self.delay_l[self.delay_idx] = self.lp_state_l;
                self.delay_r[self.delay_idx] = self.lp_state_r;
                self.delay_idx = (self.delay_idx + 1) % MAX_DELAY;
                self.prefill -= 1;
                continue;
            }

            let mix = self.wet.advance(want_enabled);

            self.lp_state_l = l * (1.0 - self.lp_coeff) + self.lp_state_l * self.lp_coeff;
            self.lp_state_r = r * (1.0 - self.lp_coeff) + self.lp_state_r * self.lp_coeff;

            let read_idx = (self.delay_idx + MAX_DELAY - self.delay_len) % MAX_DELAY;
            let delayed_l = self.delay_l[read_idx];
            let delayed_r = self.delay_r[read_idx];

            self.delay_l[self.delay_idx] = self.lp_state_l;
            self.delay_r[self.delay_idx] = self.lp_state_r;
            self.delay_idx = (self.delay_idx + 1) % MAX_DELAY;

            let wet_l = l * self.direct_gain + delayed_r * self.crossfeed_gain;
            let wet_r = r * self.direct_gain + delayed_l * self.crossfeed_gain;

            buf[f * 2] = l * (1.0 - mix) + wet_l * mix;
            buf[f * 2 + 1] = r * (1.0 - mix) + wet_r * mix;
        }

        // Fully faded out: clear state for a clean restart
        if self.wet.is_bypassed() {
            self.clear_state();
        }
    }
}

impl Default for CrossfeedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_stereo(frames: usize, freq: f32, sample_rate: f32, offset: usize) -> Vec<f32> {
        let mut buf = vec![0.0f32; frames * 2];
        for f in 0..frames {
            let t = (offset + f) as f32 / sample_rate;
            let s = 0.5 * (2.0 * PI * freq * t).sin();
            buf[f * 2] = s;
            buf[f * 2 + 1] = s;
        }
        buf
    }

    #[test]
    fn test_disabled_is_bit_exact_passthrough() {
        let mut cf = CrossfeedProcessor::new();
        cf.prepare(44100.0);
        let original = sine_stereo(512, 1000.0, 44100.0, 0);
        let mut buf = original.clone();
        cf.process(&mut buf, 512, 2);
        assert_eq!(buf, original);
    }

    #[test]
    fn test_enable_fades_in_and_mixes() {
        let mut cf = CrossfeedProcessor::new();
        cf.prepare(44100.0);
        cf.control().set_enabled(true);

        // Run well past the prefill + 2000-sample fade
        let mut offset = 0;
        for _ in 0..8 {
            let mut buf = sine_stereo(512, 200.0, 44100.0, offset);
            cf.process(&mut buf, 512, 2);
            offset += 512;
        }

        // At full wet with correlated input, output stays below full scale
        // (direct + crossfeed = 1) but is clearly crossfed
        let mut buf = sine_stereo(512, 200.0, 44100.0, offset);
        let dry = buf.clone();
        cf.process(&mut buf, 512, 2);
        assert!(buf.iter().any(|&s| s != 0.0));
        assert!(buf.iter().all(|&s| s.abs() <= 0.5 + 1e-4));
        assert!(buf != dry);
    }

    #[test]
    fn test_mono_content_never_clips() {
        let mut cf = CrossfeedProcessor::new();
        cf.prepare(48000.0);
        cf.control().set_enabled(true);
        cf.control().set_level(CrossfeedLevel::Strong);

        for block in 0..20 {
            let mut buf = vec![if block % 2 == 0 { 1.0f32 } else { -1.0 }; 512 * 2];
            cf.process(&mut buf, 512, 2);
            assert!(buf.iter().all(|&s| s.abs() <= 1.0 + 1e-4));
        }
    }

    #[test]
    fn test_disable_returns_to_fresh_state() {
        // Enable, fade fully in, disable, fade fully out: the processor
        // then behaves identically to a freshly constructed one.
        let mut cf = CrossfeedProcessor::new();
        cf.prepare(44100.0);
        let ctl = cf.control();

        ctl.set_enabled(true);
        let mut offset = 0;
        for _ in 0..8 {
            let mut buf = sine_stereo(512, 300.0, 44100.0, offset);
            cf.process(&mut buf, 512, 2);
            offset += 512;
        }
        ctl.set_enabled(false);
        for _ in 0..8 {
            let mut buf = sine_stereo(512, 300.0, 44100.0, offset);
            cf.process(&mut buf, 512, 2);
            offset += 512;
        }

        assert!(cf.wet.is_bypassed());
        assert_eq!(cf.lp_state_l, 0.0);
        assert_eq!(cf.lp_state_r, 0.0);
        assert!(cf.delay_l.iter().all(|&s| s == 0.0));
        assert!(cf.delay_r.iter().all(|&s| s == 0.0));
        assert_eq!(cf.delay_idx, 0);

        // And passes through bit-exact again
        let original = sine_stereo(256, 300.0, 44100.0, offset);
        let mut buf = original.clone();
        cf.process(&mut buf, 256, 2);
        assert_eq!(buf, original);
    }

    #[test]
    fn test_level_change_keeps_running() {
        let mut cf = CrossfeedProcessor::new();
        cf.prepare(44100.0);
        let ctl = cf.control();
        ctl.set_enabled(true);

        let mut offset = 0;
        for block in 0..10 {
            if block == 5 {
                ctl.set_level(CrossfeedLevel::Light);
            }
            let mut buf = sine_stereo(512, 440.0, 44100.0, offset);
            cf.process(&mut buf, 512, 2);
            offset += 512;
            assert!(buf.iter().all(|s| s.is_finite()));
        }
        assert_eq!(ctl.level(), CrossfeedLevel::Light);
    }

    #[test]
    fn test_non_stereo_untouched() {
        let mut cf = CrossfeedProcessor::new();
        cf.prepare(44100.0);
        cf.control().set_enabled(true);
        let original = vec![0.3f32; 128 * 6];
        let mut buf = original.clone();
        cf.process(&mut buf, 128, 6);
        assert_eq!(buf, original);
    }
}
