//! Biquad filters (Audio EQ Cookbook)
//!
//! Coefficient computation for the seven filter kinds the parametric EQ
//! offers, plus the direct-form-I state the render thread cascades per
//! (band, channel). All filter arithmetic runs in f64; the render buffer
//! stays f32.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use rustfft::num_complex::Complex;

/// Number of EQ bands.
pub const MAX_BANDS: usize = 20;

/// Filter response kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterKind {
    #[default]
    Peak,
    LowShelf,
    HighShelf,
    LowPass,
    HighPass,
    Notch,
    BandPass,
}

impl FilterKind {
    /// Gain-type filters are no-ops at 0 dB.
    #[inline]
    pub fn is_gain_type(self) -> bool {
        matches!(self, Self::Peak | Self::LowShelf | Self::HighShelf)
    }
}

/// One EQ band. Two copies exist per equalizer: the *pending* set written
/// by the UI thread and the *active* set read by the render thread.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub enabled: bool,
    pub kind: FilterKind,
    /// Center/corner frequency in Hz
    pub frequency: f32,
    /// Gain in dB (-30..+30); ignored by LowPass/HighPass/Notch/BandPass
    pub gain_db: f32,
    /// Quality factor (0.1..30)
    pub q: f32,
}

impl Default for Band {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: FilterKind::Peak,
            frequency: 1000.0,
            gain_db: 0.0,
            q: std::f32::consts::FRAC_1_SQRT_2,
        }
    }
}

impl Band {
    /// A disabled band, or a gain-type band at exactly 0 dB, has no effect.
    #[inline]
    pub fn is_noop(&self) -> bool {
        !self.enabled || (self.kind.is_gain_type() && self.gain_db == 0.0)
    }
}

/// Biquad coefficients with a0 normalized out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        Self::identity()
    }
}

impl BiquadCoeffs {
    /// Unity gain, no filtering.
    pub const fn identity() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Compute cookbook coefficients for a band at the given sample rate.
    /// Out-of-range parameters are clamped rather than rejected; range
    /// validation happens on the control API.
    pub fn from_band(band: &Band, sample_rate: f64) -> Self {
        let sample_rate = if sample_rate > 0.0 { sample_rate } else { 44100.0 };
        let q = (band.q as f64).max(0.1);
        let gain_db = (band.gain_db as f64).clamp(-30.0, 30.0);
        let mut freq = band.frequency as f64;
        if freq <= 0.0 {
            freq = 1000.0;
        }
        freq = freq.min(sample_rate * 0.49);

        let a = 10.0_f64.powf(gain_db / 40.0);
        let w0 = 2.0 * PI * freq / sample_rate;
        let cos_w0 = w0.cos();
        let sin_w0 = w0.sin();
        let alpha = sin_w0 / (2.0 * q);

        let (b0, b1, b2, a0, a1, a2) = match band.kind {
            FilterKind::Peak => (
                1.0 + alpha * a,
                -2.0 * cos_w0,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_w0,
                1.0 - alpha / a,
            ),
            FilterKind::LowShelf => {
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 + two_sqrt_a_alpha),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0),
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 - two_sqrt_a_alpha),
                    (a + 1.0) + (a - 1.0) * cos_w0 + two_sqrt_a_alpha,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0),
                    (a + 1.0) + (a - 1.0) * cos_w0 - two_sqrt_a_alpha,
                )
            }
            FilterKind::HighShelf => {
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 + two_sqrt_a_alpha),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0),
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 - two_sqrt_a_alpha),
                    (a + 1.0) - (a - 1.0) * cos_w0 + two_sqrt_a_alpha,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w0),
                    (a + 1.0) - (a - 1.0) * cos_w0 - two_sqrt_a_alpha,
                )
            }
            FilterKind::LowPass => (
                (1.0 - cos_w0) / 2.0,
                1.0 - cos_w0,
                (1.0 - cos_w0) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            FilterKind::HighPass => (
                (1.0 + cos_w0) / 2.0,
                -(1.0 + cos_w0),
                (1.0 + cos_w0) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            FilterKind::Notch => (
                1.0,
                -2.0 * cos_w0,
                1.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            FilterKind::BandPass => (
                alpha,
                0.0,
                -alpha,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// |H(e^jw)| on the unit circle.
    pub fn magnitude_at(&self, w: f64) -> f64 {
        let z1 = Complex::from_polar(1.0, -w);
        let z2 = z1 * z1;
        let num = Complex::new(self.b0, 0.0) + z1 * self.b1 + z2 * self.b2;
        let den = Complex::new(1.0, 0.0) + z1 * self.a1 + z2 * self.a2;
        (num / den).norm()
    }

    /// Largest pole magnitude; < 1 for a stable filter.
    pub fn pole_radius(&self) -> f64 {
        let disc = self.a1 * self.a1 - 4.0 * self.a2;
        if disc >= 0.0 {
            let s = disc.sqrt();
            let r1 = (-self.a1 + s) / 2.0;
            let r2 = (-self.a1 - s) / 2.0;
            r1.abs().max(r2.abs())
        } else {
            // Complex conjugate pair: |z|^2 = a2
            self.a2.sqrt()
        }
    }
}

/// Direct-form-I biquad history, one per (band, channel). Cleared on
/// format change, coefficient swap and re-enable.
#[derive(Debug, Clone, Copy, Default)]
pub struct BiquadState {
    pub x1: f64,
    pub x2: f64,
    pub y1: f64,
    pub y2: f64,
}

impl BiquadState {
    /// Run one sample through the section.
    #[inline(always)]
    pub fn process_sample(&mut self, c: &BiquadCoeffs, x: f64) -> f64 {
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_passthrough() {
        let c = BiquadCoeffs::identity();
        let mut s = BiquadState::default();
        for i in 0..32 {
            let x = (i as f64 * 0.3).sin();
            assert!((s.process_sample(&c, x) - x).abs() < 1e-12);
        }
    }

    #[test]
    fn test_lowpass_passes_dc() {
        let band = Band {
            kind: FilterKind::LowPass,
            frequency: 1000.0,
            q: 0.707,
            ..Band::default()
        };
        let c = BiquadCoeffs::from_band(&band, 48000.0);
        let mut s = BiquadState::default();
        let mut y = 0.0;
        for _ in 0..2000 {
            y = s.process_sample(&c, 1.0);
        }
        assert!((y - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_highpass_blocks_dc() {
        let band = Band {
            kind: FilterKind::HighPass,
            frequency: 1000.0,
            q: 0.707,
            ..Band::default()
        };
        let c = BiquadCoeffs::from_band(&band, 48000.0);
        let mut s = BiquadState::default();
        let mut y = 1.0;
        for _ in 0..2000 {
            y = s.process_sample(&c, 1.0);
        }
        assert!(y.abs() < 0.01);
    }

    #[test]
    fn test_peak_center_gain() {
        for gain_db in [-12.0f32, -6.0, 3.0, 6.0, 12.0] {
            let band = Band {
                kind: FilterKind::Peak,
                frequency: 1000.0,
                gain_db,
                q: 1.0,
                ..Band::default()
            };
            let c = BiquadCoeffs::from_band(&band, 44100.0);
            let w0 = 2.0 * PI * 1000.0 / 44100.0;
            let mag_db = 20.0 * c.magnitude_at(w0).log10();
            assert!(
                (mag_db - gain_db as f64).abs() < 0.05,
                "center gain {mag_db} dB for requested {gain_db} dB"
            );
        }
    }

    #[test]
    fn test_poles_stable_over_parameter_ranges() {
        // Every valid (kind, frequency, gain, q) combination must place
        // all poles strictly inside the unit circle.
        let kinds = [
            FilterKind::Peak,
            FilterKind::LowShelf,
            FilterKind::HighShelf,
            FilterKind::LowPass,
            FilterKind::HighPass,
            FilterKind::Notch,
            FilterKind::BandPass,
        ];
        for sample_rate in [44100.0, 48000.0, 96000.0, 192000.0] {
            for &kind in &kinds {
                for freq in [20.0f32, 100.0, 1000.0, 10000.0, 20000.0] {
                    for gain_db in [-30.0f32, -12.0, 0.0, 12.0, 30.0] {
                        for q in [0.1f32, 0.7071, 1.0, 10.0, 30.0] {
                            let band = Band {
                                enabled: true,
                                kind,
                                frequency: freq,
                                gain_db,
                                q,
                            };
                            let c = BiquadCoeffs::from_band(&band, sample_rate);
                            let r = c.pole_radius();
                            assert!(
                                r < 1.0,
                                "unstable: {kind:?} f={freq} g={gain_db} q={q} fs={sample_rate} r={r}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_frequency_clamped_to_nyquist() {
        let band = Band {
            frequency: 30000.0,
            gain_db: 6.0,
            ..Band::default()
        };
        let c = BiquadCoeffs::from_band(&band, 44100.0);
        assert!(c.pole_radius() < 1.0);
        assert!(c.b0.is_finite() && c.a2.is_finite());
    }

    #[test]
    fn test_noop_detection() {
        let mut band = Band::default();
        assert!(band.is_noop());
        band.gain_db = 3.0;
        assert!(!band.is_noop());
        band.enabled = false;
        assert!(band.is_noop());

        let cut = Band {
            kind: FilterKind::LowPass,
            gain_db: 0.0,
            ..Band::default()
        };
        assert!(!cut.is_noop());
    }
}
