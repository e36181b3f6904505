//! 20-band parametric equalizer
//!
//! Two phase modes over one magnitude response:
//!
//! - **Minimum phase**: every active band cascaded as a second-order IIR
//!   section, double precision per (band, channel).
//! - **Linear phase**: the same magnitude, sampled on a uniform bin grid
//!   and turned into a zero-phase symmetric FIR (inverse real FFT,
//!   circular shift to center, Blackman-Harris window), applied with the
//!   partitioned overlap-add engine.
//!
//! Band edits land in a pending set under a lock the render thread only
//! try-acquires; in linear-phase mode the FIR kernel is rebuilt on the
//! control thread and staged for adoption. Kernel adoption warms up the
//! alternate OLA slot against the same input and promotes it with a short
//! equal-power crossfade, so kernel changes never glitch. Phase-mode
//! switches run a fade-out / mute / fade-in envelope sized to the FIR
//! warm-up time.

use au_core::{EngineError, MAX_CHANNELS, Sample};
use log::debug;
use parking_lot::Mutex;
use realfft::{ComplexToReal, RealFftPlanner};
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use crate::biquad::{Band, BiquadCoeffs, BiquadState, MAX_BANDS};
use crate::fade::{LP_FADE_LEN, RAMP_FADE_LEN, equal_power_gains, fade_out_gain, warmup_gain};
use crate::partition::{CONV_BINS, ConvFft, KernelPartitions, OlaChannel, PARTITION_SIZE};
use crate::staged::Published;

const DEFAULT_ACTIVE_BANDS: usize = 10;

/// Enable/disable crossfade step (full ramp in 256 samples).
const ENABLE_FADE_STEP: f32 = 1.0 / RAMP_FADE_LEN as f32;

/// Phase mode of the equalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PhaseMode {
    #[default]
    MinimumPhase = 0,
    LinearPhase = 1,
}

impl PhaseMode {
    fn from_index(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::MinimumPhase),
            1 => Some(Self::LinearPhase),
            _ => None,
        }
    }
}

/// FIR length for the linear-phase kernel at a given sample rate.
fn fir_len_for_rate(sample_rate: f64) -> usize {
    if sample_rate <= 50_000.0 {
        4096
    } else if sample_rate <= 100_000.0 {
        8192
    } else {
        16384
    }
}

fn next_pow2(n: usize) -> usize {
    let mut p = 1;
    while p < n {
        p <<= 1;
    }
    p
}

/// Pending parameter set: written by the UI under the lock, snapshotted
/// whole by the render thread. Pending and active always have the same
/// shape; only the values change.
struct PendingBands {
    bands: [Band; MAX_BANDS],
    coeffs: [BiquadCoeffs; MAX_BANDS],
    active: usize,
    sample_rate: f64,
}

impl PendingBands {
    fn recompute_coeffs(&mut self) {
        for i in 0..MAX_BANDS {
            self.coeffs[i] = BiquadCoeffs::from_band(&self.bands[i], self.sample_rate);
        }
    }
}

/// Control-thread FIR kernel builder: magnitude sampling on the build
/// grid, inverse real FFT, circular shift, window, partition FFTs.
struct KernelBuilder {
    fir_len: usize,
    build_fft_size: usize,
    inverse: Option<std::sync::Arc<dyn ComplexToReal<f32>>>,
    scratch: Vec<Complex<f32>>,
    spectrum: Vec<Complex<f32>>,
    time_buf: Vec<f32>,
    kernel_time: Vec<f32>,
    conv_fft: ConvFft,
}

impl KernelBuilder {
    fn new() -> Self {
        Self {
            fir_len: 0,
            build_fft_size: 0,
            inverse: None,
            scratch: Vec::new(),
            spectrum: Vec::new(),
            time_buf: Vec::new(),
            kernel_time: Vec::new(),
            conv_fft: ConvFft::new(),
        }
    }

    fn configure(&mut self, sample_rate: f64) {
        self.fir_len = fir_len_for_rate(sample_rate);
        self.build_fft_size = next_pow2(self.fir_len);
        let mut planner = RealFftPlanner::<f32>::new();
        let inverse = planner.plan_fft_inverse(self.build_fft_size);
        self.scratch = vec![Complex::new(0.0, 0.0); inverse.get_scratch_len()];
        self.spectrum = vec![Complex::new(0.0, 0.0); self.build_fft_size / 2 + 1];
        self.time_buf = vec![0.0; self.build_fft_size];
        self.kernel_time = vec![0.0; self.fir_len];
        self.inverse = Some(inverse);
    }

    fn num_partitions(&self) -> usize {
        self.fir_len.div_ceil(PARTITION_SIZE).max(1)
    }

    /// Build the partitioned frequency-domain kernel for a band snapshot.
    fn build(&mut self, bands: &[Band; MAX_BANDS], coeffs: &[BiquadCoeffs; MAX_BANDS], active: usize) -> KernelPartitions {
        let build_size = self.build_fft_size;
        let build_half = build_size / 2;

        // Combined magnitude at each build bin, zero phase
        for k in 0..=build_half {
            let w = 2.0 * std::f64::consts::PI * k as f64 / build_size as f64;
            let mut mag = 1.0f64;
            for band in 0..active.min(MAX_BANDS) {
                if bands[band].is_noop() {
                    continue;
                }
                mag *= coeffs[band].magnitude_at(w);
            }
            self.spectrum[k] = Complex::new(mag as f32, 0.0);
        }

        // Inverse real FFT -> zero-phase impulse centred on sample 0
        if let Some(inverse) = &self.inverse {
            inverse
                .process_with_scratch(&mut self.spectrum, &mut self.time_buf, &mut self.scratch)
                .ok();
        }
        let scale = 1.0 / build_size as f32;
        for s in &mut self.time_buf {
            *s *= scale;
        }

        // Circular shift so the peak sits at fir_len / 2 (causal,
        // symmetric -> linear phase)
        let half_fir = self.fir_len / 2;
        for i in 0..half_fir {
            self.kernel_time[i] = self.time_buf[build_size - half_fir + i];
            self.kernel_time[half_fir + i] = self.time_buf[i];
        }

        // Blackman-Harris window
        for (n, s) in self.kernel_time.iter_mut().enumerate() {
            let t = n as f64 / (self.fir_len - 1) as f64;
            let w = 0.35875 - 0.48829 * (2.0 * std::f64::consts::PI * t).cos()
                + 0.14128 * (4.0 * std::f64::consts::PI * t).cos()
                - 0.01168 * (6.0 * std::f64::consts::PI * t).cos();
            *s *= w as f32;
        }

        KernelPartitions::from_time_domain(&self.kernel_time, &mut self.conv_fft)
    }
}

/// Serialized equalizer state.
#[derive(Serialize, Deserialize)]
struct EqState {
    bands: Vec<Band>,
    active_bands: usize,
    phase_mode: PhaseMode,
}

struct EqShared {
    enabled: AtomicBool,
    pending: Mutex<PendingBands>,
    bands_dirty: AtomicBool,
    /// -1 = no pending switch
    pending_phase_mode: AtomicI32,
    /// Control-side view of the requested mode
    requested_mode: AtomicI32,
    staged_kernel: Published<KernelPartitions>,
    builder: Mutex<KernelBuilder>,
    defer_builds: AtomicBool,
    fir_len: AtomicUsize,
}

/// Control-thread handle to the equalizer.
#[derive(Clone)]
pub struct EqControl {
    shared: Arc<EqShared>,
}

impl EqControl {
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    /// Replace one band. Parameter values are clamped to their legal
    /// ranges; an out-of-range index is an error.
    pub fn set_band(&self, index: usize, band: Band) -> Result<(), EngineError> {
        if index >= MAX_BANDS {
            return Err(EngineError::BandOutOfRange(index));
        }
        {
            let mut pending = self.shared.pending.lock();
            let sample_rate = pending.sample_rate;
            pending.bands[index] = band;
            pending.coeffs[index] = BiquadCoeffs::from_band(&band, sample_rate);
        }
        self.shared.bands_dirty.store(true, Ordering::Release);
        self.rebuild_after_edit();
        Ok(())
    }

    pub fn band(&self, index: usize) -> Result<Band, EngineError> {
        if index >= MAX_BANDS {
            return Err(EngineError::BandOutOfRange(index));
        }
        Ok(self.shared.pending.lock().bands[index])
    }

    pub fn set_active_bands(&self, count: usize) -> Result<(), EngineError> {
        if count == 0 || count > MAX_BANDS {
            return Err(EngineError::InvalidParameter(format!(
                "active band count {count} (supported: 1..={MAX_BANDS})"
            )));
        }
        self.shared.pending.lock().active = count;
        self.shared.bands_dirty.store(true, Ordering::Release);
        self.rebuild_after_edit();
        Ok(())
    }

    pub fn active_bands(&self) -> usize {
        self.shared.pending.lock().active
    }

    /// Defer kernel rebuilds until `end_batch_update`.
    pub fn begin_batch_update(&self) {
        self.shared.defer_builds.store(true, Ordering::Relaxed);
    }

    pub fn end_batch_update(&self) {
        self.shared.defer_builds.store(false, Ordering::Relaxed);
        self.rebuild_after_edit();
    }

    /// Request a phase-mode switch. The render thread runs the fade-out /
    /// warm-up / fade-in transition at the next buffer.
    pub fn set_phase_mode(&self, mode: PhaseMode) {
        let prev = self.shared.requested_mode.swap(mode as i32, Ordering::Relaxed);
        if prev == mode as i32 {
            return;
        }
        if mode == PhaseMode::LinearPhase {
            self.build_kernel_staged();
        }
        self.shared.pending_phase_mode.store(mode as i32, Ordering::Release);
        debug!("equalizer: phase mode switch to {mode:?} requested");
    }

    pub fn phase_mode(&self) -> PhaseMode {
        PhaseMode::from_index(self.shared.requested_mode.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    /// Latency the current mode introduces, for downstream A/V sync.
    pub fn latency_samples(&self) -> usize {
        let fir_len = self.shared.fir_len.load(Ordering::Relaxed);
        if self.phase_mode() == PhaseMode::LinearPhase && fir_len > 0 {
            PARTITION_SIZE + fir_len / 2
        } else {
            0
        }
    }

    /// dB magnitude of the pending response at `num_points` log-spaced
    /// frequencies from 20 Hz to 20 kHz, for graph rendering.
    pub fn frequency_response(&self, num_points: usize) -> Vec<f64> {
        let mut response = vec![0.0; num_points];
        if num_points < 2 {
            return response;
        }
        let pending = self.shared.pending.lock();
        let log_min = 20.0f64.log10();
        let log_max = 20_000.0f64.log10();
        for (i, out) in response.iter_mut().enumerate() {
            let freq =
                10.0f64.powf(log_min + (log_max - log_min) * i as f64 / (num_points - 1) as f64);
            let w = 2.0 * std::f64::consts::PI * freq / pending.sample_rate;
            let mut total_db = 0.0;
            for band in 0..pending.active {
                if pending.bands[band].is_noop() {
                    continue;
                }
                let mag = pending.coeffs[band].magnitude_at(w);
                if mag > 0.0 {
                    total_db += 20.0 * mag.log10();
                }
            }
            *out = total_db;
        }
        response
    }

    /// Serialize bands, active count and phase mode.
    pub fn save_state(&self) -> Vec<u8> {
        let pending = self.shared.pending.lock();
        let state = EqState {
            bands: pending.bands.to_vec(),
            active_bands: pending.active,
            phase_mode: self.phase_mode(),
        };
        drop(pending);
        serde_json::to_vec(&state).unwrap_or_default()
    }

    pub fn restore_state(&self, blob: &[u8]) -> bool {
        let Ok(state) = serde_json::from_slice::<EqState>(blob) else {
            return false;
        };
        if state.active_bands == 0 || state.active_bands > MAX_BANDS {
            return false;
        }
        self.begin_batch_update();
        {
            let mut pending = self.shared.pending.lock();
            for (i, band) in state.bands.iter().take(MAX_BANDS).enumerate() {
                pending.bands[i] = *band;
            }
            pending.active = state.active_bands;
            pending.recompute_coeffs();
        }
        self.shared.bands_dirty.store(true, Ordering::Release);
        self.end_batch_update();
        self.set_phase_mode(state.phase_mode);
        true
    }

    fn rebuild_after_edit(&self) {
        if self.shared.defer_builds.load(Ordering::Relaxed) {
            return;
        }
        if self.phase_mode() == PhaseMode::LinearPhase {
            self.build_kernel_staged();
        }
    }

    /// Build the FIR kernel from the pending bands and stage it for the
    /// render thread. No-op before `prepare` has configured the builder.
    fn build_kernel_staged(&self) {
        let (bands, coeffs, active) = {
            let pending = self.shared.pending.lock();
            (pending.bands, pending.coeffs, pending.active)
        };
        let mut builder = self.shared.builder.lock();
        if builder.fir_len == 0 {
            return;
        }
        let parts = builder.build(&bands, &coeffs, active);
        drop(builder);
        self.shared.staged_kernel.publish_with(|slot| *slot = parts);
    }
}

/// One double-buffered overlap-add instance with its own kernel.
struct OlaSlot {
    channels: Vec<OlaChannel>,
    kernel: KernelPartitions,
    phase: usize,
    fdl_idx: usize,
    has_output: bool,
    /// Complete partitions since warm-up start
    partitions_processed: usize,
}

impl OlaSlot {
    fn new(num_partitions: usize, channels: usize) -> Self {
        Self {
            channels: (0..channels).map(|_| OlaChannel::new(num_partitions)).collect(),
            kernel: KernelPartitions::zeroed(num_partitions),
            phase: 0,
            fdl_idx: 0,
            has_output: false,
            partitions_processed: 0,
        }
    }

    /// Full reset: all buffers, FDL, counters.
    fn reset(&mut self) {
        for ch in &mut self.channels {
            ch.reset();
        }
        self.phase = 0;
        self.fdl_idx = 0;
        self.has_output = false;
        self.partitions_processed = 0;
    }

    /// Restart warm-up after a kernel replacement mid-warm-up: clear the
    /// FDL and overlap tails, keep the block phase running.
    fn restart_warmup(&mut self) {
        for ch in &mut self.channels {
            ch.reset();
        }
        self.has_output = false;
        self.partitions_processed = 0;
    }
}

/// Linear-phase processing state: two OLA slots plus shared FFT scratch.
/// Fully provisioned at `prepare` so a later mode switch allocates
/// nothing on the render thread.
struct LpEngine {
    fir_len: usize,
    num_partitions: usize,
    slots: [OlaSlot; 2],
    cur: usize,
    /// Index of the warming slot, if a kernel change is in flight
    next: Option<usize>,
    crossfading: bool,
    xfade_pos: usize,
    fft: ConvFft,
    accum: Vec<Complex<f32>>,
    /// Input copy feeding both slots
    dry_buf: Vec<f32>,
    /// Warming slot's output during dual processing
    next_buf: Vec<f32>,
}

impl LpEngine {
    fn empty() -> Self {
        Self {
            fir_len: 0,
            num_partitions: 0,
            slots: [OlaSlot::new(1, 0), OlaSlot::new(1, 0)],
            cur: 0,
            next: None,
            crossfading: false,
            xfade_pos: 0,
            fft: ConvFft::new(),
            accum: vec![Complex::new(0.0, 0.0); CONV_BINS],
            dry_buf: Vec::new(),
            next_buf: Vec::new(),
        }
    }

    fn allocate(&mut self, fir_len: usize, channels: usize, max_samples: usize) {
        self.fir_len = fir_len;
        self.num_partitions = fir_len.div_ceil(PARTITION_SIZE).max(1);
        self.slots = [
            OlaSlot::new(self.num_partitions, channels),
            OlaSlot::new(self.num_partitions, channels),
        ];
        self.dry_buf = vec![0.0; max_samples];
        self.next_buf = vec![0.0; max_samples];
        self.reset();
    }

    fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.cur = 0;
        self.next = None;
        self.crossfading = false;
        self.xfade_pos = 0;
    }
}

/// What the transition state machine is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Idle,
    FadeOut { pos: usize },
    Warmup { pos: usize, total: usize },
}

/// Render-side equalizer.
pub struct EqualizerProcessor {
    shared: Arc<EqShared>,

    // Active parameters (render thread only)
    bands: [Band; MAX_BANDS],
    coeffs: [BiquadCoeffs; MAX_BANDS],
    active_bands: usize,
    phase_mode: PhaseMode,

    // Per-(band, channel) biquad history
    state: Box<[[BiquadState; MAX_CHANNELS]; MAX_BANDS]>,

    // Phase-mode transition
    transition: Transition,
    transition_target: PhaseMode,

    // Coefficient crossfade (masks the biquad state restart)
    coeff_fade_pos: Option<usize>,
    coeff_fade_buf: Vec<f32>,

    // Enable/disable crossfade
    enable_mix: f32,
    enable_fade_buf: Vec<f32>,

    lp: LpEngine,

    channels: usize,
    sample_rate: f64,
}

fn default_bands() -> [Band; MAX_BANDS] {
    // Logarithmically spaced from 20 Hz to 20 kHz
    let mut bands = [Band::default(); MAX_BANDS];
    let log_min = 20.0f64.log10();
    let log_max = 20_000.0f64.log10();
    for (i, band) in bands.iter_mut().enumerate() {
        let log_freq = log_min + (log_max - log_min) * i as f64 / (MAX_BANDS - 1) as f64;
        band.frequency = 10.0f64.powf(log_freq) as f32;
        band.q = 1.0;
    }
    bands
}

impl EqualizerProcessor {
    pub fn new() -> Self {
        let bands = default_bands();
        let sample_rate = 44100.0;
        let mut pending = PendingBands {
            bands,
            coeffs: [BiquadCoeffs::identity(); MAX_BANDS],
            active: DEFAULT_ACTIVE_BANDS,
            sample_rate,
        };
        pending.recompute_coeffs();
        let coeffs = pending.coeffs;

        Self {
            shared: Arc::new(EqShared {
                enabled: AtomicBool::new(true),
                pending: Mutex::new(pending),
                bands_dirty: AtomicBool::new(false),
                pending_phase_mode: AtomicI32::new(-1),
                requested_mode: AtomicI32::new(PhaseMode::MinimumPhase as i32),
                staged_kernel: Published::new(KernelPartitions::zeroed(1)),
                builder: Mutex::new(KernelBuilder::new()),
                defer_builds: AtomicBool::new(false),
                fir_len: AtomicUsize::new(0),
            }),
            bands,
            coeffs,
            active_bands: DEFAULT_ACTIVE_BANDS,
            phase_mode: PhaseMode::MinimumPhase,
            state: Box::new([[BiquadState::default(); MAX_CHANNELS]; MAX_BANDS]),
            transition: Transition::Idle,
            transition_target: PhaseMode::MinimumPhase,
            coeff_fade_pos: None,
            coeff_fade_buf: Vec::new(),
            enable_mix: 1.0,
            enable_fade_buf: Vec::new(),
            lp: LpEngine::empty(),
            channels: 2,
            sample_rate,
        }
    }

    pub fn control(&self) -> EqControl {
        EqControl {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Called while audio is stopped: rebuilds coefficients, provisions
    /// both OLA slots and every fade scratch buffer for the format.
    pub fn prepare(&mut self, sample_rate: f64, channels: usize, max_block_size: usize) {
        self.sample_rate = sample_rate;
        self.channels = channels.min(MAX_CHANNELS);

        {
            let mut pending = self.shared.pending.lock();
            pending.sample_rate = sample_rate;
            pending.recompute_coeffs();
            self.bands = pending.bands;
            self.coeffs = pending.coeffs;
            self.active_bands = pending.active;
        }
        self.shared.bands_dirty.store(false, Ordering::Relaxed);
        self.shared.pending_phase_mode.store(-1, Ordering::Relaxed);

        let max_samples = max_block_size * self.channels;
        self.enable_fade_buf = vec![0.0; max_samples];
        self.coeff_fade_buf = vec![0.0; max_samples];
        self.coeff_fade_pos = None;
        self.enable_mix = 1.0;

        // Provision linear-phase resources regardless of the current mode
        // so a later switch needs no render-side allocation
        let fir_len = fir_len_for_rate(sample_rate);
        self.shared.fir_len.store(fir_len, Ordering::Relaxed);
        self.shared.builder.lock().configure(sample_rate);
        self.lp.allocate(fir_len, self.channels, max_samples);

        // Adopt the requested mode directly; no transition while stopped
        self.phase_mode = self.control().phase_mode();
        self.transition = Transition::Idle;

        self.reset();

        if self.phase_mode == PhaseMode::LinearPhase {
            self.control().build_kernel_staged();
        }
        debug!(
            "equalizer: prepared for {sample_rate} Hz, {} channels, FIR {fir_len}",
            self.channels
        );
    }

    /// Zero all filter histories.
    pub fn reset(&mut self) {
        self.clear_biquad_state();
        self.lp.reset();
    }

    fn clear_biquad_state(&mut self) {
        for band_states in self.state.iter_mut() {
            for s in band_states.iter_mut() {
                *s = BiquadState::default();
            }
        }
    }

    pub fn process(&mut self, buf: &mut [Sample], frames: usize, channels: usize) {
        let enabled = self.shared.enabled.load(Ordering::Relaxed);
        let fading =
            (enabled && self.enable_mix < 1.0) || (!enabled && self.enable_mix > 0.0);
        if !enabled && !fading {
            return;
        }

        let n = frames * channels;
        let need_blend = fading && self.enable_fade_buf.len() >= n;
        if need_blend {
            self.enable_fade_buf[..n].copy_from_slice(&buf[..n]);
        }

        self.apply_pending_bands(buf, n);

        // Start a phase-mode transition only when idle
        if self.transition == Transition::Idle {
            let pending = self.shared.pending_phase_mode.swap(-1, Ordering::Acquire);
            if let Some(target) = PhaseMode::from_index(pending) {
                if target != self.phase_mode {
                    self.transition_target = target;
                    self.transition = Transition::FadeOut { pos: 0 };
                }
            }
        }

        match self.transition {
            Transition::FadeOut { pos } => {
                self.process_current_mode(buf, frames, channels);
                for i in 0..frames {
                    let g = fade_out_gain(pos + i, RAMP_FADE_LEN);
                    for c in 0..channels {
                        buf[i * channels + c] *= g;
                    }
                }
                let pos = pos + frames;
                if pos >= RAMP_FADE_LEN {
                    // Switch modes with all state cleared; the envelope
                    // stays muted while the new mode warms up
                    self.phase_mode = self.transition_target;
                    self.clear_biquad_state();
                    self.lp.reset();
                    self.coeff_fade_pos = None;
                    let total = if self.phase_mode == PhaseMode::LinearPhase && self.lp.fir_len > 0
                    {
                        let latency = PARTITION_SIZE + self.lp.fir_len / 2;
                        let partitions = latency.div_ceil(PARTITION_SIZE);
                        (partitions + 1) * PARTITION_SIZE + RAMP_FADE_LEN
                    } else {
                        2 * RAMP_FADE_LEN
                    };
                    self.transition = Transition::Warmup { pos: 0, total };
                } else {
                    self.transition = Transition::FadeOut { pos };
                }
            }
            Transition::Warmup { pos, total } => {
                self.process_current_mode(buf, frames, channels);
                for i in 0..frames {
                    let g = warmup_gain(pos + i, total, RAMP_FADE_LEN);
                    for c in 0..channels {
                        buf[i * channels + c] *= g;
                    }
                }
                let pos = pos + frames;
                self.transition = if pos >= total {
                    Transition::Idle
                } else {
                    Transition::Warmup { pos, total }
                };
            }
            Transition::Idle => {
                self.process_current_mode(buf, frames, channels);
            }
        }

        // Coefficient crossfade: dry -> processed after a parameter swap
        if let Some(pos) = self.coeff_fade_pos {
            if self.coeff_fade_buf.len() >= n {
                for f in 0..frames {
                    let t = ((pos + f) as f32 / RAMP_FADE_LEN as f32).min(1.0);
                    for c in 0..channels {
                        let idx = f * channels + c;
                        buf[idx] = self.coeff_fade_buf[idx] * (1.0 - t) + buf[idx] * t;
                    }
                }
            }
            let pos = pos + frames;
            self.coeff_fade_pos = if pos >= RAMP_FADE_LEN { None } else { Some(pos) };
        }

        // Enable/disable crossfade against the untouched input copy
        if need_blend {
            let dir = if enabled { ENABLE_FADE_STEP } else { -ENABLE_FADE_STEP };
            for f in 0..frames {
                self.enable_mix = (self.enable_mix + dir).clamp(0.0, 1.0);
                for c in 0..channels {
                    let idx = f * channels + c;
                    buf[idx] = self.enable_fade_buf[idx] * (1.0 - self.enable_mix)
                        + buf[idx] * self.enable_mix;
                }
            }
        } else if enabled && self.enable_mix < 1.0 {
            self.enable_mix = 1.0;
        }
    }

    /// Snapshot the pending parameter set if it changed and the lock is
    /// free. In minimum-phase mode the biquad state restarts from zero
    /// and a short dry ramp masks it.
    fn apply_pending_bands(&mut self, buf: &[Sample], n: usize) {
        if !self.shared.bands_dirty.load(Ordering::Acquire) {
            return;
        }
        let Some(pending) = self.shared.pending.try_lock() else {
            // UI holds the lock; the next callback picks it up
            return;
        };
        self.bands = pending.bands;
        self.coeffs = pending.coeffs;
        self.active_bands = pending.active;
        self.shared.bands_dirty.store(false, Ordering::Relaxed);
        drop(pending);

        if self.phase_mode == PhaseMode::MinimumPhase {
            self.clear_biquad_state();
            if self.coeff_fade_buf.len() >= n {
                self.coeff_fade_buf[..n].copy_from_slice(&buf[..n]);
                self.coeff_fade_pos = Some(0);
            }
        }
        // Linear-phase kernels arrive separately through the staged slot
    }

    fn process_current_mode(&mut self, buf: &mut [Sample], frames: usize, channels: usize) {
        if self.phase_mode == PhaseMode::LinearPhase && self.lp.fir_len > 0 {
            self.process_linear_phase(buf, frames, channels);
        } else {
            self.process_minimum_phase(buf, frames, channels);
        }
    }

    fn process_minimum_phase(&mut self, buf: &mut [Sample], frames: usize, channels: usize) {
        let ch = channels.min(MAX_CHANNELS);
        for band in 0..self.active_bands.min(MAX_BANDS) {
            if self.bands[band].is_noop() {
                continue;
            }
            let coeffs = self.coeffs[band];
            let band_state = &mut self.state[band];
            for f in 0..frames {
                for c in 0..ch {
                    let idx = f * channels + c;
                    let y = band_state[c].process_sample(&coeffs, buf[idx] as f64);
                    buf[idx] = y as f32;
                }
            }
        }
    }

    fn process_linear_phase(&mut self, buf: &mut [Sample], frames: usize, channels: usize) {
        let lp = &mut self.lp;
        let ch = channels.min(lp.slots[0].channels.len());
        if ch == 0 {
            return;
        }

        // Adopt a staged kernel. Three cases: cold slot takes it
        // directly; otherwise the alternate slot starts (or restarts)
        // warming up with it.
        self.shared.staged_kernel.try_consume_with(|staged| {
            if staged.num_partitions() != lp.num_partitions {
                return;
            }
            let cur = lp.cur;
            if !lp.slots[cur].has_output {
                lp.slots[cur].kernel.copy_from(staged);
            } else if let Some(alt) = lp.next {
                // A newer kernel arrived mid-warm-up: replace it and
                // restart the warming slot
                lp.slots[alt].kernel.copy_from(staged);
                lp.slots[alt].restart_warmup();
                lp.crossfading = false;
                lp.xfade_pos = 0;
            } else {
                let alt = 1 - cur;
                lp.slots[alt].reset();
                lp.slots[alt].kernel.copy_from(staged);
                lp.next = Some(alt);
                lp.crossfading = false;
                lp.xfade_pos = 0;
            }
        });

        let n = frames * channels;
        if lp.dry_buf.len() < n {
            return;
        }
        lp.dry_buf[..n].copy_from_slice(&buf[..n]);

        let cur = lp.cur;
        Self::process_slot(
            &mut lp.slots[cur],
            &mut lp.fft,
            &mut lp.accum,
            &lp.dry_buf[..n],
            &mut buf[..n],
            frames,
            channels,
            ch,
        );

        if let Some(next_idx) = lp.next {
            // Warm the alternate slot against the same input while the
            // current slot keeps playing
            {
                let (dry, next_out) = (&lp.dry_buf[..n], &mut lp.next_buf[..n]);
                Self::process_slot(
                    &mut lp.slots[next_idx],
                    &mut lp.fft,
                    &mut lp.accum,
                    dry,
                    next_out,
                    frames,
                    channels,
                    ch,
                );
            }

            if lp.slots[next_idx].has_output && !lp.crossfading {
                lp.crossfading = true;
                lp.xfade_pos = 0;
            }

            if lp.crossfading {
                for i in 0..frames {
                    let t = ((lp.xfade_pos + i) as f32 / LP_FADE_LEN as f32).min(1.0);
                    let (g_old, g_new) = equal_power_gains(t);
                    for c in 0..ch {
                        let idx = i * channels + c;
                        buf[idx] = buf[idx] * g_old + lp.next_buf[idx] * g_new;
                    }
                }
                lp.xfade_pos += frames;
                if lp.xfade_pos >= LP_FADE_LEN {
                    // Promote the warmed slot
                    lp.cur = next_idx;
                    lp.next = None;
                    lp.crossfading = false;
                    lp.xfade_pos = 0;
                }
            }
        }
    }

    /// Partitioned convolution for one OLA slot: deinterleave into the
    /// channel input blocks, emit the previous partition's output, and
    /// convolve whenever a partition fills.
    #[allow(clippy::too_many_arguments)]
    fn process_slot(
        slot: &mut OlaSlot,
        fft: &mut ConvFft,
        accum: &mut [Complex<f32>],
        input: &[f32],
        output: &mut [f32],
        frames: usize,
        channels: usize,
        ch: usize,
    ) {
        let mut pos = 0;
        while pos < frames {
            let avail = (frames - pos).min(PARTITION_SIZE - slot.phase);

            for i in 0..avail {
                let base = (pos + i) * channels;
                for c in 0..ch {
                    slot.channels[c].input[slot.phase + i] = input[base + c];
                }
                if slot.has_output {
                    for c in 0..ch {
                        output[base + c] = slot.channels[c].output[slot.phase + i];
                    }
                } else {
                    for c in 0..ch {
                        output[base + c] = 0.0;
                    }
                }
            }

            slot.phase += avail;
            pos += avail;

            if slot.phase >= PARTITION_SIZE {
                for c in 0..ch {
                    slot.channels[c].convolve_block(&slot.kernel, fft, slot.fdl_idx, accum);
                }
                slot.fdl_idx = (slot.fdl_idx + 1) % slot.kernel.num_partitions();
                slot.phase = 0;

                if !slot.has_output {
                    slot.partitions_processed += 1;
                    // FDL fully populated plus one clean overlap tail
                    if slot.partitions_processed >= slot.kernel.num_partitions() + 1 {
                        slot.has_output = true;
                    }
                }
            }
        }
    }
}

impl Default for EqualizerProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biquad::FilterKind;

    fn peak(frequency: f32, gain_db: f32, q: f32) -> Band {
        Band {
            enabled: true,
            kind: FilterKind::Peak,
            frequency,
            gain_db,
            q,
        }
    }

    fn sine_block(frames: usize, freq: f32, amp: f32, sample_rate: f32, offset: usize) -> Vec<f32> {
        let mut buf = vec![0.0f32; frames * 2];
        for f in 0..frames {
            let t = (offset + f) as f32 / sample_rate;
            let s = amp * (2.0 * std::f32::consts::PI * freq * t).sin();
            buf[f * 2] = s;
            buf[f * 2 + 1] = s;
        }
        buf
    }

    /// Collect left-channel output for `num_blocks` partition-sized
    /// blocks of a sine through the given equalizer.
    fn run_sine_blocks(
        eq: &mut EqualizerProcessor,
        num_blocks: usize,
        freq: f32,
        amp: f32,
        sample_rate: f32,
    ) -> Vec<f32> {
        let mut out = Vec::with_capacity(num_blocks * PARTITION_SIZE);
        for b in 0..num_blocks {
            let mut block = sine_block(PARTITION_SIZE, freq, amp, sample_rate, b * PARTITION_SIZE);
            eq.process(&mut block, PARTITION_SIZE, 2);
            for f in 0..PARTITION_SIZE {
                out.push(block[f * 2]);
            }
        }
        out
    }

    /// Max sample-to-sample delta at partition boundaries vs within
    /// partitions, skipping the warm-up region.
    fn boundary_deltas(output: &[f32], start: usize) -> (f32, f32) {
        let mut max_intra = 0.0f32;
        let mut max_inter = 0.0f32;
        for n in (start + 1)..output.len() {
            let delta = (output[n] - output[n - 1]).abs();
            if n % PARTITION_SIZE == 0 {
                max_inter = max_inter.max(delta);
            } else {
                max_intra = max_intra.max(delta);
            }
        }
        (max_intra, max_inter)
    }

    #[test]
    fn test_flat_linear_phase_passthrough() {
        let mut eq = EqualizerProcessor::new();
        eq.control().set_phase_mode(PhaseMode::LinearPhase);
        eq.prepare(48000.0, 2, PARTITION_SIZE);

        for b in 0..20 {
            let mut block = vec![0.5f32; PARTITION_SIZE * 2];
            eq.process(&mut block, PARTITION_SIZE, 2);
            if b >= 6 {
                for (i, &s) in block.iter().enumerate() {
                    assert!(
                        (0.49..=0.51).contains(&s),
                        "block {b} sample {i}: {s}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_linear_phase_ola_continuity_flat() {
        let mut eq = EqualizerProcessor::new();
        eq.control().set_phase_mode(PhaseMode::LinearPhase);
        eq.prepare(44100.0, 2, PARTITION_SIZE);

        let out = run_sine_blocks(&mut eq, 20, 1000.0, 0.5, 44100.0);
        let (intra, inter) = boundary_deltas(&out, 6 * PARTITION_SIZE);
        assert!(intra > 1e-10, "no signal reached the output");
        let ratio = inter / intra;
        assert!(ratio < 1.05, "boundary discontinuity: ratio {ratio}");
    }

    #[test]
    fn test_linear_phase_ola_continuity_boosted() {
        let mut eq = EqualizerProcessor::new();
        let ctl = eq.control();
        ctl.set_phase_mode(PhaseMode::LinearPhase);
        ctl.set_band(0, peak(1000.0, 6.0, 1.0)).unwrap();
        eq.prepare(44100.0, 2, PARTITION_SIZE);

        let out = run_sine_blocks(&mut eq, 20, 440.0, 0.25, 44100.0);
        let (intra, inter) = boundary_deltas(&out, 6 * PARTITION_SIZE);
        assert!(intra > 1e-10);
        assert!(inter / intra < 1.05, "ratio {}", inter / intra);
    }

    #[test]
    fn test_linear_phase_mixed_frame_sizes() {
        let mut eq = EqualizerProcessor::new();
        eq.control().set_phase_mode(PhaseMode::LinearPhase);
        eq.prepare(44100.0, 2, 2048);

        let frame_sizes = [512usize, 256, 768, 1024, 2048];
        let mut out = Vec::new();
        let mut offset = 0usize;
        for round in 0..30 {
            let frames = frame_sizes[round % frame_sizes.len()];
            let mut block = sine_block(frames, 440.0, 0.5, 44100.0, offset);
            eq.process(&mut block, frames, 2);
            for f in 0..frames {
                out.push(block[f * 2]);
            }
            offset += frames;
        }

        let (intra, inter) = boundary_deltas(&out, 6 * PARTITION_SIZE);
        assert!(intra > 1e-10);
        assert!(inter / intra < 1.05, "ratio {}", inter / intra);
    }

    #[test]
    fn test_minimum_phase_peak_gain_rms() {
        // One +6 dB band at 1 kHz, 1 kHz sine at 0.25: output RMS is
        // 0.25 * 10^(6/20) / sqrt(2) within 5% after settling
        let mut eq = EqualizerProcessor::new();
        let ctl = eq.control();
        ctl.set_band(0, peak(1000.0, 6.0, 1.0)).unwrap();
        ctl.set_active_bands(1).unwrap();
        eq.prepare(44100.0, 2, PARTITION_SIZE);

        let out = run_sine_blocks(&mut eq, 8, 1000.0, 0.25, 44100.0);
        let settled = &out[512..];
        let rms = (settled.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>()
            / settled.len() as f64)
            .sqrt();
        let expected = 0.25 * 10.0f64.powf(6.0 / 20.0) / 2.0f64.sqrt();
        assert!(
            (rms - expected).abs() / expected < 0.05,
            "rms {rms}, expected {expected}"
        );
    }

    #[test]
    fn test_band_edit_applies_without_artifacts() {
        let mut eq = EqualizerProcessor::new();
        let ctl = eq.control();
        ctl.set_active_bands(4).unwrap();
        eq.prepare(44100.0, 2, PARTITION_SIZE);

        let mut offset = 0;
        for b in 0..12 {
            if b == 4 {
                ctl.set_band(0, peak(500.0, 9.0, 2.0)).unwrap();
            }
            if b == 8 {
                ctl.set_band(0, peak(2000.0, -9.0, 0.5)).unwrap();
            }
            let mut block = sine_block(PARTITION_SIZE, 1000.0, 0.25, 44100.0, offset);
            eq.process(&mut block, PARTITION_SIZE, 2);
            offset += PARTITION_SIZE;
            for &s in &block {
                assert!(s.is_finite());
                assert!(s.abs() < 1.0);
            }
        }
        assert_eq!(ctl.band(0).unwrap().frequency, 2000.0);
    }

    #[test]
    fn test_phase_mode_transition_attenuates() {
        // MP -> LP switch during a steady sine: the transition window is
        // strictly quieter than the input and never exceeds the input
        // amplitude
        let mut eq = EqualizerProcessor::new();
        let ctl = eq.control();
        eq.prepare(44100.0, 2, PARTITION_SIZE);

        let mut offset = 0;
        for _ in 0..4 {
            let mut block = sine_block(PARTITION_SIZE, 1000.0, 0.5, 44100.0, offset);
            eq.process(&mut block, PARTITION_SIZE, 2);
            offset += PARTITION_SIZE;
        }

        ctl.set_phase_mode(PhaseMode::LinearPhase);

        // 256 fade-out + (3 + 1) * 1024 + 256 warm-up, rounded up
        let transition_samples = RAMP_FADE_LEN + 4 * PARTITION_SIZE + RAMP_FADE_LEN;
        let blocks = transition_samples.div_ceil(PARTITION_SIZE);
        let mut in_energy = 0.0f64;
        let mut out_energy = 0.0f64;
        for _ in 0..blocks {
            let block_in = sine_block(PARTITION_SIZE, 1000.0, 0.5, 44100.0, offset);
            let mut block = block_in.clone();
            eq.process(&mut block, PARTITION_SIZE, 2);
            offset += PARTITION_SIZE;
            for (&x, &y) in block_in.iter().zip(&block) {
                in_energy += (x as f64) * (x as f64);
                out_energy += (y as f64) * (y as f64);
                assert!(y.abs() <= 0.5 + 1e-4, "sample {y} exceeds input amplitude");
            }
        }
        assert!(
            out_energy < in_energy,
            "transition energy {out_energy} not below input {in_energy}"
        );

        // Steady state afterwards: LP passes the sine again
        for _ in 0..8 {
            let mut block = sine_block(PARTITION_SIZE, 1000.0, 0.5, 44100.0, offset);
            eq.process(&mut block, PARTITION_SIZE, 2);
            offset += PARTITION_SIZE;
        }
        let mut block = sine_block(PARTITION_SIZE, 1000.0, 0.5, 44100.0, offset);
        eq.process(&mut block, PARTITION_SIZE, 2);
        let peak_out = block.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(peak_out > 0.4, "LP output did not come back: peak {peak_out}");
    }

    #[test]
    fn test_kernel_swap_crossfades_in_lp_mode() {
        let mut eq = EqualizerProcessor::new();
        let ctl = eq.control();
        ctl.set_phase_mode(PhaseMode::LinearPhase);
        eq.prepare(44100.0, 2, PARTITION_SIZE);

        // Warm up the current slot
        let mut offset = 0;
        for _ in 0..8 {
            let mut block = sine_block(PARTITION_SIZE, 440.0, 0.4, 44100.0, offset);
            eq.process(&mut block, PARTITION_SIZE, 2);
            offset += PARTITION_SIZE;
        }

        // Stage a boosted kernel; the alternate slot warms up and
        // promotes without NaNs or level explosions
        ctl.set_band(0, peak(440.0, 6.0, 1.0)).unwrap();
        for _ in 0..12 {
            let mut block = sine_block(PARTITION_SIZE, 440.0, 0.4, 44100.0, offset);
            eq.process(&mut block, PARTITION_SIZE, 2);
            offset += PARTITION_SIZE;
            for &s in &block {
                assert!(s.is_finite());
                assert!(s.abs() < 1.5);
            }
        }

        // After promotion the +6 dB boost is audible
        let mut block = sine_block(PARTITION_SIZE, 440.0, 0.4, 44100.0, offset);
        eq.process(&mut block, PARTITION_SIZE, 2);
        let peak_out = block.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(peak_out > 0.4 * 1.5, "boost not applied: peak {peak_out}");
    }

    #[test]
    fn test_enable_disable_crossfade() {
        let mut eq = EqualizerProcessor::new();
        let ctl = eq.control();
        ctl.set_band(0, peak(1000.0, 12.0, 1.0)).unwrap();
        ctl.set_active_bands(1).unwrap();
        eq.prepare(44100.0, 2, PARTITION_SIZE);

        let mut offset = 0;
        for _ in 0..4 {
            let mut block = sine_block(PARTITION_SIZE, 1000.0, 0.2, 44100.0, offset);
            eq.process(&mut block, PARTITION_SIZE, 2);
            offset += PARTITION_SIZE;
        }

        // Disable: after the 256-sample fade the output equals the input
        ctl.set_enabled(false);
        let mut block = sine_block(PARTITION_SIZE, 1000.0, 0.2, 44100.0, offset);
        eq.process(&mut block, PARTITION_SIZE, 2);
        offset += PARTITION_SIZE;

        let original = sine_block(PARTITION_SIZE, 1000.0, 0.2, 44100.0, offset);
        let mut block = original.clone();
        eq.process(&mut block, PARTITION_SIZE, 2);
        assert_eq!(block, original, "disabled EQ must be bit-exact passthrough");
    }

    #[test]
    fn test_latency_query() {
        let eq = EqualizerProcessor::new();
        let ctl = eq.control();
        assert_eq!(ctl.latency_samples(), 0);

        let mut eq = eq;
        eq.prepare(44100.0, 2, 1024);
        ctl.set_phase_mode(PhaseMode::LinearPhase);
        assert_eq!(ctl.latency_samples(), PARTITION_SIZE + 4096 / 2);

        ctl.set_phase_mode(PhaseMode::MinimumPhase);
        assert_eq!(ctl.latency_samples(), 0);
    }

    #[test]
    fn test_fir_length_by_rate() {
        assert_eq!(fir_len_for_rate(44100.0), 4096);
        assert_eq!(fir_len_for_rate(48000.0), 4096);
        assert_eq!(fir_len_for_rate(96000.0), 8192);
        assert_eq!(fir_len_for_rate(192000.0), 16384);
    }

    #[test]
    fn test_frequency_response_shape() {
        let eq = EqualizerProcessor::new();
        let ctl = eq.control();
        ctl.set_band(0, peak(1000.0, 6.0, 1.0)).unwrap();
        ctl.set_active_bands(1).unwrap();

        let response = ctl.frequency_response(256);
        assert_eq!(response.len(), 256);

        // Peak near 1 kHz, flat at the extremes
        let log_min = 20.0f64.log10();
        let log_max = 20_000.0f64.log10();
        let idx_1k = ((1000.0f64.log10() - log_min) / (log_max - log_min) * 255.0) as usize;
        assert!((response[idx_1k] - 6.0).abs() < 0.5, "at 1k: {}", response[idx_1k]);
        assert!(response[0].abs() < 0.5);
        assert!(response[255].abs() < 1.0);
    }

    #[test]
    fn test_band_index_out_of_range() {
        let eq = EqualizerProcessor::new();
        let ctl = eq.control();
        assert!(matches!(
            ctl.set_band(MAX_BANDS, Band::default()),
            Err(EngineError::BandOutOfRange(_))
        ));
        assert!(ctl.band(MAX_BANDS).is_err());
        assert!(ctl.set_active_bands(0).is_err());
        assert!(ctl.set_active_bands(MAX_BANDS + 1).is_err());
    }

    #[test]
    fn test_batch_update_defers_staging() {
        let mut eq = EqualizerProcessor::new();
        let ctl = eq.control();
        ctl.set_phase_mode(PhaseMode::LinearPhase);
        eq.prepare(44100.0, 2, 1024);

        // Drain the kernel staged by prepare
        let mut block = vec![0.0f32; PARTITION_SIZE * 2];
        eq.process(&mut block, PARTITION_SIZE, 2);
        assert!(!eq.shared.staged_kernel.is_ready());

        ctl.begin_batch_update();
        ctl.set_band(0, peak(100.0, 3.0, 1.0)).unwrap();
        ctl.set_band(1, peak(300.0, -3.0, 1.0)).unwrap();
        assert!(!eq.shared.staged_kernel.is_ready(), "build must be deferred");
        ctl.end_batch_update();
        assert!(eq.shared.staged_kernel.is_ready(), "build runs at batch end");
    }

    #[test]
    fn test_state_roundtrip() {
        let eq = EqualizerProcessor::new();
        let ctl = eq.control();
        ctl.set_band(2, peak(250.0, 4.5, 2.0)).unwrap();
        ctl.set_active_bands(12).unwrap();
        let blob = ctl.save_state();

        let eq2 = EqualizerProcessor::new();
        let ctl2 = eq2.control();
        assert!(ctl2.restore_state(&blob));
        assert_eq!(ctl2.band(2).unwrap(), peak(250.0, 4.5, 2.0));
        assert_eq!(ctl2.active_bands(), 12);

        assert!(!ctl2.restore_state(b"not json"));
    }
}
