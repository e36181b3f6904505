//! Render pipeline
//!
//! Owns every processor and applies them in fixed order once per audio
//! callback:
//!
//! ```text
//! headroom gain -> crossfeed -> convolution -> HRTF -> equalizer -> plugins
//! ```
//!
//! `process` is render-thread code: it reads atomics, try-locks the
//! plugin list, and never allocates. All configuration flows through
//! `PipelineControl`, which is cloneable and safe to use from UI and
//! background threads while audio runs. Structural changes (add, remove,
//! enable) emit `EngineEvent::ConfigurationChanged` to subscribers,
//! always outside any lock the render thread contends on.

use au_core::{AudioFormat, EngineError, Sample};
use au_dsp::crossfeed::{CrossfeedControl, CrossfeedLevel, CrossfeedProcessor};
use au_dsp::convolution::{ConvolutionControl, ConvolutionProcessor};
use au_dsp::equalizer::{EqControl, EqualizerProcessor};
use au_dsp::fade::RAMP_FADE_LEN;
use au_dsp::gain::{GainControl, GainProcessor};
use au_dsp::hrtf::{HrtfControl, HrtfProcessor};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::processor::DspProcessor;

/// Pipeline-enable crossfade step (full ramp in 256 samples, ~6 ms).
const ENABLE_FADE_STEP: f32 = 1.0 / RAMP_FADE_LEN as f32;

/// Notifications emitted to subscribers after configuration mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    ConfigurationChanged,
}

struct PipelineShared {
    enabled: AtomicBool,
    /// External processors. Writers are control threads; the render
    /// thread traverses under `try_read` and skips the whole sub-chain
    /// on contention. Each slot carries its own lock so the render
    /// thread can call `process` with exclusive access while control
    /// threads hold the shared list lock for queries.
    plugins: RwLock<Vec<Mutex<Box<dyn DspProcessor>>>>,
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
    format: Mutex<Option<AudioFormat>>,
}

/// Serialized session snapshot: built-in processor state plus the plugin
/// chain's order, enabled flags and opaque blobs.
#[derive(Serialize, Deserialize)]
struct SessionState {
    enabled: bool,
    gain_db: f32,
    gain_enabled: bool,
    equalizer: Vec<u8>,
    eq_enabled: bool,
    crossfeed_enabled: bool,
    crossfeed_level: i32,
    convolution_enabled: bool,
    hrtf_enabled: bool,
    hrtf_angle: f32,
    plugins: Vec<PluginState>,
}

#[derive(Serialize, Deserialize)]
struct PluginState {
    name: String,
    enabled: bool,
    state: Vec<u8>,
}

/// Control-thread handle to the pipeline and its built-in processors.
#[derive(Clone)]
pub struct PipelineControl {
    shared: Arc<PipelineShared>,
    gain: GainControl,
    equalizer: EqControl,
    crossfeed: CrossfeedControl,
    convolution: ConvolutionControl,
    hrtf: HrtfControl,
}

impl PipelineControl {
    pub fn gain(&self) -> &GainControl {
        &self.gain
    }

    pub fn equalizer(&self) -> &EqControl {
        &self.equalizer
    }

    pub fn crossfeed(&self) -> &CrossfeedControl {
        &self.crossfeed
    }

    pub fn convolution(&self) -> &ConvolutionControl {
        &self.convolution
    }

    pub fn hrtf(&self) -> &HrtfControl {
        &self.hrtf
    }

    /// Enable or disable the whole pipeline. The render thread
    /// cross-fades against a dry copy of the input over ~6 ms.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
        self.notify_configuration_changed();
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Latency the pipeline introduces, for downstream A/V sync.
    pub fn latency_samples(&self) -> usize {
        self.equalizer.latency_samples()
    }

    /// Append an external processor. It is prepared for the current
    /// format before it becomes reachable from the render thread.
    pub fn add_processor(&self, mut processor: Box<dyn DspProcessor>) {
        let format = *self.shared.format.lock();
        if let Some(format) = format {
            processor.prepare(format.sample_rate, format.channels);
        }
        {
            let mut plugins = self.shared.plugins.write();
            plugins.push(Mutex::new(processor));
            debug!("pipeline: processor added ({} external)", plugins.len());
        }
        // A freshly added processor should be audible even if the
        // pipeline was switched off earlier
        if !self.shared.enabled.load(Ordering::Acquire) {
            self.shared.enabled.store(true, Ordering::Release);
            debug!("pipeline: auto-enabled on processor add");
        }
        self.notify_configuration_changed();
    }

    /// Remove the processor at `index`. Its destructor runs on this
    /// thread after the list lock is released.
    pub fn remove_processor(&self, index: usize) -> bool {
        let removed = {
            let mut plugins = self.shared.plugins.write();
            if index < plugins.len() {
                Some(plugins.remove(index))
            } else {
                None
            }
        };
        match removed {
            Some(slot) => {
                self.notify_configuration_changed();
                // Dropped here, outside the lock: a plugin teardown may
                // re-enter processor_count() or similar queries
                drop(slot);
                true
            }
            None => false,
        }
    }

    /// Move the processor at `from` to position `to`, shifting the rest.
    pub fn move_processor(&self, from: usize, to: usize) -> bool {
        let moved = {
            let mut plugins = self.shared.plugins.write();
            if from >= plugins.len() || to >= plugins.len() {
                false
            } else {
                let slot = plugins.remove(from);
                plugins.insert(to, slot);
                true
            }
        };
        if moved {
            self.notify_configuration_changed();
        }
        moved
    }

    pub fn processor_count(&self) -> usize {
        self.shared.plugins.read().len()
    }

    /// Run `f` against the processor at `index`, if present.
    pub fn with_processor<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut dyn DspProcessor) -> R,
    ) -> Option<R> {
        let plugins = self.shared.plugins.read();
        let slot = plugins.get(index)?;
        let mut proc = slot.lock();
        Some(f(proc.as_mut()))
    }

    /// Subscribe to configuration-changed notifications.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Notify subscribers after an out-of-band state change (gain dB, EQ
    /// bands, processor enable flags).
    pub fn notify_configuration_changed(&self) {
        let mut subscribers = self.shared.subscribers.lock();
        subscribers.retain(|tx| tx.send(EngineEvent::ConfigurationChanged).is_ok());
    }

    /// Snapshot the session: built-in processors plus plugin order,
    /// enabled flags and state blobs.
    pub fn save_session(&self) -> Vec<u8> {
        let plugins = {
            let list = self.shared.plugins.read();
            list.iter()
                .map(|slot| {
                    let proc = slot.lock();
                    PluginState {
                        name: proc.name().to_string(),
                        enabled: proc.is_enabled(),
                        state: proc.save_state(),
                    }
                })
                .collect()
        };
        let state = SessionState {
            enabled: self.is_enabled(),
            gain_db: self.gain.gain_db(),
            gain_enabled: self.gain.is_enabled(),
            equalizer: self.equalizer.save_state(),
            eq_enabled: self.equalizer.is_enabled(),
            crossfeed_enabled: self.crossfeed.is_enabled(),
            crossfeed_level: self.crossfeed.level() as i32,
            convolution_enabled: self.convolution.is_enabled(),
            hrtf_enabled: self.hrtf.is_enabled(),
            hrtf_angle: self.hrtf.speaker_angle(),
            plugins,
        };
        serde_json::to_vec(&state).unwrap_or_default()
    }

    /// Restore a session snapshot. Plugins are matched by position and
    /// name against the currently loaded chain; blobs for missing
    /// plugins are skipped.
    pub fn restore_session(&self, blob: &[u8]) -> Result<(), EngineError> {
        let state: SessionState =
            serde_json::from_slice(blob).map_err(|_| EngineError::RestoreFailed)?;

        self.gain.set_gain_db(state.gain_db);
        self.gain.set_enabled(state.gain_enabled);
        if !state.equalizer.is_empty() && !self.equalizer.restore_state(&state.equalizer) {
            warn!("pipeline: equalizer state blob not restored");
        }
        self.equalizer.set_enabled(state.eq_enabled);
        if let Some(level) = CrossfeedLevel::from_index(state.crossfeed_level) {
            self.crossfeed.set_level(level);
        }
        self.crossfeed.set_enabled(state.crossfeed_enabled);
        self.convolution.set_enabled(state.convolution_enabled);
        let _ = self.hrtf.set_speaker_angle(state.hrtf_angle);
        self.hrtf.set_enabled(state.hrtf_enabled);

        {
            let plugins = self.shared.plugins.read();
            for (slot, saved) in plugins.iter().zip(&state.plugins) {
                let mut proc = slot.lock();
                if proc.name() != saved.name {
                    warn!(
                        "pipeline: plugin order mismatch ({} vs {}), skipping blob",
                        proc.name(),
                        saved.name
                    );
                    continue;
                }
                proc.set_enabled(saved.enabled);
                if !saved.state.is_empty() && !proc.restore_state(&saved.state) {
                    warn!("pipeline: plugin {} rejected its state blob", saved.name);
                }
            }
        }

        self.shared.enabled.store(state.enabled, Ordering::Release);
        self.notify_configuration_changed();
        Ok(())
    }
}

/// The render pipeline. Owned by the audio side; `process` runs in the
/// driver callback, `prepare`/`reset` while audio is stopped.
pub struct Pipeline {
    shared: Arc<PipelineShared>,
    gain: GainProcessor,
    crossfeed: CrossfeedProcessor,
    convolution: ConvolutionProcessor,
    hrtf: HrtfProcessor,
    equalizer: EqualizerProcessor,

    /// Pipeline-enable crossfade state, render thread only
    enable_mix: f32,
    dry_buf: Vec<Sample>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                enabled: AtomicBool::new(true),
                plugins: RwLock::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                format: Mutex::new(None),
            }),
            gain: GainProcessor::new(),
            crossfeed: CrossfeedProcessor::new(),
            convolution: ConvolutionProcessor::new(),
            hrtf: HrtfProcessor::new(),
            equalizer: EqualizerProcessor::new(),
            enable_mix: 1.0,
            dry_buf: Vec::new(),
        }
    }

    pub fn control(&self) -> PipelineControl {
        PipelineControl {
            shared: Arc::clone(&self.shared),
            gain: self.gain.control(),
            equalizer: self.equalizer.control(),
            crossfeed: self.crossfeed.control(),
            convolution: self.convolution.control(),
            hrtf: self.hrtf.control(),
        }
    }

    /// Negotiate the playback format. Called while audio is stopped;
    /// after this returns, the render thread runs without allocating.
    pub fn prepare(&mut self, format: AudioFormat) -> Result<(), EngineError> {
        let format = AudioFormat::new(format.sample_rate, format.channels, format.max_block_size)?;
        *self.shared.format.lock() = Some(format);

        self.dry_buf = vec![0.0; format.max_block_size * format.channels];
        self.enable_mix = 1.0;

        self.gain.reset();
        self.crossfeed.prepare(format.sample_rate);
        self.convolution.prepare(format.sample_rate, format.channels);
        self.hrtf.prepare(format.sample_rate, format.max_block_size);
        self.equalizer
            .prepare(format.sample_rate, format.channels, format.max_block_size);

        let plugins = self.shared.plugins.write();
        for slot in plugins.iter() {
            slot.lock().prepare(format.sample_rate, format.channels);
        }
        debug!(
            "pipeline: prepared {} Hz, {} ch, max block {}",
            format.sample_rate, format.channels, format.max_block_size
        );
        Ok(())
    }

    /// Zero all processor histories (called on seek).
    pub fn reset(&mut self) {
        self.gain.reset();
        self.crossfeed.reset();
        self.convolution.reset();
        self.hrtf.reset();
        self.equalizer.reset();

        let plugins = self.shared.plugins.write();
        for slot in plugins.iter() {
            slot.lock().reset();
        }
    }

    /// Render-thread entry point, in place on interleaved float32.
    ///
    /// `dop_passthrough` skips all processing (DSD-over-PCM frames must
    /// stay bit-perfect); `bit_perfect` skips everything except the
    /// headroom gain.
    pub fn process(
        &mut self,
        buf: &mut [Sample],
        frames: usize,
        channels: usize,
        dop_passthrough: bool,
        bit_perfect: bool,
    ) {
        if dop_passthrough {
            return;
        }

        let enabled = self.shared.enabled.load(Ordering::Acquire);
        let fading =
            (enabled && self.enable_mix < 1.0) || (!enabled && self.enable_mix > 0.0);
        if !enabled && !fading {
            return;
        }

        let n = frames * channels;
        let need_blend = fading && self.dry_buf.len() >= n;
        if need_blend {
            self.dry_buf[..n].copy_from_slice(&buf[..n]);
        }

        self.gain.process(buf, frames, channels);

        if !bit_perfect {
            self.crossfeed.process(buf, frames, channels);
            self.convolution.process(buf, frames, channels);
            self.hrtf.process(buf, frames, channels);
            self.equalizer.process(buf, frames, channels);

            // Plugin sub-chain: try-only reader lock. If a control
            // thread holds the list for a mutation, the plugins are
            // skipped for this one buffer; every other stage still ran.
            if let Some(plugins) = self.shared.plugins.try_read() {
                for slot in plugins.iter() {
                    let Some(mut proc) = slot.try_lock() else {
                        continue;
                    };
                    if !proc.is_enabled() {
                        continue;
                    }
                    // A panicking processor leaves the buffer as-is and
                    // the chain moves on; no retry
                    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        proc.process(buf, frames, channels);
                    }));
                }
            }
        }

        // Pipeline-enable crossfade against the untouched input copy
        if need_blend {
            let dir = if enabled { ENABLE_FADE_STEP } else { -ENABLE_FADE_STEP };
            for f in 0..frames {
                self.enable_mix = (self.enable_mix + dir).clamp(0.0, 1.0);
                for c in 0..channels {
                    let idx = f * channels + c;
                    buf[idx] =
                        self.dry_buf[idx] * (1.0 - self.enable_mix) + buf[idx] * self.enable_mix;
                }
            }
        } else if enabled && self.enable_mix < 1.0 {
            self.enable_mix = 1.0;
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
