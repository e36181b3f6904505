//! Partitioned frequency-domain convolution core
//!
//! Overlap-add convolution in fixed 1024-sample partitions with a 2048
//! point real FFT. A frequency-domain delay line (FDL) keeps the spectra
//! of the last P input blocks; each output block is the bin-wise sum over
//! `FDL[(idx - p) mod P] * kernel[p]`. Shared by the linear-phase
//! equalizer and the convolution reverb.
//!
//! The inverse transform is scaled by `1 / CONV_FFT_SIZE`: realfft's
//! unnormalised forward/inverse pair round-trips at N, with DC and Nyquist
//! as ordinary bins.

use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use std::sync::Arc;

/// Samples per partition.
pub const PARTITION_SIZE: usize = 1024;

/// FFT size: one partition of signal, one partition of zero padding.
pub const CONV_FFT_SIZE: usize = 2 * PARTITION_SIZE;

/// Bins in a half-spectrum of the convolution FFT.
pub const CONV_BINS: usize = CONV_FFT_SIZE / 2 + 1;

/// Pre-planned 2048-point real FFT pair with scratch buffers.
/// Allocation-free after construction, so one instance can live on the
/// render thread.
pub struct ConvFft {
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    time_buf: Vec<f32>,
    scratch_fwd: Vec<Complex<f32>>,
    scratch_inv: Vec<Complex<f32>>,
}

impl ConvFft {
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(CONV_FFT_SIZE);
        let inverse = planner.plan_fft_inverse(CONV_FFT_SIZE);
        let scratch_fwd = vec![Complex::new(0.0, 0.0); forward.get_scratch_len()];
        let scratch_inv = vec![Complex::new(0.0, 0.0); inverse.get_scratch_len()];
        Self {
            forward,
            inverse,
            time_buf: vec![0.0; CONV_FFT_SIZE],
            scratch_fwd,
            scratch_inv,
        }
    }

    /// Forward transform of one partition block, zero-padded to the FFT size.
    pub fn forward_block(&mut self, block: &[f32], spectrum: &mut [Complex<f32>]) {
        debug_assert!(block.len() <= PARTITION_SIZE);
        debug_assert_eq!(spectrum.len(), CONV_BINS);
        self.time_buf[..block.len()].copy_from_slice(block);
        self.time_buf[block.len()..].fill(0.0);
        self.forward
            .process_with_scratch(&mut self.time_buf, spectrum, &mut self.scratch_fwd)
            .ok();
    }

    /// Inverse transform; the returned slice is scaled by `1 / CONV_FFT_SIZE`
    /// and valid until the next call. The spectrum is consumed.
    pub fn inverse_block(&mut self, spectrum: &mut [Complex<f32>]) -> &[f32] {
        debug_assert_eq!(spectrum.len(), CONV_BINS);
        // DC and Nyquist are real by construction; clear accumulated
        // rounding noise before the c2r transform.
        spectrum[0].im = 0.0;
        spectrum[CONV_BINS - 1].im = 0.0;
        self.inverse
            .process_with_scratch(spectrum, &mut self.time_buf, &mut self.scratch_inv)
            .ok();
        let scale = 1.0 / CONV_FFT_SIZE as f32;
        for s in &mut self.time_buf {
            *s *= scale;
        }
        &self.time_buf
    }
}

impl Default for ConvFft {
    fn default() -> Self {
        Self::new()
    }
}

/// Frequency-domain kernel: P partitions of `CONV_BINS` bins each.
#[derive(Clone)]
pub struct KernelPartitions {
    parts: Vec<Vec<Complex<f32>>>,
}

impl KernelPartitions {
    /// All-zero kernel with the given partition count.
    pub fn zeroed(num_partitions: usize) -> Self {
        Self {
            parts: vec![vec![Complex::new(0.0, 0.0); CONV_BINS]; num_partitions.max(1)],
        }
    }

    /// Partition a time-domain kernel into 1024-sample blocks and
    /// transform each. Control-thread only (allocates).
    pub fn from_time_domain(kernel: &[f32], fft: &mut ConvFft) -> Self {
        let num_partitions = kernel.len().div_ceil(PARTITION_SIZE).max(1);
        let mut parts = Vec::with_capacity(num_partitions);
        for p in 0..num_partitions {
            let start = p * PARTITION_SIZE;
            let end = (start + PARTITION_SIZE).min(kernel.len());
            let mut spectrum = vec![Complex::new(0.0, 0.0); CONV_BINS];
            if start < kernel.len() {
                fft.forward_block(&kernel[start..end], &mut spectrum);
            }
            parts.push(spectrum);
        }
        Self { parts }
    }

    #[inline]
    pub fn num_partitions(&self) -> usize {
        self.parts.len()
    }

    #[inline]
    pub fn part(&self, p: usize) -> &[Complex<f32>] {
        &self.parts[p]
    }

    #[inline]
    pub fn part_mut(&mut self, p: usize) -> &mut [Complex<f32>] {
        &mut self.parts[p]
    }

    /// Copy another kernel of the same partition count. Render-safe
    /// (memcpy only).
    pub fn copy_from(&mut self, other: &KernelPartitions) {
        debug_assert_eq!(self.parts.len(), other.parts.len());
        for (dst, src) in self.parts.iter_mut().zip(&other.parts) {
            dst.copy_from_slice(src);
        }
    }

    pub fn clear(&mut self) {
        for part in &mut self.parts {
            part.fill(Complex::new(0.0, 0.0));
        }
    }
}

/// Per-channel overlap-add state: input accumulation block, overlap tail,
/// previous output block and the FDL ring.
#[derive(Clone)]
pub struct OlaChannel {
    /// Current input block being accumulated
    pub input: Vec<f32>,
    /// Overlap tail saved from the previous block
    pub overlap: Vec<f32>,
    /// Convolved output of the previous full partition
    pub output: Vec<f32>,
    fdl: Vec<Vec<Complex<f32>>>,
}

impl OlaChannel {
    pub fn new(num_partitions: usize) -> Self {
        Self {
            input: vec![0.0; PARTITION_SIZE],
            overlap: vec![0.0; PARTITION_SIZE],
            output: vec![0.0; PARTITION_SIZE],
            fdl: vec![vec![Complex::new(0.0, 0.0); CONV_BINS]; num_partitions.max(1)],
        }
    }

    #[inline]
    pub fn num_partitions(&self) -> usize {
        self.fdl.len()
    }

    pub fn reset(&mut self) {
        self.input.fill(0.0);
        self.overlap.fill(0.0);
        self.output.fill(0.0);
        for slot in &mut self.fdl {
            slot.fill(Complex::new(0.0, 0.0));
        }
    }

    /// Run one full partition: FFT the accumulated input into the FDL at
    /// `fdl_idx`, multiply-accumulate against the kernel, inverse
    /// transform, overlap-add into `output` and save the new tail.
    ///
    /// `accum` is caller-owned scratch of `CONV_BINS` bins.
    pub fn convolve_block(
        &mut self,
        kernel: &KernelPartitions,
        fft: &mut ConvFft,
        fdl_idx: usize,
        accum: &mut [Complex<f32>],
    ) {
        let num_partitions = self.fdl.len();
        debug_assert!(fdl_idx < num_partitions);
        debug_assert_eq!(kernel.num_partitions(), num_partitions);
        debug_assert_eq!(accum.len(), CONV_BINS);

        fft.forward_block(&self.input, &mut self.fdl[fdl_idx]);

        accum.fill(Complex::new(0.0, 0.0));
        for p in 0..num_partitions {
            let slot = (fdl_idx + num_partitions - p) % num_partitions;
            let x = &self.fdl[slot];
            let h = kernel.part(p);
            for ((acc, a), b) in accum.iter_mut().zip(x.iter()).zip(h.iter()) {
                *acc += a * b;
            }
        }

        let time = fft.inverse_block(accum);
        for i in 0..PARTITION_SIZE {
            self.output[i] = time[i] + self.overlap[i];
        }
        self.overlap.copy_from_slice(&time[PARTITION_SIZE..]);
    }
}
