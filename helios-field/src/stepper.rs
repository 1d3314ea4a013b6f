// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Multislice wave propagation
//!
//! The thick object is approximated as a stack of thin slices: the
//! wavefront is multiplied by each slice's transmission function, and
//! between consecutive slices (never after the last) propagated through
//! free space by `forward FFT → Fresnel kernel → inverse FFT`. An optional
//! trailing free-space leg propagates the exit wave to the detector;
//! [`FreePropagation::FarField`] instead returns the centered Fourier
//! transform itself.
//!
//! One stepper is planned per `[ny, nx]` frame shape and carries the
//! inter-slice kernel for the uniform z pitch. The sparse variant receives
//! explicit slice positions plus precomputed frequency meshes and rebuilds
//! the kernel per inter-slice gap.
//!
//! The FFT shift convention is taken from the config and applied to every
//! propagation step here; the same convention must govern the backward
//! (gradient) pass of whatever differentiates this computation — that is
//! an invariant for the autodiff backend to preserve, not something this
//! component can enforce.

use std::f64::consts::PI;

use helios_math::complex::ComplexSoA;
use helios_math::fft::{fftshift2, multiply_kernel, Fft2d, FftShiftConvention};
use helios_math::kernel::{transfer_function_kernel, transfer_function_kernel_from_mesh};
use serde::{Deserialize, Serialize};

use crate::volume::{ObjectBatchView, ObjectRepr};

/// Sign of the phase exponent in the transmission function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignConvention {
    Positive,
    Negative,
}

impl SignConvention {
    #[inline]
    pub fn factor(&self) -> f64 {
        match self {
            SignConvention::Positive => 1.0,
            SignConvention::Negative => -1.0,
        }
    }
}

/// Trailing free-space leg after the slice loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FreePropagation {
    /// Fresnel propagation over a distance in nm.
    Distance(f64),
    /// Detector in the far field: return the centered Fourier transform of
    /// the exit wave without inverse-transforming.
    FarField,
}

/// Illumination handed to one stepper call (a single probe mode).
#[derive(Debug, Clone, Copy)]
pub enum ProbeIllumination<'a> {
    /// One `[ny, nx]` plane shared by every batch entry.
    Shared { re: &'a [f32], im: &'a [f32] },
    /// Per-position planes `[batch, ny, nx]` (position-corrected probes).
    PerPosition { re: &'a [f32], im: &'a [f32] },
}

/// Stepper configuration. `voxel_nm` is the `[y, x, z]` voxel pitch; the z
/// component is both the slice thickness in the transmission function and
/// the uniform inter-slice propagation distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepperConfig {
    pub lambda_nm: f64,
    pub voxel_nm: [f64; 3],
    pub repr: ObjectRepr,
    pub sign: SignConvention,
    pub shift: FftShiftConvention,
    /// Skip inter-slice propagation entirely (pure projection
    /// approximation).
    pub pure_projection: bool,
}

/// Batched multislice propagator for one frame shape.
pub struct SliceStepper {
    cfg: StepperConfig,
    ny: usize,
    nx: usize,
    fft: Fft2d,
    interslice: ComplexSoA,
}

impl SliceStepper {
    pub fn new(cfg: StepperConfig, frame: [usize; 2]) -> Self {
        let interslice = transfer_function_kernel(
            cfg.voxel_nm[2],
            cfg.lambda_nm,
            [cfg.voxel_nm[0], cfg.voxel_nm[1]],
            frame,
        );
        Self {
            cfg,
            ny: frame[0],
            nx: frame[1],
            fft: Fft2d::new(frame[0], frame[1]),
            interslice,
        }
    }

    pub fn config(&self) -> &StepperConfig {
        &self.cfg
    }

    pub fn frame(&self) -> [usize; 2] {
        [self.ny, self.nx]
    }

    /// Propagate one probe mode through a batch of object sub-volumes with
    /// uniform slice spacing.
    ///
    /// `kernel` overrides the stepper's own inter-slice kernel when given
    /// (callers may cache kernels by key). Returns `(re, im)` exit planes
    /// of shape `[batch, ny, nx]`.
    pub fn propagate_batch(
        &self,
        obj: ObjectBatchView<'_>,
        probe: ProbeIllumination<'_>,
        kernel: Option<&ComplexSoA>,
        free_prop: Option<FreePropagation>,
    ) -> (Vec<f32>, Vec<f32>) {
        self.check_shapes(&obj, &probe);
        let interslice = kernel.unwrap_or(&self.interslice);
        let frame = self.ny * self.nx;
        let mut out_re = vec![0.0f32; obj.batch * frame];
        let mut out_im = vec![0.0f32; obj.batch * frame];

        for b in 0..obj.batch {
            let (mut wre, mut wim) = self.init_wavefront(&probe, b);
            for z in 0..obj.nz {
                self.apply_slice(&obj, b, z, &mut wre, &mut wim);
                if z + 1 < obj.nz && !self.cfg.pure_projection {
                    self.propagation_step(&mut wre, &mut wim, interslice);
                }
            }
            self.free_space_leg(&mut wre, &mut wim, free_prop, None);
            out_re[b * frame..(b + 1) * frame].copy_from_slice(&wre);
            out_im[b * frame..(b + 1) * frame].copy_from_slice(&wim);
        }
        (out_re, out_im)
    }

    /// Propagate through slices at explicit, irregular z positions.
    ///
    /// `slice_pos_nm` gives the z coordinate of each slice (ascending, one
    /// per object slice); the kernel for each gap is rebuilt from the
    /// caller-supplied centered frequency meshes `u` / `v` (row-major
    /// `[ny, nx]` planes), as is the trailing free-space kernel.
    pub fn propagate_sparse_batch(
        &self,
        obj: ObjectBatchView<'_>,
        probe: ProbeIllumination<'_>,
        slice_pos_nm: &[f64],
        u: &[f32],
        v: &[f32],
        free_prop: Option<FreePropagation>,
    ) -> (Vec<f32>, Vec<f32>) {
        self.check_shapes(&obj, &probe);
        assert_eq!(
            slice_pos_nm.len(),
            obj.nz,
            "need one slice position per object slice ({} vs {})",
            slice_pos_nm.len(),
            obj.nz
        );
        assert_eq!(u.len(), self.ny * self.nx, "u mesh shape mismatch");
        assert_eq!(v.len(), self.ny * self.nx, "v mesh shape mismatch");

        // One kernel per inter-slice gap, shared across the batch.
        let gap_kernels: Vec<ComplexSoA> = slice_pos_nm
            .windows(2)
            .map(|w| transfer_function_kernel_from_mesh(w[1] - w[0], self.cfg.lambda_nm, u, v))
            .collect();

        let frame = self.ny * self.nx;
        let mut out_re = vec![0.0f32; obj.batch * frame];
        let mut out_im = vec![0.0f32; obj.batch * frame];

        for b in 0..obj.batch {
            let (mut wre, mut wim) = self.init_wavefront(&probe, b);
            for z in 0..obj.nz {
                self.apply_slice(&obj, b, z, &mut wre, &mut wim);
                if z + 1 < obj.nz && !self.cfg.pure_projection {
                    self.propagation_step(&mut wre, &mut wim, &gap_kernels[z]);
                }
            }
            self.free_space_leg(&mut wre, &mut wim, free_prop, Some((u, v)));
            out_re[b * frame..(b + 1) * frame].copy_from_slice(&wre);
            out_im[b * frame..(b + 1) * frame].copy_from_slice(&wim);
        }
        (out_re, out_im)
    }

    /// Apply one free-space hop with a caller-built kernel to a single
    /// `[ny, nx]` plane pair. Lets callers that parameterize the
    /// propagation distance (and so must own the kernel construction)
    /// reuse the stepper's FFT plan and shift convention.
    pub fn free_propagate(&self, re: &mut [f32], im: &mut [f32], kernel: &ComplexSoA) {
        assert_eq!(re.len(), self.ny * self.nx, "plane shape mismatch");
        assert_eq!(im.len(), self.ny * self.nx, "plane shape mismatch");
        self.propagation_step(re, im, kernel);
    }

    fn check_shapes(&self, obj: &ObjectBatchView<'_>, probe: &ProbeIllumination<'_>) {
        assert_eq!(
            [obj.ny, obj.nx],
            [self.ny, self.nx],
            "object frame [{}, {}] does not match stepper frame [{}, {}]",
            obj.ny,
            obj.nx,
            self.ny,
            self.nx
        );
        let frame = self.ny * self.nx;
        match probe {
            ProbeIllumination::Shared { re, im } => {
                assert_eq!(re.len(), frame, "shared probe plane shape mismatch");
                assert_eq!(im.len(), frame, "shared probe plane shape mismatch");
            }
            ProbeIllumination::PerPosition { re, im } => {
                assert_eq!(re.len(), obj.batch * frame, "per-position probe shape mismatch");
                assert_eq!(im.len(), obj.batch * frame, "per-position probe shape mismatch");
            }
        }
    }

    fn init_wavefront(&self, probe: &ProbeIllumination<'_>, b: usize) -> (Vec<f32>, Vec<f32>) {
        let frame = self.ny * self.nx;
        match probe {
            ProbeIllumination::Shared { re, im } => (re.to_vec(), im.to_vec()),
            ProbeIllumination::PerPosition { re, im } => (
                re[b * frame..(b + 1) * frame].to_vec(),
                im[b * frame..(b + 1) * frame].to_vec(),
            ),
        }
    }

    /// Multiply the wavefront by slice `z`'s transmission function.
    fn apply_slice(
        &self,
        obj: &ObjectBatchView<'_>,
        b: usize,
        z: usize,
        wre: &mut [f32],
        wim: &mut [f32],
    ) {
        match self.cfg.repr {
            ObjectRepr::PhaseAbsorption => {
                // t = exp(i·σ·k·δ) · exp(−k·β), k = 2π·Δz/λ
                let k = 2.0 * PI * self.cfg.voxel_nm[2] / self.cfg.lambda_nm;
                let sigma = self.cfg.sign.factor();
                for y in 0..obj.ny {
                    for x in 0..obj.nx {
                        let delta = obj.get(b, y, x, z, 0) as f64;
                        let beta = obj.get(b, y, x, z, 1) as f64;
                        let att = (-k * beta).exp();
                        let (s, c) = (sigma * k * delta).sin_cos();
                        let (tre, tim) = ((att * c) as f32, (att * s) as f32);
                        let i = y * obj.nx + x;
                        let r = wre[i];
                        let im = wim[i];
                        wre[i] = r * tre - im * tim;
                        wim[i] = r * tim + im * tre;
                    }
                }
            }
            ObjectRepr::RealImag => {
                // Channels are the transmission itself; no attenuation
                // model is applied beyond what the channels encode.
                for y in 0..obj.ny {
                    for x in 0..obj.nx {
                        let tre = obj.get(b, y, x, z, 0);
                        let tim = obj.get(b, y, x, z, 1);
                        let i = y * obj.nx + x;
                        let r = wre[i];
                        let im = wim[i];
                        wre[i] = r * tre - im * tim;
                        wim[i] = r * tim + im * tre;
                    }
                }
            }
        }
    }

    /// One free-space hop: forward FFT, kernel multiply under the
    /// configured shift convention, inverse FFT.
    fn propagation_step(&self, wre: &mut [f32], wim: &mut [f32], kernel: &ComplexSoA) {
        self.fft.forward(wre, wim);
        multiply_kernel(wre, wim, self.ny, self.nx, kernel, self.cfg.shift);
        self.fft.inverse(wre, wim);
    }

    fn free_space_leg(
        &self,
        wre: &mut [f32],
        wim: &mut [f32],
        free_prop: Option<FreePropagation>,
        mesh: Option<(&[f32], &[f32])>,
    ) {
        match free_prop {
            None => {}
            Some(FreePropagation::FarField) => {
                self.fft.forward(wre, wim);
                fftshift2(wre, wim, self.ny, self.nx);
            }
            Some(FreePropagation::Distance(dist_nm)) => {
                let kernel = match mesh {
                    Some((u, v)) => {
                        transfer_function_kernel_from_mesh(dist_nm, self.cfg.lambda_nm, u, v)
                    }
                    None => transfer_function_kernel(
                        dist_nm,
                        self.cfg.lambda_nm,
                        [self.cfg.voxel_nm[0], self.cfg.voxel_nm[1]],
                        [self.ny, self.nx],
                    ),
                };
                self.propagation_step(wre, wim, &kernel);
            }
        }
    }
}
