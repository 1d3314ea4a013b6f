// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! 2-D FFT helpers over SoA planes
//!
//! Thin wrapper around `rustfft` operating on separate `re[]` / `im[]`
//! planes. The inverse transform scales by `1/(ny·nx)` so that
//! `inverse(forward(x)) == x` (numpy "backward" normalization).
//!
//! The shift convention is explicit: [`FftShiftConvention::Centered`]
//! fftshifts the spectrum before a kernel multiply and ifftshifts after;
//! [`FftShiftConvention::Natural`] leaves the spectrum in natural order and
//! instead ifftshifts the (centered) kernel once. Both orderings compute
//! the same product; one convention must be used for every propagation in
//! a reconstruction, forward and backward alike — an invariant the
//! differentiating backend is expected to preserve, not something enforced
//! here.

use std::sync::Arc;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::complex::ComplexSoA;

/// Where the zero frequency sits when a spectrum meets a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FftShiftConvention {
    /// fftshift the spectrum, multiply a centered kernel, ifftshift back.
    Centered,
    /// Leave the spectrum in natural order; the kernel is ifftshifted once.
    Natural,
}

/// Planned 2-D FFT for a fixed `[ny, nx]` grid.
///
/// Plans are reused across calls; gather/scatter through a scratch buffer
/// keeps the SoA planes untouched except for the transform itself.
pub struct Fft2d {
    ny: usize,
    nx: usize,
    fwd_row: Arc<dyn Fft<f32>>,
    inv_row: Arc<dyn Fft<f32>>,
    fwd_col: Arc<dyn Fft<f32>>,
    inv_col: Arc<dyn Fft<f32>>,
}

impl Fft2d {
    pub fn new(ny: usize, nx: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            ny,
            nx,
            fwd_row: planner.plan_fft_forward(nx),
            inv_row: planner.plan_fft_inverse(nx),
            fwd_col: planner.plan_fft_forward(ny),
            inv_col: planner.plan_fft_inverse(ny),
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.ny, self.nx]
    }

    /// Forward 2-D FFT in place (no normalization).
    pub fn forward(&self, re: &mut [f32], im: &mut [f32]) {
        self.transform(re, im, false);
    }

    /// Inverse 2-D FFT in place, scaled by `1/(ny·nx)`.
    pub fn inverse(&self, re: &mut [f32], im: &mut [f32]) {
        self.transform(re, im, true);
        let scale = 1.0 / (self.ny * self.nx) as f32;
        for v in re.iter_mut() {
            *v *= scale;
        }
        for v in im.iter_mut() {
            *v *= scale;
        }
    }

    fn transform(&self, re: &mut [f32], im: &mut [f32], inverse: bool) {
        assert_eq!(re.len(), self.ny * self.nx, "plane shape mismatch");
        assert_eq!(im.len(), self.ny * self.nx, "plane shape mismatch");

        let row_fft = if inverse { &self.inv_row } else { &self.fwd_row };
        let col_fft = if inverse { &self.inv_col } else { &self.fwd_col };

        // Rows
        let mut buf: Vec<Complex32> = vec![Complex32::new(0.0, 0.0); self.nx.max(self.ny)];
        for r in 0..self.ny {
            let base = r * self.nx;
            for c in 0..self.nx {
                buf[c] = Complex32::new(re[base + c], im[base + c]);
            }
            row_fft.process(&mut buf[..self.nx]);
            for c in 0..self.nx {
                re[base + c] = buf[c].re;
                im[base + c] = buf[c].im;
            }
        }

        // Columns
        for c in 0..self.nx {
            for r in 0..self.ny {
                let i = r * self.nx + c;
                buf[r] = Complex32::new(re[i], im[i]);
            }
            col_fft.process(&mut buf[..self.ny]);
            for r in 0..self.ny {
                let i = r * self.nx + c;
                re[i] = buf[r].re;
                im[i] = buf[r].im;
            }
        }
    }
}

/// Circularly roll a row-major `[ny, nx]` plane by `(sy, sx)` (numpy `roll`
/// semantics: positive shifts move content toward higher indices, wrapping).
pub fn roll_plane(plane: &mut [f32], ny: usize, nx: usize, sy: i64, sx: i64) {
    assert_eq!(plane.len(), ny * nx);
    if ny == 0 || nx == 0 {
        return;
    }
    let sy = sy.rem_euclid(ny as i64) as usize;
    let sx = sx.rem_euclid(nx as i64) as usize;
    if sy == 0 && sx == 0 {
        return;
    }
    let mut out = vec![0.0f32; plane.len()];
    for y in 0..ny {
        let ty = (y + sy) % ny;
        for x in 0..nx {
            let tx = (x + sx) % nx;
            out[ty * nx + tx] = plane[y * nx + x];
        }
    }
    plane.copy_from_slice(&out);
}

/// fftshift both planes: zero frequency moves to the grid center.
pub fn fftshift2(re: &mut [f32], im: &mut [f32], ny: usize, nx: usize) {
    let sy = (ny / 2) as i64;
    let sx = (nx / 2) as i64;
    roll_plane(re, ny, nx, sy, sx);
    roll_plane(im, ny, nx, sy, sx);
}

/// ifftshift both planes: exact inverse of [`fftshift2`] (differs from it
/// by one sample on odd-length axes).
pub fn ifftshift2(re: &mut [f32], im: &mut [f32], ny: usize, nx: usize) {
    let sy = -((ny / 2) as i64);
    let sx = -((nx / 2) as i64);
    roll_plane(re, ny, nx, sy, sx);
    roll_plane(im, ny, nx, sy, sx);
}

/// Multiply a natural-order spectrum by a *centered* kernel under the given
/// shift convention.
///
/// `Centered` shifts the spectrum to meet the kernel; `Natural` shifts a
/// copy of the kernel to meet the spectrum. One full propagation step is
/// `forward → multiply_kernel → inverse`.
pub fn multiply_kernel(
    re: &mut [f32],
    im: &mut [f32],
    ny: usize,
    nx: usize,
    kernel: &ComplexSoA,
    convention: FftShiftConvention,
) {
    assert_eq!(kernel.len(), ny * nx, "kernel shape mismatch");
    match convention {
        FftShiftConvention::Centered => {
            fftshift2(re, im, ny, nx);
            crate::complex::mul_planes_in_place(re, im, &kernel.re, &kernel.im);
            ifftshift2(re, im, ny, nx);
        }
        FftShiftConvention::Natural => {
            let mut kre = kernel.re.clone();
            let mut kim = kernel.im.clone();
            ifftshift2(&mut kre, &mut kim, ny, nx);
            crate::complex::mul_planes_in_place(re, im, &kre, &kim);
        }
    }
}
