// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Fresnel free-space propagation kernels
//!
//! The transfer-function (TF) kernel is the frequency-domain multiplier
//!
//!   H(u, v) = exp(i·k·d) · exp(−i·π·λ·d·(u² + v²)),   k = 2π/λ
//!
//! evaluated on centered frequency meshes, so |H| = 1 everywhere (pure
//! phase). The impulse-response (IR) kernel is the Fourier transform of the
//! real-space Fresnel chirp and is kept for completeness; production
//! selection always uses the TF form regardless of the critical-sampling
//! criterion — a deliberate determinism choice (identical kernel algebra on
//! every evaluation) rather than an oversight. [`select_kernel_form`]
//! still computes and logs the criterion.
//!
//! All kernels are pure functions of their inputs; callers may cache by
//! `(distance, wavelength, pixel size, shape)`.

use std::f64::consts::PI;

use tracing::debug;

use crate::complex::ComplexSoA;
use crate::fft::{fftshift2, Fft2d};
use crate::mesh::{centered_axis, frequency_sq_mesh};

/// Which Fresnel kernel algebra to use for a propagation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelForm {
    /// Frequency-domain transfer function (always selected in production).
    TransferFunction,
    /// Real-space impulse response, Fourier-transformed.
    ImpulseResponse,
}

/// Transfer-function Fresnel kernel on a centered frequency mesh.
///
/// Distances and lengths are in nm. The returned plane is row-major
/// `[shape[0], shape[1]]` with the zero frequency at the grid center.
pub fn transfer_function_kernel(
    dist_nm: f64,
    lambda_nm: f64,
    pixel_size_nm: [f64; 2],
    shape: [usize; 2],
) -> ComplexSoA {
    let k = 2.0 * PI / lambda_nm;
    let quad = frequency_sq_mesh(pixel_size_nm, shape);

    let n = shape[0] * shape[1];
    let mut out = ComplexSoA::zeros(n);
    let pild = PI * lambda_nm * dist_nm;
    let kd = k * dist_nm;
    for i in 0..n {
        let phase = kd - pild * quad[i];
        out.re[i] = phase.cos() as f32;
        out.im[i] = phase.sin() as f32;
    }
    out
}

/// Transfer-function kernel evaluated on caller-supplied frequency meshes.
///
/// The sparse multislice path rebuilds a kernel per inter-slice gap from
/// precomputed `u` / `v` planes instead of a fixed pixel size.
pub fn transfer_function_kernel_from_mesh(
    dist_nm: f64,
    lambda_nm: f64,
    u: &[f32],
    v: &[f32],
) -> ComplexSoA {
    assert_eq!(u.len(), v.len(), "frequency meshes must match");
    let k = 2.0 * PI / lambda_nm;
    let kd = k * dist_nm;
    let pild = PI * lambda_nm * dist_nm;

    let mut out = ComplexSoA::zeros(u.len());
    for i in 0..u.len() {
        let q = (u[i] as f64) * (u[i] as f64) + (v[i] as f64) * (v[i] as f64);
        let phase = kd - pild * q;
        out.re[i] = phase.cos() as f32;
        out.im[i] = phase.sin() as f32;
    }
    out
}

/// Impulse-response Fresnel kernel: real-space chirp
/// `h = exp(i·k·d)/(i·λ·d) · exp(i·k/(2d)·(x² + y²))`, Fourier-transformed
/// and centered, scaled by the pixel area.
pub fn impulse_response_kernel(
    dist_nm: f64,
    lambda_nm: f64,
    pixel_size_nm: [f64; 2],
    shape: [usize; 2],
) -> ComplexSoA {
    let k = 2.0 * PI / lambda_nm;
    let half_y = shape[0] as f64 * pixel_size_nm[0] / 2.0;
    let half_x = shape[1] as f64 * pixel_size_nm[1] / 2.0;
    let ys = centered_axis(half_y, shape[0]);
    let xs = centered_axis(half_x, shape[1]);

    // 1/(i·λ·d) = -i/(λ·d)
    let inv_mag = 1.0 / (lambda_nm * dist_nm);
    let kd = k * dist_nm;
    let (pre_re, pre_im) = (kd.sin() * inv_mag, -kd.cos() * inv_mag);

    let n = shape[0] * shape[1];
    let mut re = Vec::with_capacity(n);
    let mut im = Vec::with_capacity(n);
    for &y in &ys {
        for &x in &xs {
            let chirp = k / (2.0 * dist_nm) * (x * x + y * y);
            let (s, c) = chirp.sin_cos();
            re.push((pre_re * c - pre_im * s) as f32);
            im.push((pre_re * s + pre_im * c) as f32);
        }
    }

    let fft = Fft2d::new(shape[0], shape[1]);
    fft.forward(&mut re, &mut im);
    fftshift2(&mut re, &mut im, shape[0], shape[1]);

    let area = (pixel_size_nm[0] * pixel_size_nm[1]) as f32;
    let mut out = ComplexSoA::from_parts(re, im);
    out.scale(area);
    out
}

/// Spherical (point-projection) propagation kernel over angular frequency
/// coordinates, for a source at radius `r_nm` propagated by `dist_nm`.
pub fn spherical_kernel(
    dist_nm: f64,
    lambda_nm: f64,
    r_nm: f64,
    theta_max: f64,
    phi_max: f64,
    shape: [usize; 2],
) -> ComplexSoA {
    let k = 2.0 * PI / lambda_nm;
    let curvature = 1.0 / (r_nm + dist_nm) - 1.0 / r_nm;

    let k_theta: Vec<f64> = (0..shape[0])
        .map(|i| PI / theta_max * (i as f64 - (shape[0] as f64 - 1.0) / 2.0))
        .collect();
    let k_phi: Vec<f64> = (0..shape[1])
        .map(|i| PI / phi_max * (i as f64 - (shape[1] as f64 - 1.0) / 2.0))
        .collect();

    let mut out = ComplexSoA::zeros(shape[0] * shape[1]);
    let mut idx = 0;
    for &kt in &k_theta {
        for &kp in &k_phi {
            let phase = -1.0 / (2.0 * k) * (kt * kt + kp * kp) * curvature;
            out.re[idx] = phase.cos() as f32;
            out.im[idx] = phase.sin() as f32;
            idx += 1;
        }
    }
    out
}

/// Decide which kernel form the sampling criterion would prefer, then
/// return the production choice.
///
/// The textbook rule: TF when the mean voxel pitch exceeds the critical
/// sampling length `λ·d / l` (l = cube-root extent of the propagated
/// volume), IR otherwise. The criterion is logged and the TF form is
/// returned unconditionally; see the module docs.
pub fn select_kernel_form(
    dist_nm: f64,
    lambda_nm: f64,
    mean_voxel_nm: f64,
    extent_nm: f64,
) -> KernelForm {
    let crit_samp = lambda_nm * dist_nm / extent_nm;
    let preferred = if mean_voxel_nm > crit_samp {
        KernelForm::TransferFunction
    } else {
        KernelForm::ImpulseResponse
    };
    debug!(
        crit_samp_nm = crit_samp,
        mean_voxel_nm,
        ?preferred,
        "Fresnel sampling criterion evaluated; using transfer-function form"
    );
    KernelForm::TransferFunction
}
