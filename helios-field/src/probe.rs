// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Probe adapter: defocus, sub-pixel shift, initial guesses
//!
//! The sub-pixel shift has a hard correctness boundary: when both shift
//! components are within 0.01 px of an integer, the shift is an *exact*
//! circular roll with zero interpolation error; otherwise it is a
//! Fourier-domain phase ramp. The integer path is not an optimization —
//! gradient-based position refinement depends on integer shifts being
//! bit-exact — so both paths must be preserved exactly as written.

use std::f64::consts::PI;

use helios_math::complex::ComplexSoA;
use helios_math::fft::{fftshift2, ifftshift2, multiply_kernel, roll_plane, Fft2d, FftShiftConvention};
use helios_math::kernel::transfer_function_kernel;
use helios_math::mesh::fftfreq;

use crate::wavefront::Wavefront;

/// Tolerance inside which a shift component counts as an integer.
const INTEGER_SHIFT_TOL: f64 = 0.01;

/// Apply a defocus of `dist_nm` to every probe mode: frequency-domain
/// convolution with the Fresnel transfer function at that distance.
pub fn defocus(
    probe: &mut Wavefront,
    dist_nm: f64,
    lambda_nm: f64,
    pixel_size_nm: [f64; 2],
    convention: FftShiftConvention,
) {
    let kernel = transfer_function_kernel(dist_nm, lambda_nm, pixel_size_nm, [probe.ny, probe.nx]);
    convolve_with_kernel(probe, &kernel, convention);
}

/// Frequency-domain convolution of every probe mode with a centered
/// kernel.
pub fn convolve_with_kernel(
    probe: &mut Wavefront,
    kernel: &ComplexSoA,
    convention: FftShiftConvention,
) {
    let (ny, nx) = (probe.ny, probe.nx);
    assert_eq!(kernel.len(), ny * nx, "kernel shape mismatch");
    let fft = Fft2d::new(ny, nx);
    for m in 0..probe.modes {
        let (re, im) = probe.mode_planes_mut(m);
        fft.forward(re, im);
        multiply_kernel(re, im, ny, nx, kernel, convention);
        fft.inverse(re, im);
    }
}

/// Whether a shift vector takes the exact circular-roll path.
#[inline]
pub fn is_integer_shift(shift: [f64; 2]) -> bool {
    (shift[0] - shift[0].round()).abs() < INTEGER_SHIFT_TOL
        && (shift[1] - shift[1].round()).abs() < INTEGER_SHIFT_TOL
}

/// Shift one complex plane by `(shift_y, shift_x)` pixels.
///
/// Integer shifts (within 0.01 px on both axes) perform an exact circular
/// roll; fractional shifts multiply the spectrum by
/// `exp(−i·2π·(f_y·s_y + f_x·s_x))` and inverse-transform.
pub fn subpixel_shift_plane(re: &mut [f32], im: &mut [f32], ny: usize, nx: usize, shift: [f64; 2]) {
    assert_eq!(re.len(), ny * nx, "plane shape mismatch");
    assert_eq!(im.len(), ny * nx, "plane shape mismatch");

    if is_integer_shift(shift) {
        let sy = shift[0].round() as i64;
        let sx = shift[1].round() as i64;
        roll_plane(re, ny, nx, sy, sx);
        roll_plane(im, ny, nx, sy, sx);
        return;
    }

    let fy = fftfreq(ny);
    let fx = fftfreq(nx);
    let fft = Fft2d::new(ny, nx);
    fft.forward(re, im);
    for y in 0..ny {
        let py = fy[y] * shift[0];
        for x in 0..nx {
            let phase = -2.0 * PI * (py + fx[x] * shift[1]);
            let (s, c) = (phase.sin() as f32, phase.cos() as f32);
            let i = y * nx + x;
            let r = re[i];
            let om = im[i];
            re[i] = r * c - om * s;
            im[i] = r * s + om * c;
        }
    }
    fft.inverse(re, im);
}

/// Shift every mode of a probe along its spatial axes.
pub fn shift_wavefront(probe: &mut Wavefront, shift: [f64; 2]) {
    let (ny, nx) = (probe.ny, probe.nx);
    for m in 0..probe.modes {
        let (re, im) = probe.mode_planes_mut(m);
        subpixel_shift_plane(re, im, ny, nx, shift);
    }
}

/// Shift a real-valued image (e.g. a measured magnitude frame) in place.
///
/// Integer shifts roll the image directly; fractional shifts go through
/// the Fourier path and keep the magnitude of the complex result, the way
/// measured frames are realigned.
pub fn shift_real_image(img: &mut [f32], ny: usize, nx: usize, shift: [f64; 2]) {
    if is_integer_shift(shift) {
        roll_plane(img, ny, nx, shift[0].round() as i64, shift[1].round() as i64);
        return;
    }
    let mut im = vec![0.0f32; img.len()];
    subpixel_shift_plane(img, &mut im, ny, nx, shift);
    for (r, i) in img.iter_mut().zip(im.iter()) {
        *r = (*r * *r + *i * *i).sqrt();
    }
}

/// Build an initial probe guess by back-propagating an averaged measured
/// magnitude frame from the detector to the sample plane: multiply the
/// centered spectrum by the kernel for `−dist_nm` and inverse-transform.
pub fn backpropagated_guess(
    mean_magnitude: &[f32],
    ny: usize,
    nx: usize,
    dist_nm: f64,
    lambda_nm: f64,
    pixel_size_nm: [f64; 2],
) -> Wavefront {
    assert_eq!(mean_magnitude.len(), ny * nx, "frame shape mismatch");
    let kernel = transfer_function_kernel(-dist_nm, lambda_nm, pixel_size_nm, [ny, nx]);

    let mut probe = Wavefront::zeros(1, ny, nx);
    {
        let (re, im) = probe.mode_planes_mut(0);
        re.copy_from_slice(mean_magnitude);
        let fft = Fft2d::new(ny, nx);
        fft.forward(re, im);
        fftshift2(re, im, ny, nx);
        helios_math::complex::mul_planes_in_place(re, im, &kernel.re, &kernel.im);
        ifftshift2(re, im, ny, nx);
        fft.inverse(re, im);
    }
    probe
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_plane(ny: usize, nx: usize) -> (Vec<f32>, Vec<f32>) {
        let re: Vec<f32> = (0..ny * nx).map(|i| (i as f32 * 0.17).sin()).collect();
        let im: Vec<f32> = (0..ny * nx).map(|i| (i as f32 * 0.29).cos()).collect();
        (re, im)
    }

    fn energy(re: &[f32], im: &[f32]) -> f64 {
        re.iter()
            .zip(im.iter())
            .map(|(&r, &i)| (r as f64).powi(2) + (i as f64).powi(2))
            .sum()
    }

    #[test]
    fn test_integer_shift_is_exact_roll() {
        let (ny, nx) = (6, 5);
        let (re0, im0) = ramp_plane(ny, nx);

        for shift in [[1.0, 0.0], [0.0, -2.0], [3.0, 2.0], [-1.0, -1.0], [2.004, -0.996]] {
            let mut re = re0.clone();
            let mut im = im0.clone();
            subpixel_shift_plane(&mut re, &mut im, ny, nx, shift);

            let mut rre = re0.clone();
            let mut rim = im0.clone();
            roll_plane(&mut rre, ny, nx, shift[0].round() as i64, shift[1].round() as i64);
            roll_plane(&mut rim, ny, nx, shift[0].round() as i64, shift[1].round() as i64);

            // Bit-exact: the integer path must not touch the values.
            assert_eq!(re, rre, "integer shift {:?} must be an exact roll", shift);
            assert_eq!(im, rim);
        }
    }

    #[test]
    fn test_fractional_shift_conserves_energy() {
        let (ny, nx) = (8, 8);
        let (mut re, mut im) = ramp_plane(ny, nx);
        let e0 = energy(&re, &im);
        subpixel_shift_plane(&mut re, &mut im, ny, nx, [0.5, -1.3]);
        let e1 = energy(&re, &im);
        assert!(
            (e1 - e0).abs() / e0 < 1e-5,
            "fractional shift should conserve energy: {} vs {}",
            e0,
            e1
        );
    }

    #[test]
    fn test_fractional_then_inverse_restores() {
        let (ny, nx) = (8, 8);
        let (re0, im0) = ramp_plane(ny, nx);
        let mut re = re0.clone();
        let mut im = im0.clone();
        subpixel_shift_plane(&mut re, &mut im, ny, nx, [0.4, 0.7]);
        subpixel_shift_plane(&mut re, &mut im, ny, nx, [-0.4, -0.7]);
        for i in 0..ny * nx {
            assert!((re[i] - re0[i]).abs() < 1e-5);
            assert!((im[i] - im0[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_half_pixel_shifts_compose_to_integer() {
        // Two half-pixel Fourier shifts equal one exact one-pixel roll.
        let (ny, nx) = (8, 8);
        let (re0, im0) = ramp_plane(ny, nx);

        let mut re = re0.clone();
        let mut im = im0.clone();
        subpixel_shift_plane(&mut re, &mut im, ny, nx, [0.5, 0.0]);
        subpixel_shift_plane(&mut re, &mut im, ny, nx, [0.5, 0.0]);

        let mut rre = re0.clone();
        let mut rim = im0.clone();
        roll_plane(&mut rre, ny, nx, 1, 0);
        roll_plane(&mut rim, ny, nx, 1, 0);

        for i in 0..ny * nx {
            assert!((re[i] - rre[i]).abs() < 1e-4);
            assert!((im[i] - rim[i]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_defocus_conserves_energy() {
        let mut probe = Wavefront::spot(16, 16, 6);
        let e0 = probe.energy();
        defocus(&mut probe, 2.0e4, 0.1, [10.0, 10.0], FftShiftConvention::Centered);
        let e1 = probe.energy();
        assert!((e1 - e0).abs() / e0 < 1e-4, "defocus is unitary: {} vs {}", e0, e1);
        // And actually spreads the field beyond the original support.
        let (re, im) = probe.mode_planes(0);
        let corner = re[0] * re[0] + im[0] * im[0];
        assert!(corner.abs() > 0.0 || e1 > 0.0);
    }

    #[test]
    fn test_backpropagated_guess_roundtrip() {
        // Back-propagating then defocusing forward by the same distance
        // recovers the original magnitude frame.
        let (ny, nx) = (16, 16);
        let frame: Vec<f32> = helios_math::phantom::generate_disk([ny, nx], 4.0, 2);
        let dist = 5.0e4;

        let mut probe = backpropagated_guess(&frame, ny, nx, dist, 0.1, [10.0, 10.0]);
        defocus(&mut probe, dist, 0.1, [10.0, 10.0], FftShiftConvention::Centered);

        let (re, im) = probe.mode_planes(0);
        for i in 0..ny * nx {
            let mag = (re[i] * re[i] + im[i] * im[i]).sqrt();
            assert!(
                (mag - frame[i]).abs() < 1e-3,
                "pixel {}: {} vs {}",
                i,
                mag,
                frame[i]
            );
        }
    }
}
