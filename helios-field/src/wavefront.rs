// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Wavefront storage and probe initializers
//!
//! A [`Wavefront`] is a multi-mode complex illumination field stored as
//! separate `re[]` / `im[]` planes `[mode, y, x]`; a [`WavefrontBatch`]
//! adds a leading batch axis for per-scan-position exit waves. Mode
//! intensities always combine incoherently (Σ|ψ_m|²) — modes are the
//! coherent components of a partially coherent beam.

use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Multi-mode complex wavefront `[mode, ny, nx]` as SoA planes.
#[derive(Debug, Clone, PartialEq)]
pub struct Wavefront {
    pub re: Vec<f32>,
    pub im: Vec<f32>,
    pub modes: usize,
    pub ny: usize,
    pub nx: usize,
}

impl Wavefront {
    pub fn zeros(modes: usize, ny: usize, nx: usize) -> Self {
        let n = modes * ny * nx;
        Self {
            re: vec![0.0; n],
            im: vec![0.0; n],
            modes,
            ny,
            nx,
        }
    }

    /// Uniform unit-amplitude plane wave (single mode).
    pub fn plane(ny: usize, nx: usize) -> Self {
        let mut w = Self::zeros(1, ny, nx);
        w.re.fill(1.0);
        w
    }

    /// Square spot of unit amplitude, `width` pixels on a side, centered.
    pub fn spot(ny: usize, nx: usize, width: usize) -> Self {
        let mut w = Self::zeros(1, ny, nx);
        let radius = width / 2;
        let cy = ny / 2;
        let cx = nx / 2;
        let y0 = cy.saturating_sub(radius);
        let x0 = cx.saturating_sub(radius);
        for y in y0..(y0 + width).min(ny) {
            for x in x0..(x0 + width).min(nx) {
                w.re[y * nx + x] = 1.0;
            }
        }
        w
    }

    /// Diverging spherical wave from a point source `dist_nm` upstream.
    pub fn spherical(
        ny: usize,
        nx: usize,
        pixel_size_nm: [f64; 2],
        lambda_nm: f64,
        dist_nm: f64,
    ) -> Self {
        let mut w = Self::zeros(1, ny, nx);
        let half_y = (ny as f64 - 1.0) * pixel_size_nm[0] / 2.0;
        let half_x = (nx as f64 - 1.0) * pixel_size_nm[1] / 2.0;
        for y in 0..ny {
            let yy = y as f64 * pixel_size_nm[0] - half_y;
            for x in 0..nx {
                let xx = x as f64 * pixel_size_nm[1] - half_x;
                let r = (xx * xx + yy * yy + dist_nm * dist_nm).sqrt();
                let phase = -2.0 * PI * r / lambda_nm;
                let i = y * nx + x;
                w.re[i] = phase.cos() as f32;
                w.im[i] = phase.sin() as f32;
            }
        }
        w
    }

    /// Point-projection-lens wavefront: a lens of focal length `focal_nm`
    /// a distance `lens_sample_dist_nm` upstream of the sample.
    pub fn point_projection_lens(
        ny: usize,
        nx: usize,
        pixel_size_nm: [f64; 2],
        lambda_nm: f64,
        focal_nm: f64,
        lens_sample_dist_nm: f64,
    ) -> Self {
        let mut w = Self::zeros(1, ny, nx);
        let half_y = (ny as f64 - 1.0) * pixel_size_nm[0] / 2.0;
        let half_x = (nx as f64 - 1.0) * pixel_size_nm[1] / 2.0;
        for y in 0..ny {
            let yy = y as f64 * pixel_size_nm[0] - half_y;
            for x in 0..nx {
                let xx = x as f64 * pixel_size_nm[1] - half_x;
                let r = (xx * xx + yy * yy).sqrt();
                let theta = (r / (lens_sample_dist_nm - focal_nm)).atan();
                let path = (lens_sample_dist_nm / theta.cos()).rem_euclid(lambda_nm);
                let phase = 2.0 * PI * path / lambda_nm;
                // 1 + i·tan(φ), normalized to unit amplitude.
                let t = phase.tan();
                let mag = (1.0 + t * t).sqrt();
                let i = y * nx + x;
                w.re[i] = (1.0 / mag) as f32;
                w.im[i] = (t / mag) as f32;
            }
        }
        w
    }

    /// Deterministic random wavefront for fixtures: amplitudes in
    /// `[0, amplitude]`, uniform phase.
    pub fn random(modes: usize, ny: usize, nx: usize, seed: u64, amplitude: f32) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut w = Self::zeros(modes, ny, nx);
        for i in 0..w.re.len() {
            let a = rng.gen_range(0.0..amplitude as f64);
            let ph = rng.gen_range(0.0..2.0 * PI);
            w.re[i] = (a * ph.cos()) as f32;
            w.im[i] = (a * ph.sin()) as f32;
        }
        w
    }

    #[inline]
    pub fn idx(&self, m: usize, y: usize, x: usize) -> usize {
        (m * self.ny + y) * self.nx + x
    }

    /// Borrow one mode's planes.
    pub fn mode_planes(&self, m: usize) -> (&[f32], &[f32]) {
        let n = self.ny * self.nx;
        (&self.re[m * n..(m + 1) * n], &self.im[m * n..(m + 1) * n])
    }

    /// Mutably borrow one mode's planes.
    pub fn mode_planes_mut(&mut self, m: usize) -> (&mut [f32], &mut [f32]) {
        let n = self.ny * self.nx;
        (&mut self.re[m * n..(m + 1) * n], &mut self.im[m * n..(m + 1) * n])
    }

    /// Pad the spatial axes of every mode by `[[y_lo, y_hi], [x_lo, x_hi]]`
    /// with a constant complex fill (vacuum illumination pads with
    /// `1 + 0i` so padded regions transmit freely).
    pub fn pad_spatial(&self, pads: [[usize; 2]; 2], fill: (f32, f32)) -> Wavefront {
        let ny = self.ny + pads[0][0] + pads[0][1];
        let nx = self.nx + pads[1][0] + pads[1][1];
        let mut out = Wavefront::zeros(self.modes, ny, nx);
        out.re.fill(fill.0);
        out.im.fill(fill.1);
        for m in 0..self.modes {
            for y in 0..self.ny {
                let src = (m * self.ny + y) * self.nx;
                let dst = (m * ny + y + pads[0][0]) * nx + pads[1][0];
                out.re[dst..dst + self.nx].copy_from_slice(&self.re[src..src + self.nx]);
                out.im[dst..dst + self.nx].copy_from_slice(&self.im[src..src + self.nx]);
            }
        }
        out
    }

    /// Copy a `[wy, wx]` spatial window of every mode starting at
    /// `(y0, x0)`.
    pub fn crop_window(&self, y0: usize, x0: usize, wy: usize, wx: usize) -> Wavefront {
        assert!(
            y0 + wy <= self.ny && x0 + wx <= self.nx,
            "probe crop [{}+{}, {}+{}] exceeds frame [{}, {}]",
            y0,
            wy,
            x0,
            wx,
            self.ny,
            self.nx
        );
        let mut out = Wavefront::zeros(self.modes, wy, wx);
        for m in 0..self.modes {
            for y in 0..wy {
                let src = (m * self.ny + y0 + y) * self.nx + x0;
                let dst = (m * wy + y) * wx;
                out.re[dst..dst + wx].copy_from_slice(&self.re[src..src + wx]);
                out.im[dst..dst + wx].copy_from_slice(&self.im[src..src + wx]);
            }
        }
        out
    }

    /// Total squared-magnitude energy over all modes, accumulated in f64.
    pub fn energy(&self) -> f64 {
        self.re
            .iter()
            .zip(self.im.iter())
            .map(|(&r, &i)| (r as f64) * (r as f64) + (i as f64) * (i as f64))
            .sum()
    }
}

/// Batched multi-mode wavefront `[batch, mode, ny, nx]` as SoA planes.
#[derive(Debug, Clone, PartialEq)]
pub struct WavefrontBatch {
    pub re: Vec<f32>,
    pub im: Vec<f32>,
    pub batch: usize,
    pub modes: usize,
    pub ny: usize,
    pub nx: usize,
}

impl WavefrontBatch {
    pub fn zeros(batch: usize, modes: usize, ny: usize, nx: usize) -> Self {
        let n = batch * modes * ny * nx;
        Self {
            re: vec![0.0; n],
            im: vec![0.0; n],
            batch,
            modes,
            ny,
            nx,
        }
    }

    #[inline]
    pub fn idx(&self, b: usize, m: usize, y: usize, x: usize) -> usize {
        ((b * self.modes + m) * self.ny + y) * self.nx + x
    }

    /// Borrow one `(batch, mode)` plane pair.
    pub fn plane(&self, b: usize, m: usize) -> (&[f32], &[f32]) {
        let n = self.ny * self.nx;
        let start = (b * self.modes + m) * n;
        (&self.re[start..start + n], &self.im[start..start + n])
    }

    /// Overwrite one `(batch, mode)` plane pair.
    pub fn set_plane(&mut self, b: usize, m: usize, re: &[f32], im: &[f32]) {
        let n = self.ny * self.nx;
        assert_eq!(re.len(), n, "plane shape mismatch");
        assert_eq!(im.len(), n, "plane shape mismatch");
        let start = (b * self.modes + m) * n;
        self.re[start..start + n].copy_from_slice(re);
        self.im[start..start + n].copy_from_slice(im);
    }

    /// Concatenate along the batch axis. Mode count and frame shape must
    /// match.
    pub fn concat(parts: Vec<WavefrontBatch>) -> WavefrontBatch {
        assert!(!parts.is_empty(), "cannot concatenate an empty batch list");
        let (modes, ny, nx) = (parts[0].modes, parts[0].ny, parts[0].nx);
        let total: usize = parts.iter().map(|p| p.batch).sum();
        let mut out = WavefrontBatch::zeros(0, modes, ny, nx);
        out.batch = total;
        out.re = Vec::with_capacity(total * modes * ny * nx);
        out.im = Vec::with_capacity(total * modes * ny * nx);
        for p in parts {
            assert_eq!(
                (p.modes, p.ny, p.nx),
                (modes, ny, nx),
                "cannot concatenate mismatched wavefront batches"
            );
            out.re.extend_from_slice(&p.re);
            out.im.extend_from_slice(&p.im);
        }
        out
    }

    /// Incoherent mode mixing: per-pixel intensity `Σ_m |ψ_m|²`, shape
    /// `[batch, ny, nx]`.
    pub fn intensity(&self) -> Vec<f32> {
        let frame = self.ny * self.nx;
        let mut out = vec![0.0f32; self.batch * frame];
        for b in 0..self.batch {
            for m in 0..self.modes {
                let (re, im) = self.plane(b, m);
                let base = b * frame;
                for i in 0..frame {
                    out[base + i] += re[i] * re[i] + im[i] * im[i];
                }
            }
        }
        out
    }

    /// Predicted detector magnitude `sqrt(Σ_m |ψ_m|²)`, shape
    /// `[batch, ny, nx]`.
    pub fn magnitude(&self) -> Vec<f32> {
        let mut out = self.intensity();
        for v in out.iter_mut() {
            *v = v.sqrt();
        }
        out
    }

    /// Crop every frame to a centered-at-offset `[wy, wx]` window starting
    /// at `(y0, x0)`. Used to strip halo borders before the loss.
    pub fn crop_frames(&self, y0: usize, x0: usize, wy: usize, wx: usize) -> WavefrontBatch {
        assert!(
            y0 + wy <= self.ny && x0 + wx <= self.nx,
            "frame crop [{}+{}, {}+{}] exceeds frame [{}, {}]",
            y0,
            wy,
            x0,
            wx,
            self.ny,
            self.nx
        );
        let mut out = WavefrontBatch::zeros(self.batch, self.modes, wy, wx);
        for b in 0..self.batch {
            for m in 0..self.modes {
                let (sre, sim) = self.plane(b, m);
                for y in 0..wy {
                    let src = (y0 + y) * self.nx + x0;
                    let dst = ((b * self.modes + m) * wy + y) * wx;
                    out.re[dst..dst + wx].copy_from_slice(&sre[src..src + wx]);
                    out.im[dst..dst + wx].copy_from_slice(&sim[src..src + wx]);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_probe_is_unit() {
        let w = Wavefront::plane(4, 4);
        assert!(w.re.iter().all(|&v| v == 1.0));
        assert!(w.im.iter().all(|&v| v == 0.0));
        assert!((w.energy() - 16.0).abs() < 1e-12);
    }

    #[test]
    fn test_spot_support() {
        let w = Wavefront::spot(8, 8, 4);
        let lit: usize = w.re.iter().filter(|&&v| v > 0.0).count();
        assert_eq!(lit, 16, "4×4 spot should light 16 pixels");
        assert_eq!(w.re[0], 0.0, "corner stays dark");
    }

    #[test]
    fn test_spherical_unit_amplitude() {
        let w = Wavefront::spherical(6, 6, [10.0, 10.0], 0.1, 1.0e5);
        for i in 0..36 {
            let mag = (w.re[i] * w.re[i] + w.im[i] * w.im[i]).sqrt();
            assert!((mag - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_point_projection_lens_unit_amplitude() {
        let w = Wavefront::point_projection_lens(8, 8, [10.0, 10.0], 0.1, 1.0e5, 5.0e5);
        for i in 0..64 {
            let mag = (w.re[i] * w.re[i] + w.im[i] * w.im[i]).sqrt();
            assert!((mag - 1.0).abs() < 1e-5, "|w[{}]| = {}", i, mag);
        }
    }

    #[test]
    fn test_random_is_deterministic_per_seed() {
        let a = Wavefront::random(2, 4, 4, 7, 0.5);
        let b = Wavefront::random(2, 4, 4, 7, 0.5);
        let c = Wavefront::random(2, 4, 4, 8, 0.5);
        assert_eq!(a, b, "same seed reproduces the same field");
        assert_ne!(a, c, "different seeds differ");
        let peak = a
            .re
            .iter()
            .zip(a.im.iter())
            .map(|(&r, &i)| (r * r + i * i).sqrt())
            .fold(0.0f32, f32::max);
        assert!(peak <= 0.5 + 1e-6, "amplitude bound respected");
    }

    #[test]
    fn test_incoherent_mode_mixing() {
        // Two modes with amplitudes 1 and 2 → intensity 1 + 4 everywhere.
        let mut w = WavefrontBatch::zeros(1, 2, 2, 2);
        let ones = vec![1.0f32; 4];
        let twos = vec![2.0f32; 4];
        let zeros = vec![0.0f32; 4];
        w.set_plane(0, 0, &ones, &zeros);
        w.set_plane(0, 1, &zeros, &twos);

        let intensity = w.intensity();
        assert!(intensity.iter().all(|&v| (v - 5.0).abs() < 1e-6));
        let mag = w.magnitude();
        assert!(mag.iter().all(|&v| (v - 5.0f32.sqrt()).abs() < 1e-6));
    }

    #[test]
    fn test_concat_preserves_order() {
        let mut a = WavefrontBatch::zeros(1, 1, 1, 2);
        a.re[0] = 1.0;
        let mut b = WavefrontBatch::zeros(2, 1, 1, 2);
        b.re[0] = 2.0;
        b.re[2] = 3.0;
        let cat = WavefrontBatch::concat(vec![a, b]);
        assert_eq!(cat.batch, 3);
        assert_eq!(cat.re[0], 1.0);
        assert_eq!(cat.plane(1, 0).0[0], 2.0);
        assert_eq!(cat.plane(2, 0).0[0], 3.0);
    }

    #[test]
    fn test_crop_frames() {
        let mut w = WavefrontBatch::zeros(1, 1, 4, 4);
        for i in 0..16 {
            w.re[i] = i as f32;
        }
        let c = w.crop_frames(1, 1, 2, 2);
        assert_eq!(c.re, vec![5.0, 6.0, 9.0, 10.0]);
    }
}
