// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Measured diffraction data access
//!
//! The models never own the measured dataset; they pull frames through
//! [`DiffractionData`] by `(angle, position, downsample stride)`. Frames
//! are magnitudes — the provider takes the absolute value on read so
//! negative or complex-stored raw data cannot leak sign into the loss.

/// Random-access provider of measured diffraction magnitudes.
pub trait DiffractionData {
    fn n_angles(&self) -> usize;

    /// Scan positions (detector frames) per angle.
    fn n_positions(&self) -> usize;

    /// Native `[ny, nx]` frame shape.
    fn frame_shape(&self) -> [usize; 2];

    /// Magnitude frame at `(angle, position)`, strided by `stride ≥ 1` on
    /// both detector axes.
    fn frame(&self, angle: usize, position: usize, stride: usize) -> Vec<f32>;

    /// Frame shape after downsampling by `stride`.
    fn downsampled_shape(&self, stride: usize) -> [usize; 2] {
        let [ny, nx] = self.frame_shape();
        [ny.div_ceil(stride), nx.div_ceil(stride)]
    }
}

/// Fully resident dataset `[angle, position, y, x]`.
#[derive(Debug, Clone)]
pub struct InMemoryDiffraction {
    data: Vec<f32>,
    n_angles: usize,
    n_positions: usize,
    ny: usize,
    nx: usize,
}

impl InMemoryDiffraction {
    pub fn new(data: Vec<f32>, n_angles: usize, n_positions: usize, ny: usize, nx: usize) -> Self {
        assert_eq!(
            data.len(),
            n_angles * n_positions * ny * nx,
            "dataset length does not match [angle, position, y, x] shape"
        );
        Self {
            data,
            n_angles,
            n_positions,
            ny,
            nx,
        }
    }

    /// Stack per-position frames of one angle into a dataset with a single
    /// angle axis entry.
    pub fn from_frames(frames: &[Vec<f32>], ny: usize, nx: usize) -> Self {
        let mut data = Vec::with_capacity(frames.len() * ny * nx);
        for f in frames {
            assert_eq!(f.len(), ny * nx, "frame shape mismatch");
            data.extend_from_slice(f);
        }
        Self::new(data, 1, frames.len(), ny, nx)
    }
}

impl DiffractionData for InMemoryDiffraction {
    fn n_angles(&self) -> usize {
        self.n_angles
    }

    fn n_positions(&self) -> usize {
        self.n_positions
    }

    fn frame_shape(&self) -> [usize; 2] {
        [self.ny, self.nx]
    }

    fn frame(&self, angle: usize, position: usize, stride: usize) -> Vec<f32> {
        assert!(angle < self.n_angles, "angle {} out of range", angle);
        assert!(position < self.n_positions, "position {} out of range", position);
        let stride = stride.max(1);
        let base = (angle * self.n_positions + position) * self.ny * self.nx;
        let mut out = Vec::with_capacity(self.ny.div_ceil(stride) * self.nx.div_ceil(stride));
        let mut y = 0;
        while y < self.ny {
            let row = base + y * self.nx;
            let mut x = 0;
            while x < self.nx {
                out.push(self.data[row + x].abs());
                x += stride;
            }
            y += stride;
        }
        out
    }
}

/// Gather and stack the frames for a batch of position indices at one
/// angle. Returns the stacked data and the per-frame shape.
pub fn gather_frames(
    data: &dyn DiffractionData,
    angle: usize,
    indices: &[usize],
    stride: usize,
) -> (Vec<f32>, [usize; 2]) {
    let shape = data.downsampled_shape(stride.max(1));
    let mut out = Vec::with_capacity(indices.len() * shape[0] * shape[1]);
    for &i in indices {
        out.extend_from_slice(&data.frame(angle, i, stride));
    }
    (out, shape)
}

/// In-place preprocessing of raw transmission data into projection space:
/// clamp into `[2e-3, 1]`, take the negative log, zero out NaNs.
pub fn preprocess(dat: &mut [f32]) {
    for v in dat.iter_mut() {
        let clamped = v.abs().clamp(2e-3, 1.0);
        let out = -clamped.ln();
        *v = if out.is_nan() { 0.0 } else { out };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_access_and_abs() {
        let data = vec![1.0, -2.0, 3.0, -4.0];
        let d = InMemoryDiffraction::new(data, 1, 1, 2, 2);
        assert_eq!(d.frame(0, 0, 1), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_downsample_stride() {
        // 4×4 frame, stride 2 → rows 0, 2 and cols 0, 2.
        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let d = InMemoryDiffraction::new(data, 1, 1, 4, 4);
        assert_eq!(d.frame(0, 0, 2), vec![0.0, 2.0, 8.0, 10.0]);
        assert_eq!(d.downsampled_shape(2), [2, 2]);
        // Odd stride on even size keeps the ceiling count.
        assert_eq!(d.downsampled_shape(3), [2, 2]);
    }

    #[test]
    fn test_gather_preserves_index_order() {
        let mut frames = Vec::new();
        for i in 0..3 {
            frames.push(vec![i as f32; 4]);
        }
        let d = InMemoryDiffraction::from_frames(&frames, 2, 2);
        let (stacked, shape) = gather_frames(&d, 0, &[2, 0], 1);
        assert_eq!(shape, [2, 2]);
        assert_eq!(stacked[0], 2.0, "first requested index comes first");
        assert_eq!(stacked[4], 0.0);
    }

    #[test]
    fn test_preprocess_clamps_and_logs() {
        let mut dat = vec![0.5, 0.0, 2.0, f32::NAN];
        preprocess(&mut dat);
        assert!((dat[0] - 0.5f32.ln().abs()).abs() < 1e-6);
        assert!((dat[1] - (-(2e-3f32).ln())).abs() < 1e-3, "tiny values clamp to 2e-3");
        assert_eq!(dat[2], 0.0, "values above 1 clamp to 1, -ln(1) = 0");
        assert_eq!(dat[3], 0.0, "NaN zeroes out");
    }
}
