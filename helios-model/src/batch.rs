// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Scan-position batching and sub-volume extraction
//!
//! Scan positions arrive as one minibatch per model call and are split
//! into sub-batches of at most `n_dp_batch` positions (ceiling division).
//! Before extraction the object is padded so every window — optionally
//! inflated by a halo — lands inside the array: per axis,
//! `lo = max(0, −min pos)` and `hi = max(0, max pos + window − size)`.
//! Padded voxels carry the identity transmission for the active
//! representation.

use std::ops::Range;

use helios_field::volume::{ObjectBatch, ObjectRepr, ObjectVolume};
use helios_field::wavefront::{Wavefront, WavefrontBatch};

/// Split `n` items into contiguous sub-batches of at most `max_size`.
pub fn split_batches(n: usize, max_size: usize) -> Vec<Range<usize>> {
    assert!(max_size > 0, "sub-batch size must be positive");
    let mut out = Vec::with_capacity(n.div_ceil(max_size));
    let mut start = 0;
    while start < n {
        let end = (start + max_size).min(n);
        out.push(start..end);
        start = end;
    }
    out
}

/// Round fractional scan positions to the pixel grid.
pub fn round_positions(positions: &[[f64; 2]]) -> Vec<[i64; 2]> {
    positions
        .iter()
        .map(|p| [p[0].round() as i64, p[1].round() as i64])
        .collect()
}

/// Per-axis `[lo, hi]` pad lengths so that every `window`-sized crop at
/// the given positions stays inside an object of spatial size `size_yx`.
pub fn calculate_pad(
    size_yx: [usize; 2],
    positions: &[[i64; 2]],
    window: [usize; 2],
) -> [[usize; 2]; 2] {
    let mut pads = [[0usize; 2]; 2];
    for axis in 0..2 {
        let min = positions.iter().map(|p| p[axis]).min().unwrap_or(0);
        let max = positions.iter().map(|p| p[axis]).max().unwrap_or(0);
        pads[axis][0] = (-min).max(0) as usize;
        pads[axis][1] = (max + window[axis] as i64 - size_yx[axis] as i64).max(0) as usize;
    }
    pads
}

/// Pad an object for the given position set and crop window, optionally
/// inflated by a halo border on every side of every window.
///
/// Returns the padded volume and the `(y, x)` offset to add to each
/// position before cropping a `window + 2·halo` block (the offset already
/// accounts for the halo).
pub fn pad_object(
    obj: &ObjectVolume,
    positions: &[[i64; 2]],
    window: [usize; 2],
    halo: usize,
    repr: ObjectRepr,
) -> (ObjectVolume, [i64; 2]) {
    let h = halo as i64;
    let haloed: Vec<[i64; 2]> = positions.iter().map(|p| [p[0] - h, p[1] - h]).collect();
    let eff_window = [window[0] + 2 * halo, window[1] + 2 * halo];
    let pads = calculate_pad([obj.ny, obj.nx], &haloed, eff_window);
    let padded = obj.pad_spatial(pads, repr);
    (
        padded,
        [pads[0][0] as i64 - h, pads[1][0] as i64 - h],
    )
}

/// Extract a `[window + 2·halo]` sub-volume per position at
/// `position + offset` (offset from [`pad_object`]). A single-position
/// batch takes the no-stacking fast path.
pub fn extract_subvolumes(
    obj: &ObjectVolume,
    positions: &[[i64; 2]],
    offset: [i64; 2],
    window: [usize; 2],
    halo: usize,
) -> ObjectBatch {
    assert!(!positions.is_empty(), "cannot extract an empty sub-batch");
    let wy = window[0] + 2 * halo;
    let wx = window[1] + 2 * halo;

    let crop = |p: &[i64; 2]| {
        let y0 = p[0] + offset[0];
        let x0 = p[1] + offset[1];
        assert!(
            y0 >= 0 && x0 >= 0,
            "position ({}, {}) lands outside the padded object",
            y0,
            x0
        );
        obj.crop_window(y0 as usize, x0 as usize, wy, wx)
    };

    if positions.len() == 1 {
        return ObjectBatch::from_single(crop(&positions[0]));
    }
    ObjectBatch::stack(positions.iter().map(crop).collect())
}

/// Extract a per-position window of every probe mode from a padded probe,
/// producing a `[batch, mode, wy, wx]` wavefront batch.
pub fn extract_subprobes(
    probe: &Wavefront,
    positions: &[[i64; 2]],
    offset: [i64; 2],
    window: [usize; 2],
    halo: usize,
) -> WavefrontBatch {
    assert!(!positions.is_empty(), "cannot extract an empty sub-batch");
    let wy = window[0] + 2 * halo;
    let wx = window[1] + 2 * halo;
    let mut out = WavefrontBatch::zeros(positions.len(), probe.modes, wy, wx);
    for (b, p) in positions.iter().enumerate() {
        let y0 = p[0] + offset[0];
        let x0 = p[1] + offset[1];
        assert!(
            y0 >= 0 && x0 >= 0,
            "position ({}, {}) lands outside the padded probe",
            y0,
            x0
        );
        let cropped = probe.crop_window(y0 as usize, x0 as usize, wy, wx);
        for m in 0..probe.modes {
            let (re, im) = cropped.mode_planes(m);
            out.set_plane(b, m, re, im);
        }
    }
    out
}
