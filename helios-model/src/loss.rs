// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Data-fidelity losses and detector masking
//!
//! The predicted detector magnitude is compared against the measured data
//! under one of two statistics: least squares (on a magnitude or intensity
//! target) or a Poisson negative log-likelihood. A beamstop mask removes
//! physically blocked detector pixels symmetrically from prediction and
//! measurement before either statistic is evaluated.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Loss statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    LeastSquares,
    PoissonNll,
}

/// What the measured values physically are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawDataType {
    Magnitude,
    Intensity,
}

/// Detector pixels excluded from the loss because a physical beamstop
/// blocks them. `true` marks a *valid* (unblocked) pixel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamstopMask {
    mask: Vec<bool>,
    ny: usize,
    nx: usize,
}

impl BeamstopMask {
    /// Threshold a transmission map: values at or above `1e-5` are valid.
    pub fn from_map(values: &[f32], ny: usize, nx: usize) -> Self {
        assert_eq!(values.len(), ny * nx, "beamstop map shape mismatch");
        Self {
            mask: values.iter().map(|&v| v >= 1e-5).collect(),
            ny,
            nx,
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.ny, self.nx]
    }

    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Keep only unblocked pixels of a `[frames, ny, nx]` stack, frame by
    /// frame. Prediction and measurement must be filtered by the same
    /// mask or the comparison is biased.
    pub fn filter(&self, stack: &[f32], frames: usize) -> Vec<f32> {
        assert_eq!(stack.len(), frames * self.ny * self.nx, "stack shape mismatch");
        let frame = self.ny * self.nx;
        let mut out = Vec::with_capacity(frames * self.valid_count());
        for f in 0..frames {
            let base = f * frame;
            for i in 0..frame {
                if self.mask[i] {
                    out.push(stack[base + i]);
                }
            }
        }
        out
    }
}

/// Mean data-fidelity loss between predicted magnitudes and measured
/// values, both flat stacks of equal length.
///
/// Least squares targets the measured magnitude (or `sqrt` of measured
/// intensity); the Poisson form is
/// `mean(pred² − target·ln(pred²))` with the target being `|meas|²` for
/// magnitude data and `|meas|` for intensity data.
pub fn fidelity_loss(pred: &[f32], meas: &[f32], kind: LossKind, raw: RawDataType) -> f64 {
    assert_eq!(
        pred.len(),
        meas.len(),
        "prediction and measurement lengths differ: {} vs {}",
        pred.len(),
        meas.len()
    );
    assert!(!pred.is_empty(), "cannot evaluate a loss over zero pixels");
    let n = pred.len() as f64;

    match kind {
        LossKind::LeastSquares => {
            let mut acc = 0.0f64;
            for i in 0..pred.len() {
                let target = match raw {
                    RawDataType::Magnitude => meas[i].abs() as f64,
                    RawDataType::Intensity => (meas[i].abs() as f64).sqrt(),
                };
                let d = pred[i] as f64 - target;
                acc += d * d;
            }
            acc / n
        }
        LossKind::PoissonNll => {
            let mut acc = 0.0f64;
            for i in 0..pred.len() {
                let intensity = (pred[i] as f64) * (pred[i] as f64);
                let target = match raw {
                    RawDataType::Magnitude => {
                        let m = meas[i].abs() as f64;
                        m * m
                    }
                    RawDataType::Intensity => meas[i].abs() as f64,
                };
                acc += intensity - target * intensity.ln();
            }
            acc / n
        }
    }
}

/// Apply an optional beamstop to prediction and measurement symmetrically,
/// then evaluate the fidelity loss.
pub fn masked_fidelity_loss(
    pred: &[f32],
    meas: &[f32],
    frames: usize,
    beamstop: Option<&BeamstopMask>,
    kind: LossKind,
    raw: RawDataType,
) -> f64 {
    match beamstop {
        None => fidelity_loss(pred, meas, kind, raw),
        Some(mask) => {
            let p = mask.filter(pred, frames);
            let m = mask.filter(meas, frames);
            debug!(
                valid = mask.valid_count(),
                total = mask.shape()[0] * mask.shape()[1],
                "beamstop applied before loss"
            );
            fidelity_loss(&p, &m, kind, raw)
        }
    }
}
