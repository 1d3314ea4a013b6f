// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Regularization terms on the object estimate
//!
//! A closed set of typed penalty terms; the sum of every present term is
//! added to the data-fidelity loss. A zero-weighted or absent term
//! contributes exactly 0 by branch, never by numerical cancellation.
//! There is deliberately no name-keyed dispatch: an unknown regularizer
//! cannot be configured, so it cannot be silently ignored.

use helios_field::volume::{ObjectRepr, ObjectVolume};

use crate::ModelError;

/// One penalty term with its typed parameters.
#[derive(Debug, Clone)]
pub enum Regularizer {
    /// `α_d·mean(|ch0|) + α_b·mean(|ch1|)`.
    L1 { alpha_d: f64, alpha_b: f64 },
    /// L1 with an elementwise weight map (one weight per voxel), updated
    /// between iterations by the driver.
    ReweightedL1 {
        alpha_d: f64,
        alpha_b: f64,
        weights: Vec<f32>,
    },
    /// Total variation: `γ · Σ_axes Σ |circular forward difference|` of
    /// channel 0 — or of `atan2(ch1, ch0)` in the real/imag
    /// representation, where channel 0 alone is not a phase.
    TotalVariation { gamma: f64 },
}

/// The set of active terms. Evaluation order is insertion order; the
/// result is a plain sum so order only matters to floating-point noise.
#[derive(Debug, Clone, Default)]
pub struct RegularizerSet {
    terms: Vec<Regularizer>,
}

impl RegularizerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn add_l1_norm(&mut self, alpha_d: f64, alpha_b: f64) {
        self.terms.push(Regularizer::L1 { alpha_d, alpha_b });
    }

    pub fn add_reweighted_l1_norm(&mut self, alpha_d: f64, alpha_b: f64, weights: Vec<f32>) {
        self.terms.push(Regularizer::ReweightedL1 {
            alpha_d,
            alpha_b,
            weights,
        });
    }

    pub fn add_total_variation(&mut self, gamma: f64) {
        self.terms.push(Regularizer::TotalVariation { gamma });
    }

    /// Replace the weight map of the reweighted-L1 term.
    ///
    /// Errors if no reweighted term is active — reweighting without the
    /// term is a driver bug, not a silent no-op.
    pub fn update_l1_weights(&mut self, weights: Vec<f32>) -> Result<(), ModelError> {
        for term in self.terms.iter_mut() {
            if let Regularizer::ReweightedL1 { weights: w, .. } = term {
                *w = weights;
                return Ok(());
            }
        }
        Err(ModelError::MissingHyperparameter("reweighted_l1.weights"))
    }

    /// Evaluate the sum of all active terms on an object volume.
    pub fn value(&self, obj: &ObjectVolume, repr: ObjectRepr) -> f64 {
        let mut total = 0.0f64;
        for term in &self.terms {
            total += match term {
                Regularizer::L1 { alpha_d, alpha_b } => l1_norm(obj, *alpha_d, *alpha_b, None),
                Regularizer::ReweightedL1 {
                    alpha_d,
                    alpha_b,
                    weights,
                } => l1_norm(obj, *alpha_d, *alpha_b, Some(weights)),
                Regularizer::TotalVariation { gamma } => {
                    if *gamma == 0.0 {
                        0.0
                    } else {
                        *gamma * total_variation(obj, repr)
                    }
                }
            };
        }
        total
    }
}

/// Weighted or unweighted L1 over both channels. Zero or non-finite
/// weights branch to an exact 0 for that channel.
fn l1_norm(obj: &ObjectVolume, alpha_d: f64, alpha_b: f64, weights: Option<&[f32]>) -> f64 {
    if let Some(w) = weights {
        assert_eq!(
            w.len(),
            obj.n_voxels(),
            "weight map length {} does not match voxel count {}",
            w.len(),
            obj.n_voxels()
        );
    }
    let n = obj.n_voxels() as f64;
    let mut out = 0.0f64;
    for (c, alpha) in [(0usize, alpha_d), (1usize, alpha_b)] {
        if alpha == 0.0 {
            continue;
        }
        let mut acc = 0.0f64;
        for v in 0..obj.n_voxels() {
            let val = obj.data[v * 2 + c].abs() as f64;
            let wv = weights.map_or(1.0, |w| w[v] as f64);
            acc += wv * val;
        }
        out += alpha * acc / n;
    }
    out
}

/// Total variation of the object: sum over the three spatial axes of the
/// absolute circular forward differences.
pub fn total_variation(obj: &ObjectVolume, repr: ObjectRepr) -> f64 {
    let field: Vec<f32> = match repr {
        ObjectRepr::PhaseAbsorption => obj.channel(0),
        // Channel 0 is not a phase in this representation; penalize the
        // voxel transmission's phase angle instead.
        ObjectRepr::RealImag => {
            let mut out = Vec::with_capacity(obj.n_voxels());
            for v in 0..obj.n_voxels() {
                out.push(obj.data[v * 2 + 1].atan2(obj.data[v * 2]));
            }
            out
        }
    };

    let (ny, nx, nz) = (obj.ny, obj.nx, obj.nz);
    let at = |y: usize, x: usize, z: usize| field[(y * nx + x) * nz + z] as f64;

    let mut tv = 0.0f64;
    for y in 0..ny {
        let yn = (y + 1) % ny;
        for x in 0..nx {
            let xn = (x + 1) % nx;
            for z in 0..nz {
                let zn = (z + 1) % nz;
                let v = at(y, x, z);
                tv += (at(yn, x, z) - v).abs();
                tv += (at(y, xn, z) - v).abs();
                tv += (at(y, x, zn) - v).abs();
            }
        }
    }
    tv
}
