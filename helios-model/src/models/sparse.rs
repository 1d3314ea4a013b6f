// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Sparse multislice: slices at irregular z positions.
//!
//! The object's slices sit at explicit positions along the beam; each
//! inter-slice kernel is rebuilt for that gap from caller-supplied
//! frequency meshes instead of assuming the uniform voxel pitch.

use helios_field::stepper::SliceStepper;
use helios_field::wavefront::WavefrontBatch;

use crate::regularizer::RegularizerSet;
use crate::ModelError;

use super::{evaluate_loss, run_forward, ForwardModel, LossArgs, ModelConfig};

/// Arguments of the sparse-multislice loss function, in declaration
/// order. Identical to ptychography plus the trailing slice positions.
pub const SPARSE_MULTISLICE_ARGS: &[&str] = &[
    "object",
    "probe_re",
    "probe_im",
    "probe_defocus_mm",
    "probe_pos_offset",
    "angle_index",
    "position_batch",
    "measured_data",
    "pos_correction",
    "index_batch",
    "slice_pos_nm",
];

/// Multislice model over irregularly spaced slices.
pub struct SparseMultisliceModel {
    cfg: ModelConfig,
    reg: RegularizerSet,
    stepper: SliceStepper,
    last_loss: f64,
}

impl SparseMultisliceModel {
    pub fn new(cfg: ModelConfig) -> Self {
        let stepper = SliceStepper::new(cfg.stepper_config(), cfg.probe_size);
        Self {
            cfg,
            reg: RegularizerSet::new(),
            stepper,
            last_loss: 0.0,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }
}

impl ForwardModel for SparseMultisliceModel {
    fn name(&self) -> &'static str {
        "sparse_multislice"
    }

    fn argument_order(&self) -> &'static [&'static str] {
        SPARSE_MULTISLICE_ARGS
    }

    fn predict(&self, args: &LossArgs<'_>) -> Result<WavefrontBatch, ModelError> {
        let sparse = args
            .sparse
            .ok_or(ModelError::MissingHyperparameter("slice_pos_nm"))?;
        run_forward(&self.cfg, args, &self.stepper, Some(&sparse))
    }

    fn loss(&mut self, args: &LossArgs<'_>) -> Result<f64, ModelError> {
        let prediction = self.predict(args)?;
        let value = evaluate_loss(&self.cfg, &self.reg, args, &prediction);
        self.last_loss = value;
        Ok(value)
    }

    fn last_loss(&self) -> f64 {
        self.last_loss
    }

    fn regularizers(&mut self) -> &mut RegularizerSet {
        &mut self.reg
    }
}
