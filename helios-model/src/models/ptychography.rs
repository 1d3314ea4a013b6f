// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Ptychography: single propagation distance, regularly spaced slices.

use helios_field::stepper::SliceStepper;
use helios_field::wavefront::WavefrontBatch;

use crate::regularizer::RegularizerSet;
use crate::ModelError;

use super::{evaluate_loss, run_forward, ForwardModel, LossArgs, ModelConfig};

/// Arguments of the ptychography loss function, in declaration order.
/// Gradient returns are indexed by position into this list.
pub const PTYCHOGRAPHY_ARGS: &[&str] = &[
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
];

/// Scanning coherent-diffraction model with uniform slice spacing.
pub struct PtychographyModel {
    cfg: ModelConfig,
    reg: RegularizerSet,
    stepper: SliceStepper,
    last_loss: f64,
}

impl PtychographyModel {
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

impl ForwardModel for PtychographyModel {
    fn name(&self) -> &'static str {
        "ptychography"
    }

    fn argument_order(&self) -> &'static [&'static str] {
        PTYCHOGRAPHY_ARGS
    }

    fn predict(&self, args: &LossArgs<'_>) -> Result<WavefrontBatch, ModelError> {
        run_forward(&self.cfg, args, &self.stepper, None)
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
