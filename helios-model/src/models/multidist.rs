// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Multi-distance holography: one probing per position, several
//! propagation distances.
//!
//! Each scan position is simulated once through the object and then
//! free-propagated to every detector distance. Every distance is cropped
//! through a halo-aware window (the safe zone) so propagation blur leaking
//! in from outside the block cannot bias the comparison; predictions are
//! concatenated across distances into one joint loss. The propagation
//! distance itself can be an optimized parameter: with
//! `optimize_free_prop` set, the kernels are rebuilt from the model's
//! frequency meshes on every evaluation.

use helios_field::stepper::{ProbeIllumination, SliceStepper};
use helios_field::volume::ObjectBatch;
use helios_field::wavefront::WavefrontBatch;
use helios_math::kernel::{transfer_function_kernel, transfer_function_kernel_from_mesh};
use helios_math::mesh::frequency_meshes_2d;

use crate::batch::{
    calculate_pad, extract_subprobes, extract_subvolumes, pad_object, round_positions,
    split_batches,
};
use crate::data::gather_frames;
use crate::loss::masked_fidelity_loss;
use crate::regularizer::RegularizerSet;
use crate::ModelError;

use super::{
    fill_mode, prepare_probe, resolve_rotation, ForwardModel, LossArgs, ModelConfig, ObjectInput,
};

/// Arguments of the multi-distance loss function, in declaration order.
pub const MULTI_DIST_ARGS: &[&str] = &[
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
    "free_prop_nm",
    "safe_zone_width",
];

/// Multi-distance forward model.
pub struct MultiDistModel {
    cfg: ModelConfig,
    reg: RegularizerSet,
    subprobe_size: [usize; 2],
    last_loss: f64,
}

impl MultiDistModel {
    /// Requires `cfg.subprobe_size` (the per-distance detector block).
    pub fn new(cfg: ModelConfig) -> Result<Self, ModelError> {
        let subprobe_size = cfg
            .subprobe_size
            .ok_or(ModelError::MissingHyperparameter("subprobe_size"))?;
        Ok(Self {
            cfg,
            reg: RegularizerSet::new(),
            subprobe_size,
            last_loss: 0.0,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    /// Gather one mode of a wavefront batch as contiguous `[batch, y, x]`
    /// planes.
    fn batch_mode_planes(batch: &WavefrontBatch, mode: usize) -> (Vec<f32>, Vec<f32>) {
        let frame = batch.ny * batch.nx;
        let mut re = Vec::with_capacity(batch.batch * frame);
        let mut im = Vec::with_capacity(batch.batch * frame);
        for b in 0..batch.batch {
            let (pr, pi) = batch.plane(b, mode);
            re.extend_from_slice(pr);
            im.extend_from_slice(pi);
        }
        (re, im)
    }
}

impl ForwardModel for MultiDistModel {
    fn name(&self) -> &'static str {
        "multi_dist"
    }

    fn argument_order(&self) -> &'static [&'static str] {
        MULTI_DIST_ARGS
    }

    fn predict(&self, args: &LossArgs<'_>) -> Result<WavefrontBatch, ModelError> {
        let md = args
            .multi_dist
            .ok_or(ModelError::MissingHyperparameter("free_prop_nm"))?;
        let pargs = &args.predict;
        let cfg = &self.cfg;
        let halo = md.safe_zone_width;
        let sub = self.subprobe_size;
        let frame = [sub[0] + 2 * halo, sub[1] + 2 * halo];
        let n_pos = pargs.positions.len();
        assert_eq!(
            pargs.indices.len(),
            n_pos,
            "positions and dataset indices must align"
        );

        let stepper = SliceStepper::new(cfg.stepper_config(), frame);

        // Probe conditioning. The per-angle offset correction is applied
        // to the *measured* data in the loss for this geometry, not to the
        // probe.
        let probe = prepare_probe(cfg, pargs)?;

        let rotated = resolve_rotation(cfg, pargs)?;
        let rounded = round_positions(pargs.positions);

        let padded = match (&rotated, pargs.object) {
            (Some(v), _) => Some(pad_object(v, &rounded, sub, halo, cfg.repr)),
            (None, ObjectInput::Whole(v)) => Some(pad_object(v, &rounded, sub, halo, cfg.repr)),
            (None, ObjectInput::PreSliced(_)) => None,
        };

        // Pad the probe so every halo-inflated block can be cut out of it;
        // vacuum regions illuminate with unit amplitude.
        let haloed: Vec<[i64; 2]> = rounded
            .iter()
            .map(|p| [p[0] - halo as i64, p[1] - halo as i64])
            .collect();
        let ppads = calculate_pad([probe.ny, probe.nx], &haloed, frame);
        let probe_sz = probe.pad_spatial(ppads, (1.0, 0.0));
        let poffset = [
            ppads[0][0] as i64 - halo as i64,
            ppads[1][0] as i64 - halo as i64,
        ];

        // Sub-volume and sub-probe batches are fixed across distances;
        // build them once per sub-batch.
        let ranges = split_batches(n_pos, cfg.n_dp_batch);
        let mut subobjs: Vec<ObjectBatch> = Vec::with_capacity(ranges.len());
        let mut subprobes: Vec<WavefrontBatch> = Vec::with_capacity(ranges.len());
        for range in &ranges {
            let subobj = match (&padded, pargs.object) {
                (Some((vol, offset)), _) => {
                    extract_subvolumes(vol, &rounded[range.clone()], *offset, sub, halo)
                }
                (None, ObjectInput::PreSliced(b)) => {
                    let view = b.batch_range(range.start, range.len());
                    assert_eq!(
                        [view.ny, view.nx],
                        frame,
                        "pre-sliced blocks must arrive halo-inflated"
                    );
                    let mut owned = ObjectBatch::zeros(view.batch, view.ny, view.nx, view.nz);
                    owned.data.copy_from_slice(view.data);
                    owned
                }
                (None, ObjectInput::Whole(_)) => unreachable!("whole input always padded"),
            };
            subobjs.push(subobj);
            subprobes.push(extract_subprobes(
                &probe_sz,
                &rounded[range.clone()],
                poffset,
                sub,
                halo,
            ));
        }

        let mesh = if cfg.optimize_free_prop {
            Some(frequency_meshes_2d(cfg.pixel_size(), frame))
        } else {
            None
        };

        // Simulate once per distance; block order is distance-major, then
        // position order within the distance.
        let mut parts = Vec::with_capacity(md.free_prop_nm.len() * ranges.len());
        for &dist_nm in md.free_prop_nm {
            let kernel = match &mesh {
                Some((u, v)) => {
                    transfer_function_kernel_from_mesh(dist_nm, cfg.lambda_nm, u, v)
                }
                None => transfer_function_kernel(dist_nm, cfg.lambda_nm, cfg.pixel_size(), frame),
            };
            for (k, range) in ranges.iter().enumerate() {
                let len = range.len();
                let mut part = WavefrontBatch::zeros(len, cfg.n_probe_modes, frame[0], frame[1]);
                for m in 0..cfg.n_probe_modes {
                    let (pre, pim) = Self::batch_mode_planes(&subprobes[k], m);
                    let (mut ore, mut oim) = stepper.propagate_batch(
                        subobjs[k].view(),
                        ProbeIllumination::PerPosition { re: &pre, im: &pim },
                        None,
                        None,
                    );
                    let fsz = frame[0] * frame[1];
                    for b in 0..len {
                        stepper.free_propagate(
                            &mut ore[b * fsz..(b + 1) * fsz],
                            &mut oim[b * fsz..(b + 1) * fsz],
                            &kernel,
                        );
                    }
                    fill_mode(&mut part, m, &ore, &oim);
                }
                parts.push(part);
            }
        }
        let joined = WavefrontBatch::concat(parts);

        // Strip the halo from every frame (real and imaginary alike) so
        // boundary blur never reaches the loss.
        Ok(if halo > 0 {
            joined.crop_frames(halo, halo, sub[0], sub[1])
        } else {
            joined
        })
    }

    fn loss(&mut self, args: &LossArgs<'_>) -> Result<f64, ModelError> {
        let md = args
            .multi_dist
            .ok_or(ModelError::MissingHyperparameter("free_prop_nm"))?;
        let cfg = &self.cfg;
        let prediction = self.predict(args)?;
        let pred_mag = prediction.magnitude();

        let n_dists = md.free_prop_nm.len();
        assert!(n_dists > 0, "need at least one propagation distance");
        let n_blocks = args.data.n_positions() / n_dists;
        let minibatch = args.predict.indices.len();

        // Measured frames replicate the position indices once per
        // distance: block i reads indices shifted by i·n_blocks.
        let mut full_indices = Vec::with_capacity(n_dists * minibatch);
        for i_dist in 0..n_dists {
            full_indices.extend(args.predict.indices.iter().map(|&i| i + i_dist * n_blocks));
        }
        let measured_angle = args.predict.angle_index * cfg.theta_downsample.max(1);
        let (mut meas, mshape) =
            gather_frames(args.data, measured_angle, &full_indices, cfg.ds_level.max(1));
        assert_eq!(
            mshape,
            [prediction.ny, prediction.nx],
            "measured block shape {:?} does not match prediction",
            mshape
        );
        let fsz = mshape[0] * mshape[1];

        // Per-angle offset: realign the measurement to the prediction.
        if cfg.optimize_probe_pos_offset {
            let offsets = args
                .predict
                .probe_pos_offset
                .ok_or(ModelError::MissingHyperparameter("probe_pos_offset"))?;
            let shift = offsets[args.predict.angle_index];
            for f in 0..full_indices.len() {
                helios_field::probe::shift_real_image(
                    &mut meas[f * fsz..(f + 1) * fsz],
                    mshape[0],
                    mshape[1],
                    shift,
                );
            }
        }

        // Per-distance position correction, applied to the measured
        // blocks. The correction here is indexed by distance — see the
        // geometry's field docs and the indexing property test.
        if cfg.optimize_all_probe_pos {
            let correction = md
                .dist_correction
                .ok_or(ModelError::MissingHyperparameter("dist_correction"))?;
            assert!(
                correction.len() >= n_dists,
                "need one correction per distance ({} < {})",
                correction.len(),
                n_dists
            );
            for i_dist in 0..n_dists {
                let shift = correction[i_dist];
                for b in 0..minibatch {
                    let f = i_dist * minibatch + b;
                    helios_field::probe::shift_real_image(
                        &mut meas[f * fsz..(f + 1) * fsz],
                        mshape[0],
                        mshape[1],
                        shift,
                    );
                }
            }
        }

        let fidelity = masked_fidelity_loss(
            &pred_mag,
            &meas,
            prediction.batch,
            cfg.beamstop.as_ref(),
            cfg.loss,
            cfg.raw_data,
        );
        let reg_value = match args.predict.object {
            ObjectInput::Whole(v) => self.reg.value(v, cfg.repr),
            ObjectInput::PreSliced(_) => 0.0,
        };

        let value = fidelity + reg_value;
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
