// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Forward models — predicted diffraction and scalar loss
//!
//! Three imaging geometries share one predict/loss pipeline: fetch the
//! rotation table, condition the probe (defocus, per-angle offset), rotate
//! and pad the object, extract a sub-volume per scan position, run the
//! slice stepper per position sub-batch × probe mode, combine modes
//! incoherently, compare against measured data and add the regularizers.
//!
//! The variants form a closed set ([`ForwardVariant`]); each declares the
//! positional argument order its loss function consumes, and the driver's
//! gradient bookkeeping is checked against that order instead of trusted.

mod multidist;
mod ptychography;
mod sparse;

pub use multidist::{MultiDistModel, MULTI_DIST_ARGS};
pub use ptychography::{PtychographyModel, PTYCHOGRAPHY_ARGS};
pub use sparse::{SparseMultisliceModel, SPARSE_MULTISLICE_ARGS};

use helios_field::probe as probe_ops;
use helios_field::stepper::{FreePropagation, ProbeIllumination, SignConvention, SliceStepper, StepperConfig};
use helios_field::volume::{ObjectBatch, ObjectBatchView, ObjectRepr, ObjectVolume};
use helios_field::wavefront::{Wavefront, WavefrontBatch};
use helios_math::fft::FftShiftConvention;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::{extract_subvolumes, pad_object, round_positions, split_batches};
use crate::data::{gather_frames, DiffractionData};
use crate::loss::{masked_fidelity_loss, BeamstopMask, LossKind, RawDataType};
use crate::regularizer::RegularizerSet;
use crate::ModelError;

/// Shift corrections below this magnitude (in px) are treated as inactive.
pub(crate) const CORRECTION_EPS: f64 = 1e-3;

/// Options shared by every forward variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub lambda_nm: f64,
    /// `[y, x, z]` voxel pitch in nm at the working (downsampled)
    /// resolution.
    pub voxel_nm: [f64; 3],
    /// Probe frame `[ny, nx]` — also the sub-volume crop window.
    pub probe_size: [usize; 2],
    pub n_probe_modes: usize,
    /// Maximum positions per stepper call (sub-batch size).
    pub n_dp_batch: usize,
    pub repr: ObjectRepr,
    pub sign: SignConvention,
    pub shift: FftShiftConvention,
    pub loss: LossKind,
    pub raw_data: RawDataType,
    /// Detector downsampling stride (≥ 1).
    pub ds_level: usize,
    /// Angle downsampling stride (≥ 1): model angle i reads measured
    /// angle `i · theta_downsample`.
    pub theta_downsample: usize,
    /// Thin (2-D) object: skip rotation entirely.
    pub two_d_mode: bool,
    /// Skip inter-slice propagation (projection approximation).
    pub pure_projection: bool,
    /// The driver already rotated the object this iteration.
    pub rotate_out_of_loop: bool,
    pub optimize_probe_defocus: bool,
    pub optimize_probe_pos_offset: bool,
    pub optimize_all_probe_pos: bool,
    /// Treat the free-propagation distances as optimizable parameters
    /// (MultiDist): kernels are rebuilt from the model's frequency meshes
    /// on every call so the distance stays a plain flowing value.
    pub optimize_free_prop: bool,
    /// Trailing free-space leg for Ptychography / SparseMultislice.
    pub free_prop: Option<FreePropagation>,
    /// MultiDist detector block size (the halo is added on top).
    pub subprobe_size: Option<[usize; 2]>,
    pub beamstop: Option<BeamstopMask>,
}

impl ModelConfig {
    /// Config with the common defaults: single mode, least squares on
    /// magnitude data, no downsampling, no optional corrections.
    pub fn new(lambda_nm: f64, voxel_nm: [f64; 3], probe_size: [usize; 2]) -> Self {
        Self {
            lambda_nm,
            voxel_nm,
            probe_size,
            n_probe_modes: 1,
            n_dp_batch: 16,
            repr: ObjectRepr::PhaseAbsorption,
            sign: SignConvention::Positive,
            shift: FftShiftConvention::Centered,
            loss: LossKind::LeastSquares,
            raw_data: RawDataType::Magnitude,
            ds_level: 1,
            theta_downsample: 1,
            two_d_mode: false,
            pure_projection: false,
            rotate_out_of_loop: false,
            optimize_probe_defocus: false,
            optimize_probe_pos_offset: false,
            optimize_all_probe_pos: false,
            optimize_free_prop: false,
            free_prop: None,
            subprobe_size: None,
            beamstop: None,
        }
    }

    pub(crate) fn stepper_config(&self) -> StepperConfig {
        StepperConfig {
            lambda_nm: self.lambda_nm,
            voxel_nm: self.voxel_nm,
            repr: self.repr,
            sign: self.sign,
            shift: self.shift,
            pure_projection: self.pure_projection,
        }
    }

    pub(crate) fn pixel_size(&self) -> [f64; 2] {
        [self.voxel_nm[0], self.voxel_nm[1]]
    }
}

/// Where the object estimate comes from for one call.
#[derive(Debug, Clone, Copy)]
pub enum ObjectInput<'a> {
    /// The whole (or whole-per-process) volume; sub-volumes are cropped
    /// here after padding.
    Whole(&'a ObjectVolume),
    /// Pre-distributed mode: the driver already extracted this
    /// minibatch's sub-volumes from a sharded store, in position order.
    PreSliced(&'a ObjectBatch),
}

/// Per-(angle, position) probe shift corrections, in px.
#[derive(Debug, Clone)]
pub struct PosCorrectionTable {
    data: Vec<[f64; 2]>,
    n_angles: usize,
    n_positions: usize,
}

impl PosCorrectionTable {
    pub fn zeros(n_angles: usize, n_positions: usize) -> Self {
        Self {
            data: vec![[0.0; 2]; n_angles * n_positions],
            n_angles,
            n_positions,
        }
    }

    pub fn set(&mut self, angle: usize, position: usize, shift: [f64; 2]) {
        assert!(angle < self.n_angles && position < self.n_positions);
        self.data[angle * self.n_positions + position] = shift;
    }

    pub fn get(&self, angle: usize, position: usize) -> [f64; 2] {
        assert!(angle < self.n_angles && position < self.n_positions);
        self.data[angle * self.n_positions + position]
    }

    /// Largest absolute component over the whole table.
    pub fn max_abs(&self) -> f64 {
        self.data
            .iter()
            .flat_map(|s| s.iter())
            .fold(0.0f64, |m, &v| m.max(v.abs()))
    }
}

/// Arguments common to every variant's predict step. The field order
/// mirrors each variant's declared argument order.
#[derive(Clone, Copy)]
pub struct PredictArgs<'a> {
    pub object: ObjectInput<'a>,
    pub probe: &'a Wavefront,
    pub probe_defocus_mm: Option<f64>,
    /// Per-angle probe offset, indexed by angle.
    pub probe_pos_offset: Option<&'a [[f64; 2]]>,
    pub angle_index: usize,
    /// Scan positions of this minibatch (fractional px; rounded to the
    /// grid before any indexing).
    pub positions: &'a [[f64; 2]],
    /// Per-(angle, position) probe shift corrections.
    pub pos_correction: Option<&'a PosCorrectionTable>,
    /// Dataset position indices of this minibatch, aligned with
    /// `positions`.
    pub indices: &'a [usize],
    /// Precomputed rotation remap for this angle.
    pub rotation: Option<&'a [u32]>,
}

/// Slice geometry for the sparse multislice variant.
#[derive(Clone, Copy)]
pub struct SparseGeometry<'a> {
    /// Ascending z position of each object slice, nm.
    pub slice_pos_nm: &'a [f64],
    /// Centered frequency meshes (row-major `[ny, nx]`) the per-gap
    /// kernels are rebuilt from.
    pub u: &'a [f32],
    pub v: &'a [f32],
}

/// Detector geometry for the multi-distance variant.
#[derive(Clone, Copy)]
pub struct MultiDistGeometry<'a> {
    /// Free-propagation distances, nm, one detector block per entry.
    pub free_prop_nm: &'a [f64],
    /// Halo width (px) added around each block during simulation and
    /// cropped off before the loss.
    pub safe_zone_width: usize,
    /// Measurement shift corrections indexed by *distance* — not by scan
    /// position, the way the per-(angle, position) table is indexed
    /// elsewhere. The indexing property test pins this interpretation;
    /// check it before changing the axis.
    pub dist_correction: Option<&'a [[f64; 2]]>,
}

/// Everything one loss evaluation consumes.
#[derive(Clone, Copy)]
pub struct LossArgs<'a> {
    pub predict: PredictArgs<'a>,
    pub data: &'a dyn DiffractionData,
    pub sparse: Option<SparseGeometry<'a>>,
    pub multi_dist: Option<MultiDistGeometry<'a>>,
}

/// Capability shared by the three forward variants.
pub trait ForwardModel {
    fn name(&self) -> &'static str;

    /// Declared positional argument order of the loss function. The
    /// driver's gradient bookkeeping indexes by position into this list.
    fn argument_order(&self) -> &'static [&'static str];

    /// Simulate the batched exit wavefront `[batch, mode, y, x]`.
    fn predict(&self, args: &LossArgs<'_>) -> Result<WavefrontBatch, ModelError>;

    /// Differentiable scalar loss: data fidelity plus regularization.
    /// Records the numeric value as a side effect ([`Self::last_loss`]).
    fn loss(&mut self, args: &LossArgs<'_>) -> Result<f64, ModelError>;

    /// Numeric value of the most recent loss evaluation.
    fn last_loss(&self) -> f64;

    /// Active regularization terms.
    fn regularizers(&mut self) -> &mut RegularizerSet;

    /// Position of `name` in the declared argument order.
    fn argument_index(&self, name: &str) -> Result<usize, ModelError> {
        self.argument_order()
            .iter()
            .position(|&a| a == name)
            .ok_or_else(|| ModelError::UnknownArgument(name.to_string()))
    }

    /// Verify a caller-provided positional argument list matches the
    /// declared order exactly.
    fn check_argument_order(&self, provided: &[&str]) -> Result<(), ModelError> {
        let expected = self.argument_order();
        if provided.len() != expected.len() || provided.iter().zip(expected).any(|(p, e)| p != e) {
            return Err(ModelError::ArgumentOrder {
                expected: expected.iter().map(|s| s.to_string()).collect(),
                got: provided.iter().map(|s| s.to_string()).collect(),
            });
        }
        Ok(())
    }
}

/// Closed set of forward-model variants.
pub enum ForwardVariant {
    Ptychography(PtychographyModel),
    SparseMultislice(SparseMultisliceModel),
    MultiDist(MultiDistModel),
}

impl ForwardModel for ForwardVariant {
    fn name(&self) -> &'static str {
        match self {
            ForwardVariant::Ptychography(m) => m.name(),
            ForwardVariant::SparseMultislice(m) => m.name(),
            ForwardVariant::MultiDist(m) => m.name(),
        }
    }

    fn argument_order(&self) -> &'static [&'static str] {
        match self {
            ForwardVariant::Ptychography(m) => m.argument_order(),
            ForwardVariant::SparseMultislice(m) => m.argument_order(),
            ForwardVariant::MultiDist(m) => m.argument_order(),
        }
    }

    fn predict(&self, args: &LossArgs<'_>) -> Result<WavefrontBatch, ModelError> {
        match self {
            ForwardVariant::Ptychography(m) => m.predict(args),
            ForwardVariant::SparseMultislice(m) => m.predict(args),
            ForwardVariant::MultiDist(m) => m.predict(args),
        }
    }

    fn loss(&mut self, args: &LossArgs<'_>) -> Result<f64, ModelError> {
        match self {
            ForwardVariant::Ptychography(m) => m.loss(args),
            ForwardVariant::SparseMultislice(m) => m.loss(args),
            ForwardVariant::MultiDist(m) => m.loss(args),
        }
    }

    fn last_loss(&self) -> f64 {
        match self {
            ForwardVariant::Ptychography(m) => m.last_loss(),
            ForwardVariant::SparseMultislice(m) => m.last_loss(),
            ForwardVariant::MultiDist(m) => m.last_loss(),
        }
    }

    fn regularizers(&mut self) -> &mut RegularizerSet {
        match self {
            ForwardVariant::Ptychography(m) => m.regularizers(),
            ForwardVariant::SparseMultislice(m) => m.regularizers(),
            ForwardVariant::MultiDist(m) => m.regularizers(),
        }
    }
}

// ─── Shared pipeline steps ──────────────────────────

/// Clone the probe and apply the optional defocus correction.
pub(crate) fn prepare_probe(
    cfg: &ModelConfig,
    args: &PredictArgs<'_>,
) -> Result<Wavefront, ModelError> {
    assert_eq!(
        args.probe.modes, cfg.n_probe_modes,
        "probe carries {} modes, config declares {}",
        args.probe.modes, cfg.n_probe_modes
    );
    let mut probe = args.probe.clone();
    if cfg.optimize_probe_defocus {
        let mm = args
            .probe_defocus_mm
            .ok_or(ModelError::MissingHyperparameter("probe_defocus_mm"))?;
        probe_ops::defocus(
            &mut probe,
            mm * 1.0e6,
            cfg.lambda_nm,
            cfg.pixel_size(),
            cfg.shift,
        );
    }
    Ok(probe)
}

/// Apply the per-angle probe offset correction in place.
pub(crate) fn apply_probe_offset(
    cfg: &ModelConfig,
    args: &PredictArgs<'_>,
    probe: &mut Wavefront,
) -> Result<(), ModelError> {
    if !cfg.optimize_probe_pos_offset {
        return Ok(());
    }
    let offsets = args
        .probe_pos_offset
        .ok_or(ModelError::MissingHyperparameter("probe_pos_offset"))?;
    assert!(
        args.angle_index < offsets.len(),
        "angle {} has no probe offset entry",
        args.angle_index
    );
    probe_ops::shift_wavefront(probe, offsets[args.angle_index]);
    Ok(())
}

/// Resolve the object to simulate from: rotate the whole volume through
/// the precomputed table, or pass it through when rotation is off or
/// already applied upstream. Pre-sliced input is assumed pre-rotated.
///
/// Rotating on the fly without a table is an unsupported configuration:
/// the nearest-neighbor remap is only reproducible across processes and
/// iterations when read from the shared precomputed tables, so the models
/// fail fast instead of approximating.
pub(crate) fn resolve_rotation(
    cfg: &ModelConfig,
    args: &PredictArgs<'_>,
) -> Result<Option<ObjectVolume>, ModelError> {
    let volume = match args.object {
        ObjectInput::PreSliced(_) => return Ok(None),
        ObjectInput::Whole(v) => v,
    };
    if cfg.two_d_mode || cfg.rotate_out_of_loop {
        return Ok(None);
    }
    match args.rotation {
        Some(table) => Ok(Some(volume.remap_voxels(table))),
        None => Err(ModelError::UnsupportedConfiguration(
            "on-the-fly rotation without a precomputed coordinate table".into(),
        )),
    }
}

/// Whether per-position probe shifts are active for this call.
pub(crate) fn corrections_active(cfg: &ModelConfig, args: &PredictArgs<'_>) -> bool {
    cfg.optimize_all_probe_pos
        || args
            .pos_correction
            .map_or(false, |t| t.max_abs() > CORRECTION_EPS)
}

/// Contiguous `[len, ny, nx]` planes of one mode gathered from a list of
/// per-position probes.
pub(crate) fn stacked_mode_planes(probes: &[Wavefront], mode: usize) -> (Vec<f32>, Vec<f32>) {
    let frame = probes[0].ny * probes[0].nx;
    let mut re = Vec::with_capacity(probes.len() * frame);
    let mut im = Vec::with_capacity(probes.len() * frame);
    for p in probes {
        let (pr, pi) = p.mode_planes(mode);
        re.extend_from_slice(pr);
        im.extend_from_slice(pi);
    }
    (re, im)
}

/// Copy one mode's `[len, ny, nx]` output planes into a wavefront batch.
pub(crate) fn fill_mode(batch: &mut WavefrontBatch, mode: usize, re: &[f32], im: &[f32]) {
    let frame = batch.ny * batch.nx;
    for b in 0..batch.batch {
        batch.set_plane(b, mode, &re[b * frame..(b + 1) * frame], &im[b * frame..(b + 1) * frame]);
    }
}

/// The predict pipeline shared by Ptychography and SparseMultislice: one
/// stepper invocation per sub-batch × mode, with optional per-position
/// probe shifts. `sparse` selects the irregular-spacing propagation path.
pub(crate) fn run_forward(
    cfg: &ModelConfig,
    args: &LossArgs<'_>,
    stepper: &SliceStepper,
    sparse: Option<&SparseGeometry<'_>>,
) -> Result<WavefrontBatch, ModelError> {
    let pargs = &args.predict;
    let n_pos = pargs.positions.len();
    assert_eq!(
        pargs.indices.len(),
        n_pos,
        "positions and dataset indices must align ({} vs {})",
        n_pos,
        pargs.indices.len()
    );

    let mut probe = prepare_probe(cfg, pargs)?;
    apply_probe_offset(cfg, pargs, &mut probe)?;

    let rotated = resolve_rotation(cfg, pargs)?;
    let rounded = round_positions(pargs.positions);

    // Pad once for the whole minibatch; pre-sliced input arrives already
    // window-shaped.
    let padded = match (&rotated, pargs.object) {
        (Some(v), _) => Some(pad_object(v, &rounded, cfg.probe_size, 0, cfg.repr)),
        (None, ObjectInput::Whole(v)) => Some(pad_object(v, &rounded, cfg.probe_size, 0, cfg.repr)),
        (None, ObjectInput::PreSliced(_)) => None,
    };

    let shift_probes = corrections_active(cfg, pargs);
    let mut parts = Vec::new();
    for range in split_batches(n_pos, cfg.n_dp_batch) {
        let len = range.len();

        let owned_subobj;
        let view: ObjectBatchView<'_> = match (&padded, pargs.object) {
            (Some((vol, offset)), _) => {
                owned_subobj =
                    extract_subvolumes(vol, &rounded[range.clone()], *offset, cfg.probe_size, 0);
                owned_subobj.view()
            }
            (None, ObjectInput::PreSliced(b)) => b.batch_range(range.start, len),
            (None, ObjectInput::Whole(_)) => unreachable!("whole input always padded"),
        };

        let shifted: Option<Vec<Wavefront>> = if shift_probes {
            let table = pargs
                .pos_correction
                .ok_or(ModelError::MissingHyperparameter("pos_correction"))?;
            Some(
                range
                    .clone()
                    .map(|k| {
                        let mut p = probe.clone();
                        let shift = table.get(pargs.angle_index, pargs.indices[k]);
                        probe_ops::shift_wavefront(&mut p, shift);
                        p
                    })
                    .collect(),
            )
        } else {
            None
        };

        let mut part = WavefrontBatch::zeros(len, cfg.n_probe_modes, stepper.frame()[0], stepper.frame()[1]);
        for m in 0..cfg.n_probe_modes {
            let stacked;
            let illum = match &shifted {
                Some(list) => {
                    stacked = stacked_mode_planes(list, m);
                    ProbeIllumination::PerPosition {
                        re: &stacked.0,
                        im: &stacked.1,
                    }
                }
                None => {
                    let (re, im) = probe.mode_planes(m);
                    ProbeIllumination::Shared { re, im }
                }
            };
            let (ore, oim) = match sparse {
                None => stepper.propagate_batch(view, illum, None, cfg.free_prop),
                Some(sg) => stepper.propagate_sparse_batch(
                    view,
                    illum,
                    sg.slice_pos_nm,
                    sg.u,
                    sg.v,
                    cfg.free_prop,
                ),
            };
            fill_mode(&mut part, m, &ore, &oim);
        }
        parts.push(part);
    }
    Ok(WavefrontBatch::concat(parts))
}

/// The loss tail shared by Ptychography and SparseMultislice: predicted
/// magnitude vs gathered measurement, beamstop, fidelity statistic,
/// regularization.
pub(crate) fn evaluate_loss(
    cfg: &ModelConfig,
    reg: &RegularizerSet,
    args: &LossArgs<'_>,
    prediction: &WavefrontBatch,
) -> f64 {
    let pred_mag = prediction.magnitude();
    let measured_angle = args.predict.angle_index * cfg.theta_downsample.max(1);
    let (meas, mshape) = gather_frames(
        args.data,
        measured_angle,
        args.predict.indices,
        cfg.ds_level.max(1),
    );
    assert_eq!(
        mshape,
        [prediction.ny, prediction.nx],
        "measured frame shape {:?} does not match prediction [{}, {}]",
        mshape,
        prediction.ny,
        prediction.nx
    );

    let fidelity = masked_fidelity_loss(
        &pred_mag,
        &meas,
        prediction.batch,
        cfg.beamstop.as_ref(),
        cfg.loss,
        cfg.raw_data,
    );

    // In pre-distributed mode each process regularizes its own shard on
    // the driver side; the minibatch of crops is not a volume.
    let reg_value = match args.predict.object {
        ObjectInput::Whole(v) => reg.value(v, cfg.repr),
        ObjectInput::PreSliced(_) => 0.0,
    };

    let total = fidelity + reg_value;
    debug!(fidelity, reg_value, total, "loss evaluated");
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_json_roundtrip() {
        let mut cfg = ModelConfig::new(0.15, [12.0, 12.0, 20.0], [64, 64]);
        cfg.n_probe_modes = 3;
        cfg.free_prop = Some(FreePropagation::FarField);
        cfg.subprobe_size = Some([32, 32]);
        cfg.loss = LossKind::PoissonNll;

        let json = serde_json::to_string(&cfg).unwrap();
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.lambda_nm, cfg.lambda_nm);
        assert_eq!(back.n_probe_modes, 3);
        assert_eq!(back.free_prop, Some(FreePropagation::FarField));
        assert_eq!(back.subprobe_size, Some([32, 32]));
        assert_eq!(back.loss, LossKind::PoissonNll);
    }

    #[test]
    fn test_correction_table_max_abs() {
        let mut t = PosCorrectionTable::zeros(2, 3);
        assert_eq!(t.max_abs(), 0.0);
        t.set(1, 2, [0.5, -2.25]);
        assert_eq!(t.max_abs(), 2.25);
        assert_eq!(t.get(1, 2), [0.5, -2.25]);
        assert_eq!(t.get(0, 0), [0.0, 0.0]);
    }
}
