// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! End-to-end forward model behavior across the three geometries.

use helios_field::probe::subpixel_shift_plane;
use helios_field::volume::{ObjectRepr, ObjectVolume};
use helios_field::wavefront::Wavefront;
use helios_model::models::{MultiDistGeometry, PosCorrectionTable, SparseGeometry};
use helios_model::{
    ForwardModel, InMemoryDiffraction, LossArgs, ModelConfig, ModelError, MultiDistModel,
    ObjectInput, PredictArgs, PtychographyModel, SparseMultisliceModel,
};

fn base_config(probe: [usize; 2]) -> ModelConfig {
    let mut cfg = ModelConfig::new(0.1, [10.0, 10.0, 10.0], probe);
    cfg.two_d_mode = true;
    cfg
}

fn args<'a>(
    object: ObjectInput<'a>,
    probe: &'a Wavefront,
    positions: &'a [[f64; 2]],
    indices: &'a [usize],
    data: &'a InMemoryDiffraction,
) -> LossArgs<'a> {
    LossArgs {
        predict: PredictArgs {
            object,
            probe,
            probe_defocus_mm: None,
            probe_pos_offset: None,
            angle_index: 0,
            positions,
            pos_correction: None,
            indices,
            rotation: None,
        },
        data,
        sparse: None,
        multi_dist: None,
    }
}

#[test]
fn zero_object_uniform_probe_has_zero_loss() {
    // Single slice, single mode, single position: an all-zero
    // phase/absorption object is the identity transmission, the exit wave
    // is the probe itself, and a measurement equal to the probe amplitude
    // gives an exactly zero least-squares loss.
    let (ny, nx) = (8, 8);
    let cfg = base_config([ny, nx]);
    let mut model = PtychographyModel::new(cfg);

    let object = ObjectVolume::zeros(ny, nx, 1);
    let probe = Wavefront::plane(ny, nx);
    let data = InMemoryDiffraction::from_frames(&[vec![1.0; ny * nx]], ny, nx);
    let positions = [[0.0, 0.0]];
    let indices = [0usize];

    let largs = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );

    let prediction = model.predict(&largs).unwrap();
    assert_eq!(prediction.batch, 1);
    assert_eq!(prediction.modes, 1);
    let (re, im) = prediction.plane(0, 0);
    for i in 0..ny * nx {
        assert_eq!(re[i], 1.0, "zero-slice transmission is the identity");
        assert_eq!(im[i], 0.0);
    }

    // Zero-weighted regularization contributes an exact 0, by branch.
    model.regularizers().add_l1_norm(0.0, 0.0);
    let loss = model.loss(&largs).unwrap();
    assert_eq!(loss, 0.0, "matched magnitude with zero regularization is exactly 0");
    assert_eq!(model.last_loss(), 0.0);
}

#[test]
fn variant_enum_dispatches_like_the_model() {
    let (ny, nx) = (8, 8);
    let object = ObjectVolume::zeros(ny, nx, 1);
    let probe = Wavefront::plane(ny, nx);
    let data = InMemoryDiffraction::from_frames(&[vec![1.0; ny * nx]], ny, nx);
    let positions = [[0.0, 0.0]];
    let indices = [0usize];

    let mut variant =
        helios_model::ForwardVariant::Ptychography(PtychographyModel::new(base_config([ny, nx])));
    assert_eq!(variant.name(), "ptychography");
    assert_eq!(variant.argument_order().len(), 10);

    let largs = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );
    let loss = variant.loss(&largs).unwrap();
    assert_eq!(loss, 0.0);
    assert_eq!(variant.last_loss(), 0.0);
}

#[test]
fn loss_orders_true_below_perturbed() {
    // Simulate a measurement from a known object, then check the loss
    // ranks the true object below a perturbed one.
    let (ny, nx, nz) = (8, 8, 2);
    let cfg = base_config([ny, nx]);
    let mut model = PtychographyModel::new(cfg);

    let mut object = ObjectVolume::zeros(ny, nx, nz);
    for y in 0..ny {
        for x in 0..nx {
            for z in 0..nz {
                object.set(y, x, z, 0, 0.03 * (y + x) as f32);
                object.set(y, x, z, 1, 0.002 * (z + 1) as f32);
            }
        }
    }
    let probe = Wavefront::plane(ny, nx);
    let positions = [[0.0, 0.0]];
    let indices = [0usize];

    // Forward-simulate the measurement with a placeholder dataset.
    let placeholder = InMemoryDiffraction::from_frames(&[vec![0.0; ny * nx]], ny, nx);
    let largs = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &placeholder,
    );
    let measured = model.predict(&largs).unwrap().magnitude();
    let data = InMemoryDiffraction::from_frames(&[measured], ny, nx);

    let true_args = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );
    let loss_true = model.loss(&true_args).unwrap();

    // Perturb absorption on half the frame: a non-uniform change that
    // must show up in the detected magnitudes.
    let mut perturbed = object.clone();
    for y in 0..ny {
        for x in 0..nx / 2 {
            perturbed.set(y, x, 0, 1, perturbed.get(y, x, 0, 1) + 0.01);
        }
    }
    let pert_args = args(
        ObjectInput::Whole(&perturbed),
        &probe,
        &positions,
        &indices,
        &data,
    );
    let loss_pert = model.loss(&pert_args).unwrap();

    assert!(loss_true < 1e-10, "true object reproduces its own data: {}", loss_true);
    assert!(loss_pert > loss_true + 1e-6, "perturbation must raise the loss");
}

#[test]
fn on_the_fly_rotation_is_refused() {
    let (ny, nx) = (8, 8);
    let mut cfg = base_config([ny, nx]);
    cfg.two_d_mode = false;

    let model = PtychographyModel::new(cfg);
    let object = ObjectVolume::zeros(ny, nx, 2);
    let probe = Wavefront::plane(ny, nx);
    let data = InMemoryDiffraction::from_frames(&[vec![1.0; ny * nx]], ny, nx);
    let positions = [[0.0, 0.0]];
    let indices = [0usize];

    let largs = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );
    let err = model.predict(&largs).unwrap_err();
    assert!(
        matches!(err, ModelError::UnsupportedConfiguration(_)),
        "rotation without a table must fail, not approximate: {:?}",
        err
    );
}

#[test]
fn argument_order_is_checked_exactly() {
    let model = PtychographyModel::new(base_config([4, 4]));
    assert_eq!(model.argument_index("object").unwrap(), 0);
    assert_eq!(model.argument_index("index_batch").unwrap(), 9);
    assert!(matches!(
        model.argument_index("no_such_argument").unwrap_err(),
        ModelError::UnknownArgument(_)
    ));

    let declared = model.argument_order().to_vec();
    assert!(model.check_argument_order(&declared).is_ok());

    let mut swapped = declared.clone();
    swapped.swap(1, 2);
    assert!(matches!(
        model.check_argument_order(&swapped).unwrap_err(),
        ModelError::ArgumentOrder { .. }
    ));
    assert!(matches!(
        model.check_argument_order(&declared[..5]).unwrap_err(),
        ModelError::ArgumentOrder { .. }
    ));
}

#[test]
fn presliced_input_matches_whole_volume() {
    let (ny, nx, nz) = (12, 12, 2);
    let window = [6usize, 6];
    let cfg = base_config(window);

    let mut object = ObjectVolume::zeros(ny, nx, nz);
    for (i, v) in object.data.iter_mut().enumerate() {
        *v = ((i * 37 % 101) as f32) * 0.01;
    }
    let probe = Wavefront::spot(window[0], window[1], 4);
    let data = InMemoryDiffraction::from_frames(
        &[vec![1.0; 36], vec![1.0; 36]],
        window[0],
        window[1],
    );
    let positions = [[0.0, 0.0], [2.0, 3.0]];
    let indices = [0usize, 1];

    let model = PtychographyModel::new(cfg);
    let whole_args = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );
    let from_whole = model.predict(&whole_args).unwrap();

    // Pre-extract the same sub-volumes and feed them as a shard batch.
    let rounded = helios_model::batch::round_positions(&positions);
    let (padded, offset) =
        helios_model::batch::pad_object(&object, &rounded, window, 0, ObjectRepr::PhaseAbsorption);
    let shard = helios_model::batch::extract_subvolumes(&padded, &rounded, offset, window, 0);

    let presliced_args = args(
        ObjectInput::PreSliced(&shard),
        &probe,
        &positions,
        &indices,
        &data,
    );
    let from_shard = model.predict(&presliced_args).unwrap();

    assert_eq!(from_whole.re, from_shard.re, "pre-distributed path must agree exactly");
    assert_eq!(from_whole.im, from_shard.im);
}

#[test]
fn position_correction_shifts_the_probe() {
    let (ny, nx) = (8, 8);
    let mut cfg = base_config([ny, nx]);
    cfg.optimize_all_probe_pos = true;
    let model = PtychographyModel::new(cfg);

    let object = ObjectVolume::zeros(ny, nx, 1);
    let probe = Wavefront::spot(ny, nx, 4);
    let data = InMemoryDiffraction::from_frames(&[vec![0.0; ny * nx]], ny, nx);
    let positions = [[0.0, 0.0]];
    let indices = [0usize];

    let mut table = PosCorrectionTable::zeros(1, 1);
    table.set(0, 0, [0.0, 2.0]);

    let mut largs = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );
    largs.predict.pos_correction = Some(&table);

    let prediction = model.predict(&largs).unwrap();
    let (got_re, got_im) = prediction.plane(0, 0);

    // Integer correction: the probe rolls exactly.
    let mut want_re = probe.mode_planes(0).0.to_vec();
    let mut want_im = probe.mode_planes(0).1.to_vec();
    subpixel_shift_plane(&mut want_re, &mut want_im, ny, nx, [0.0, 2.0]);
    assert_eq!(got_re, want_re.as_slice());
    assert_eq!(got_im, want_im.as_slice());
}

#[test]
fn sparse_uniform_positions_match_ptychography() {
    let (ny, nx, nz) = (8, 8, 3);
    let cfg = base_config([ny, nx]);

    let mut object = ObjectVolume::zeros(ny, nx, nz);
    for (i, v) in object.data.iter_mut().enumerate() {
        *v = ((i * 13 % 53) as f32) * 0.005;
    }
    let probe = Wavefront::plane(ny, nx);
    let data = InMemoryDiffraction::from_frames(&[vec![1.0; ny * nx]], ny, nx);
    let positions = [[0.0, 0.0]];
    let indices = [0usize];

    let ptycho = PtychographyModel::new(cfg.clone());
    let largs = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );
    let reference = ptycho.predict(&largs).unwrap();

    let sparse_model = SparseMultisliceModel::new(cfg);
    let (u, v) = helios_math::mesh::frequency_meshes_2d([10.0, 10.0], [ny, nx]);
    let slice_pos = [0.0, 10.0, 20.0];
    let mut sargs = largs;
    sargs.sparse = Some(SparseGeometry {
        slice_pos_nm: &slice_pos,
        u: &u,
        v: &v,
    });
    let sparse_pred = sparse_model.predict(&sargs).unwrap();

    for i in 0..reference.re.len() {
        assert!(
            (reference.re[i] - sparse_pred.re[i]).abs() < 1e-4,
            "re[{}]: {} vs {}",
            i,
            reference.re[i],
            sparse_pred.re[i]
        );
        assert!((reference.im[i] - sparse_pred.im[i]).abs() < 1e-4);
    }
}

#[test]
fn sparse_without_geometry_is_missing_hyperparameter() {
    let model = SparseMultisliceModel::new(base_config([4, 4]));
    let object = ObjectVolume::zeros(4, 4, 1);
    let probe = Wavefront::plane(4, 4);
    let data = InMemoryDiffraction::from_frames(&[vec![1.0; 16]], 4, 4);
    let positions = [[0.0, 0.0]];
    let indices = [0usize];
    let largs = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );
    assert!(matches!(
        model.predict(&largs).unwrap_err(),
        ModelError::MissingHyperparameter("slice_pos_nm")
    ));
}

#[test]
fn multidist_correction_is_indexed_by_distance() {
    // The correction table rides the *distance* axis when realigning
    // measured blocks: block i shifts by correction[i], not by the
    // per-position entry. Any change in interpretation must trip this
    // test instead of silently realigning data the other way.
    let (ny, nx) = (8, 8);
    let mut cfg = base_config([ny, nx]);
    cfg.subprobe_size = Some([ny, nx]);
    cfg.optimize_all_probe_pos = true;
    let mut model = MultiDistModel::new(cfg).unwrap();

    let object = ObjectVolume::zeros(ny, nx, 1);
    let probe = Wavefront::spot(ny, nx, 4);

    // Prediction pattern for both (zero) distances is the spot magnitude.
    let pattern: Vec<f32> = {
        let (re, im) = probe.mode_planes(0);
        re.iter()
            .zip(im.iter())
            .map(|(&r, &i)| (r * r + i * i).sqrt())
            .collect()
    };
    // Measured block 0 matches; block 1 is stored rolled by −3 px in x and
    // must be realigned by the distance-1 correction of +3 px.
    let mut rolled = pattern.clone();
    let mut rolled_im = vec![0.0f32; rolled.len()];
    subpixel_shift_plane(&mut rolled, &mut rolled_im, ny, nx, [0.0, -3.0]);
    let data = InMemoryDiffraction::from_frames(&[pattern, rolled], ny, nx);

    let positions = [[0.0, 0.0]];
    let indices = [0usize];
    let distances = [0.0f64, 0.0];
    let correction = [[0.0, 0.0], [0.0, 3.0]];

    let mut largs = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );
    largs.multi_dist = Some(MultiDistGeometry {
        free_prop_nm: &distances,
        safe_zone_width: 0,
        dist_correction: Some(&correction),
    });

    let aligned = model.loss(&largs).unwrap();
    assert!(
        aligned < 1e-8,
        "per-distance correction realigns block 1 exactly: {}",
        aligned
    );

    // Under the per-position interpretation both blocks would take the
    // position-0 correction (zero) and block 1 would stay misaligned.
    let no_correction = [[0.0, 0.0], [0.0, 0.0]];
    let mut misaligned_args = largs;
    misaligned_args.multi_dist = Some(MultiDistGeometry {
        free_prop_nm: &distances,
        safe_zone_width: 0,
        dist_correction: Some(&no_correction),
    });
    let misaligned = model.loss(&misaligned_args).unwrap();
    assert!(
        misaligned > 1e-3,
        "without the per-distance shift the blocks disagree: {}",
        misaligned
    );
}

#[test]
fn multidist_halo_is_cropped_from_both_parts() {
    let (ny, nx) = (6, 6);
    let halo = 2usize;
    let mut cfg = base_config([ny, nx]);
    cfg.subprobe_size = Some([ny, nx]);
    let model = MultiDistModel::new(cfg).unwrap();

    let object = ObjectVolume::zeros(ny, nx, 1);
    let probe = Wavefront::plane(ny, nx);
    let data = InMemoryDiffraction::from_frames(&[vec![1.0; ny * nx]], ny, nx);
    let positions = [[0.0, 0.0]];
    let indices = [0usize];
    let distances = [5.0e3f64];

    let mut largs = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );
    largs.multi_dist = Some(MultiDistGeometry {
        free_prop_nm: &distances,
        safe_zone_width: halo,
        dist_correction: None,
    });

    let prediction = model.predict(&largs).unwrap();
    assert_eq!(
        [prediction.ny, prediction.nx],
        [ny, nx],
        "halo must be stripped from the returned frames"
    );
    // Frames are complex: both real and imaginary planes have the block
    // shape (the halo is removed from each).
    assert_eq!(prediction.re.len(), ny * nx);
    assert_eq!(prediction.im.len(), ny * nx);
}

#[test]
fn downsampled_and_theta_strided_measurements_align() {
    // Detector stride 2 and angle stride 2: model angle 1 must read
    // measured angle 2 at half resolution.
    let (full_ny, full_nx) = (16, 16);
    let (ny, nx) = (8, 8);
    let mut cfg = base_config([ny, nx]);
    cfg.ds_level = 2;
    cfg.theta_downsample = 2;
    let mut model = PtychographyModel::new(cfg);

    // Three measured angles; only angle 2 matches the prediction of 1.0.
    let mut data = Vec::new();
    for angle in 0..3 {
        let v = if angle == 2 { 1.0f32 } else { 9.0 };
        data.extend(vec![v; full_ny * full_nx]);
    }
    let data = InMemoryDiffraction::new(data, 3, 1, full_ny, full_nx);

    let object = ObjectVolume::zeros(ny, nx, 1);
    let probe = Wavefront::plane(ny, nx);
    let positions = [[0.0, 0.0]];
    let indices = [0usize];

    let mut largs = args(
        ObjectInput::Whole(&object),
        &probe,
        &positions,
        &indices,
        &data,
    );
    largs.predict.angle_index = 1;

    let loss = model.loss(&largs).unwrap();
    assert_eq!(loss, 0.0, "model angle 1 reads measured angle 2");
}
