// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Moment-based and plain gradient-descent parameter updates
//!
//! Both optimizers come in two storage strategies: whole arrays in memory,
//! or out-of-core moment state in chunked datasets applied one
//! leading-axis slice at a time. The iteration counter advances once per
//! *logical* optimizer call — for the file-backed path that is once per
//! full pass over all owned slices, never once per slice, or the bias
//! correction would race ahead of the data.
//!
//! Adam, per element:
//!
//!   m′ = (1−b1)·g + b1·m
//!   v′ = (1−b2)·g² + b2·v
//!   m̂  = m′ / (1 − b1^(t+1))
//!   v̂  = v′ / (1 − b2^(t+1))
//!   x′ = x − step·m̂ / (√v̂ + ε)
//!
//! Gradient descent: `x′ = x − step·g`, with an optional staircase decay
//! that halves the step each time the cumulative batch index crosses
//! `T_i = T₀·(2^(i+1) − 1)` (92, 276, 644, … for the default T₀ = 92),
//! recomputed fresh from the iteration count on every call — no decay
//! state is persisted.

use std::path::Path;

use tracing::debug;

use crate::backend::{BackendContext, BackendMode};
use crate::process::ProcessGroup;
use crate::store::{ChunkedDataset, StoreError};

/// Optimizer-level failures.
#[derive(Debug, thiserror::Error)]
pub enum OptimError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("missing or invalid hyperparameter `{0}`")]
    MissingHyperparameter(&'static str),
    #[error("state shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("optimizer state storage mismatch: {0}")]
    StorageMismatch(&'static str),
}

// ─── Adam ───────────────────────────────────────────

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct AdamParams {
    pub step_size: f64,
    pub b1: f64,
    pub b2: f64,
    pub eps: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            step_size: 1e-3,
            b1: 0.9,
            b2: 0.999,
            eps: 1e-7,
        }
    }
}

impl AdamParams {
    pub fn validate(&self) -> Result<(), OptimError> {
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(OptimError::MissingHyperparameter("step_size"));
        }
        if !(0.0..1.0).contains(&self.b1) {
            return Err(OptimError::MissingHyperparameter("b1"));
        }
        if !(0.0..1.0).contains(&self.b2) {
            return Err(OptimError::MissingHyperparameter("b2"));
        }
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(OptimError::MissingHyperparameter("eps"));
        }
        Ok(())
    }
}

/// One Adam update over flat arrays, at iteration `t` (0-based). Moments
/// are updated in place; intermediate arithmetic runs in f64 so the bias
/// corrections stay exact for large `t`.
pub fn adam_apply_gradient(
    x: &mut [f32],
    g: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    t: u64,
    params: &AdamParams,
) {
    assert_eq!(x.len(), g.len(), "x and gradient lengths differ");
    assert_eq!(x.len(), m.len(), "x and m lengths differ");
    assert_eq!(x.len(), v.len(), "x and v lengths differ");

    let b1 = params.b1;
    let b2 = params.b2;
    let bias1 = 1.0 - b1.powi(t as i32 + 1);
    let bias2 = 1.0 - b2.powi(t as i32 + 1);

    for i in 0..x.len() {
        let gi = g[i] as f64;
        let mi = (1.0 - b1) * gi + b1 * m[i] as f64;
        let vi = (1.0 - b2) * gi * gi + b2 * v[i] as f64;
        let mhat = mi / bias1;
        let vhat = vi / bias2;
        m[i] = mi as f32;
        v[i] = vi as f32;
        x[i] = (x[i] as f64 - params.step_size * mhat / (vhat.sqrt() + params.eps)) as f32;
    }
}

enum AdamState {
    InMemory { m: Vec<f32>, v: Vec<f32> },
    OutOfCore { m: ChunkedDataset, v: ChunkedDataset },
}

/// Adam with named moment state `("m", "v")` mirroring the parameter
/// shape.
pub struct AdamOptimizer {
    shape: Vec<usize>,
    state: AdamState,
    i_batch: u64,
}

impl AdamOptimizer {
    /// Memory-resident state, zero-initialized.
    pub fn new_in_memory(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            state: AdamState::InMemory {
                m: vec![0.0; n],
                v: vec![0.0; n],
            },
            i_batch: 0,
        }
    }

    /// Out-of-core state: one chunked dataset per named moment, created
    /// cooperatively in `dir` (first creator wins, others attach).
    pub fn with_file_state(shape: &[usize], dir: &Path) -> Result<Self, OptimError> {
        let (m, _) = ChunkedDataset::open_or_create(&dir.join("adam_m.hcd"), shape)?;
        let (v, _) = ChunkedDataset::open_or_create(&dir.join("adam_v.hcd"), shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            state: AdamState::OutOfCore { m, v },
            i_batch: 0,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn i_batch(&self) -> u64 {
        self.i_batch
    }

    /// In-memory update of a whole parameter array; advances the
    /// iteration counter once.
    pub fn apply_gradient(
        &mut self,
        x: &mut [f32],
        g: &[f32],
        params: &AdamParams,
    ) -> Result<(), OptimError> {
        params.validate()?;
        let (m, v) = match &mut self.state {
            AdamState::InMemory { m, v } => (m, v),
            AdamState::OutOfCore { .. } => {
                return Err(OptimError::StorageMismatch(
                    "state is file-backed; use apply_gradient_to_file",
                ))
            }
        };
        if x.len() != m.len() {
            return Err(OptimError::ShapeMismatch(format!(
                "parameter length {} does not match optimizer state {}",
                x.len(),
                m.len()
            )));
        }
        adam_apply_gradient(x, g, m, v, self.i_batch, params);
        self.i_batch += 1;
        Ok(())
    }

    /// Slice-streamed update of a file-backed parameter array.
    ///
    /// Each process touches only the slices it owns (round-robin by rank);
    /// for every owned slice: read x, g, m, v, update, write back. The
    /// iteration counter advances once per full pass. The backend is
    /// swapped to concrete mode for the duration — the updates are plain
    /// numeric — and restored on every exit path by the guard.
    pub fn apply_gradient_to_file(
        &mut self,
        object: &mut ChunkedDataset,
        gradient: &mut ChunkedDataset,
        group: ProcessGroup,
        backend: &BackendContext,
        params: &AdamParams,
    ) -> Result<(), OptimError> {
        params.validate()?;
        let (m_ds, v_ds) = match &mut self.state {
            AdamState::OutOfCore { m, v } => (m, v),
            AdamState::InMemory { .. } => {
                return Err(OptimError::StorageMismatch(
                    "state is memory-resident; use apply_gradient",
                ))
            }
        };
        check_file_shapes(object, gradient, &self.shape)?;

        let _guard = backend.scoped(BackendMode::Concrete);
        let t = self.i_batch;
        for i_slice in group.owned_slices(object.n_slices()) {
            let mut x = object.read_slice(i_slice)?;
            let g = gradient.read_slice(i_slice)?;
            let mut m = m_ds.read_slice(i_slice)?;
            let mut v = v_ds.read_slice(i_slice)?;

            adam_apply_gradient(&mut x, &g, &mut m, &mut v, t, params);

            object.write_slice(i_slice, &x)?;
            m_ds.write_slice(i_slice, &m)?;
            v_ds.write_slice(i_slice, &v)?;
        }
        self.i_batch += 1;
        Ok(())
    }

    /// Named state arrays in declaration order, for checkpointing.
    /// Only meaningful for memory-resident state.
    pub fn named_state(&self) -> Result<Vec<(&'static str, &[f32])>, OptimError> {
        match &self.state {
            AdamState::InMemory { m, v } => Ok(vec![("m", m.as_slice()), ("v", v.as_slice())]),
            AdamState::OutOfCore { .. } => Err(OptimError::StorageMismatch(
                "file-backed state checkpoints through its datasets",
            )),
        }
    }

    /// Restore state arrays in the same declaration order used by
    /// [`Self::named_state`].
    pub fn restore_state(&mut self, arrays: &[Vec<f32>]) -> Result<(), OptimError> {
        let (m, v) = match &mut self.state {
            AdamState::InMemory { m, v } => (m, v),
            AdamState::OutOfCore { .. } => {
                return Err(OptimError::StorageMismatch(
                    "file-backed state checkpoints through its datasets",
                ))
            }
        };
        if arrays.len() != 2 || arrays[0].len() != m.len() || arrays[1].len() != v.len() {
            return Err(OptimError::ShapeMismatch(
                "checkpoint does not carry (m, v) of the expected shape".into(),
            ));
        }
        m.copy_from_slice(&arrays[0]);
        v.copy_from_slice(&arrays[1]);
        Ok(())
    }
}

// ─── Gradient descent ───────────────────────────────

/// Plain gradient-descent hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct GdParams {
    pub step_size: f64,
    /// Enable the staircase step decay.
    pub dynamic_rate: bool,
    /// T₀: the first decay threshold (92 in the reference schedule).
    pub first_downrate_iteration: u64,
}

impl Default for GdParams {
    fn default() -> Self {
        Self {
            step_size: 1e-3,
            dynamic_rate: true,
            first_downrate_iteration: 92,
        }
    }
}

impl GdParams {
    pub fn validate(&self) -> Result<(), OptimError> {
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(OptimError::MissingHyperparameter("step_size"));
        }
        if self.dynamic_rate && self.first_downrate_iteration == 0 {
            return Err(OptimError::MissingHyperparameter("first_downrate_iteration"));
        }
        Ok(())
    }
}

/// Number of step halvings accumulated by iteration `i_batch` under the
/// staircase schedule with first threshold `t0`: one halving each time
/// the cumulative index crosses `t0·(2^(i+1) − 1)`.
///
/// Recomputed fresh every call; nothing is persisted.
pub fn gd_halvings(i_batch: u64, t0: u64) -> u32 {
    let mut threshold = t0;
    let mut i = 1u32;
    let mut halvings = 0u32;
    while threshold < i_batch {
        threshold = threshold.saturating_add(t0.saturating_mul(1u64 << i.min(63)));
        i += 1;
        halvings += 1;
    }
    halvings
}

/// One gradient-descent update: `x ← x − step·g`, with the staircase
/// decay applied when enabled.
pub fn gd_apply_gradient(x: &mut [f32], g: &[f32], i_batch: u64, params: &GdParams) {
    assert_eq!(x.len(), g.len(), "x and gradient lengths differ");
    let mut step = params.step_size;
    if params.dynamic_rate {
        let halvings = gd_halvings(i_batch, params.first_downrate_iteration);
        if halvings > 0 {
            step = step / f64::powi(2.0, halvings as i32);
            debug!(halvings, step, "staircase decay applied");
        }
    }
    for i in 0..x.len() {
        x[i] = (x[i] as f64 - step * g[i] as f64) as f32;
    }
}

/// Stateless-update gradient-descent optimizer; the struct only tracks
/// the logical iteration counter for file-backed application.
pub struct GdOptimizer {
    i_batch: u64,
}

impl Default for GdOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl GdOptimizer {
    pub fn new() -> Self {
        Self { i_batch: 0 }
    }

    pub fn i_batch(&self) -> u64 {
        self.i_batch
    }

    /// Whole-array update; advances the iteration counter once.
    pub fn apply_gradient(
        &mut self,
        x: &mut [f32],
        g: &[f32],
        params: &GdParams,
    ) -> Result<(), OptimError> {
        params.validate()?;
        gd_apply_gradient(x, g, self.i_batch, params);
        self.i_batch += 1;
        Ok(())
    }

    /// Slice-streamed update of a file-backed parameter array; same
    /// ownership, backend-swap and counter semantics as the Adam variant.
    pub fn apply_gradient_to_file(
        &mut self,
        object: &mut ChunkedDataset,
        gradient: &mut ChunkedDataset,
        group: ProcessGroup,
        backend: &BackendContext,
        params: &GdParams,
    ) -> Result<(), OptimError> {
        params.validate()?;
        if object.shape() != gradient.shape() {
            return Err(OptimError::ShapeMismatch(format!(
                "object shape {:?} does not match gradient shape {:?}",
                object.shape(),
                gradient.shape()
            )));
        }

        let _guard = backend.scoped(BackendMode::Concrete);
        let t = self.i_batch;
        for i_slice in group.owned_slices(object.n_slices()) {
            let mut x = object.read_slice(i_slice)?;
            let g = gradient.read_slice(i_slice)?;
            gd_apply_gradient(&mut x, &g, t, params);
            object.write_slice(i_slice, &x)?;
        }
        self.i_batch += 1;
        Ok(())
    }
}

fn check_file_shapes(
    object: &ChunkedDataset,
    gradient: &ChunkedDataset,
    state_shape: &[usize],
) -> Result<(), OptimError> {
    if object.shape() != gradient.shape() {
        return Err(OptimError::ShapeMismatch(format!(
            "object shape {:?} does not match gradient shape {:?}",
            object.shape(),
            gradient.shape()
        )));
    }
    if object.shape() != state_shape {
        return Err(OptimError::ShapeMismatch(format!(
            "object shape {:?} does not match optimizer state shape {:?} — \
             the moment partitioning must mirror the object exactly",
            object.shape(),
            state_shape
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adam_zero_gradient_is_identity() {
        let mut opt = AdamOptimizer::new_in_memory(&[4]);
        let mut x = vec![1.0f32, -2.0, 0.5, 3.0];
        let x0 = x.clone();
        let g = vec![0.0f32; 4];
        for _ in 0..25 {
            opt.apply_gradient(&mut x, &g, &AdamParams::default()).unwrap();
        }
        assert_eq!(x, x0, "zero gradient must leave parameters unchanged");
        assert_eq!(opt.i_batch(), 25);
    }

    #[test]
    fn test_adam_first_step_magnitude() {
        // At t = 0 the bias corrections cancel the (1−b) factors exactly,
        // so a constant gradient moves x by ≈ step·g/(|g| + ε).
        let mut opt = AdamOptimizer::new_in_memory(&[1]);
        let mut x = vec![0.0f32];
        let params = AdamParams::default();
        opt.apply_gradient(&mut x, &[0.5], &params).unwrap();
        assert!(
            (x[0] + params.step_size as f32).abs() < 1e-4,
            "first Adam step should be ≈ −step, got {}",
            x[0]
        );
    }

    #[test]
    fn test_adam_descends_quadratic() {
        // Minimize f(x) = x² with its exact gradient 2x.
        let mut opt = AdamOptimizer::new_in_memory(&[1]);
        let mut x = vec![1.0f32];
        let params = AdamParams {
            step_size: 0.05,
            ..AdamParams::default()
        };
        for _ in 0..200 {
            let g = vec![2.0 * x[0]];
            opt.apply_gradient(&mut x, &g, &params).unwrap();
        }
        assert!(x[0].abs() < 0.1, "Adam should approach the minimum, got {}", x[0]);
    }

    #[test]
    fn test_gd_halving_thresholds() {
        // T₀ = 92: thresholds at 92·(2^(i+1)−1) = 92, 276, 644.
        assert_eq!(gd_halvings(0, 92), 0);
        assert_eq!(gd_halvings(92, 92), 0, "at the threshold, not yet crossed");
        assert_eq!(gd_halvings(93, 92), 1, "first crossing at 92");
        assert_eq!(gd_halvings(276, 92), 1);
        assert_eq!(gd_halvings(277, 92), 2, "second crossing at 276");
        assert_eq!(gd_halvings(644, 92), 2);
        assert_eq!(gd_halvings(645, 92), 3, "third crossing at 644");
    }

    #[test]
    fn test_gd_step_decays() {
        let params = GdParams::default();
        let g = vec![1.0f32];

        let mut x_early = vec![0.0f32];
        gd_apply_gradient(&mut x_early, &g, 0, &params);

        let mut x_late = vec![0.0f32];
        gd_apply_gradient(&mut x_late, &g, 300, &params);

        let ratio = x_early[0] / x_late[0];
        assert!(
            (ratio - 4.0).abs() < 1e-4,
            "by iteration 300 the step has halved twice, ratio {}",
            ratio
        );
    }

    #[test]
    fn test_gd_static_rate_ignores_schedule() {
        let params = GdParams {
            dynamic_rate: false,
            ..GdParams::default()
        };
        let mut x = vec![0.0f32];
        gd_apply_gradient(&mut x, &[1.0], 10_000, &params);
        assert!((x[0] as f64 + params.step_size).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_step_size_rejected() {
        let mut opt = GdOptimizer::new();
        let params = GdParams {
            step_size: f64::NAN,
            ..GdParams::default()
        };
        let err = opt.apply_gradient(&mut [0.0], &[1.0], &params).unwrap_err();
        assert!(matches!(err, OptimError::MissingHyperparameter("step_size")));
    }

    #[test]
    fn test_in_memory_rejects_file_call_shape() {
        let opt = AdamOptimizer::new_in_memory(&[2, 2]);
        assert!(opt.named_state().is_ok());
        let mut opt = opt;
        let err = opt
            .apply_gradient(&mut [0.0; 3], &[0.0; 3], &AdamParams::default())
            .unwrap_err();
        assert!(matches!(err, OptimError::ShapeMismatch(_)));
    }
}
